//! Transport error types.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("connection failed")]
    ConnectionFailed,

    #[error("packet checksum mismatch")]
    ChecksumFailed,

    #[error("packet of {size} bytes exceeds the limit of {limit}")]
    PacketTooLarge { size: usize, limit: usize },

    #[error("peer protocol version {0:#x} is incompatible")]
    IncompatibleProtocolVersion(u64),

    #[error("listen address in use")]
    AddressInUse,

    #[error("malformed packet: {0}")]
    CorruptPacket(String),

    #[error("message codec error: {0}")]
    MessageCodec(#[from] bincode::Error),

    #[error("transport is shut down")]
    Shutdown,

    #[error("reply endpoint was dropped before a reply arrived")]
    ReplyDropped,
}

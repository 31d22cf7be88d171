//! Storage error types.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("core codec error: {0}")]
    Core(#[from] taglog_core::Error),

    #[error("disk queue corrupt: {0}")]
    CorruptQueue(String),

    #[error("read at {location} is below the popped location {popped}")]
    PoppedRange { location: u64, popped: u64 },

    #[error("read of [{location}, +{length}) extends past the durable tail {durable}")]
    PastDurable {
        location: u64,
        length: u64,
        durable: u64,
    },

    #[error("queue operation in wrong state: {0}")]
    WrongState(&'static str),

    #[error("kv store format key mismatch: found {0:?}")]
    FormatMismatch(String),

    #[error("queue entry protocol version {0:#x} is incompatible")]
    IncompatibleQueueEntry(u64),
}

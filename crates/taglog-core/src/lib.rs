//! Core Types for TagLog
//!
//! This crate defines the vocabulary shared by every other taglog crate:
//!
//! - **Version**: the 64-bit commit ordinal assigned by the commit
//!   coordinator. Strictly increasing within a log generation; gaps are
//!   allowed, duplicates are not.
//! - **Tag**: the routing label `(locality, id)` attached to every message,
//!   identifying which consumers receive it.
//! - **Uid**: 128-bit identifier used for generations, peek subscribers and
//!   endpoint tokens.
//! - **Message framing**: the bit-exact layout of commit batches and peek
//!   reply bodies.
//!
//! Nothing in here does I/O. The storage and network crates build their
//! on-disk and on-wire formats out of these pieces.

pub mod error;
pub mod message;
pub mod tag;
pub mod types;

pub use error::{Error, Result};
pub use message::{
    CommitBatchBuilder, CommitBatchReader, ExecOp, MessageRef, PeekBodyBuilder, PeekBodyReader,
};
pub use tag::{Tag, LOCALITY_LOG_ROUTER, LOCALITY_REMOTE, LOCALITY_SATELLITE, LOCALITY_SPECIAL};
pub use types::{
    protocol_compatible, StorageBytes, Uid, Version, PROTOCOL_VERSION,
    PROTOCOL_VERSION_COMPATIBLE_MASK,
};

/// The transaction-system tag. Always eligible for delivery regardless of
/// the generation's locality, and spilled by value rather than by reference.
pub const TXS_TAG: Tag = Tag {
    locality: LOCALITY_SPECIAL,
    id: 1,
};

//! TagLog Storage Layer
//!
//! This crate implements the durable side of the transaction log:
//!
//! 1. **Raw disk queue** ([`diskqueue`]): an append-only byte log made of
//!    segment files, with a durable commit barrier, prefix reclamation by
//!    pop, and a sequential recovery reader.
//! 2. **Framed log queue** ([`logqueue`]): length-prefixed records with a
//!    validity flag over the raw queue, including torn-tail zero-fill
//!    repair, plus the typed queue-entry codec the server pushes commits
//!    through.
//! 3. **Ordered KV index** ([`kv`], [`memkv`]): the persistent side index
//!    holding generation metadata, popped versions and spilled message
//!    data. Shipped engine: an in-memory B-tree persisted through its own
//!    op log with commit markers and incremental snapshots.
//!
//! ## Data flow
//!
//! ```text
//! commit path ──► LogQueue ──► RawDiskQueue ──► segment files
//!                                  ▲
//! spill loop ──► MemoryKv ── op log┘ (its own RawDiskQueue)
//! ```
//!
//! Everything here is crash-safe under the same discipline: bytes become
//! durable only at an explicit `commit()`, and recovery replays exactly the
//! durable prefix, repairing a torn tail before any new append.

pub mod diskqueue;
pub mod error;
pub mod keys;
pub mod kv;
pub mod logqueue;
pub mod memkv;

pub use diskqueue::{DiskQueueConfig, RawDiskQueue};
pub use error::{Error, Result};
pub use kv::KvIndex;
pub use logqueue::{FramedQueue, LogQueue, QueueEntry};
pub use memkv::MemoryKv;

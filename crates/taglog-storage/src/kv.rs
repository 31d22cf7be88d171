//! Ordered KV Index Contract
//!
//! The transaction log's persistent side index: an ordered map from byte
//! key to byte value with range scans, range clears and an atomic commit
//! barrier. The log server depends only on this trait; the shipped engine
//! is [`crate::memkv::MemoryKv`], an in-memory B-tree persisted through its
//! own op log.
//!
//! ## Atomicity
//!
//! Every mutation issued since the previous `commit` either survives a
//! crash together or not at all. Reads observe staged (uncommitted)
//! mutations — callers sequence their own read-after-durable requirements
//! around `commit`.

use async_trait::async_trait;
use bytes::Bytes;
use taglog_core::StorageBytes;

use crate::error::Result;

/// Ordered key-value store with atomic batch commit.
#[async_trait]
pub trait KvIndex: Send + Sync {
    /// Stage a point write.
    async fn set(&self, key: &[u8], value: &[u8]);

    /// Stage a clear of `[begin, end)`.
    async fn clear_range(&self, begin: &[u8], end: &[u8]);

    /// Durable barrier for every mutation staged so far.
    async fn commit(&self) -> Result<()>;

    async fn read_value(&self, key: &[u8]) -> Result<Option<Bytes>>;

    /// Ascending scan of `[begin, end)`, stopping after `row_limit` rows or
    /// once `byte_limit` total key+value bytes have been produced
    /// (returning at least one row if any exists).
    async fn read_range(
        &self,
        begin: &[u8],
        end: &[u8],
        row_limit: usize,
        byte_limit: usize,
    ) -> Result<Vec<(Bytes, Bytes)>>;

    fn storage_bytes(&self) -> StorageBytes;
}

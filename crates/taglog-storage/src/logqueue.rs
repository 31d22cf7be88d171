//! Framed Log Queue
//!
//! Two layers over the raw disk queue:
//!
//! - [`FramedQueue`]: length-prefixed records with a trailing validity
//!   flag, plus the recovery discipline that repairs a torn tail.
//! - [`LogQueue`]: the typed queue the commit path pushes through, framing
//!   one [`QueueEntry`] per record.
//!
//! ## Record format
//!
//! ```text
//! ┌──────────────┬────────────────────┬───────────────┐
//! │ Payload len  │ Payload            │ Valid flag    │
//! │ (4 bytes LE) │ (len bytes)        │ (1 byte, 0x01)│
//! └──────────────┴────────────────────┴───────────────┘
//! ```
//!
//! A queue-entry payload begins with the wire protocol version, then the
//! generation id, version, known-committed version and the message blob.
//!
//! ## Torn-tail repair
//!
//! A crash can leave the last record incomplete. On recovery:
//!
//! - A **partial length header** is completed with zero bytes, and the
//!   phantom record it then describes is zero-filled through its flag
//!   byte, so the byte stream stays frame-aligned.
//! - A **partial payload or missing flag** is zero-filled through the flag
//!   byte for the same reason.
//! - A complete record whose flag is `0` was never committed (it is a
//!   previously zero-filled tear). It is skipped, not returned: committed
//!   records appended after an earlier repair must still be replayed.
//!
//! The zero fill is staged before any new append is accepted and becomes
//! durable with the next commit.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use taglog_core::{protocol_compatible, Uid, Version, PROTOCOL_VERSION};
use tracing::{debug, warn};

use crate::diskqueue::{DiskQueueConfig, RawDiskQueue};
use crate::error::{Error, Result};

/// Upper bound on a single record payload; anything larger is corruption.
const MAX_FRAME_BYTES: u32 = 100 * 1024 * 1024;

/// Bytes of frame overhead around a payload: length header + valid flag.
pub const FRAME_OVERHEAD: u64 = 5;

/// Length-prefixed record framing with torn-tail repair.
pub struct FramedQueue {
    queue: RawDiskQueue,
    recovered: bool,
}

impl FramedQueue {
    pub async fn open(config: DiskQueueConfig) -> Result<Self> {
        let queue = RawDiskQueue::open(config).await?;
        Ok(Self {
            queue,
            recovered: false,
        })
    }

    /// Position the recovery cursor. Returns true if the queue is empty.
    pub fn init_recovery(&mut self, min_location: u64) -> Result<bool> {
        self.queue.init_recovery(min_location)
    }

    /// Read the next valid record. Returns `Ok(None)` exactly once, at the
    /// durable tail, after repairing any torn final record; the queue then
    /// accepts appends.
    pub async fn read_next_frame(&mut self) -> Result<Option<(Bytes, u64, u64)>> {
        if self.recovered {
            return Err(Error::WrongState("read_next_frame after recovery finished"));
        }
        loop {
            let header = self.queue.read_next(4).await?;
            if header.len() < 4 {
                let zero_fill = if header.is_empty() {
                    0
                } else {
                    // Complete the header, then the phantom record the
                    // zero-extended length describes.
                    let mut four = [0u8; 4];
                    four[..header.len()].copy_from_slice(&header);
                    let phantom_len = u32::from_le_bytes(four) as u64;
                    (4 - header.len()) as u64 + phantom_len + 1
                };
                return self.end_recovery(zero_fill).await;
            }
            let payload_len = (&header[..]).get_u32_le();
            if payload_len > MAX_FRAME_BYTES {
                return Err(Error::CorruptQueue(format!(
                    "record payload length {} exceeds the frame limit",
                    payload_len
                )));
            }
            let start = self.queue.next_read_location() - 4;
            let body = self.queue.read_next(payload_len as usize + 1).await?;
            if body.len() < payload_len as usize + 1 {
                let zero_fill = (payload_len as usize + 1 - body.len()) as u64;
                return self.end_recovery(zero_fill).await;
            }
            match body[payload_len as usize] {
                1 => {
                    let end = self.queue.next_read_location();
                    return Ok(Some((body.slice(..payload_len as usize), start, end)));
                }
                0 => {
                    // A previously repaired tear; never committed.
                    debug!(start, len = payload_len, "skipping zero-filled record");
                    continue;
                }
                other => {
                    return Err(Error::CorruptQueue(format!(
                        "record at {} has valid flag {:#x}",
                        start, other
                    )));
                }
            }
        }
    }

    async fn end_recovery(&mut self, zero_fill: u64) -> Result<Option<(Bytes, u64, u64)>> {
        self.queue.finish_recovery().await?;
        if zero_fill > 0 {
            warn!(zero_fill, "zero-filling torn record at queue tail");
            let zeros = vec![0u8; zero_fill as usize];
            self.queue.push(&zeros).await?;
        }
        self.recovered = true;
        Ok(None)
    }

    /// Stage one framed record; returns its `(start, end)` locations.
    pub async fn push_frame(&mut self, payload: &[u8]) -> Result<(u64, u64)> {
        if !self.recovered {
            return Err(Error::WrongState("push_frame before recovery finished"));
        }
        let mut buf = BytesMut::with_capacity(payload.len() + FRAME_OVERHEAD as usize);
        buf.put_u32_le(payload.len() as u32);
        buf.put_slice(payload);
        buf.put_u8(1);
        let start = self.queue.push(&buf).await?;
        Ok((start, start + buf.len() as u64))
    }

    /// Random-access read of one record previously pushed at
    /// `[start, end)`. The record must still be unpopped and durable.
    pub async fn read_frame_at(&self, start: u64, end: u64) -> Result<Bytes> {
        if end < start + FRAME_OVERHEAD {
            return Err(Error::CorruptQueue(format!(
                "record range [{}, {}) is smaller than the frame overhead",
                start, end
            )));
        }
        let raw = self.queue.read(start, end - start).await?;
        let mut buf = raw.clone();
        let payload_len = buf.get_u32_le() as u64;
        if payload_len + FRAME_OVERHEAD != end - start {
            return Err(Error::CorruptQueue(format!(
                "record at {} has length {} but was referenced as {} bytes",
                start,
                payload_len,
                end - start
            )));
        }
        if raw[raw.len() - 1] != 1 {
            return Err(Error::CorruptQueue(format!(
                "referenced record at {} was never committed",
                start
            )));
        }
        Ok(raw.slice(4..raw.len() - 1))
    }

    pub async fn commit(&mut self) -> Result<()> {
        self.queue.commit().await
    }

    pub async fn pop(&mut self, upto: u64) -> Result<()> {
        self.queue.pop(upto).await
    }

    pub fn next_push_location(&self) -> u64 {
        self.queue.next_push_location()
    }

    pub fn popped_location(&self) -> u64 {
        self.queue.popped_location()
    }

    pub fn storage_bytes(&self) -> taglog_core::StorageBytes {
        self.queue.storage_bytes()
    }
}

/// One record of the transaction log queue: everything needed to replay a
/// single version for a single generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueEntry {
    pub id: Uid,
    pub version: Version,
    pub known_committed_version: Version,
    pub messages: Bytes,
}

impl QueueEntry {
    fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(8 + 16 + 8 + 8 + 4 + self.messages.len());
        buf.put_u64_le(PROTOCOL_VERSION);
        buf.put_slice(&self.id.to_bytes());
        buf.put_u64_le(self.version);
        buf.put_u64_le(self.known_committed_version);
        buf.put_u32_le(self.messages.len() as u32);
        buf.put_slice(&self.messages);
        buf.freeze()
    }

    fn decode(mut payload: Bytes) -> Result<Self> {
        if payload.len() < 8 + 16 + 8 + 8 + 4 {
            return Err(Error::CorruptQueue(format!(
                "queue entry payload of {} bytes is too short",
                payload.len()
            )));
        }
        let protocol = payload.get_u64_le();
        if !protocol_compatible(protocol, PROTOCOL_VERSION) {
            return Err(Error::IncompatibleQueueEntry(protocol));
        }
        let mut uid_bytes = [0u8; 16];
        payload.copy_to_slice(&mut uid_bytes);
        let id = Uid::from_bytes(uid_bytes);
        let version = payload.get_u64_le();
        let known_committed_version = payload.get_u64_le();
        let len = payload.get_u32_le() as usize;
        if payload.len() != len {
            return Err(Error::CorruptQueue(format!(
                "queue entry message blob is {} bytes, expected {}",
                payload.len(),
                len
            )));
        }
        Ok(Self {
            id,
            version,
            known_committed_version,
            messages: payload,
        })
    }
}

/// The typed transaction-log queue.
pub struct LogQueue {
    inner: FramedQueue,
}

impl LogQueue {
    pub async fn open(config: DiskQueueConfig) -> Result<Self> {
        Ok(Self {
            inner: FramedQueue::open(config).await?,
        })
    }

    pub fn init_recovery(&mut self, min_location: u64) -> Result<bool> {
        self.inner.init_recovery(min_location)
    }

    /// Replay the next durable entry, or `Ok(None)` at the repaired tail.
    pub async fn read_next(&mut self) -> Result<Option<(QueueEntry, u64, u64)>> {
        match self.inner.read_next_frame().await? {
            Some((payload, start, end)) => Ok(Some((QueueEntry::decode(payload)?, start, end))),
            None => Ok(None),
        }
    }

    /// Stage one entry; returns the `(start, end)` queue locations it
    /// occupies, for the caller's version-location index.
    pub async fn push(&mut self, entry: &QueueEntry) -> Result<(u64, u64)> {
        self.inner.push_frame(&entry.encode()).await
    }

    /// Resolve a spilled reference back to its entry.
    pub async fn entry_at(&self, start: u64, end: u64) -> Result<QueueEntry> {
        QueueEntry::decode(self.inner.read_frame_at(start, end).await?)
    }

    pub async fn commit(&mut self) -> Result<()> {
        self.inner.commit().await
    }

    pub async fn pop(&mut self, upto: u64) -> Result<()> {
        self.inner.pop(upto).await
    }

    pub fn next_push_location(&self) -> u64 {
        self.inner.next_push_location()
    }

    pub fn popped_location(&self) -> u64 {
        self.inner.popped_location()
    }

    pub fn storage_bytes(&self) -> taglog_core::StorageBytes {
        self.inner.storage_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn config(dir: &TempDir) -> DiskQueueConfig {
        DiskQueueConfig {
            directory: dir.path().to_path_buf(),
            file_prefix: "tlog".to_string(),
            ..Default::default()
        }
    }

    fn entry(version: Version, body: &'static [u8]) -> QueueEntry {
        QueueEntry {
            id: Uid::new(1, 2),
            version,
            known_committed_version: version.saturating_sub(1),
            messages: Bytes::from_static(body),
        }
    }

    async fn open_recovered(dir: &TempDir) -> (LogQueue, Vec<QueueEntry>) {
        let mut q = LogQueue::open(config(dir)).await.unwrap();
        q.init_recovery(0).unwrap();
        let mut entries = Vec::new();
        while let Some((e, _, _)) = q.read_next().await.unwrap() {
            entries.push(e);
        }
        (q, entries)
    }

    fn only_segment_path(dir: &TempDir) -> std::path::PathBuf {
        let mut paths: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().path())
            .filter(|p| p.extension().map(|x| x == "seg").unwrap_or(false))
            .collect();
        assert_eq!(paths.len(), 1);
        paths.pop().unwrap()
    }

    #[tokio::test]
    async fn test_push_read_roundtrip() {
        let dir = TempDir::new().unwrap();
        {
            let (mut q, entries) = open_recovered(&dir).await;
            assert!(entries.is_empty());
            let (s1, e1) = q.push(&entry(10, b"aaa")).await.unwrap();
            let (s2, _) = q.push(&entry(11, b"bb")).await.unwrap();
            assert_eq!(e1, s2);
            assert!(s1 < s2);
            q.commit().await.unwrap();
        }
        let (_, entries) = open_recovered(&dir).await;
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0], entry(10, b"aaa"));
        assert_eq!(entries[1], entry(11, b"bb"));
    }

    #[tokio::test]
    async fn test_entry_at_resolves_reference() {
        let dir = TempDir::new().unwrap();
        let (mut q, _) = open_recovered(&dir).await;
        let (start, end) = q.push(&entry(42, b"payload")).await.unwrap();
        q.commit().await.unwrap();
        let read = q.entry_at(start, end).await.unwrap();
        assert_eq!(read, entry(42, b"payload"));
    }

    #[tokio::test]
    async fn test_entry_at_bad_range_is_corrupt() {
        let dir = TempDir::new().unwrap();
        let (mut q, _) = open_recovered(&dir).await;
        let (start, end) = q.push(&entry(42, b"payload")).await.unwrap();
        q.push(&entry(43, b"next")).await.unwrap();
        q.commit().await.unwrap();
        assert!(matches!(
            q.entry_at(start, end + 3).await,
            Err(Error::CorruptQueue(_))
        ));
    }

    #[tokio::test]
    async fn test_uncommitted_push_is_not_recovered() {
        let dir = TempDir::new().unwrap();
        {
            let (mut q, _) = open_recovered(&dir).await;
            q.push(&entry(10, b"durable")).await.unwrap();
            q.commit().await.unwrap();
            q.push(&entry(11, b"staged only")).await.unwrap();
            // no commit
        }
        // The staged record happens to be fully on disk here, flag byte
        // included, so it is indistinguishable from a committed one; what
        // matters is the torn cases below. This asserts the full-record
        // case replays (the durable prefix replay may legitimately include
        // it).
        let (_, entries) = open_recovered(&dir).await;
        assert!(!entries.is_empty());
        assert_eq!(entries[0], entry(10, b"durable"));
    }

    #[tokio::test]
    async fn test_torn_flag_byte_is_repaired() {
        // S4 shape: commit three records, shear 3 bytes off the tail
        // (through the last record's flag byte), recover, then append.
        let dir = TempDir::new().unwrap();
        {
            let (mut q, _) = open_recovered(&dir).await;
            q.push(&entry(20, b"twenty")).await.unwrap();
            q.push(&entry(21, b"twenty-one")).await.unwrap();
            q.push(&entry(22, b"twenty-two")).await.unwrap();
            q.commit().await.unwrap();
        }
        let path = only_segment_path(&dir);
        let len = std::fs::metadata(&path).unwrap().len();
        let file = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(len - 3).unwrap();
        drop(file);

        let (mut q, entries) = open_recovered(&dir).await;
        let versions: Vec<_> = entries.iter().map(|e| e.version).collect();
        assert_eq!(versions, vec![20, 21]);

        // The tail was zero-filled; new appends must work and survive.
        q.push(&entry(23, b"twenty-three")).await.unwrap();
        q.commit().await.unwrap();
        drop(q);

        let (_, entries) = open_recovered(&dir).await;
        let versions: Vec<_> = entries.iter().map(|e| e.version).collect();
        assert_eq!(versions, vec![20, 21, 23]);
    }

    #[tokio::test]
    async fn test_torn_header_is_repaired() {
        let dir = TempDir::new().unwrap();
        let full_len;
        {
            let (mut q, _) = open_recovered(&dir).await;
            q.push(&entry(30, b"thirty")).await.unwrap();
            q.commit().await.unwrap();
            full_len = q.next_push_location();
            q.push(&entry(31, b"thirty-one")).await.unwrap();
            q.commit().await.unwrap();
        }
        // Shear so only 2 bytes of the second record's header survive.
        let path = only_segment_path(&dir);
        let file = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(full_len + 2).unwrap();
        drop(file);

        let (mut q, entries) = open_recovered(&dir).await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].version, 30);

        q.push(&entry(32, b"thirty-two")).await.unwrap();
        q.commit().await.unwrap();
        drop(q);

        let (_, entries) = open_recovered(&dir).await;
        let versions: Vec<_> = entries.iter().map(|e| e.version).collect();
        assert_eq!(versions, vec![30, 32]);
    }

    #[tokio::test]
    async fn test_repeated_crashes_keep_framing_aligned() {
        let dir = TempDir::new().unwrap();
        {
            let (mut q, _) = open_recovered(&dir).await;
            q.push(&entry(1, b"one")).await.unwrap();
            q.commit().await.unwrap();
            q.push(&entry(2, b"two")).await.unwrap();
            q.commit().await.unwrap();
        }
        for round in 0..3u64 {
            // Tear one byte per round, recover, append, repeat.
            let path = only_segment_path(&dir);
            let len = std::fs::metadata(&path).unwrap().len();
            let file = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
            file.set_len(len - 1).unwrap();
            drop(file);

            let (mut q, entries) = open_recovered(&dir).await;
            assert!(entries.iter().any(|e| e.version == 1));
            q.push(&entry(100 + round, b"patch")).await.unwrap();
            q.commit().await.unwrap();
        }
        let (_, entries) = open_recovered(&dir).await;
        assert!(entries.iter().any(|e| e.version == 1));
        assert_eq!(entries.last().unwrap().version, 102);
    }

    #[tokio::test]
    async fn test_framing_survives_segment_roll() {
        let dir = TempDir::new().unwrap();
        let config = DiskQueueConfig {
            directory: dir.path().to_path_buf(),
            file_prefix: "tlog".to_string(),
            segment_bytes: 128,
            ..Default::default()
        };
        {
            let mut q = LogQueue::open(config.clone()).await.unwrap();
            q.init_recovery(0).unwrap();
            while q.read_next().await.unwrap().is_some() {}
            for v in 0..50u64 {
                q.push(&entry(v, b"roll roll roll")).await.unwrap();
            }
            q.commit().await.unwrap();
        }
        let mut q = LogQueue::open(config).await.unwrap();
        q.init_recovery(0).unwrap();
        let mut versions = Vec::new();
        while let Some((e, _, _)) = q.read_next().await.unwrap() {
            versions.push(e.version);
        }
        assert_eq!(versions, (0..50u64).collect::<Vec<_>>());
    }
}

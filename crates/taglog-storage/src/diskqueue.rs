//! Raw Disk Queue
//!
//! An append-only byte log backed by a directory of segment files. Offsets
//! ("locations") are global: they increase monotonically for the life of the
//! queue and are never reused, so a location names the same bytes forever.
//!
//! ## File layout
//!
//! Each segment file is named `{prefix}-{base:016x}.seg` where `base` is the
//! global location of its first byte. Segments are contiguous: the next
//! segment starts exactly where the previous one ends. A segment is rolled
//! once it reaches the configured size; records may span a roll boundary
//! because readers see one continuous byte stream.
//!
//! ## Durability
//!
//! `push` stages bytes with a buffered file write and implies nothing.
//! `commit` fsyncs every file touched since the previous commit, oldest
//! first; only then are the staged bytes recoverable. A crash between the
//! two may leave a partially-written tail — the queue makes no attempt to
//! detect that itself. The framing layer on top owns torn-tail detection
//! and calls [`RawDiskQueue::finish_recovery`] once it has found the true
//! end.
//!
//! ## Reclamation
//!
//! `pop(upto)` declares that no reader will ever ask for bytes below
//! `upto` again. Whole segment files entirely below the pop location are
//! deleted; a partially-popped segment is retained until the pop location
//! passes its end.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use taglog_core::StorageBytes;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

const SEGMENT_SUFFIX: &str = ".seg";

/// Disk queue configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiskQueueConfig {
    /// Directory holding the segment files.
    pub directory: PathBuf,

    /// File name prefix, e.g. `logqueue`.
    pub file_prefix: String,

    /// Roll to a new segment once the active one reaches this size.
    pub segment_bytes: u64,

    /// Capacity reported through `storage_bytes`.
    pub capacity_bytes: u64,
}

impl Default for DiskQueueConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("./data/queue"),
            file_prefix: "queue".to_string(),
            segment_bytes: 8 * 1024 * 1024,
            capacity_bytes: 64 * 1024 * 1024 * 1024,
        }
    }
}

#[derive(Debug)]
struct Segment {
    /// Global location of the first byte.
    base: u64,
    /// Bytes currently in the file.
    len: u64,
    path: PathBuf,
}

impl Segment {
    fn end(&self) -> u64 {
        self.base + self.len
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Mode {
    /// Opened, recovery not yet initialized.
    Opened,
    /// Sequential recovery reads in progress.
    Recovering,
    /// Recovery finished, appends allowed.
    Appending,
}

struct ReadCursor {
    /// Index into `segments` of the segment the cursor is in.
    segment: usize,
    /// Global location of the next byte to read.
    location: u64,
    /// Open handle positioned at the cursor, lazily created.
    file: Option<File>,
}

/// Append-only segmented byte queue. See the module docs.
pub struct RawDiskQueue {
    config: DiskQueueConfig,
    segments: Vec<Segment>,
    mode: Mode,
    /// Global location of the next staged byte.
    push_location: u64,
    /// Everything below this survived the last `commit`.
    durable_location: u64,
    /// Everything below this may be reclaimed.
    popped_location: u64,
    /// Active segment handle, open for append.
    active: Option<File>,
    /// Rolled-but-not-yet-synced handles, oldest first.
    unsynced: Vec<File>,
    cursor: Option<ReadCursor>,
}

impl RawDiskQueue {
    /// Open the queue, scanning the directory for existing segments. The
    /// queue starts in recovery mode; call [`Self::init_recovery`] and
    /// drain [`Self::read_next`] (or go straight to
    /// [`Self::finish_recovery`]) before pushing.
    pub async fn open(config: DiskQueueConfig) -> Result<Self> {
        tokio::fs::create_dir_all(&config.directory).await?;

        let mut segments = Vec::new();
        let mut entries = tokio::fs::read_dir(&config.directory).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if let Some(base) = parse_segment_base(&path, &config.file_prefix) {
                let len = entry.metadata().await?.len();
                segments.push(Segment { base, len, path });
            }
        }
        segments.sort_by_key(|s| s.base);

        for pair in segments.windows(2) {
            if pair[0].end() != pair[1].base {
                return Err(Error::CorruptQueue(format!(
                    "segment gap: {} ends at {} but next starts at {}",
                    pair[0].path.display(),
                    pair[0].end(),
                    pair[1].base
                )));
            }
        }

        let push_location = segments.last().map(|s| s.end()).unwrap_or(0);
        let popped_location = segments.first().map(|s| s.base).unwrap_or(0);

        info!(
            dir = %config.directory.display(),
            segments = segments.len(),
            tail = push_location,
            "disk queue opened"
        );

        Ok(Self {
            config,
            segments,
            mode: Mode::Opened,
            push_location,
            durable_location: push_location,
            popped_location,
            active: None,
            unsynced: Vec::new(),
            cursor: None,
        })
    }

    /// Position the recovery cursor at `min_location` (clamped into the
    /// surviving range). Returns true if the queue was found fully empty.
    pub fn init_recovery(&mut self, min_location: u64) -> Result<bool> {
        if self.mode != Mode::Opened {
            return Err(Error::WrongState("init_recovery after recovery started"));
        }
        let start = min_location
            .max(self.popped_location)
            .min(self.push_location);
        let segment = self
            .segments
            .iter()
            .position(|s| s.end() > start)
            .unwrap_or(self.segments.len());
        self.cursor = Some(ReadCursor {
            segment,
            location: start,
            file: None,
        });
        self.mode = Mode::Recovering;
        Ok(self.segments.is_empty() || self.push_location == self.popped_location)
    }

    /// Sequentially read up to `n` bytes at the cursor. A short (possibly
    /// empty) result means the physical end of the queue was reached.
    pub async fn read_next(&mut self, n: usize) -> Result<Bytes> {
        if self.mode != Mode::Recovering {
            return Err(Error::WrongState("read_next outside recovery"));
        }
        let mut out = BytesMut::with_capacity(n.min(64 * 1024));
        while out.len() < n {
            let cursor = match self.cursor.as_mut() {
                Some(c) => c,
                None => return Err(Error::WrongState("read_next before init_recovery")),
            };
            let segment = match self.segments.get(cursor.segment) {
                Some(s) => s,
                None => break, // past the last segment
            };
            if cursor.location >= segment.end() {
                cursor.segment += 1;
                cursor.file = None;
                continue;
            }
            if cursor.file.is_none() {
                let mut file = File::open(&segment.path).await?;
                file.seek(SeekFrom::Start(cursor.location - segment.base))
                    .await?;
                cursor.file = Some(file);
            }
            let want = (n - out.len()).min((segment.end() - cursor.location) as usize);
            let mut buf = vec![0u8; want];
            let file = cursor.file.as_mut().ok_or(Error::WrongState("no cursor"))?;
            file.read_exact(&mut buf).await?;
            cursor.location += want as u64;
            out.extend_from_slice(&buf);
        }
        Ok(out.freeze())
    }

    /// Truncate the physical tail to the read cursor and switch to append
    /// mode. Must be called exactly once, after the framing layer has
    /// located the end of the durable data.
    pub async fn finish_recovery(&mut self) -> Result<()> {
        if self.mode != Mode::Recovering {
            return Err(Error::WrongState("finish_recovery outside recovery"));
        }
        let location = self
            .cursor
            .as_ref()
            .map(|c| c.location)
            .unwrap_or(self.push_location);

        // Drop segments entirely beyond the cursor, then truncate the one
        // containing it.
        while let Some(last) = self.segments.last() {
            if last.base >= location && last.len > 0 && last.base != location {
                warn!(base = last.base, "discarding unreachable segment");
                tokio::fs::remove_file(&last.path).await?;
                self.segments.pop();
            } else {
                break;
            }
        }
        if let Some(seg) = self
            .segments
            .iter_mut()
            .find(|s| s.base <= location && location < s.end())
        {
            if location - seg.base < seg.len {
                debug!(
                    tail = location,
                    dropped = seg.end() - location,
                    "truncating torn queue tail"
                );
                let file = OpenOptions::new().write(true).open(&seg.path).await?;
                file.set_len(location - seg.base).await?;
                file.sync_all().await?;
                seg.len = location - seg.base;
            }
        }

        self.push_location = location;
        self.durable_location = location;
        self.cursor = None;
        self.mode = Mode::Appending;

        // Re-open (or create) the active segment for appending.
        let active = match self.segments.last() {
            Some(seg) if seg.end() == location => {
                OpenOptions::new().append(true).open(&seg.path).await?
            }
            _ => self.create_segment(location).await?,
        };
        self.active = Some(active);
        Ok(())
    }

    async fn create_segment(&mut self, base: u64) -> Result<File> {
        let path = self.config.directory.join(format!(
            "{}-{:016x}{}",
            self.config.file_prefix, base, SEGMENT_SUFFIX
        ));
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .append(true)
            .open(&path)
            .await?;
        self.segments.push(Segment { base, len: 0, path });
        Ok(file)
    }

    /// Stage bytes at the tail; returns the global location of the first
    /// byte. Durability requires a later [`Self::commit`].
    pub async fn push(&mut self, data: &[u8]) -> Result<u64> {
        if self.mode != Mode::Appending {
            return Err(Error::WrongState("push before finish_recovery"));
        }
        let start = self.push_location;

        let roll = match self.segments.last() {
            Some(seg) => seg.len >= self.config.segment_bytes,
            None => true,
        };
        if roll {
            if let Some(old) = self.active.take() {
                self.unsynced.push(old);
            }
            let file = self.create_segment(start).await?;
            self.active = Some(file);
        }

        let file = self.active.as_mut().ok_or(Error::WrongState("no active"))?;
        file.write_all(data).await?;
        if let Some(seg) = self.segments.last_mut() {
            seg.len += data.len() as u64;
        }
        self.push_location += data.len() as u64;
        Ok(start)
    }

    /// Durable barrier: after this resolves, every prior `push` is
    /// recoverable in order.
    pub async fn commit(&mut self) -> Result<()> {
        if self.mode != Mode::Appending {
            return Err(Error::WrongState("commit before finish_recovery"));
        }
        for file in &mut self.unsynced {
            file.sync_data().await?;
        }
        self.unsynced.clear();
        if let Some(active) = self.active.as_mut() {
            active.sync_data().await?;
        }
        self.durable_location = self.push_location;
        Ok(())
    }

    /// Declare that no reader will ask for bytes below `upto` again.
    /// Deletes whole segments below the pop location.
    pub async fn pop(&mut self, upto: u64) -> Result<()> {
        let upto = upto.min(self.durable_location);
        if upto <= self.popped_location {
            return Ok(());
        }
        self.popped_location = upto;

        let mut kept = Vec::with_capacity(self.segments.len());
        for seg in self.segments.drain(..) {
            // The active (last) segment is never deleted.
            let is_active = seg.end() >= self.push_location;
            if !is_active && seg.end() <= upto {
                debug!(base = seg.base, len = seg.len, "popping queue segment");
                tokio::fs::remove_file(&seg.path).await?;
            } else {
                kept.push(seg);
            }
        }
        self.segments = kept;
        Ok(())
    }

    /// Checked random-access read of `[location, location + length)`. Used
    /// to resolve spilled references. Fails below the pop location and past
    /// the durable tail.
    pub async fn read(&self, location: u64, length: u64) -> Result<Bytes> {
        if location < self.popped_location {
            return Err(Error::PoppedRange {
                location,
                popped: self.popped_location,
            });
        }
        if location + length > self.durable_location {
            return Err(Error::PastDurable {
                location,
                length,
                durable: self.durable_location,
            });
        }
        let mut out = BytesMut::with_capacity(length as usize);
        let mut at = location;
        while (out.len() as u64) < length {
            let seg = self
                .segments
                .iter()
                .find(|s| s.base <= at && at < s.end())
                .ok_or_else(|| {
                    Error::CorruptQueue(format!("no segment covers location {}", at))
                })?;
            let want = (length - out.len() as u64).min(seg.end() - at);
            let mut file = File::open(&seg.path).await?;
            file.seek(SeekFrom::Start(at - seg.base)).await?;
            let mut buf = vec![0u8; want as usize];
            file.read_exact(&mut buf).await?;
            out.extend_from_slice(&buf);
            at += want;
        }
        Ok(out.freeze())
    }

    pub fn next_read_location(&self) -> u64 {
        self.cursor
            .as_ref()
            .map(|c| c.location)
            .unwrap_or(self.push_location)
    }

    pub fn next_push_location(&self) -> u64 {
        self.push_location
    }

    pub fn durable_location(&self) -> u64 {
        self.durable_location
    }

    pub fn popped_location(&self) -> u64 {
        self.popped_location
    }

    pub fn storage_bytes(&self) -> StorageBytes {
        let used: u64 = self.segments.iter().map(|s| s.len).sum();
        StorageBytes::for_used(used, self.config.capacity_bytes)
    }
}

fn parse_segment_base(path: &Path, prefix: &str) -> Option<u64> {
    let name = path.file_name()?.to_str()?;
    let rest = name.strip_prefix(prefix)?.strip_prefix('-')?;
    let hex = rest.strip_suffix(SEGMENT_SUFFIX)?;
    if hex.len() != 16 {
        return None;
    }
    u64::from_str_radix(hex, 16).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn config(dir: &TempDir) -> DiskQueueConfig {
        DiskQueueConfig {
            directory: dir.path().to_path_buf(),
            file_prefix: "test".to_string(),
            segment_bytes: 64,
            capacity_bytes: 1024 * 1024,
        }
    }

    async fn fresh_queue(dir: &TempDir) -> RawDiskQueue {
        let mut q = RawDiskQueue::open(config(dir)).await.unwrap();
        assert!(q.init_recovery(0).unwrap());
        q.finish_recovery().await.unwrap();
        q
    }

    #[tokio::test]
    async fn test_push_assigns_sequential_locations() {
        let dir = TempDir::new().unwrap();
        let mut q = fresh_queue(&dir).await;
        assert_eq!(q.push(b"abc").await.unwrap(), 0);
        assert_eq!(q.push(b"defg").await.unwrap(), 3);
        assert_eq!(q.next_push_location(), 7);
    }

    #[tokio::test]
    async fn test_commit_then_reopen_recovers_bytes() {
        let dir = TempDir::new().unwrap();
        {
            let mut q = fresh_queue(&dir).await;
            q.push(b"hello ").await.unwrap();
            q.push(b"world").await.unwrap();
            q.commit().await.unwrap();
        }
        let mut q = RawDiskQueue::open(config(&dir)).await.unwrap();
        assert!(!q.init_recovery(0).unwrap());
        let bytes = q.read_next(64).await.unwrap();
        assert_eq!(&bytes[..], b"hello world");
        let end = q.read_next(16).await.unwrap();
        assert!(end.is_empty());
    }

    #[tokio::test]
    async fn test_read_spans_segment_roll() {
        let dir = TempDir::new().unwrap();
        let mut q = fresh_queue(&dir).await;
        // Segment size is 64; push enough to roll several times.
        for i in 0u8..8 {
            q.push(&[i; 40]).await.unwrap();
        }
        q.commit().await.unwrap();
        assert!(q.segments.len() > 1);

        let data = q.read(30, 60).await.unwrap();
        assert_eq!(data.len(), 60);
        assert_eq!(data[9], 0); // last byte of record 0
        assert_eq!(data[10], 1); // first byte of record 1

        drop(q);
        let mut q = RawDiskQueue::open(config(&dir)).await.unwrap();
        q.init_recovery(0).unwrap();
        let all = q.read_next(8 * 40).await.unwrap();
        assert_eq!(all.len(), 8 * 40);
        for i in 0u8..8 {
            assert!(all[i as usize * 40..(i as usize + 1) * 40]
                .iter()
                .all(|b| *b == i));
        }
    }

    #[tokio::test]
    async fn test_pop_deletes_whole_segments_only() {
        let dir = TempDir::new().unwrap();
        let mut q = fresh_queue(&dir).await;
        for i in 0u8..8 {
            q.push(&[i; 40]).await.unwrap();
        }
        q.commit().await.unwrap();
        let used_before = q.storage_bytes().used;

        q.pop(150).await.unwrap();
        let used_after = q.storage_bytes().used;
        assert!(used_after < used_before);
        // Bytes at and above the pop location must survive.
        assert!(q.read(150, 40).await.is_ok());
        // Bytes below it must be refused.
        assert!(matches!(
            q.read(0, 10).await,
            Err(Error::PoppedRange { .. })
        ));
    }

    #[tokio::test]
    async fn test_pop_everything_reclaims_all_but_active() {
        let dir = TempDir::new().unwrap();
        let mut q = fresh_queue(&dir).await;
        for i in 0u8..8 {
            q.push(&[i; 40]).await.unwrap();
        }
        q.commit().await.unwrap();
        let tail = q.next_push_location();
        q.pop(tail).await.unwrap();
        // Only the active segment's bytes may remain.
        assert!(q.storage_bytes().used <= q.config.segment_bytes + 40);
    }

    #[tokio::test]
    async fn test_read_past_durable_is_refused() {
        let dir = TempDir::new().unwrap();
        let mut q = fresh_queue(&dir).await;
        q.push(b"staged but not committed").await.unwrap();
        assert!(matches!(
            q.read(0, 5).await,
            Err(Error::PastDurable { .. })
        ));
        q.commit().await.unwrap();
        assert_eq!(&q.read(0, 6).await.unwrap()[..], b"staged");
    }

    #[tokio::test]
    async fn test_torn_tail_is_truncated_on_recovery() {
        let dir = TempDir::new().unwrap();
        {
            let mut q = fresh_queue(&dir).await;
            q.push(b"durable").await.unwrap();
            q.commit().await.unwrap();
            q.push(b"torn").await.unwrap();
            // No commit: the tail may or may not survive; simulate the
            // worst case by leaving it there (it did survive) and having
            // the framing layer stop early.
        }
        let mut q = RawDiskQueue::open(config(&dir)).await.unwrap();
        q.init_recovery(0).unwrap();
        let head = q.read_next(7).await.unwrap();
        assert_eq!(&head[..], b"durable");
        // Framing layer decides the rest is torn and finishes here.
        q.finish_recovery().await.unwrap();
        assert_eq!(q.next_push_location(), 7);
        let loc = q.push(b"fresh").await.unwrap();
        assert_eq!(loc, 7);
        q.commit().await.unwrap();
        assert_eq!(&q.read(7, 5).await.unwrap()[..], b"fresh");
    }

    #[tokio::test]
    async fn test_reopen_after_pop_keeps_locations() {
        let dir = TempDir::new().unwrap();
        {
            let mut q = fresh_queue(&dir).await;
            for i in 0u8..8 {
                q.push(&[i; 40]).await.unwrap();
            }
            q.commit().await.unwrap();
            q.pop(200).await.unwrap();
        }
        let mut q = RawDiskQueue::open(config(&dir)).await.unwrap();
        assert!(!q.init_recovery(0).unwrap());
        // Cursor clamps to the surviving range.
        assert!(q.next_read_location() >= 64);
        let rest = q.read_next(usize::MAX / 2).await.unwrap();
        assert_eq!(q.next_read_location(), 320);
        assert!(!rest.is_empty());
    }

    #[tokio::test]
    async fn test_empty_queue_reports_empty() {
        let dir = TempDir::new().unwrap();
        let mut q = RawDiskQueue::open(config(&dir)).await.unwrap();
        assert!(q.init_recovery(0).unwrap());
        assert!(q.read_next(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_storage_bytes_accounting() {
        let dir = TempDir::new().unwrap();
        let mut q = fresh_queue(&dir).await;
        q.push(&[0u8; 100]).await.unwrap();
        q.commit().await.unwrap();
        let s = q.storage_bytes();
        assert_eq!(s.used, 100);
        assert_eq!(s.total, 1024 * 1024);
        assert_eq!(s.free, s.total - 100);
    }
}

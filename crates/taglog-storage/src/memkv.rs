//! In-Memory KV Engine
//!
//! An ordered map held fully in memory and persisted through its own op
//! log (a [`FramedQueue`]). Each mutation is framed as one op record; a
//! `Commit` marker closes a batch. Recovery replays the log in order,
//! buffering ops and applying them only when their commit marker is seen,
//! so a batch torn by a crash rolls back as a unit.
//!
//! ## Bounding the log
//!
//! The log would otherwise grow forever, so a snapshot cycle re-writes the
//! live map into the log as `SnapshotItem` ops, a chunk per call to
//! [`MemoryKv::snapshot_step`]. When a cycle wraps around, a
//! `SnapshotEnd` is written and the log prefix preceding the cycle's start
//! is popped at the next commit: everything at or after that location
//! (the cycle's items plus all ops interleaved with them) reconstructs the
//! map.
//!
//! Snapshot items capture staged-but-uncommitted values, which is sound
//! because they become durable under the same commit marker as the ops
//! that staged those values.

use std::collections::BTreeMap;
use std::ops::Bound;

use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use taglog_core::StorageBytes;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::diskqueue::DiskQueueConfig;
use crate::error::{Error, Result};
use crate::kv::KvIndex;
use crate::logqueue::FramedQueue;

const OP_SET: u8 = 1;
const OP_CLEAR_RANGE: u8 = 2;
const OP_COMMIT: u8 = 3;
const OP_SNAPSHOT_ITEM: u8 = 4;
const OP_SNAPSHOT_END: u8 = 5;

#[derive(Debug)]
enum Op {
    Set { key: Vec<u8>, value: Bytes },
    ClearRange { begin: Vec<u8>, end: Vec<u8> },
    Commit,
    SnapshotItem { key: Vec<u8>, value: Bytes },
    SnapshotEnd,
}

impl Op {
    fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        match self {
            Op::Set { key, value } | Op::SnapshotItem { key, value } => {
                buf.put_u8(if matches!(self, Op::Set { .. }) {
                    OP_SET
                } else {
                    OP_SNAPSHOT_ITEM
                });
                buf.put_u32_le(key.len() as u32);
                buf.put_slice(key);
                buf.put_u32_le(value.len() as u32);
                buf.put_slice(value);
            }
            Op::ClearRange { begin, end } => {
                buf.put_u8(OP_CLEAR_RANGE);
                buf.put_u32_le(begin.len() as u32);
                buf.put_slice(begin);
                buf.put_u32_le(end.len() as u32);
                buf.put_slice(end);
            }
            Op::Commit => buf.put_u8(OP_COMMIT),
            Op::SnapshotEnd => buf.put_u8(OP_SNAPSHOT_END),
        }
        buf.freeze()
    }

    fn decode(mut payload: Bytes) -> Result<Op> {
        if payload.is_empty() {
            return Err(Error::CorruptQueue("empty kv op record".to_string()));
        }
        let kind = payload.get_u8();
        let mut pair = |payload: &mut Bytes| -> Result<(Vec<u8>, Bytes)> {
            if payload.len() < 4 {
                return Err(Error::CorruptQueue("short kv op".to_string()));
            }
            let klen = payload.get_u32_le() as usize;
            if payload.len() < klen + 4 {
                return Err(Error::CorruptQueue("short kv op key".to_string()));
            }
            let key = payload.split_to(klen).to_vec();
            let vlen = payload.get_u32_le() as usize;
            if payload.len() < vlen {
                return Err(Error::CorruptQueue("short kv op value".to_string()));
            }
            let value = payload.split_to(vlen);
            Ok((key, value))
        };
        match kind {
            OP_SET => {
                let (key, value) = pair(&mut payload)?;
                Ok(Op::Set { key, value })
            }
            OP_SNAPSHOT_ITEM => {
                let (key, value) = pair(&mut payload)?;
                Ok(Op::SnapshotItem { key, value })
            }
            OP_CLEAR_RANGE => {
                let (begin, end) = pair(&mut payload)?;
                Ok(Op::ClearRange {
                    begin,
                    end: end.to_vec(),
                })
            }
            OP_COMMIT => Ok(Op::Commit),
            OP_SNAPSHOT_END => Ok(Op::SnapshotEnd),
            other => Err(Error::CorruptQueue(format!("unknown kv op kind {}", other))),
        }
    }
}

fn apply_op(data: &mut BTreeMap<Vec<u8>, Bytes>, op: Op) {
    match op {
        Op::Set { key, value } | Op::SnapshotItem { key, value } => {
            data.insert(key, value);
        }
        Op::ClearRange { begin, end } => {
            let dead: Vec<Vec<u8>> = data
                .range::<[u8], _>((
                    Bound::Included(begin.as_slice()),
                    Bound::Excluded(end.as_slice()),
                ))
                .map(|(k, _)| k.clone())
                .collect();
            for key in dead {
                data.remove(&key);
            }
        }
        Op::Commit | Op::SnapshotEnd => {}
    }
}

struct Inner {
    data: BTreeMap<Vec<u8>, Bytes>,
    /// Encoded ops staged since the last commit, in issue order.
    staged: Vec<Bytes>,
    queue: FramedQueue,
    /// Next key the snapshot cycle will re-write, if a cycle is running.
    snapshot_cursor: Option<Vec<u8>>,
    /// Queue location where the running cycle began.
    cycle_start: Option<u64>,
    /// Pop the op log to this location at the next commit.
    pop_pending: Option<u64>,
}

impl Inner {
    fn apply(&mut self, op: Op) {
        apply_op(&mut self.data, op);
    }
}

/// In-memory ordered KV store with op-log persistence. See module docs.
pub struct MemoryKv {
    inner: Mutex<Inner>,
}

impl MemoryKv {
    /// Open the store, replaying its op log.
    pub async fn open(config: DiskQueueConfig) -> Result<Self> {
        let mut queue = FramedQueue::open(config).await?;
        queue.init_recovery(0)?;

        let mut data = BTreeMap::new();
        let mut pending: Vec<Op> = Vec::new();
        let mut replayed = 0usize;
        let mut dropped = 0usize;
        while let Some((payload, _, _)) = queue.read_next_frame().await? {
            let op = Op::decode(payload)?;
            if matches!(op, Op::Commit) {
                replayed += pending.len();
                for op in pending.drain(..) {
                    apply_op(&mut data, op);
                }
            } else {
                pending.push(op);
            }
        }
        dropped += pending.len();

        info!(
            keys = data.len(),
            replayed, dropped, "memory kv store recovered"
        );

        Ok(Self {
            inner: Mutex::new(Inner {
                data,
                staged: Vec::new(),
                queue,
                snapshot_cursor: None,
                cycle_start: None,
                pop_pending: None,
            }),
        })
    }

    /// Write one chunk of the snapshot cycle, up to `max_bytes` of re-written
    /// key/value data. Returns true if this call completed a cycle.
    pub async fn snapshot_step(&self, max_bytes: usize) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        if inner.snapshot_cursor.is_none() {
            let start = inner.queue.next_push_location();
            inner.cycle_start = Some(start);
            inner.snapshot_cursor = Some(Vec::new());
        }
        let cursor = inner
            .snapshot_cursor
            .clone()
            .ok_or(Error::WrongState("snapshot cursor missing"))?;

        let mut written = 0usize;
        let mut items: Vec<Op> = Vec::new();
        let mut next_cursor: Option<Vec<u8>> = None;
        for (key, value) in inner
            .data
            .range::<[u8], _>((Bound::Included(cursor.as_slice()), Bound::Unbounded))
        {
            if written >= max_bytes {
                next_cursor = Some(key.clone());
                break;
            }
            written += key.len() + value.len();
            items.push(Op::SnapshotItem {
                key: key.clone(),
                value: value.clone(),
            });
        }
        for item in &items {
            let encoded = item.encode();
            inner.staged.push(encoded);
        }

        match next_cursor {
            Some(next) => {
                inner.snapshot_cursor = Some(next);
                Ok(false)
            }
            None => {
                inner.staged.push(Op::SnapshotEnd.encode());
                inner.snapshot_cursor = None;
                let cycle_start = inner.cycle_start.take();
                inner.pop_pending = cycle_start;
                debug!(rewritten = written, "kv snapshot cycle complete");
                Ok(true)
            }
        }
    }
}

#[async_trait]
impl KvIndex for MemoryKv {
    async fn set(&self, key: &[u8], value: &[u8]) {
        let mut inner = self.inner.lock().await;
        let op = Op::Set {
            key: key.to_vec(),
            value: Bytes::copy_from_slice(value),
        };
        inner.staged.push(op.encode());
        inner.apply(op);
    }

    async fn clear_range(&self, begin: &[u8], end: &[u8]) {
        let mut inner = self.inner.lock().await;
        let op = Op::ClearRange {
            begin: begin.to_vec(),
            end: end.to_vec(),
        };
        inner.staged.push(op.encode());
        inner.apply(op);
    }

    async fn commit(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.staged.is_empty() {
            return Ok(());
        }
        let staged = std::mem::take(&mut inner.staged);
        for op in &staged {
            inner.queue.push_frame(op).await?;
        }
        inner.queue.push_frame(&Op::Commit.encode()).await?;
        inner.queue.commit().await?;
        if let Some(pop) = inner.pop_pending.take() {
            inner.queue.pop(pop).await?;
        }
        Ok(())
    }

    async fn read_value(&self, key: &[u8]) -> Result<Option<Bytes>> {
        let inner = self.inner.lock().await;
        Ok(inner.data.get(key).cloned())
    }

    async fn read_range(
        &self,
        begin: &[u8],
        end: &[u8],
        row_limit: usize,
        byte_limit: usize,
    ) -> Result<Vec<(Bytes, Bytes)>> {
        let inner = self.inner.lock().await;
        let mut out = Vec::new();
        let mut bytes = 0usize;
        for (key, value) in inner
            .data
            .range::<[u8], _>((Bound::Included(begin), Bound::Excluded(end)))
        {
            if out.len() >= row_limit || (bytes >= byte_limit && !out.is_empty()) {
                break;
            }
            bytes += key.len() + value.len();
            out.push((Bytes::copy_from_slice(key), value.clone()));
        }
        Ok(out)
    }

    fn storage_bytes(&self) -> StorageBytes {
        // The queue is the durable footprint; the map itself is RAM.
        match self.inner.try_lock() {
            Ok(inner) => inner.queue.storage_bytes(),
            Err(_) => StorageBytes::default(),
        }
    }
}

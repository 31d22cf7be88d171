//! Log generations and the tag-indexed memory log.
//!
//! A [`Generation`] is one recruited instance of the log, identified by a
//! coordinator epoch. Its mutable state lives behind one async mutex; the
//! monotone counters every waiter cares about (`version`,
//! `queue_committed_version`) are watch channels so a peek or commit can
//! wait for "version ≥ v" without holding the state lock.
//!
//! ## The memory log
//!
//! `commit_messages` appends each message of a batch to the per-tag deques
//! as `(version, slice)` pairs. The slices alias the batch's shared byte
//! block (`Bytes` handles), so a message tagged for three localities costs
//! three deque entries but one copy of its bytes. Accounting charges every
//! append with the message bytes plus a measured per-entry overhead knob;
//! the same amount is credited to `bytes_durable` when the entry is erased
//! (by spilling or by a pop), which is what the commit path's
//! backpressure watches.
//!
//! ## Version counters
//!
//! ```text
//! persistent_data_durable_version ≤ persistent_data_version
//!     ≤ queue_committed_version ≤ version
//! ```
//!
//! holds between any two state transitions; `known_committed_version`
//! trails `version` and `min_known_committed_version` never decreases.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use bytes::Bytes;
use taglog_core::{CommitBatchReader, Tag, Uid, Version, LOCALITY_LOG_ROUTER, TXS_TAG};
use tokio::sync::{watch, Mutex};
use tracing::debug;

use crate::config::Knobs;
use crate::error::Result;

/// Per-tag state in the memory log.
#[derive(Debug)]
pub struct TagData {
    pub tag: Tag,
    /// `(version, framed message bytes)`, oldest first.
    pub messages: VecDeque<(Version, Bytes)>,
    /// Largest version a consumer promised never to request below.
    pub popped: Version,
    /// Earliest disk-queue location still holding spilled data for this
    /// tag. Meaningless while `nothing_persistent`.
    pub popped_location: u64,
    /// No record for this tag currently lives in the KV index.
    pub nothing_persistent: bool,
    /// Popped since the last spill iteration persisted pops.
    pub popped_recently: bool,
    /// Still waiting for the first pop after recovery.
    pub unpopped_recovered: bool,
    /// A pop moved `popped`; the spill loop must recompute
    /// `popped_location` before using it.
    pub requires_popped_location_update: bool,
}

impl TagData {
    fn new(tag: Tag, popped: Version, unpopped_recovered: bool) -> Self {
        Self {
            tag,
            messages: VecDeque::new(),
            popped,
            popped_location: u64::MAX,
            nothing_persistent: true,
            popped_recently: popped > 0,
            unpopped_recovered,
            requires_popped_location_update: false,
        }
    }

    /// Drop in-memory entries with `version < before`; returns the
    /// accounted bytes released.
    pub fn erase_messages_before(&mut self, before: Version, overhead: u64) -> u64 {
        let mut freed = 0u64;
        while let Some((version, bytes)) = self.messages.front() {
            if *version >= before {
                break;
            }
            freed += bytes.len() as u64 + overhead;
            self.messages.pop_front();
        }
        freed
    }
}

/// Mutable per-generation state. One async mutex guards all of it; never
/// hold the guard across disk or network waits.
#[derive(Debug, Default)]
pub struct GenState {
    pub known_committed_version: Version,
    pub min_known_committed_version: Version,
    pub durable_known_committed_version: Version,
    pub persistent_data_version: Version,
    pub persistent_data_durable_version: Version,
    pub queue_popped_version: Version,
    /// version → `(start, end)` locations of its record in the log queue.
    pub version_location: BTreeMap<Version, (u64, u64)>,
    /// version → accounted `(non_txs_bytes, txs_bytes)` for spill budgets.
    pub version_sizes: BTreeMap<Version, (u64, u64)>,
    /// Jagged `[locality bucket][tag id]` array of tag state.
    tag_data: Vec<Vec<Option<TagData>>>,
    /// Recovered tags that have not yet seen their first pop.
    pub unpopped_recovered_tags: usize,
}

impl GenState {
    pub fn tag(&self, tag: Tag) -> Option<&TagData> {
        self.tag_data
            .get(tag.bucket_index())?
            .get(tag.id as usize)?
            .as_ref()
    }

    pub fn tag_mut(&mut self, tag: Tag) -> Option<&mut TagData> {
        self.tag_data
            .get_mut(tag.bucket_index())?
            .get_mut(tag.id as usize)?
            .as_mut()
    }

    /// Fetch-or-create. Tag data is created lazily on first mention and
    /// never recreated under the same identity after retirement.
    pub fn tag_or_create(
        &mut self,
        tag: Tag,
        popped: Version,
        unpopped_recovered: bool,
    ) -> &mut TagData {
        let bucket = tag.bucket_index();
        if self.tag_data.len() <= bucket {
            self.tag_data.resize_with(bucket + 1, Vec::new);
        }
        let row = &mut self.tag_data[bucket];
        if row.len() <= tag.id as usize {
            row.resize_with(tag.id as usize + 1, || None);
        }
        let slot = &mut row[tag.id as usize];
        if slot.is_none() {
            if unpopped_recovered {
                self.unpopped_recovered_tags += 1;
            }
            *slot = Some(TagData::new(tag, popped, unpopped_recovered));
        }
        slot.as_mut().expect("slot populated above")
    }

    pub fn tags(&self) -> impl Iterator<Item = &TagData> {
        self.tag_data
            .iter()
            .flat_map(|row| row.iter().filter_map(|t| t.as_ref()))
    }

    pub fn tags_mut(&mut self) -> impl Iterator<Item = &mut TagData> {
        self.tag_data
            .iter_mut()
            .flat_map(|row| row.iter_mut().filter_map(|t| t.as_mut()))
    }

    /// True when no tag holds in-memory or spilled data any more.
    pub fn fully_drained(&self) -> bool {
        self.tags()
            .all(|t| t.messages.is_empty() && t.nothing_persistent)
    }
}

/// One recruited instance of the log.
pub struct Generation {
    pub id: Uid,
    /// Coordinator epoch of the recruitment.
    pub epoch: u64,
    pub locality: i8,
    pub log_router_tags: u32,
    /// First version this generation serves; predecessors own everything
    /// below.
    pub recovered_at: Version,
    pub unrecovered_before: Version,

    version: watch::Sender<Version>,
    queue_committed_version: watch::Sender<Version>,
    stopped: watch::Sender<bool>,
    recovery_complete: watch::Sender<bool>,
    pub initialized: AtomicBool,

    pub state: Mutex<GenState>,
    /// One spiller at a time touches the KV index for this generation.
    pub persistent_data_commit_lock: Mutex<()>,
    /// Held while an exec operation is applied; commits queue behind it.
    pub exec_op_lock: Mutex<()>,
    /// Serializes the admission check-and-apply of the commit path so a
    /// duplicate request cannot interleave with the original.
    pub commit_admission_lock: Mutex<()>,

    pub bytes_input: AtomicU64,
    pub bytes_durable: AtomicU64,
}

impl Generation {
    pub fn new(
        id: Uid,
        epoch: u64,
        locality: i8,
        log_router_tags: u32,
        recovered_at: Version,
        unrecovered_before: Version,
    ) -> Self {
        Self {
            id,
            epoch,
            locality,
            log_router_tags,
            recovered_at,
            unrecovered_before,
            version: watch::channel(0).0,
            queue_committed_version: watch::channel(0).0,
            stopped: watch::channel(false).0,
            recovery_complete: watch::channel(false).0,
            initialized: AtomicBool::new(false),
            state: Mutex::new(GenState::default()),
            persistent_data_commit_lock: Mutex::new(()),
            exec_op_lock: Mutex::new(()),
            commit_admission_lock: Mutex::new(()),
            bytes_input: AtomicU64::new(0),
            bytes_durable: AtomicU64::new(0),
        }
    }

    pub fn version(&self) -> Version {
        *self.version.borrow()
    }

    /// Advance the version. This is the only way the counter moves, and it
    /// is what unblocks every waiter.
    pub fn set_version(&self, v: Version) {
        self.version.send_if_modified(|current| {
            if v > *current {
                *current = v;
                true
            } else {
                false
            }
        });
    }

    pub async fn wait_version(&self, v: Version) {
        let mut rx = self.version.subscribe();
        let _ = rx.wait_for(|current| *current >= v).await;
    }

    pub fn queue_committed_version(&self) -> Version {
        *self.queue_committed_version.borrow()
    }

    pub fn set_queue_committed_version(&self, v: Version) {
        self.queue_committed_version.send_if_modified(|current| {
            if v > *current {
                *current = v;
                true
            } else {
                false
            }
        });
    }

    pub async fn wait_queue_committed(&self, v: Version) {
        let mut rx = self.queue_committed_version.subscribe();
        let _ = rx.wait_for(|current| *current >= v).await;
    }

    pub fn subscribe_version(&self) -> watch::Receiver<Version> {
        self.version.subscribe()
    }

    pub fn is_stopped(&self) -> bool {
        *self.stopped.borrow()
    }

    pub fn stop(&self) {
        let _ = self.stopped.send(true);
    }

    pub fn recovery_is_complete(&self) -> bool {
        *self.recovery_complete.borrow()
    }

    pub fn signal_recovery_complete(&self) {
        let _ = self.recovery_complete.send(true);
    }

    pub async fn wait_recovery_complete(&self) {
        let mut rx = self.recovery_complete.subscribe();
        let _ = rx.wait_for(|done| *done).await;
    }

    /// Bytes appended but not yet released; what backpressure watches.
    pub fn unreleased_bytes(&self) -> u64 {
        self.bytes_input
            .load(Ordering::Relaxed)
            .saturating_sub(self.bytes_durable.load(Ordering::Relaxed))
    }

    /// Map a message tag to the tag data it should land in, or `None`
    /// when this generation does not serve it.
    pub fn route_tag(&self, tag: Tag) -> Option<Tag> {
        if tag == TXS_TAG {
            return Some(tag);
        }
        if tag.locality == LOCALITY_LOG_ROUTER {
            if self.log_router_tags == 0 {
                return None;
            }
            return Some(Tag::new(
                LOCALITY_LOG_ROUTER,
                (tag.id as u32 % self.log_router_tags) as u16,
            ));
        }
        if tag.locality < 0 || tag.locality == self.locality {
            Some(tag)
        } else {
            None
        }
    }

    /// Append one version's batch into the memory log. Returns the bytes
    /// charged to `bytes_input`.
    pub async fn commit_messages(
        &self,
        version: Version,
        batch: &Bytes,
        knobs: &Knobs,
        mark_unpopped_recovered: bool,
    ) -> Result<u64> {
        let mut state = self.state.lock().await;
        let mut charged = 0u64;
        let mut non_txs = 0u64;
        let mut txs = 0u64;

        for message in CommitBatchReader::new(batch.clone()) {
            let message = message?;
            let mut targets: Vec<Tag> = Vec::with_capacity(message.tags.len());
            for tag in &message.tags {
                if let Some(routed) = self.route_tag(*tag) {
                    if !targets.contains(&routed) {
                        targets.push(routed);
                    }
                }
            }
            for tag in targets {
                let data = state.tag_or_create(tag, 0, mark_unpopped_recovered);
                if data.popped > version {
                    continue;
                }
                data.messages.push_back((version, message.raw.clone()));
                let size = message.raw.len() as u64;
                charged += size + knobs.version_message_overhead_bytes;
                if tag == TXS_TAG {
                    txs += size;
                } else {
                    non_txs += size;
                }
            }
        }

        state.version_sizes.insert(version, (non_txs, txs));
        drop(state);

        if charged > 0 {
            self.bytes_input.fetch_add(charged, Ordering::Relaxed);
            debug!(gen = %self.id, version, charged, "messages committed to memory log");
        }
        Ok(charged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use taglog_core::CommitBatchBuilder;

    fn knobs() -> Knobs {
        Knobs::default()
    }

    fn generation() -> Generation {
        Generation::new(Uid::new(1, 1), 1, 0, 2, 0, 0)
    }

    fn batch(specs: &[(&[Tag], &'static [u8])]) -> Bytes {
        let mut b = CommitBatchBuilder::new();
        for (tags, payload) in specs {
            b.append(tags, payload);
        }
        b.finish()
    }

    #[tokio::test]
    async fn test_commit_appends_per_tag() {
        let generation = generation();
        let t = Tag::new(0, 7);
        let u = Tag::new(0, 8);
        let b = batch(&[(&[t], b"a"), (&[t, u], b"b")]);
        generation
            .commit_messages(10, &b, &knobs(), false)
            .await
            .unwrap();

        let state = generation.state.lock().await;
        assert_eq!(state.tag(t).unwrap().messages.len(), 2);
        assert_eq!(state.tag(u).unwrap().messages.len(), 1);
        assert_eq!(state.tag(t).unwrap().messages[0].0, 10);
    }

    #[tokio::test]
    async fn test_foreign_locality_is_skipped_but_txs_always_lands() {
        let generation = generation(); // locality 0
        let foreign = Tag::new(3, 1);
        let b = batch(&[(&[foreign], b"skip me"), (&[TXS_TAG], b"txs")]);
        generation
            .commit_messages(5, &b, &knobs(), false)
            .await
            .unwrap();

        let state = generation.state.lock().await;
        assert!(state.tag(foreign).is_none());
        assert_eq!(state.tag(TXS_TAG).unwrap().messages.len(), 1);
    }

    #[tokio::test]
    async fn test_log_router_tags_are_mod_mapped() {
        let generation = generation(); // 2 router tags
        let router5 = Tag::new(LOCALITY_LOG_ROUTER, 5);
        let b = batch(&[(&[router5], b"routed")]);
        generation
            .commit_messages(5, &b, &knobs(), false)
            .await
            .unwrap();

        let state = generation.state.lock().await;
        assert!(state.tag(router5).is_none());
        let mapped = Tag::new(LOCALITY_LOG_ROUTER, 1); // 5 % 2
        assert_eq!(state.tag(mapped).unwrap().messages.len(), 1);
    }

    #[tokio::test]
    async fn test_popped_tag_rejects_old_versions() {
        let generation = generation();
        let t = Tag::new(0, 1);
        {
            let mut state = generation.state.lock().await;
            state.tag_or_create(t, 20, false);
        }
        let b = batch(&[(&[t], b"stale")]);
        generation
            .commit_messages(10, &b, &knobs(), false)
            .await
            .unwrap();
        let state = generation.state.lock().await;
        assert!(state.tag(t).unwrap().messages.is_empty());
    }

    #[tokio::test]
    async fn test_erase_messages_before_frees_accounted_bytes() {
        let generation = generation();
        let t = Tag::new(0, 1);
        let k = knobs();
        for v in [10u64, 11, 12] {
            let b = batch(&[(&[t], b"payload")]);
            generation.commit_messages(v, &b, &k, false).await.unwrap();
        }
        let input = generation.bytes_input.load(Ordering::Relaxed);
        assert!(input > 0);

        let mut state = generation.state.lock().await;
        let freed = state
            .tag_mut(t)
            .unwrap()
            .erase_messages_before(12, k.version_message_overhead_bytes);
        assert_eq!(state.tag(t).unwrap().messages.len(), 1);
        assert_eq!(freed, input / 3 * 2);
    }

    #[tokio::test]
    async fn test_version_counters_are_monotone() {
        let generation = generation();
        generation.set_version(5);
        generation.set_version(3); // ignored
        assert_eq!(generation.version(), 5);
        generation.wait_version(5).await;

        generation.set_queue_committed_version(4);
        assert_eq!(generation.queue_committed_version(), 4);
    }

    #[tokio::test]
    async fn test_empty_batch_advances_nothing_but_records_sizes() {
        let generation = generation();
        generation
            .commit_messages(7, &Bytes::new(), &knobs(), false)
            .await
            .unwrap();
        let state = generation.state.lock().await;
        assert_eq!(state.version_sizes.get(&7), Some(&(0, 0)));
        assert_eq!(state.tags().count(), 0);
    }
}

//! Peek / pop service.
//!
//! ## Peek
//!
//! A peek assembles everything committed for one tag from `begin` onward:
//! spilled data first (value rows for the txs tag, reference batches
//! resolved back through the log queue for everyone else), then the
//! in-memory tail. The in-memory slice is snapshotted *before* the
//! spilled reads: the slices are cheap shared handles, and taking them
//! first means a spill that lands mid-peek cannot open a gap between the
//! two sources.
//!
//! Subscribers that pipeline peeks attach `(subscriber, sequence)`:
//! request `n+1` waits until request `n` has established its end version,
//! so replies stay contiguous even when requests arrive reordered.
//! Trackers expire when idle and evict sequences that fall behind the
//! window, failing their waiters with `timed_out`.
//!
//! ## Pop
//!
//! A pop is a promise never to ask for versions below `upto` again. It
//! trims the in-memory deque immediately; the spill loop later persists
//! the popped version, clears dead spilled rows and releases the disk
//! queue prefix. During an operator snapshot pops are deferred and
//! replayed when the snapshot ends (or its deadline passes).

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::Ordering;
use std::sync::Arc;

use bytes::Bytes;
use taglog_core::{
    CommitBatchReader, PeekBodyBuilder, Tag, Uid, Version, LOCALITY_LOG_ROUTER, TXS_TAG,
};
use taglog_storage::keys;
use taglog_storage::KvIndex;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::generation::Generation;
use crate::rpc::{PeekReply, PeekRequest, PopRequest};
use crate::server::ServerInner;
use crate::spill::SpilledRecord;

/// State of one sequence slot in a peek tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SeqState {
    Pending,
    Ready(Version),
    Failed,
}

#[derive(Debug)]
pub(crate) struct PeekTracker {
    pub last_update: Instant,
    pub sequences: BTreeMap<u64, watch::Sender<SeqState>>,
}

impl Default for PeekTracker {
    fn default() -> Self {
        Self {
            last_update: Instant::now(),
            sequences: BTreeMap::new(),
        }
    }
}

/// Operator-snapshot pop deferral.
#[derive(Debug, Default)]
pub(crate) struct IgnorePops {
    /// `(command uid, deadline)` while a snapshot is in flight.
    pub active: Option<(Uid, Instant)>,
    /// Deferred pops, keyed by `(generation, tag)`, holding the max upto.
    pub deferred: HashMap<(Uid, Tag), Version>,
}

pub(crate) async fn handle_peek(
    inner: &Arc<ServerInner>,
    generation: &Arc<Generation>,
    req: PeekRequest,
) -> Result<PeekReply> {
    let mut begin = req.begin;

    // Sequenced streams: wait for the predecessor request to establish our
    // begin version.
    if let Some((peek_id, sequence)) = req.sequence {
        if sequence > 0 {
            let mut slot_rx = {
                let mut trackers = inner.peek_trackers.lock().await;
                let tracker = trackers.entry(peek_id).or_default();
                tracker.last_update = Instant::now();

                let window = inner.knobs.parallel_peek_window;
                if sequence >= window {
                    let cutoff = sequence - window;
                    let dead: Vec<u64> =
                        tracker.sequences.range(..=cutoff).map(|(&s, _)| s).collect();
                    for s in dead {
                        if let Some(slot) = tracker.sequences.remove(&s) {
                            slot.send_replace(SeqState::Failed);
                        }
                    }
                }
                if let Some((&first, _)) = tracker.sequences.iter().next() {
                    if sequence < first {
                        return Err(Error::TimedOut);
                    }
                }
                tracker
                    .sequences
                    .entry(sequence)
                    .or_insert_with(|| watch::channel(SeqState::Pending).0)
                    .subscribe()
            };
            let state = slot_rx
                .wait_for(|s| *s != SeqState::Pending)
                .await
                .map(|s| *s)
                .unwrap_or(SeqState::Failed);
            match state {
                SeqState::Ready(version) => begin = version,
                SeqState::Failed | SeqState::Pending => return Err(Error::TimedOut),
            }
        }
    }

    let result = peek_messages(inner, generation, &req, begin).await;

    // Establish the next sequence's begin version.
    if let Some((peek_id, sequence)) = req.sequence {
        let mut trackers = inner.peek_trackers.lock().await;
        let tracker = trackers.entry(peek_id).or_default();
        tracker.last_update = Instant::now();
        if let Some((&first, _)) = tracker.sequences.iter().next() {
            if sequence + 1 < first {
                return Err(Error::TimedOut);
            }
        }
        let next_begin = match &result {
            Ok(reply) => Some(reply.end),
            // A blocked peek still seeds the stream so its successor can
            // retry from the same place.
            Err(Error::EndOfStream) => Some(begin),
            Err(_) => None,
        };
        if let Some(end) = next_begin {
            let slot = tracker
                .sequences
                .entry(sequence + 1)
                .or_insert_with(|| watch::channel(SeqState::Pending).0);
            let previous = *slot.borrow();
            match previous {
                SeqState::Ready(existing) if existing != end => {
                    // A retried sequence disagreeing about its end means
                    // the stream is broken.
                    return Err(Error::TimedOut);
                }
                SeqState::Pending => {
                    // send_replace: the slot usually has no subscriber yet
                    // (its request has not arrived), and the value must
                    // stick for when it does.
                    slot.send_replace(SeqState::Ready(end));
                }
                _ => {}
            }
        }
    }

    result
}

async fn peek_messages(
    inner: &Arc<ServerInner>,
    generation: &Arc<Generation>,
    req: &PeekRequest,
    begin: Version,
) -> Result<PeekReply> {
    if req.return_if_blocked && generation.version() < begin {
        return Err(Error::EndOfStream);
    }
    generation.wait_version(begin).await;
    tokio::task::yield_now().await;

    // Cap parallel router-tag reads.
    let _router_permit = if req.tag.locality == LOCALITY_LOG_ROUTER {
        Some(
            inner
                .router_reads
                .clone()
                .acquire_owned()
                .await
                .map_err(|_| Error::WorkerRemoved)?,
        )
    } else {
        None
    };

    let budget = inner.knobs.peek_reply_byte_budget;
    let state = generation.state.lock().await;
    let pddv = state.persistent_data_durable_version;
    let min_known_committed_version = state.min_known_committed_version;

    let popped = state.tag(req.tag).map(|t| t.popped).unwrap_or(0);
    if popped > begin {
        return Ok(PeekReply {
            messages: Bytes::new(),
            end: popped,
            popped: Some(popped),
            max_known_version: generation.version(),
            min_known_committed_version,
            begin,
            only_spilled: req.only_spilled,
        });
    }

    // Snapshot the in-memory tail before any disk read; the slices stay
    // valid even if a concurrent spill erases the deque entries.
    let memory_begin = begin.max(pddv + 1);
    let memory: Vec<(Version, Bytes)> = if req.only_spilled {
        Vec::new()
    } else {
        state
            .tag(req.tag)
            .map(|t| {
                t.messages
                    .iter()
                    .filter(|(v, _)| *v >= memory_begin)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    };
    drop(state);

    let mut body = PeekBodyBuilder::new();
    let mut end = generation.version() + 1;
    let mut budget_hit = false;

    if begin <= pddv {
        if req.tag == TXS_TAG {
            budget_hit =
                read_value_spilled(inner, generation, begin, pddv, budget, &mut body, &mut end)
                    .await?;
        } else {
            budget_hit = read_reference_spilled(
                inner, generation, req.tag, begin, budget, &mut body, &mut end,
            )
            .await?;
        }
    }

    if req.only_spilled {
        // Only history was requested; memory stays untouched.
        if !budget_hit {
            end = pddv + 1;
        }
    } else if !budget_hit {
        let mut current: Option<Version> = None;
        for (version, raw) in &memory {
            if current != Some(*version) {
                if body.len() >= budget {
                    end = *version;
                    break;
                }
                body.begin_version(*version);
                current = Some(*version);
            }
            body.append_message(raw);
        }
    }

    Ok(PeekReply {
        messages: body.finish(),
        end,
        popped: None,
        max_known_version: generation.version(),
        min_known_committed_version,
        begin,
        only_spilled: req.only_spilled,
    })
}

/// Value-spill read: `TagMsg` rows hold the framed messages directly.
/// Returns true when the read stopped short of the durable boundary, in
/// which case the caller must not splice in-memory data after the gap.
async fn read_value_spilled(
    inner: &Arc<ServerInner>,
    generation: &Arc<Generation>,
    begin: Version,
    pddv: Version,
    budget: usize,
    body: &mut PeekBodyBuilder,
    end: &mut Version,
) -> Result<bool> {
    let from = keys::tag_version_key(keys::TAG_MSG_PREFIX, generation.id, TXS_TAG, begin);
    let (_, to) = keys::prefix_range(&keys::tag_key(
        keys::TAG_MSG_PREFIX,
        generation.id,
        TXS_TAG,
    ));
    let rows = inner.kv.read_range(&from, &to, usize::MAX, budget).await?;
    let mut last_version = None;
    for (key, value) in &rows {
        let Some((_, _, version)) = keys::parse_tag_version_key(keys::TAG_MSG_PREFIX, key) else {
            warn!(gen = %generation.id, "unparseable value-spill key");
            continue;
        };
        if version > pddv {
            break;
        }
        body.begin_version(version);
        body.append_message(value);
        last_version = Some(version);
        if body.len() >= budget {
            *end = version + 1;
            return Ok(true);
        }
    }
    // The scan itself may have been byte-limited below the durable
    // boundary; anything past the last row returned is not covered.
    if let Some(last) = last_version {
        if last < pddv {
            let probe =
                keys::tag_version_key(keys::TAG_MSG_PREFIX, generation.id, TXS_TAG, last + 1);
            let more = inner.kv.read_range(&probe, &to, 1, usize::MAX).await?;
            if !more.is_empty() {
                *end = last + 1;
                return Ok(true);
            }
        }
    }
    Ok(false)
}

/// Reference-spill read: resolve `TagMsgRef` batches back through the log
/// queue, filtering each recovered batch down to the requested tag.
/// Returns true if the reply budget was exhausted.
async fn read_reference_spilled(
    inner: &Arc<ServerInner>,
    generation: &Arc<Generation>,
    tag: Tag,
    begin: Version,
    budget: usize,
    body: &mut PeekBodyBuilder,
    end: &mut Version,
) -> Result<bool> {
    let from = keys::tag_version_key(keys::TAG_MSG_REF_PREFIX, generation.id, tag, begin);
    let (_, to) = keys::prefix_range(&keys::tag_key(
        keys::TAG_MSG_REF_PREFIX,
        generation.id,
        tag,
    ));
    let max_batches = inner.knobs.spill_reference_max_batches_per_peek;
    let rows = inner
        .kv
        .read_range(&from, &to, max_batches, usize::MAX)
        .await?;
    let batch_limited = rows.len() >= max_batches;

    let mut last_version = None;
    for (_, value) in rows {
        let Some(records) = SpilledRecord::decode_batch(value) else {
            warn!(gen = %generation.id, %tag, "corrupt spilled-reference batch");
            continue;
        };
        for record in records {
            if record.version < begin {
                continue;
            }
            if body.len() >= budget {
                *end = record.version;
                return Ok(true);
            }
            // Reserve peek memory for the disk read.
            let permits = (record.length as usize)
                .min(inner.knobs.peek_memory_limit_bytes)
                .max(1) as u32;
            let _memory = inner
                .peek_memory
                .clone()
                .acquire_many_owned(permits)
                .await
                .map_err(|_| Error::WorkerRemoved)?;

            let entry = {
                let queue = inner.queue.lock().await;
                queue
                    .entry_at(record.start, record.start + record.length as u64)
                    .await
            };
            let entry = match entry {
                Ok(entry) => entry,
                Err(taglog_storage::Error::PoppedRange { .. }) => {
                    // The reference raced a pop; whoever popped promised
                    // not to ask for this data again.
                    debug!(gen = %generation.id, %tag, version = record.version,
                        "spilled reference below pop location; skipping");
                    continue;
                }
                Err(e) => return Err(e.into()),
            };
            let mut wrote_header = false;
            for message in CommitBatchReader::new(entry.messages.clone()) {
                let message = message?;
                let matches = message
                    .tags
                    .iter()
                    .any(|t| generation.route_tag(*t) == Some(tag));
                if matches {
                    if !wrote_header {
                        body.begin_version(entry.version);
                        wrote_header = true;
                    }
                    body.append_message(&message.raw);
                }
            }
            last_version = Some(record.version);
        }
    }
    if batch_limited {
        // More batches exist beyond the per-peek cap; stop the reply at
        // the last resolved version so the caller re-peeks from there.
        if let Some(last) = last_version {
            *end = last + 1;
        }
        return Ok(true);
    }
    Ok(false)
}

pub(crate) async fn handle_pop(
    inner: &Arc<ServerInner>,
    generation: &Arc<Generation>,
    req: PopRequest,
) -> Result<()> {
    // Operator snapshot in flight: defer, or replay if its deadline is
    // already past.
    let replay = {
        let mut ignore = inner.ignore_pops.lock().await;
        match ignore.active {
            Some((uid, deadline)) => {
                if Instant::now() < deadline {
                    let slot = ignore.deferred.entry((generation.id, req.tag)).or_insert(0);
                    *slot = (*slot).max(req.upto);
                    return Ok(());
                }
                info!(%uid, "ignore-pops deadline passed; replaying deferred pops");
                ignore.active = None;
                std::mem::take(&mut ignore.deferred)
            }
            None => HashMap::new(),
        }
    };
    replay_deferred_pops(inner, replay).await;

    let tag = (inner.pop_pseudo_locality_tag)(req.tag);
    pop_tag(inner, generation, tag, req.upto).await
}

pub(crate) async fn replay_deferred_pops(
    inner: &Arc<ServerInner>,
    deferred: HashMap<(Uid, Tag), Version>,
) {
    for ((gen_id, tag), upto) in deferred {
        let generation = {
            let id_data = inner.id_data.lock().await;
            id_data.get(&gen_id).cloned()
        };
        if let Some(generation) = generation {
            if let Err(e) = pop_tag(inner, &generation, tag, upto).await {
                warn!(gen = %gen_id, %tag, error = %e, "deferred pop failed");
            }
        }
    }
}

pub(crate) async fn pop_tag(
    inner: &Arc<ServerInner>,
    generation: &Arc<Generation>,
    tag: Tag,
    upto: Version,
) -> Result<()> {
    if upto == 0 {
        return Ok(());
    }
    let overhead = inner.knobs.version_message_overhead_bytes;
    let mut state = generation.state.lock().await;
    let pddv = state.persistent_data_durable_version;
    let recovered_at = generation.recovered_at;

    let mut cleared_recovered = false;
    let mut freed = 0u64;
    {
        let data = state.tag_or_create(tag, 0, false);
        if upto > data.popped {
            data.popped = upto;
            data.popped_recently = true;
            data.requires_popped_location_update = true;
            if data.unpopped_recovered && upto > recovered_at {
                data.unpopped_recovered = false;
                cleared_recovered = true;
            }
        }
        if upto > pddv {
            freed = data.erase_messages_before(upto, overhead);
        }
    }
    if cleared_recovered {
        state.unpopped_recovered_tags = state.unpopped_recovered_tags.saturating_sub(1);
        debug!(
            gen = %generation.id,
            %tag,
            remaining = state.unpopped_recovered_tags,
            "recovered tag saw its first pop"
        );
    }
    if freed > 0 {
        generation.bytes_durable.fetch_add(freed, Ordering::Relaxed);
        inner.bytes_durable.fetch_add(freed, Ordering::Relaxed);
    }
    inner.check_recovery_complete(generation, &mut state);
    Ok(())
}

/// Drop idle peek trackers, failing their outstanding waiters.
pub(crate) async fn cleanup_peek_trackers(inner: Arc<ServerInner>) {
    let mut shutdown = inner.shutdown.subscribe();
    let mut tick = tokio::time::interval(inner.knobs.peek_cleanup_interval);
    loop {
        tokio::select! {
            _ = tick.tick() => {}
            _ = shutdown.changed() => return,
        }
        let expiration = inner.knobs.peek_tracker_expiration;
        let mut trackers = inner.peek_trackers.lock().await;
        let dead: Vec<Uid> = trackers
            .iter()
            .filter(|(_, t)| t.last_update.elapsed() > expiration)
            .map(|(&id, _)| id)
            .collect();
        for id in dead {
            if let Some(tracker) = trackers.remove(&id) {
                debug!(subscriber = %id, "expiring idle peek tracker");
                for (_, slot) in tracker.sequences {
                    slot.send_replace(SeqState::Failed);
                }
            }
        }
    }
}

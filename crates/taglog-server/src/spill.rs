//! Spill / update-storage loop.
//!
//! A background task moves committed in-memory versions into the KV index
//! so the memory log stays bounded:
//!
//! - the **txs tag** is value-spilled: one `TagMsg` row per version
//!   holding the concatenated framed messages (the transaction system
//!   re-reads its tag constantly; chasing references would be wasteful);
//! - every other tag is reference-spilled: `SpilledRecord`s pointing back
//!   into the log queue, batched into `TagMsgRef` rows keyed by the
//!   batch's last version.
//!
//! One iteration walks `version_sizes` forward from
//! `persistent_data_version` under a byte budget, waits for queue
//! durability, then writes tag data + generation metadata +
//! `recoveryLocation` and commits the KV index once. Only after that
//! commit are the spilled entries erased from memory and `bytes_durable`
//! advanced.
//!
//! This loop is also the only place the shared disk queue is reclaimed:
//! the pop location is the minimum over every generation's first
//! unspilled version and every tag's earliest still-referenced location.

use std::ops::Bound;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use taglog_core::{Tag, Version, TXS_TAG};
use taglog_storage::{keys, KvIndex};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::generation::Generation;
use crate::server::ServerInner;

/// Pointer from the KV index back into the log queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SpilledRecord {
    pub version: Version,
    /// Start location of the queue record holding this version.
    pub start: u64,
    /// Length of that record, frame included.
    pub length: u32,
    /// Bytes of message data for the spilled tag at this version.
    pub mutation_bytes: u32,
}

impl SpilledRecord {
    const WIRE_BYTES: usize = 8 + 8 + 4 + 4;

    pub fn encode_batch(records: &[SpilledRecord]) -> Bytes {
        let mut buf = BytesMut::with_capacity(4 + records.len() * Self::WIRE_BYTES);
        buf.put_u32_le(records.len() as u32);
        for r in records {
            buf.put_u64_le(r.version);
            buf.put_u64_le(r.start);
            buf.put_u32_le(r.length);
            buf.put_u32_le(r.mutation_bytes);
        }
        buf.freeze()
    }

    pub fn decode_batch(mut value: Bytes) -> Option<Vec<SpilledRecord>> {
        if value.len() < 4 {
            return None;
        }
        let count = value.get_u32_le() as usize;
        if value.len() != count * Self::WIRE_BYTES {
            return None;
        }
        let mut out = Vec::with_capacity(count);
        for _ in 0..count {
            out.push(SpilledRecord {
                version: value.get_u64_le(),
                start: value.get_u64_le(),
                length: value.get_u32_le(),
                mutation_bytes: value.get_u32_le(),
            });
        }
        Some(out)
    }
}

/// Run spill iterations until shutdown.
pub(crate) async fn update_storage_loop(inner: Arc<ServerInner>) {
    let mut shutdown = inner.shutdown.subscribe();
    let mut tick = tokio::time::interval(inner.knobs.update_storage_delay);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = tick.tick() => {}
            _ = shutdown.changed() => return,
        }
        if let Err(e) = update_storage_once(&inner).await {
            // The commit lock is released by scope; retry next tick.
            warn!(error = %e, "spill iteration failed");
        }
    }
}

/// One spill iteration over the oldest still-resident generation.
pub(crate) async fn update_storage_once(inner: &Arc<ServerInner>) -> Result<()> {
    let generation = loop {
        let front = {
            let id_data = inner.id_data.lock().await;
            let mut spill_order = inner.spill_order.lock().await;
            loop {
                match spill_order.front() {
                    Some(id) => match id_data.get(id) {
                        Some(generation) => break Some(generation.clone()),
                        None => {
                            spill_order.pop_front();
                        }
                    },
                    None => break None,
                }
            }
        };
        let Some(generation) = front else {
            return Ok(());
        };

        if generation.is_stopped() {
            let fully_spilled = {
                let state = generation.state.lock().await;
                state.persistent_data_version >= generation.version()
            };
            if fully_spilled {
                // Spilling duty for this generation is done; pops finish
                // the drain.
                inner.spill_order.lock().await.pop_front();
                maybe_retire(inner, &generation).await?;
                continue;
            }
            break generation;
        }

        if generation.unreleased_bytes() < inner.knobs.spill_threshold_bytes {
            // High water not reached; queue reclamation still runs so pops
            // release disk even without new spills.
            pop_disk_queue(inner).await?;
            return Ok(());
        }
        break generation;
    };

    let next_version = {
        let state = generation.state.lock().await;
        let mut accumulated = 0u64;
        let mut next = state.persistent_data_version;
        for (&version, &(non_txs, txs)) in state
            .version_sizes
            .range((Bound::Excluded(state.persistent_data_version), Bound::Unbounded))
        {
            // Only versions already admitted can spill.
            if version > generation.version() {
                break;
            }
            next = version;
            accumulated += non_txs + txs;
            if accumulated >= inner.knobs.update_storage_byte_limit {
                break;
            }
        }
        next
    };

    {
        let state = generation.state.lock().await;
        if next_version <= state.persistent_data_version {
            drop(state);
            pop_disk_queue(inner).await?;
            return Ok(());
        }
    }

    // Spill never precedes queue durability.
    generation.wait_queue_committed(next_version).await;

    let _commit_guard = generation.persistent_data_commit_lock.lock().await;
    update_persistent_data(inner, &generation, next_version).await?;
    drop(_commit_guard);

    pop_disk_queue(inner).await?;
    maybe_retire(inner, &generation).await?;
    Ok(())
}

/// Move everything in `(persistent_data_version, new_version]` into the KV
/// index and commit it atomically.
pub(crate) async fn update_persistent_data(
    inner: &Arc<ServerInner>,
    generation: &Arc<Generation>,
    new_version: Version,
) -> Result<()> {
    // Exclusive stage-and-commit against the shared KV index.
    let _kv_guard = inner.kv_commit_lock.lock().await;
    let kv = &inner.kv;
    let overhead = inner.knobs.version_message_overhead_bytes;
    let mut state = generation.state.lock().await;
    let prev_version = state.persistent_data_version;
    debug!(
        gen = %generation.id,
        from = prev_version,
        to = new_version,
        "spilling versions to the kv index"
    );

    // Persist pops first so the spilled prefixes they invalidate can be
    // cleared in the same commit.
    let popped_updates: Vec<(Tag, Version)> = state
        .tags_mut()
        .filter(|t| t.popped_recently)
        .map(|t| {
            t.popped_recently = false;
            (t.tag, t.popped)
        })
        .collect();
    for (tag, popped) in &popped_updates {
        kv.set(
            &keys::tag_key(keys::TAG_POP_PREFIX, generation.id, *tag),
            &keys::encode_u64(*popped),
        )
        .await;
        for prefix in [keys::TAG_MSG_PREFIX, keys::TAG_MSG_REF_PREFIX] {
            let begin = keys::tag_key(prefix, generation.id, *tag);
            let end = keys::tag_version_key(prefix, generation.id, *tag, *popped);
            kv.clear_range(&begin, &end).await;
        }
    }

    // Spilled tag data. The version-location index is consulted for the
    // reference path; every committed version was recorded there by the
    // commit path.
    let version_location = state.version_location.clone();
    let mut spilled_refs: Vec<(Tag, u64)> = Vec::new(); // (tag, first start)
    let mut wrote_any: Vec<Tag> = Vec::new();
    for tag_data in state.tags_mut() {
        let spill: Vec<(Version, Bytes)> = tag_data
            .messages
            .iter()
            .filter(|(v, _)| *v > prev_version && *v <= new_version)
            .cloned()
            .collect();
        if spill.is_empty() {
            continue;
        }
        if tag_data.tag == TXS_TAG {
            // Value-spill: one row per version with the raw framed bytes.
            let mut at: Option<(Version, BytesMut)> = None;
            for (version, raw) in spill {
                match &mut at {
                    Some((v, buf)) if *v == version => buf.extend_from_slice(&raw),
                    _ => {
                        if let Some((v, buf)) = at.take() {
                            kv.set(
                                &keys::tag_version_key(
                                    keys::TAG_MSG_PREFIX,
                                    generation.id,
                                    TXS_TAG,
                                    v,
                                ),
                                &buf,
                            )
                            .await;
                        }
                        at = Some((version, BytesMut::from(&raw[..])));
                    }
                }
            }
            if let Some((v, buf)) = at {
                kv.set(
                    &keys::tag_version_key(keys::TAG_MSG_PREFIX, generation.id, TXS_TAG, v),
                    &buf,
                )
                .await;
            }
            wrote_any.push(tag_data.tag);
        } else {
            let mut batch: Vec<SpilledRecord> = Vec::new();
            let mut first_start_overall = u64::MAX;
            for (version, raw) in spill {
                let Some(&(start, end)) = version_location.get(&version) else {
                    warn!(gen = %generation.id, version, "version missing from location index");
                    continue;
                };
                match batch.last() {
                    Some(last) if last.version == version => {
                        let last = batch.last_mut().expect("nonempty");
                        last.mutation_bytes += raw.len() as u32;
                        continue;
                    }
                    _ => {}
                }
                batch.push(SpilledRecord {
                    version,
                    start,
                    length: (end - start) as u32,
                    mutation_bytes: raw.len() as u32,
                });
                first_start_overall = first_start_overall.min(start);
                if batch.len() * SpilledRecord::WIRE_BYTES
                    >= inner.knobs.spill_reference_max_bytes_per_batch
                {
                    let last_version = batch.last().expect("nonempty").version;
                    kv.set(
                        &keys::tag_version_key(
                            keys::TAG_MSG_REF_PREFIX,
                            generation.id,
                            tag_data.tag,
                            last_version,
                        ),
                        &SpilledRecord::encode_batch(&batch),
                    )
                    .await;
                    batch.clear();
                }
            }
            if !batch.is_empty() {
                let last_version = batch.last().expect("nonempty").version;
                kv.set(
                    &keys::tag_version_key(
                        keys::TAG_MSG_REF_PREFIX,
                        generation.id,
                        tag_data.tag,
                        last_version,
                    ),
                    &SpilledRecord::encode_batch(&batch),
                )
                .await;
            }
            if first_start_overall != u64::MAX {
                spilled_refs.push((tag_data.tag, first_start_overall));
                wrote_any.push(tag_data.tag);
            }
        }
    }
    for (tag, first_start) in spilled_refs {
        if let Some(t) = state.tag_mut(tag) {
            t.popped_location = t.popped_location.min(first_start);
        }
    }
    for tag in wrote_any {
        if let Some(t) = state.tag_mut(tag) {
            t.nothing_persistent = false;
        }
    }

    state.persistent_data_version = new_version;
    kv.set(
        &keys::gen_key(keys::VERSION_PREFIX, generation.id),
        &keys::encode_u64(new_version),
    )
    .await;
    kv.set(
        &keys::gen_key(keys::KNOWN_COMMITTED_PREFIX, generation.id),
        &keys::encode_u64(state.known_committed_version),
    )
    .await;

    // Where a future recovery should start replaying the queue from: the
    // start of the first record past the spilled prefix.
    let recovery_location = state
        .version_location
        .range((Bound::Excluded(new_version), Bound::Unbounded))
        .next()
        .map(|(_, &(start, _))| start)
        .or_else(|| state.version_location.values().last().map(|&(_, end)| end));
    if let Some(location) = recovery_location {
        kv.set(keys::RECOVERY_LOCATION_KEY, &keys::encode_u64(location))
            .await;
    }
    drop(state);

    kv.commit().await?;

    // Durable: release memory and advance accounting.
    let mut state = generation.state.lock().await;
    state.persistent_data_durable_version = new_version;
    let mut freed = 0u64;
    for tag_data in state.tags_mut() {
        freed += tag_data.erase_messages_before(new_version + 1, overhead);
    }
    generation.bytes_durable.fetch_add(freed, Ordering::Relaxed);
    inner.bytes_durable.fetch_add(freed, Ordering::Relaxed);
    let remaining_sizes = state.version_sizes.split_off(&(new_version + 1));
    state.version_sizes = remaining_sizes;
    let trim_from = state
        .version_location
        .range(..=new_version)
        .next_back()
        .map(|(&v, _)| v);
    if let Some(keep) = trim_from {
        // forget_before: drop location entries below the spilled prefix,
        // keeping the boundary entry for recovery-location fallback.
        let remaining_locations = state.version_location.split_off(&keep);
        state.version_location = remaining_locations;
    }
    inner.check_recovery_complete(generation, &mut state);
    drop(state);

    info!(
        gen = %generation.id,
        version = new_version,
        freed,
        "spill committed"
    );
    Ok(())
}

/// Recompute `popped_location` for tags whose pop moved since the last
/// reclamation pass, then pop the shared disk queue to the minimum
/// location any generation still needs.
pub(crate) async fn pop_disk_queue(inner: &Arc<ServerInner>) -> Result<()> {
    let generations: Vec<Arc<Generation>> = {
        let id_data = inner.id_data.lock().await;
        id_data.values().cloned().collect()
    };
    if generations.is_empty() {
        return Ok(());
    }

    let mut min_location = u64::MAX;
    for generation in &generations {
        refresh_popped_locations(inner, generation).await?;
        let state = generation.state.lock().await;
        // The replay prefix must survive: everything from the first
        // unspilled version onward.
        if let Some((_, &(start, _))) = state
            .version_location
            .range((Bound::Excluded(state.persistent_data_durable_version), Bound::Unbounded))
            .next()
        {
            min_location = min_location.min(start);
        }
        for tag_data in state.tags() {
            if !tag_data.nothing_persistent && tag_data.tag != TXS_TAG {
                min_location = min_location.min(tag_data.popped_location);
            }
        }
    }

    let mut queue = inner.queue.lock().await;
    if min_location == u64::MAX {
        // Nothing pins the queue: everything durable may go.
        min_location = queue.next_push_location();
    }
    if min_location > queue.popped_location() {
        debug!(upto = min_location, "popping shared disk queue");
        queue.pop(min_location).await?;
    }
    Ok(())
}

/// Resolve the earliest still-referenced location for tags flagged by a
/// pop. Reads the first surviving reference batch from the KV index.
async fn refresh_popped_locations(
    inner: &Arc<ServerInner>,
    generation: &Arc<Generation>,
) -> Result<()> {
    let flagged: Vec<(Tag, Version)> = {
        let mut state = generation.state.lock().await;
        state
            .tags_mut()
            .filter(|t| t.requires_popped_location_update && !t.nothing_persistent)
            .map(|t| {
                t.requires_popped_location_update = false;
                (t.tag, t.popped)
            })
            .collect()
    };
    for (tag, popped) in flagged {
        if tag == TXS_TAG {
            continue; // value-spill holds no queue references
        }
        let begin = keys::tag_version_key(keys::TAG_MSG_REF_PREFIX, generation.id, tag, popped);
        let (_, end) = keys::prefix_range(&keys::tag_key(
            keys::TAG_MSG_REF_PREFIX,
            generation.id,
            tag,
        ));
        let rows = inner.kv.read_range(&begin, &end, 1, usize::MAX).await?;
        let new_location = rows.first().and_then(|(_, value)| {
            SpilledRecord::decode_batch(value.clone())?
                .iter()
                .find(|r| r.version >= popped)
                .map(|r| r.start)
        });
        let mut state = generation.state.lock().await;
        if let Some(t) = state.tag_mut(tag) {
            match new_location {
                Some(location) => t.popped_location = location,
                None => {
                    // All spilled data for this tag is popped.
                    t.nothing_persistent = true;
                    t.popped_location = u64::MAX;
                }
            }
        }
    }
    Ok(())
}

/// Retire a generation once it is stopped, recovered and fully drained.
pub(crate) async fn maybe_retire(inner: &Arc<ServerInner>, generation: &Arc<Generation>) -> Result<()> {
    if !generation.is_stopped() || !generation.recovery_is_complete() {
        return Ok(());
    }
    let drained = {
        let state = generation.state.lock().await;
        state.fully_drained()
    };
    if !drained {
        return Ok(());
    }
    inner.retire_generation(generation).await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spilled_record_batch_roundtrip() {
        let records = vec![
            SpilledRecord {
                version: 10,
                start: 0,
                length: 64,
                mutation_bytes: 12,
            },
            SpilledRecord {
                version: 12,
                start: 64,
                length: 128,
                mutation_bytes: 90,
            },
        ];
        let encoded = SpilledRecord::encode_batch(&records);
        assert_eq!(SpilledRecord::decode_batch(encoded).unwrap(), records);
    }

    #[test]
    fn test_spilled_record_decode_rejects_bad_lengths() {
        assert!(SpilledRecord::decode_batch(Bytes::from_static(b"xx")).is_none());
        let mut wire = BytesMut::new();
        wire.put_u32_le(3); // claims 3 records, carries none
        assert!(SpilledRecord::decode_batch(wire.freeze()).is_none());
    }

    #[test]
    fn test_empty_batch_roundtrip() {
        let encoded = SpilledRecord::encode_batch(&[]);
        assert_eq!(SpilledRecord::decode_batch(encoded).unwrap(), Vec::new());
    }
}

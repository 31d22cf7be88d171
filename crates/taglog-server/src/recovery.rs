//! Startup recovery.
//!
//! Rebuilds the server's generations from the KV index, then replays the
//! log queue into them:
//!
//! 1. Check the `Format` key (a fresh store gets one; anything else must
//!    match).
//! 2. Reconstruct one stopped generation per `version/<gen>` row, restore
//!    tag pops and re-discover tags with spilled reference data so the
//!    queue reclamation logic keeps pinning their locations.
//! 3. Position the queue at `recoveryLocation` and replay every entry
//!    through the normal memory-log path, spilling inline whenever the
//!    replay holds too many bytes in memory.
//! 4. Backfill `queue_committed_version` (everything replayed is durable
//!    by definition) and signal `recovery_complete` — restored
//!    generations only exist to answer peeks from lagging subscribers
//!    until they drain.

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use taglog_core::{Tag, Uid, Version};
use taglog_storage::{keys, KvIndex};
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::generation::Generation;
use crate::server::ServerInner;
use crate::spill;

/// Read every `(generation, value)` pair under a per-generation prefix.
async fn read_gen_values(
    inner: &Arc<ServerInner>,
    prefix: &[u8],
) -> Result<HashMap<Uid, Version>> {
    let (begin, end) = keys::prefix_range(prefix);
    let rows = inner
        .kv
        .read_range(&begin, &end, usize::MAX, usize::MAX)
        .await?;
    let mut out = HashMap::new();
    for (key, value) in rows {
        let rest = &key[prefix.len()..];
        if rest.len() != 16 {
            warn!("skipping malformed metadata key");
            continue;
        }
        let mut uid = [0u8; 16];
        uid.copy_from_slice(rest);
        if let Some(v) = keys::decode_u64(value) {
            out.insert(Uid::from_bytes(uid), v);
        }
    }
    Ok(out)
}

/// Restore generations and replay the queue. Called once at startup,
/// before any background task runs.
pub(crate) async fn restore(inner: &Arc<ServerInner>) -> Result<()> {
    match inner.kv.read_value(keys::FORMAT_KEY).await? {
        Some(value) if value == keys::FORMAT_VALUE => {}
        Some(value) => {
            return Err(Error::Storage(taglog_storage::Error::FormatMismatch(
                String::from_utf8_lossy(&value).into_owned(),
            )));
        }
        None => {
            let any = inner.kv.read_range(b"", &[0xFFu8; 4], 1, usize::MAX).await?;
            if !any.is_empty() {
                return Err(Error::RecruitmentFailed(
                    "kv store has data but no format key".to_string(),
                ));
            }
            inner.kv.set(keys::FORMAT_KEY, keys::FORMAT_VALUE).await;
            info!("fresh kv store; format key written");
        }
    }

    let versions = read_gen_values(inner, keys::VERSION_PREFIX).await?;
    let known_committed = read_gen_values(inner, keys::KNOWN_COMMITTED_PREFIX).await?;
    let localities = read_gen_values(inner, keys::LOCALITY_PREFIX).await?;
    let router_tags = read_gen_values(inner, keys::LOG_ROUTER_TAGS_PREFIX).await?;
    let recovery_counts = read_gen_values(inner, keys::RECOVERY_COUNT_PREFIX).await?;

    for (&id, &version) in &versions {
        let epoch = recovery_counts.get(&id).copied().unwrap_or(0);
        let locality = localities.get(&id).copied().unwrap_or(0) as i64 as i8;
        let generation = Arc::new(Generation::new(
            id,
            epoch,
            locality,
            router_tags.get(&id).copied().unwrap_or(0) as u32,
            0,
            0,
        ));
        generation.stop();
        generation.initialized.store(true, Ordering::Release);
        generation.set_version(version);
        {
            let mut state = generation.state.lock().await;
            state.persistent_data_version = version;
            state.persistent_data_durable_version = version;
            let kcv = known_committed.get(&id).copied().unwrap_or(0);
            state.known_committed_version = kcv;
            state.durable_known_committed_version = kcv;
            state.min_known_committed_version = kcv;
        }
        restore_tags(inner, &generation).await?;
        generation.signal_recovery_complete();

        info!(gen = %id, epoch, version, "restored stopped generation");
        inner.id_data.lock().await.insert(id, generation.clone());
        inner.spill_order.lock().await.push_back(id);
        inner.had_generations.store(true, Ordering::Release);
    }

    replay_queue(inner).await?;

    // Serving is idempotent from here: everything replayed is durable.
    let id_data = inner.id_data.lock().await;
    for generation in id_data.values() {
        generation.set_queue_committed_version(generation.version());
    }
    info!(generations = id_data.len(), "recovery complete");
    Ok(())
}

/// Rebuild tag state: popped versions from `TagPop`, plus discovery of
/// tags that still hold spilled reference data (they must keep pinning
/// the disk queue until popped).
async fn restore_tags(inner: &Arc<ServerInner>, generation: &Arc<Generation>) -> Result<()> {
    let pop_prefix = keys::gen_key(keys::TAG_POP_PREFIX, generation.id);
    let (begin, end) = keys::prefix_range(&pop_prefix);
    let rows = inner
        .kv
        .read_range(&begin, &end, usize::MAX, usize::MAX)
        .await?;
    let mut state = generation.state.lock().await;
    for (key, value) in rows {
        let rest = &key[pop_prefix.len()..];
        if rest.len() != 3 {
            continue;
        }
        let tag = Tag::new(rest[0] as i8, u16::from_be_bytes([rest[1], rest[2]]));
        if let Some(popped) = keys::decode_u64(value) {
            let data = state.tag_or_create(tag, popped, false);
            data.popped = data.popped.max(popped);
        }
    }
    drop(state);

    let ref_prefix = keys::gen_key(keys::TAG_MSG_REF_PREFIX, generation.id);
    let (begin, end) = keys::prefix_range(&ref_prefix);
    let rows = inner
        .kv
        .read_range(&begin, &end, usize::MAX, usize::MAX)
        .await?;
    let mut state = generation.state.lock().await;
    for (key, _) in rows {
        if let Some((_, tag, _)) = keys::parse_tag_version_key(keys::TAG_MSG_REF_PREFIX, &key) {
            let data = state.tag_or_create(tag, 0, false);
            data.nothing_persistent = false;
            data.requires_popped_location_update = true;
        }
    }
    Ok(())
}

/// Replay the queue into the restored generations.
async fn replay_queue(inner: &Arc<ServerInner>) -> Result<()> {
    let recovery_location = inner
        .kv
        .read_value(keys::RECOVERY_LOCATION_KEY)
        .await?
        .and_then(keys::decode_u64)
        .unwrap_or(0);

    {
        let mut queue = inner.queue.lock().await;
        if queue.init_recovery(recovery_location)? {
            info!("log queue is empty");
        }
    }

    let mut replayed = 0usize;
    let mut skipped = 0usize;
    loop {
        // Lock scope per entry so inline spills interleave cleanly.
        let next = {
            let mut queue = inner.queue.lock().await;
            queue.read_next().await?
        };
        let Some((entry, start, end)) = next else {
            break;
        };

        let generation = {
            let id_data = inner.id_data.lock().await;
            id_data.get(&entry.id).cloned()
        };
        let Some(generation) = generation else {
            skipped += 1;
            continue;
        };
        if entry.version <= generation.version()
            && generation.state.lock().await.persistent_data_version >= entry.version
        {
            // Already spilled before the recorded recovery location moved.
            skipped += 1;
            continue;
        }

        let charged = generation
            .commit_messages(entry.version, &entry.messages, &inner.knobs, true)
            .await?;
        inner.bytes_input.fetch_add(charged, Ordering::Relaxed);
        {
            let mut state = generation.state.lock().await;
            state.version_location.insert(entry.version, (start, end));
            state.known_committed_version = state
                .known_committed_version
                .max(entry.known_committed_version);
        }
        generation.set_version(entry.version);
        replayed += 1;

        // Keep replay memory bounded by spilling inline.
        if inner.unreleased_bytes() > inner.knobs.recover_memory_limit {
            let to = generation.version();
            info!(gen = %generation.id, to, "replay memory limit reached; spilling inline");
            generation.set_queue_committed_version(to);
            spill::update_persistent_data(inner, &generation, to).await?;
        }
    }

    info!(replayed, skipped, "queue replay finished");
    Ok(())
}

//! Commit path and queue committer.
//!
//! `handle_commit` admits version-ordered batches: it waits until the
//! batch's predecessor version has been admitted, applies backpressure
//! while too many bytes are neither spilled nor popped, appends to the
//! memory log, frames a queue entry, and advances the generation's
//! version — the single action every peek, pop and durability waiter
//! keys off. A duplicate request (version already admitted) skips the
//! work but still waits for queue durability, so replies are idempotent.
//!
//! The **queue committer** is one task per process: it batches a durable
//! barrier over the shared disk queue and then advances
//! `queue_committed_version` for every generation whose entries the
//! barrier covered. A commit slower than the degraded threshold flags the
//! process but still completes.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use taglog_core::{CommitBatchReader, ExecOp, Version};
use taglog_storage::logqueue::QueueEntry;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::generation::Generation;
use crate::peek;
use crate::rpc::{CommitReply, CommitRequest};
use crate::server::ServerInner;

pub(crate) async fn handle_commit(
    inner: &Arc<ServerInner>,
    generation: &Arc<Generation>,
    req: CommitRequest,
) -> Result<CommitReply> {
    {
        let mut state = generation.state.lock().await;
        state.min_known_committed_version = state
            .min_known_committed_version
            .max(req.min_known_committed_version);
    }

    generation.wait_version(req.prev_version).await;

    // Backpressure: stall while the process holds too many unreleased
    // bytes. Spills and pops release them.
    let stall_started = Instant::now();
    let mut warned = false;
    while inner.unreleased_bytes() >= inner.knobs.hard_limit_bytes {
        if generation.is_stopped() {
            return Err(Error::TLogStopped);
        }
        if !warned && stall_started.elapsed() >= Duration::from_secs(1) {
            warn!(
                gen = %generation.id,
                version = req.version,
                unreleased = inner.unreleased_bytes(),
                "commit blocked on byte limit"
            );
            warned = true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    if generation.is_stopped() {
        return Err(Error::TLogStopped);
    }

    // The predecessor link: a batch is admitted only when it extends the
    // version this generation is at. Anything at or below the current
    // version is a duplicate and skips straight to the durability wait.
    // The admission lock keeps a duplicate from interleaving with the
    // original across the suspension points below.
    let admission = generation.commit_admission_lock.lock().await;
    if generation.version() == req.prev_version && req.version > req.prev_version {
        if req.has_exec_op {
            let _exec_guard = generation.exec_op_lock.lock().await;
            apply_exec_ops(inner, &req).await?;
        }

        let charged = generation
            .commit_messages(req.version, &req.messages, &inner.knobs, false)
            .await?;
        inner.bytes_input.fetch_add(charged, Ordering::Relaxed);

        let known_committed_version = {
            let mut state = generation.state.lock().await;
            state.known_committed_version = state
                .known_committed_version
                .max(req.known_committed_version);
            state.known_committed_version
        };

        let entry = QueueEntry {
            id: generation.id,
            version: req.version,
            known_committed_version,
            messages: req.messages.clone(),
        };
        let (start, end) = {
            let mut queue = inner.queue.lock().await;
            queue.push(&entry).await?
        };
        {
            let mut state = generation.state.lock().await;
            state.version_location.insert(req.version, (start, end));
        }

        let staged = inner
            .staged_commit_bytes
            .fetch_add(end - start, Ordering::Relaxed)
            + (end - start);
        if staged >= inner.knobs.large_commit_bytes {
            inner.queue_commit_wake.notify_one();
        }

        // This is what unblocks every waiter.
        generation.set_version(req.version);
        debug!(gen = %generation.id, version = req.version, bytes = end - start, "commit admitted");
    }
    drop(admission);

    // Idempotent tail: duplicates wait here too.
    let warn_interval = inner.knobs.queue_commit_warn_interval;
    loop {
        tokio::select! {
            _ = generation.wait_queue_committed(req.version) => break,
            _ = tokio::time::sleep(warn_interval) => {
                debug!(gen = %generation.id, version = req.version, "still waiting for queue durability");
            }
        }
    }

    let state = generation.state.lock().await;
    Ok(CommitReply {
        durable_known_committed_version: state.durable_known_committed_version,
    })
}

/// Apply operator snapshot commands carried in the batch.
async fn apply_exec_ops(inner: &Arc<ServerInner>, req: &CommitRequest) -> Result<()> {
    for message in CommitBatchReader::new(req.messages.clone()) {
        let message = message?;
        if !ExecOp::is_exec_payload(&message.payload) {
            continue;
        }
        match ExecOp::decode(&message.payload)? {
            ExecOp::DisablePop { uid, deadline_ms } => {
                info!(%uid, deadline_ms, "deferring pops for snapshot");
                let mut ignore = inner.ignore_pops.lock().await;
                ignore.active = Some((uid, Instant::now() + Duration::from_millis(deadline_ms)));
            }
            ExecOp::EnablePop { uid } => {
                info!(%uid, "re-enabling pops");
                let deferred = {
                    let mut ignore = inner.ignore_pops.lock().await;
                    ignore.active = None;
                    std::mem::take(&mut ignore.deferred)
                };
                peek::replay_deferred_pops(inner, deferred).await;
            }
            ExecOp::Snap { uid } => {
                run_snap_helper(inner, uid).await;
            }
        }
    }
    Ok(())
}

async fn run_snap_helper(inner: &Arc<ServerInner>, uid: taglog_core::Uid) {
    let Some(helper) = inner.config.snap_helper.clone() else {
        warn!(%uid, "snap requested but no helper binary is configured");
        return;
    };
    let spawned = tokio::process::Command::new(&helper)
        .arg("--role")
        .arg("tlog")
        .arg("--uid")
        .arg(uid.to_string())
        .spawn();
    match spawned {
        Ok(mut child) => match child.wait().await {
            Ok(status) if status.success() => info!(%uid, "snap helper succeeded"),
            Ok(status) => warn!(%uid, %status, "snap helper failed"),
            Err(e) => warn!(%uid, error = %e, "snap helper did not run"),
        },
        Err(e) => warn!(%uid, helper = %helper.display(), error = %e, "could not spawn snap helper"),
    }
}

/// The one queue committer per process.
pub(crate) async fn queue_commit_loop(inner: Arc<ServerInner>) {
    let mut shutdown = inner.shutdown.subscribe();
    loop {
        let Some(generation) = inner.newest_generation().await else {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(50)) => continue,
                _ = shutdown.changed() => return,
            }
        };

        if generation.version() <= generation.queue_committed_version() {
            // Nothing staged for the newest generation; wait for a version
            // advance, a large-commit wakeup, or a newer generation.
            let committed = generation.queue_committed_version();
            let mut version_rx = generation.subscribe_version();
            tokio::select! {
                _ = version_rx.wait_for(move |v| *v > committed) => {}
                _ = inner.queue_commit_wake.notified() => {}
                _ = tokio::time::sleep(Duration::from_millis(100)) => {}
                _ = shutdown.changed() => return,
            }
            continue;
        }

        if let Err(e) = do_queue_commit(&inner).await {
            warn!(error = %e, "queue commit failed");
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }
}

/// One durable barrier over the shared queue, then advance every
/// generation whose staged entries it covered.
async fn do_queue_commit(inner: &Arc<ServerInner>) -> Result<()> {
    // Snapshot each generation's admitted version and known-committed
    // version before the barrier; entries for those versions were pushed
    // before `set_version` made them visible.
    let snapshots: Vec<(Arc<Generation>, Version, Version)> = {
        let id_data = inner.id_data.lock().await;
        let mut out = Vec::with_capacity(id_data.len());
        for generation in id_data.values() {
            let known_committed = generation.state.lock().await.known_committed_version;
            out.push((generation.clone(), generation.version(), known_committed));
        }
        out
    };

    inner.staged_commit_bytes.store(0, Ordering::Relaxed);
    let commit_started = Instant::now();
    {
        let mut queue = inner.queue.lock().await;
        let commit = queue.commit();
        tokio::pin!(commit);
        let mut flagged = false;
        loop {
            tokio::select! {
                result = &mut commit => {
                    result?;
                    break;
                }
                _ = tokio::time::sleep(inner.knobs.degraded_commit), if !flagged => {
                    warn!("queue commit is slow; marking process degraded");
                    inner.degraded.store(true, Ordering::Release);
                    flagged = true;
                }
            }
        }
    }
    debug!(
        elapsed_ms = commit_started.elapsed().as_millis() as u64,
        "queue commit barrier complete"
    );

    for (generation, version, known_committed) in snapshots {
        // Publish the durable KCV before queue_committed_version releases
        // the commit repliers that read it.
        {
            let mut state = generation.state.lock().await;
            state.durable_known_committed_version =
                state.durable_known_committed_version.max(known_committed);
            inner.check_recovery_complete(&generation, &mut state);
        }
        generation.set_queue_committed_version(version);
    }
    Ok(())
}

//! Server wiring and generation lifecycle.
//!
//! `TLogServer::start` recovers persistent state, binds the transport,
//! registers a recruit endpoint and starts the background tasks (queue
//! committer, spill loop, KV snapshotter, peek-tracker sweeper). Each
//! recruited or restored generation gets its own set of stream endpoints
//! — a [`TLogInterface`] — so subscribers keep draining old generations
//! while new ones serve commits.
//!
//! ## Recruitment
//!
//! A recruit request stops every prior generation, writes the new
//! generation's metadata in one KV commit, and, when the request names a
//! predecessor log system, pulls the recovery tags' data in
//! `(known_committed_version, recover_at]` through the normal commit
//! path before declaring the generation caught up at `recover_at`.
//!
//! ## Retirement
//!
//! A stopped generation whose data has been fully spilled and popped is
//! erased; when the last one goes, the process's role is over and
//! `wait_removed` fires (`worker_removed`).

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use taglog_core::{Tag, Uid, Version};
use taglog_storage::logqueue::QueueEntry;
use taglog_storage::{keys, KvIndex, LogQueue, MemoryKv};
use taglog_net::{InboundPacket, Token, Transport, TransportConfig};
use tokio::sync::{mpsc, watch, Mutex, Notify, Semaphore};
use tracing::{debug, info, warn};

use crate::commit;
use crate::config::{Knobs, ServerConfig};
use crate::error::{Error, Result};
use crate::generation::{GenState, Generation};
use crate::peek::{self, IgnorePops, PeekTracker};
use crate::recovery;
use crate::rpc::*;
use crate::spill;

pub(crate) struct ServerInner {
    pub(crate) config: ServerConfig,
    pub(crate) knobs: Knobs,
    pub(crate) instance_id: Uid,
    pub(crate) transport: Transport,
    pub(crate) queue: Mutex<LogQueue>,
    pub(crate) kv: Arc<MemoryKv>,
    /// Every resident generation, newest and stopped alike.
    pub(crate) id_data: Mutex<BTreeMap<Uid, Arc<Generation>>>,
    /// Oldest-first spill duty.
    pub(crate) spill_order: Mutex<VecDeque<Uid>>,
    pub(crate) bytes_input: AtomicU64,
    pub(crate) bytes_durable: AtomicU64,
    pub(crate) staged_commit_bytes: AtomicU64,
    pub(crate) peek_memory: Arc<Semaphore>,
    pub(crate) router_reads: Arc<Semaphore>,
    pub(crate) peek_trackers: Mutex<HashMap<Uid, PeekTracker>>,
    pub(crate) ignore_pops: Mutex<IgnorePops>,
    pub(crate) queue_commit_wake: Notify,
    /// Spans stage-plus-commit sequences against the KV index, so a
    /// concurrent committer can never persist half of another writer's
    /// batch.
    pub(crate) kv_commit_lock: Mutex<()>,
    pub(crate) degraded: AtomicBool,
    pub(crate) failure_waiters: Mutex<HashMap<Uid, Vec<(SocketAddr, Token)>>>,
    pub(crate) interfaces: Mutex<HashMap<Uid, (TLogInterface, Vec<Token>)>>,
    pub(crate) removed: watch::Sender<bool>,
    pub(crate) shutdown: watch::Sender<bool>,
    pub(crate) had_generations: AtomicBool,
    /// Pseudo-locality pop translation, supplied by the surrounding log
    /// system layer; identity by default.
    pub(crate) pop_pseudo_locality_tag: Box<dyn Fn(Tag) -> Tag + Send + Sync>,
}

impl ServerInner {
    pub(crate) fn unreleased_bytes(&self) -> u64 {
        self.bytes_input
            .load(Ordering::Relaxed)
            .saturating_sub(self.bytes_durable.load(Ordering::Relaxed))
    }

    pub(crate) async fn newest_generation(&self) -> Option<Arc<Generation>> {
        let id_data = self.id_data.lock().await;
        id_data
            .values()
            .max_by_key(|g| (g.epoch, g.id))
            .cloned()
    }

    /// Latched: fires once the generation's recovered tags have all been
    /// popped past `recovered_at` and that point is durably known
    /// committed.
    pub(crate) fn check_recovery_complete(&self, generation: &Generation, state: &mut GenState) {
        if !generation.recovery_is_complete()
            && state.unpopped_recovered_tags == 0
            && state.durable_known_committed_version >= generation.recovered_at
        {
            info!(gen = %generation.id, "generation recovery complete");
            generation.signal_recovery_complete();
        }
    }

    pub(crate) fn reply<T: Serialize>(&self, to: SocketAddr, token: Token, result: &RpcResult<T>) {
        match Transport::encode_message(result) {
            Ok(body) => self.transport.send_unreliable(to, token, body),
            Err(e) => warn!(error = %e, "could not encode reply"),
        }
    }

    pub(crate) async fn retire_generation(&self, generation: &Arc<Generation>) {
        info!(gen = %generation.id, epoch = generation.epoch, "retiring generation");
        self.id_data.lock().await.remove(&generation.id);
        self.spill_order
            .lock()
            .await
            .retain(|id| *id != generation.id);
        if let Some((_, tokens)) = self.interfaces.lock().await.remove(&generation.id) {
            for token in tokens {
                self.transport.deregister(token);
            }
        }
        if let Some(waiters) = self.failure_waiters.lock().await.remove(&generation.id) {
            for (addr, token) in waiters {
                self.reply::<()>(addr, token, &Err(RpcError::WorkerRemoved));
            }
        }
        let empty = self.id_data.lock().await.is_empty();
        if empty && self.had_generations.load(Ordering::Acquire) {
            warn!("last generation retired; worker removed");
            let _ = self.removed.send(true);
        }
    }
}

/// Requests that carry their reply token.
trait HasReply {
    fn reply_token(&self) -> Token;
}

macro_rules! has_reply {
    ($($ty:ty),*) => {
        $(impl HasReply for $ty {
            fn reply_token(&self) -> Token {
                self.reply
            }
        })*
    };
}
has_reply!(
    PeekRequest,
    PopRequest,
    CommitRequest,
    LockRequest,
    QueuingMetricsRequest,
    ConfirmRunningRequest,
    RecoveryFinishedRequest,
    WaitFailureRequest,
    RecruitRequest
);

/// Register a stream endpoint whose requests run concurrently through
/// `handler`, each answered at its reply token.
fn spawn_endpoint<Req, Resp, F, Fut>(
    inner: &Arc<ServerInner>,
    generation: &Arc<Generation>,
    handler: F,
) -> Token
where
    Req: DeserializeOwned + HasReply + Send + 'static,
    Resp: Serialize + Send + 'static,
    F: Fn(Arc<ServerInner>, Arc<Generation>, Req) -> Fut + Send + Sync + Clone + 'static,
    Fut: Future<Output = RpcResult<Resp>> + Send + 'static,
{
    let (token, rx) = inner.transport.register_stream(0);
    tokio::spawn(endpoint_loop(inner.clone(), generation.clone(), rx, handler));
    token
}

async fn endpoint_loop<Req, Resp, F, Fut>(
    inner: Arc<ServerInner>,
    generation: Arc<Generation>,
    mut rx: mpsc::UnboundedReceiver<InboundPacket>,
    handler: F,
) where
    Req: DeserializeOwned + HasReply + Send + 'static,
    Resp: Serialize + Send + 'static,
    F: Fn(Arc<ServerInner>, Arc<Generation>, Req) -> Fut + Send + Sync + Clone + 'static,
    Fut: Future<Output = RpcResult<Resp>> + Send + 'static,
{
    while let Some(packet) = rx.recv().await {
        let req: Req = match Transport::decode_message(&packet.payload) {
            Ok(req) => req,
            Err(e) => {
                warn!(error = %e, "undecodable request");
                continue;
            }
        };
        let reply_token = req.reply_token();
        let from = packet.from;
        let inner = inner.clone();
        let generation = generation.clone();
        let handler = handler.clone();
        tokio::spawn(async move {
            let result = handler(inner.clone(), generation, req).await;
            inner.reply(from, reply_token, &result);
        });
    }
}

/// Register the full endpoint set for one generation.
async fn serve_generation(
    inner: &Arc<ServerInner>,
    generation: &Arc<Generation>,
) -> TLogInterface {
    let peek_token = spawn_endpoint(inner, generation, |i, g, req: PeekRequest| async move {
        peek::handle_peek(&i, &g, req).await.map_err(RpcError::from)
    });
    let pop_token = spawn_endpoint(inner, generation, |i, g, req: PopRequest| async move {
        peek::handle_pop(&i, &g, req).await.map_err(RpcError::from)
    });
    let commit_token = spawn_endpoint(inner, generation, |i, g, req: CommitRequest| async move {
        commit::handle_commit(&i, &g, req).await.map_err(RpcError::from)
    });
    let lock_token = spawn_endpoint(inner, generation, |i, g, _req: LockRequest| async move {
        handle_lock(&i, &g).await.map_err(RpcError::from)
    });
    let metrics_token = spawn_endpoint(
        inner,
        generation,
        |i, g, _req: QueuingMetricsRequest| async move {
            handle_queuing_metrics(&i, &g).await.map_err(RpcError::from)
        },
    );
    let confirm_token = spawn_endpoint(
        inner,
        generation,
        |_i, _g, _req: ConfirmRunningRequest| async move { RpcResult::Ok(()) },
    );
    let recovery_finished_token = spawn_endpoint(
        inner,
        generation,
        |_i, g, _req: RecoveryFinishedRequest| async move {
            g.wait_recovery_complete().await;
            RpcResult::Ok(())
        },
    );

    // wait_failure never answers until the generation is displaced.
    let (wait_failure_token, mut wait_failure_rx) = inner.transport.register_stream(0);
    {
        let inner = inner.clone();
        let gen_id = generation.id;
        tokio::spawn(async move {
            while let Some(packet) = wait_failure_rx.recv().await {
                if let Ok(req) = Transport::decode_message::<WaitFailureRequest>(&packet.payload) {
                    inner
                        .failure_waiters
                        .lock()
                        .await
                        .entry(gen_id)
                        .or_default()
                        .push((packet.from, req.reply));
                }
            }
        });
    }

    let interface = TLogInterface {
        id: generation.id,
        addr: inner.transport.local_addr(),
        peek_messages: peek_token,
        pop_messages: pop_token,
        commit: commit_token,
        lock: lock_token,
        get_queuing_metrics: metrics_token,
        confirm_running: confirm_token,
        recovery_finished: recovery_finished_token,
        wait_failure: wait_failure_token,
    };
    let tokens = vec![
        peek_token,
        pop_token,
        commit_token,
        lock_token,
        metrics_token,
        confirm_token,
        recovery_finished_token,
        wait_failure_token,
    ];
    inner
        .interfaces
        .lock()
        .await
        .insert(generation.id, (interface.clone(), tokens));
    interface
}

async fn handle_lock(inner: &Arc<ServerInner>, generation: &Arc<Generation>) -> Result<LockReply> {
    info!(gen = %generation.id, version = generation.version(), "locking generation");
    generation.stop();
    inner.queue_commit_wake.notify_one();
    generation.wait_queue_committed(generation.version()).await;
    let state = generation.state.lock().await;
    Ok(LockReply {
        end: generation.version(),
        known_committed_version: state.known_committed_version,
    })
}

async fn handle_queuing_metrics(
    inner: &Arc<ServerInner>,
    generation: &Arc<Generation>,
) -> Result<QueuingMetricsReply> {
    let storage_bytes = {
        let queue = inner.queue.lock().await;
        queue.storage_bytes()
    };
    let local_time = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0);
    Ok(QueuingMetricsReply {
        local_time,
        instance_id: inner.instance_id.first,
        bytes_durable: inner.bytes_durable.load(Ordering::Relaxed),
        bytes_input: inner.bytes_input.load(Ordering::Relaxed),
        storage_bytes,
        v: generation.version(),
    })
}

/// Create a generation for a recruit request.
async fn handle_recruit(inner: &Arc<ServerInner>, req: RecruitRequest) -> Result<TLogInterface> {
    info!(
        id = %req.recruitment_id,
        epoch = req.epoch,
        recover_at = req.recover_at,
        tags = req.recover_tags.len(),
        "recruiting generation"
    );
    {
        let id_data = inner.id_data.lock().await;
        if let Some(existing) = id_data.values().map(|g| g.epoch).max() {
            if req.epoch <= existing {
                return Err(Error::RecruitmentFailed(format!(
                    "epoch {} is not newer than resident epoch {}",
                    req.epoch, existing
                )));
            }
        }
        // Prior generations stop accepting commits now.
        for generation in id_data.values() {
            generation.stop();
        }
    }
    inner.queue_commit_wake.notify_one();

    let generation = Arc::new(Generation::new(
        req.recruitment_id,
        req.epoch,
        req.locality,
        req.log_router_tags,
        req.recover_at,
        req.known_committed_version + 1,
    ));
    init_persistent_state(inner, &generation, &req).await?;

    {
        let mut id_data = inner.id_data.lock().await;
        id_data.insert(generation.id, generation.clone());
    }
    inner.spill_order.lock().await.push_back(generation.id);
    inner.had_generations.store(true, Ordering::Release);
    let interface = serve_generation(inner, &generation).await;

    if let Some(recover_from) = &req.recover_from {
        if let Err(e) = pull_from_predecessor(inner, &generation, recover_from, &req).await {
            warn!(gen = %generation.id, error = %e, "predecessor pull failed");
            inner.retire_generation(&generation).await;
            return Err(Error::RecruitmentFailed(format!(
                "could not recover from predecessor: {}",
                e
            )));
        }
    } else {
        generation.set_version(req.recover_at);
    }

    {
        let mut state = generation.state.lock().await;
        inner.check_recovery_complete(&generation, &mut state);
    }
    Ok(interface)
}

/// Write the generation's metadata rows and commit them exactly once.
async fn init_persistent_state(
    inner: &Arc<ServerInner>,
    generation: &Arc<Generation>,
    req: &RecruitRequest,
) -> Result<()> {
    let _kv_guard = inner.kv_commit_lock.lock().await;
    let kv = &inner.kv;
    let id = generation.id;
    kv.set(&keys::gen_key(keys::VERSION_PREFIX, id), &keys::encode_u64(0))
        .await;
    kv.set(
        &keys::gen_key(keys::KNOWN_COMMITTED_PREFIX, id),
        &keys::encode_u64(req.known_committed_version),
    )
    .await;
    kv.set(
        &keys::gen_key(keys::LOCALITY_PREFIX, id),
        &keys::encode_u64(req.locality as i64 as u64),
    )
    .await;
    kv.set(
        &keys::gen_key(keys::LOG_ROUTER_TAGS_PREFIX, id),
        &keys::encode_u64(req.log_router_tags as u64),
    )
    .await;
    kv.set(
        &keys::gen_key(keys::RECOVERY_COUNT_PREFIX, id),
        &keys::encode_u64(req.epoch),
    )
    .await;
    kv.set(
        &keys::gen_key(keys::PROTOCOL_VERSION_PREFIX, id),
        &keys::encode_u64(taglog_core::PROTOCOL_VERSION),
    )
    .await;
    kv.commit().await?;

    {
        let mut state = generation.state.lock().await;
        state.known_committed_version = req.known_committed_version;
        state.min_known_committed_version = req.known_committed_version;
        for tag in &req.recover_tags {
            state.tag_or_create(*tag, 0, true);
        }
    }
    generation.initialized.store(true, Ordering::Release);
    Ok(())
}

/// Pull `(known_committed_version, recover_at]` for the recovery tags out
/// of the predecessor log system and feed it through the normal commit
/// path.
async fn pull_from_predecessor(
    inner: &Arc<ServerInner>,
    generation: &Arc<Generation>,
    recover_from: &RecoverFrom,
    req: &RecruitRequest,
) -> Result<()> {
    use crate::client::TLogClient;

    let pull_begin = req.known_committed_version + 1;
    // (version, subsequence) → framed message; merging per-tag peeks this
    // way de-duplicates messages carried by several recovery tags.
    let mut merged: BTreeMap<Version, BTreeMap<u32, Bytes>> = BTreeMap::new();

    for tag in &req.recover_tags {
        let mut begin = pull_begin;
        'sources: loop {
            if begin > req.recover_at {
                break;
            }
            let mut last_error: Option<Error> = None;
            for interface in &recover_from.logs {
                let client = TLogClient::new(inner.transport.clone(), interface.clone())
                    .with_timeout(Duration::from_secs(10));
                match client.peek_full(*tag, begin, true, false, None).await {
                    Ok(reply) => {
                        for decoded in taglog_core::PeekBodyReader::new(reply.messages.clone()) {
                            let (version, message) = decoded?;
                            if version < pull_begin || version > req.recover_at {
                                continue;
                            }
                            merged
                                .entry(version)
                                .or_default()
                                .insert(message.subsequence, message.raw);
                        }
                        if reply.end <= begin || reply.end > req.recover_at {
                            break 'sources;
                        }
                        begin = reply.end;
                        continue 'sources;
                    }
                    Err(Error::EndOfStream) => break 'sources,
                    Err(e) => {
                        last_error = Some(e);
                        continue;
                    }
                }
            }
            if let Some(e) = last_error {
                return Err(e);
            }
            break;
        }
    }

    // Feed the merged history through the commit path machinery: memory
    // log, queue entry, version advance.
    for (version, messages) in merged {
        let mut blob = bytes::BytesMut::new();
        for (_, raw) in messages {
            blob.extend_from_slice(&raw);
        }
        let blob = blob.freeze();
        admit_recovered_version(inner, generation, version, blob).await?;
    }

    // Declare the handoff point: the generation is caught up at
    // recover_at even if the predecessor had nothing newer.
    if generation.version() < req.recover_at {
        admit_recovered_version(inner, generation, req.recover_at, Bytes::new()).await?;
    }
    {
        let mut state = generation.state.lock().await;
        state.known_committed_version = state.known_committed_version.max(req.recover_at);
    }
    inner.queue_commit_wake.notify_one();
    generation.wait_queue_committed(generation.version()).await;
    info!(gen = %generation.id, version = generation.version(), "predecessor pull complete");
    Ok(())
}

async fn admit_recovered_version(
    inner: &Arc<ServerInner>,
    generation: &Arc<Generation>,
    version: Version,
    messages: Bytes,
) -> Result<()> {
    let charged = generation
        .commit_messages(version, &messages, &inner.knobs, true)
        .await?;
    inner.bytes_input.fetch_add(charged, Ordering::Relaxed);
    let known_committed_version = {
        let state = generation.state.lock().await;
        state.known_committed_version
    };
    let entry = QueueEntry {
        id: generation.id,
        version,
        known_committed_version,
        messages,
    };
    let (start, end) = {
        let mut queue = inner.queue.lock().await;
        queue.push(&entry).await?
    };
    {
        let mut state = generation.state.lock().await;
        state.version_location.insert(version, (start, end));
    }
    generation.set_version(version);
    Ok(())
}

/// Re-write the KV index into its own log, bounding that log's growth.
async fn kv_snapshot_loop(inner: Arc<ServerInner>) {
    let mut shutdown = inner.shutdown.subscribe();
    let mut tick = tokio::time::interval(inner.knobs.kv_snapshot_interval);
    loop {
        tokio::select! {
            _ = tick.tick() => {}
            _ = shutdown.changed() => return,
        }
        let _kv_guard = inner.kv_commit_lock.lock().await;
        match inner
            .kv
            .snapshot_step(inner.knobs.kv_snapshot_chunk_bytes)
            .await
        {
            // A completed cycle is committed promptly so the op-log
            // prefix behind it can be reclaimed.
            Ok(true) => {
                if let Err(e) = inner.kv.commit().await {
                    warn!(error = %e, "kv snapshot commit failed");
                }
            }
            Ok(false) => {}
            Err(e) => warn!(error = %e, "kv snapshot step failed"),
        }
    }
}

/// A running log server process.
pub struct TLogServer {
    inner: Arc<ServerInner>,
    recruit_token: Token,
}

impl TLogServer {
    /// Recover persistent state and start serving.
    pub async fn start(config: ServerConfig, listen_addr: SocketAddr) -> Result<TLogServer> {
        Self::start_with_transport_config(config, listen_addr, TransportConfig::default()).await
    }

    pub async fn start_with_transport_config(
        config: ServerConfig,
        listen_addr: SocketAddr,
        transport_config: TransportConfig,
    ) -> Result<TLogServer> {
        let knobs = config.knobs.clone();
        let kv = Arc::new(MemoryKv::open(config.kv_queue_config()).await?);
        let queue = LogQueue::open(config.queue_config()).await?;
        let transport = Transport::bind(transport_config, listen_addr).await?;
        let instance_id = Uid::random();
        info!(%instance_id, addr = %transport.local_addr(), "log server starting");

        let inner = Arc::new(ServerInner {
            peek_memory: Arc::new(Semaphore::new(knobs.peek_memory_limit_bytes)),
            router_reads: Arc::new(Semaphore::new(knobs.concurrent_log_router_reads)),
            config,
            knobs,
            instance_id,
            transport,
            queue: Mutex::new(queue),
            kv,
            id_data: Mutex::new(BTreeMap::new()),
            spill_order: Mutex::new(VecDeque::new()),
            bytes_input: AtomicU64::new(0),
            bytes_durable: AtomicU64::new(0),
            staged_commit_bytes: AtomicU64::new(0),
            peek_trackers: Mutex::new(HashMap::new()),
            ignore_pops: Mutex::new(IgnorePops::default()),
            queue_commit_wake: Notify::new(),
            kv_commit_lock: Mutex::new(()),
            degraded: AtomicBool::new(false),
            failure_waiters: Mutex::new(HashMap::new()),
            interfaces: Mutex::new(HashMap::new()),
            removed: watch::channel(false).0,
            shutdown: watch::channel(false).0,
            had_generations: AtomicBool::new(false),
            pop_pseudo_locality_tag: Box::new(|tag| tag),
        });

        recovery::restore(&inner).await?;

        // Restored generations answer peeks until their subscribers drain.
        let restored: Vec<Arc<Generation>> = {
            let id_data = inner.id_data.lock().await;
            id_data.values().cloned().collect()
        };
        for generation in &restored {
            serve_generation(&inner, generation).await;
        }

        tokio::spawn(commit::queue_commit_loop(inner.clone()));
        tokio::spawn(spill::update_storage_loop(inner.clone()));
        tokio::spawn(kv_snapshot_loop(inner.clone()));
        tokio::spawn(peek::cleanup_peek_trackers(inner.clone()));

        // Recruit endpoint: how a coordinator creates generations here.
        let (recruit_token, mut recruit_rx) = inner.transport.register_stream(0);
        {
            let inner = inner.clone();
            tokio::spawn(async move {
                while let Some(packet) = recruit_rx.recv().await {
                    let req: RecruitRequest = match Transport::decode_message(&packet.payload) {
                        Ok(req) => req,
                        Err(e) => {
                            warn!(error = %e, "undecodable recruit request");
                            continue;
                        }
                    };
                    let reply_token = req.reply;
                    let from = packet.from;
                    let inner = inner.clone();
                    tokio::spawn(async move {
                        let result = handle_recruit(&inner, req).await.map_err(RpcError::from);
                        inner.reply(from, reply_token, &result);
                    });
                }
            });
        }

        Ok(TLogServer {
            inner,
            recruit_token,
        })
    }

    pub fn transport(&self) -> Transport {
        self.inner.transport.clone()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.transport.local_addr()
    }

    /// Where recruit requests go.
    pub fn recruit_endpoint(&self) -> (SocketAddr, Token) {
        (self.inner.transport.local_addr(), self.recruit_token)
    }

    pub fn is_degraded(&self) -> bool {
        self.inner.degraded.load(Ordering::Acquire) || self.inner.transport.is_degraded()
    }

    /// Interfaces of every resident generation, oldest epoch first.
    pub async fn interfaces(&self) -> Vec<TLogInterface> {
        let id_data = self.inner.id_data.lock().await;
        let mut generations: Vec<&Arc<Generation>> = id_data.values().collect();
        generations.sort_by_key(|g| (g.epoch, g.id));
        let interfaces = self.inner.interfaces.lock().await;
        generations
            .iter()
            .filter_map(|g| interfaces.get(&g.id).map(|(i, _)| i.clone()))
            .collect()
    }

    /// Resolves when the last generation retires (`worker_removed`).
    pub async fn wait_removed(&self) {
        let mut rx = self.inner.removed.subscribe();
        let _ = rx.wait_for(|removed| *removed).await;
    }

    pub fn shutdown(&self) {
        let _ = self.inner.shutdown.send(true);
        self.inner.transport.shutdown();
    }

    /// Test/ops hook: force one spill iteration now.
    pub async fn force_spill(&self) -> Result<()> {
        let newest = self.inner.newest_generation().await;
        if let Some(generation) = newest {
            let target = generation.version();
            let needs_spill = {
                let state = generation.state.lock().await;
                state.persistent_data_version < target
            };
            if needs_spill {
                self.inner.queue_commit_wake.notify_one();
                generation.wait_queue_committed(target).await;
                let _guard = generation.persistent_data_commit_lock.lock().await;
                spill::update_persistent_data(&self.inner, &generation, target).await?;
            }
        }
        spill::pop_disk_queue(&self.inner).await?;
        if let Some(generation) = self.inner.newest_generation().await {
            spill::maybe_retire(&self.inner, &generation).await?;
        }
        Ok(())
    }

    /// Process-wide debug counters.
    pub fn byte_counters(&self) -> (u64, u64) {
        (
            self.inner.bytes_input.load(Ordering::Relaxed),
            self.inner.bytes_durable.load(Ordering::Relaxed),
        )
    }

    /// Storage accounting of the shared disk queue.
    pub async fn queue_storage_bytes(&self) -> taglog_core::StorageBytes {
        self.inner.queue.lock().await.storage_bytes()
    }
}

impl Drop for TLogServer {
    fn drop(&mut self) {
        let _ = self.inner.shutdown.send(true);
        self.inner.transport.shutdown();
        debug!("log server dropped");
    }
}

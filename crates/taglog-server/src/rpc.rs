//! RPC surface of the log server.
//!
//! Every request carries the reply token its answer should be sent to;
//! replies are `Result<_, RpcError>` so protocol-level failures
//! (`tlog_stopped`, `timed_out`, `end_of_stream`) travel as values, not as
//! dropped connections. Requests are bincode-encoded behind the
//! destination token; the wire framing around them is the transport's.
//!
//! A [`TLogInterface`] is minted per recruited generation: peeks and pops
//! against an old generation keep working while it drains, addressed by
//! the interface the recruitment returned.

use std::net::SocketAddr;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use taglog_core::{StorageBytes, Tag, Uid, Version};
use taglog_net::Token;

use crate::error::Error;

/// Protocol-level failure delivered inside a reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RpcError {
    TLogStopped,
    TimedOut,
    EndOfStream,
    WorkerRemoved,
    RecruitmentFailed(String),
    Internal(String),
}

impl From<Error> for RpcError {
    fn from(e: Error) -> Self {
        match e {
            Error::TLogStopped => RpcError::TLogStopped,
            Error::TimedOut => RpcError::TimedOut,
            Error::EndOfStream => RpcError::EndOfStream,
            Error::WorkerRemoved => RpcError::WorkerRemoved,
            Error::RecruitmentFailed(reason) => RpcError::RecruitmentFailed(reason),
            other => RpcError::Internal(other.to_string()),
        }
    }
}

impl From<RpcError> for Error {
    fn from(e: RpcError) -> Self {
        match e {
            RpcError::TLogStopped => Error::TLogStopped,
            RpcError::TimedOut => Error::TimedOut,
            RpcError::EndOfStream => Error::EndOfStream,
            RpcError::WorkerRemoved => Error::WorkerRemoved,
            RpcError::RecruitmentFailed(reason) => Error::RecruitmentFailed(reason),
            RpcError::Internal(reason) => Error::InvalidRequest(reason),
        }
    }
}

pub type RpcResult<T> = std::result::Result<T, RpcError>;

/// Endpoints of one log generation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TLogInterface {
    pub id: Uid,
    pub addr: SocketAddr,
    pub peek_messages: Token,
    pub pop_messages: Token,
    pub commit: Token,
    pub lock: Token,
    pub get_queuing_metrics: Token,
    pub confirm_running: Token,
    pub recovery_finished: Token,
    pub wait_failure: Token,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeekRequest {
    pub reply: Token,
    pub tag: Tag,
    pub begin: Version,
    pub return_if_blocked: bool,
    pub only_spilled: bool,
    /// `(subscriber, sequence)` for ordered parallel peek streams.
    pub sequence: Option<(Uid, u64)>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeekReply {
    pub messages: Bytes,
    pub end: Version,
    pub popped: Option<Version>,
    pub max_known_version: Version,
    pub min_known_committed_version: Version,
    pub begin: Version,
    pub only_spilled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PopRequest {
    pub reply: Token,
    pub tag: Tag,
    pub upto: Version,
    pub durable_known_committed_version: Version,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitRequest {
    pub reply: Token,
    pub prev_version: Version,
    pub version: Version,
    pub known_committed_version: Version,
    pub min_known_committed_version: Version,
    pub messages: Bytes,
    pub has_exec_op: bool,
    pub debug_id: Option<Uid>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitReply {
    pub durable_known_committed_version: Version,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockRequest {
    pub reply: Token,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockReply {
    pub end: Version,
    pub known_committed_version: Version,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuingMetricsRequest {
    pub reply: Token,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuingMetricsReply {
    pub local_time: f64,
    pub instance_id: u64,
    pub bytes_durable: u64,
    pub bytes_input: u64,
    pub storage_bytes: StorageBytes,
    pub v: Version,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfirmRunningRequest {
    pub reply: Token,
    pub debug_id: Option<Uid>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryFinishedRequest {
    pub reply: Token,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WaitFailureRequest {
    pub reply: Token,
}

/// Predecessor log system to recover from: the interfaces the previous
/// generation's data can still be peeked at.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RecoverFrom {
    pub logs: Vec<TLogInterface>,
}

/// Recruit a new generation on this worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecruitRequest {
    pub reply: Token,
    pub recruitment_id: Uid,
    /// Coordinator epoch; strictly increases across recruitments.
    pub epoch: u64,
    pub locality: i8,
    pub log_router_tags: u32,
    /// Versions at or below this were committed by the predecessor.
    pub known_committed_version: Version,
    /// The version this generation starts serving at.
    pub recover_at: Version,
    pub recover_tags: Vec<Tag>,
    /// Non-empty when this recruitment continues an existing log.
    pub recover_from: Option<RecoverFrom>,
}

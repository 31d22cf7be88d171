//! Client-side wrappers over the RPC surface.
//!
//! Thin request/reply helpers used by recovering generations to pull
//! predecessor data, and by tests and tools. Each call registers a
//! one-shot reply endpoint, sends the request at the interface token, and
//! flattens the transport and protocol errors into [`crate::Error`].

use std::time::Duration;

use bytes::Bytes;
use taglog_core::{Tag, Uid, Version};
use taglog_net::{Token, Transport};

use crate::error::{Error, Result};
use crate::rpc::{
    CommitReply, CommitRequest, ConfirmRunningRequest, LockReply, LockRequest, PeekReply,
    PeekRequest, PopRequest, QueuingMetricsReply, QueuingMetricsRequest, RecoveryFinishedRequest,
    RecruitRequest, RpcResult, TLogInterface,
};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Handle to one log generation's endpoints.
#[derive(Clone)]
pub struct TLogClient {
    transport: Transport,
    interface: TLogInterface,
    timeout: Duration,
}

impl TLogClient {
    pub fn new(transport: Transport, interface: TLogInterface) -> Self {
        Self {
            transport,
            interface,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn interface(&self) -> &TLogInterface {
        &self.interface
    }

    async fn call<Req, Resp>(
        &self,
        token: Token,
        make: impl FnOnce(Token) -> Req,
    ) -> Result<Resp>
    where
        Req: serde::Serialize,
        Resp: serde::de::DeserializeOwned,
    {
        let result: RpcResult<Resp> = self
            .transport
            .request(self.interface.addr, token, make, self.timeout)
            .await?;
        result.map_err(Error::from)
    }

    pub async fn commit(
        &self,
        prev_version: Version,
        version: Version,
        known_committed_version: Version,
        messages: Bytes,
        has_exec_op: bool,
    ) -> Result<CommitReply> {
        self.call(self.interface.commit, |reply| CommitRequest {
            reply,
            prev_version,
            version,
            known_committed_version,
            min_known_committed_version: known_committed_version,
            messages,
            has_exec_op,
            debug_id: None,
        })
        .await
    }

    pub async fn peek(&self, tag: Tag, begin: Version) -> Result<PeekReply> {
        self.peek_full(tag, begin, false, false, None).await
    }

    pub async fn peek_full(
        &self,
        tag: Tag,
        begin: Version,
        return_if_blocked: bool,
        only_spilled: bool,
        sequence: Option<(Uid, u64)>,
    ) -> Result<PeekReply> {
        self.call(self.interface.peek_messages, |reply| PeekRequest {
            reply,
            tag,
            begin,
            return_if_blocked,
            only_spilled,
            sequence,
        })
        .await
    }

    pub async fn pop(&self, tag: Tag, upto: Version) -> Result<()> {
        self.call(self.interface.pop_messages, |reply| PopRequest {
            reply,
            tag,
            upto,
            durable_known_committed_version: 0,
        })
        .await
    }

    pub async fn lock(&self) -> Result<LockReply> {
        self.call(self.interface.lock, |reply| LockRequest { reply })
            .await
    }

    pub async fn queuing_metrics(&self) -> Result<QueuingMetricsReply> {
        self.call(self.interface.get_queuing_metrics, |reply| {
            QueuingMetricsRequest { reply }
        })
        .await
    }

    pub async fn confirm_running(&self) -> Result<()> {
        self.call(self.interface.confirm_running, |reply| {
            ConfirmRunningRequest {
                reply,
                debug_id: None,
            }
        })
        .await
    }

    pub async fn recovery_finished(&self) -> Result<()> {
        self.call(self.interface.recovery_finished, |reply| {
            RecoveryFinishedRequest { reply }
        })
        .await
    }
}

/// Ask a worker to recruit a new log generation.
pub async fn recruit(
    transport: &Transport,
    addr: std::net::SocketAddr,
    recruit_token: Token,
    request: impl FnOnce(Token) -> RecruitRequest,
    timeout: Duration,
) -> Result<TLogInterface> {
    let result: RpcResult<TLogInterface> =
        transport.request(addr, recruit_token, request, timeout).await?;
    result.map_err(Error::from)
}

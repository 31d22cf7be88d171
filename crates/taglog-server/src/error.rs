//! Server error types.
//!
//! The variants mirror the failure taxonomy of the log protocol:
//! `TLogStopped`, `TimedOut` and `EndOfStream` surface to callers, who
//! retry against a newer generation or resend; `WorkerRemoved` and
//! `RecruitmentFailed` end this process's role.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("log generation is stopped")]
    TLogStopped,

    #[error("request timed out")]
    TimedOut,

    #[error("end of stream")]
    EndOfStream,

    #[error("worker removed")]
    WorkerRemoved,

    #[error("recruitment failed: {0}")]
    RecruitmentFailed(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("storage error: {0}")]
    Storage(#[from] taglog_storage::Error),

    #[error("transport error: {0}")]
    Net(#[from] taglog_net::Error),

    #[error("codec error: {0}")]
    Core(#[from] taglog_core::Error),
}

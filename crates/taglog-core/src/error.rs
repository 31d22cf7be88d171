//! Core error types.
//!
//! Framing errors surface when decoding commit batches, peek bodies or exec
//! operations. Higher layers wrap these with their own error enums via
//! `#[from]`.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("truncated frame: needed {needed} bytes, have {have}")]
    Truncated { needed: usize, have: usize },

    #[error("message length {length} is smaller than its fixed header")]
    BadMessageLength { length: u32 },

    #[error("expected version header, found marker {0}")]
    BadVersionHeader(i32),

    #[error("bad exec-op magic")]
    BadExecMagic,

    #[error("unknown exec-op kind: {0}")]
    UnknownExecKind(u8),
}

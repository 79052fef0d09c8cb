//! Typed errors returned synchronously to callers
//!
//! Everything that can go wrong *inside* an attempt (compile errors, timeouts,
//! provider outages) is recorded on the attempt instead. These errors cover
//! requests rejected before any work starts and session lookups.

use thiserror::Error;

/// A request rejected before the sandbox is touched
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RequestError {
    #[error("unsupported language '{0}'")]
    UnsupportedLanguage(String),

    #[error("code cannot be empty")]
    EmptyCode,

    #[error("code is {len} characters long, the maximum is {max}")]
    CodeTooLong { len: usize, max: usize },

    #[error("max_attempts must be between 1 and {max}, got {got}")]
    InvalidMaxAttempts { got: u32, max: u32 },

    #[error("unsafe code detected: {0}")]
    Unsafe(String),
}

/// Errors from the session registry and the externally paced API
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("session not found: {0}")]
    NotFound(String),

    #[error("session {0} is already complete")]
    AlreadyComplete(String),

    #[error("session {0} was cancelled")]
    Cancelled(String),

    #[error("maximum number of sessions reached ({0})")]
    CapacityReached(usize),

    #[error("invalid session id: {0}")]
    InvalidId(&'static str),

    #[error(transparent)]
    Request(#[from] RequestError),
}

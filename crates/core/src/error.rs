//! Core error model.

use thiserror::Error;

/// Result type used across the orchestration core.
pub type CoreResult<T> = Result<T, CoreError>;

/// Error taxonomy surfaced by the public control-plane operations.
///
/// Callers see kinds, not storage details. `NotFound` covers both "missing"
/// and "owned by somebody else" so that existence never leaks across owners.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// Malformed input at the public API. Never retried.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Missing, or not owned by the caller.
    #[error("not found")]
    NotFound,

    /// Uniqueness / idempotency / singleton violation.
    #[error("conflict: {0}")]
    Conflict(String),

    /// A `chat_respond` job is already in flight for the thread.
    #[error("thread busy: a reply is already being generated")]
    ThreadBusy,

    /// The requested transition is not allowed from the current state.
    #[error("state violation: {0}")]
    StateViolation(String),

    /// Store contention, adapter timeout, upstream 5xx.
    #[error("transient failure: {0}")]
    Transient(String),

    /// Unrecoverable within the current job definition.
    #[error("fatal: {0}")]
    Fatal(String),

    /// Misconfiguration (unknown handler, invalid option).
    #[error("configuration error: {0}")]
    Config(String),
}

impl CoreError {
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn state(msg: impl Into<String>) -> Self {
        Self::StateViolation(msg.into())
    }

    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    pub fn fatal(msg: impl Into<String>) -> Self {
        Self::Fatal(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn not_found() -> Self {
        Self::NotFound
    }

    /// Whether the failure belongs to the conflict family (`ThreadBusy` included).
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_) | Self::ThreadBusy)
    }

    /// Whether retrying the same operation later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

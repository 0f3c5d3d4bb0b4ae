//! Per-entry processing outcome and error model.

use switchyd_sad::SadError;
use thiserror::Error;

/// What `do_task` decided about a single pending entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskStatus {
    /// Applied (or rejected permanently); drop from pending.
    Consumed,
    /// A dependency is not installed yet; keep in pending.
    Retry,
    /// Malformed input; drop from pending and log.
    Invalid,
}

/// Error raised while processing one entry.
///
/// Reference-count underflow and similar programmer errors are not
/// represented here; those abort the process.
#[derive(Debug, Clone, Error)]
pub enum OrchError {
    /// Malformed key, out-of-range numeric, unknown enum value.
    #[error("parse error: {0}")]
    Parse(String),

    /// A referenced table or object is not installed yet.
    #[error("unresolved reference: {0}")]
    Unresolved(String),

    /// The driver rejected the operation.
    #[error("hardware error: {0}")]
    Hardware(#[from] SadError),
}

impl OrchError {
    pub fn parse(message: impl Into<String>) -> Self {
        OrchError::Parse(message.into())
    }

    pub fn unresolved(message: impl Into<String>) -> Self {
        OrchError::Unresolved(message.into())
    }

    /// Maps this error onto the pending-map outcome: parse failures
    /// are discarded, everything else is retried.
    pub fn status(&self) -> TaskStatus {
        match self {
            OrchError::Parse(_) => TaskStatus::Invalid,
            OrchError::Unresolved(_) => TaskStatus::Retry,
            OrchError::Hardware(_) => TaskStatus::Retry,
        }
    }
}

/// Result type for per-entry processing.
pub type OrchResult<T> = Result<T, OrchError>;

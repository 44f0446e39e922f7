//! Outcome model: what a handler reports and what the host scheduler sees.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Result returned to the host scheduler from a wake.
///
/// Serialized as SCREAMING_SNAKE_CASE (SUCCESS / FAILURE / NEEDS_RETRY) so host
/// shims can map it onto their own completion calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WakeOutcome {
    /// Work completed, or there was nothing to do (coalesced wake).
    Success,

    /// Terminal failure, or the wake was dropped.
    Failure,

    /// The run failed and a retry has been armed.
    NeedsRetry,
}

impl fmt::Display for WakeOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WakeOutcome::Success => "SUCCESS",
            WakeOutcome::Failure => "FAILURE",
            WakeOutcome::NeedsRetry => "NEEDS_RETRY",
        };
        f.write_str(s)
    }
}

/// A failure reported by a handler.
///
/// Handlers that bail out because their cancellation token fired should
/// return `HandlerFailure::cancelled()`; the bridge decides the final state
/// from the cancellation reason either way.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct HandlerFailure {
    pub message: String,
}

impl HandlerFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn cancelled() -> Self {
        Self::new("cancelled")
    }
}

impl From<String> for HandlerFailure {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

impl From<&str> for HandlerFailure {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

//! WakeContext - handler に渡す実行コンテキスト

use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::domain::{RunId, TaskName};

/// One handler invocation.
///
/// `deadline` is the soft deadline: the dispatcher cancels the token there.
/// Long-running handlers should poll `is_cancelled` or select on `cancelled`
/// and return early; a handler that ignores the token is aborted after a
/// short grace period.
#[derive(Debug, Clone)]
pub struct WakeContext {
    pub task: TaskName,
    pub run_id: RunId,

    /// 1-indexed attempt number of this run.
    pub attempt: u32,

    pub deadline: Instant,

    cancel: CancellationToken,
}

impl WakeContext {
    pub fn new(
        task: TaskName,
        run_id: RunId,
        attempt: u32,
        deadline: Instant,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            task,
            run_id,
            attempt,
            deadline,
            cancel,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once the run is cancelled (disarm, soft deadline or shutdown).
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    /// Time left before the soft deadline.
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }
}

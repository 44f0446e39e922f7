//! Status - run の集計

use serde::{Deserialize, Serialize};

use crate::domain::{RunState, TaskRun};

/// Runs per state.
///
/// `retry_scheduled` is the subset of `pending` that already failed at least
/// once; `awaiting_decision` counts interrupted runs whose task has not been
/// registered yet.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunCounts {
    pub pending: usize,
    pub retry_scheduled: usize,
    pub running: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub awaiting_decision: usize,
}

impl RunCounts {
    pub fn from_runs<'a>(runs: impl IntoIterator<Item = &'a TaskRun>) -> Self {
        let mut counts = RunCounts::default();
        for run in runs {
            match run.state {
                RunState::Pending => {
                    counts.pending += 1;
                    if run.is_retry_scheduled() {
                        counts.retry_scheduled += 1;
                    }
                }
                RunState::Running => counts.running += 1,
                RunState::Succeeded => counts.succeeded += 1,
                RunState::Failed => counts.failed += 1,
                RunState::Cancelled => counts.cancelled += 1,
            }
            if run.pending_decision {
                counts.awaiting_decision += 1;
            }
        }
        counts
    }

    pub fn total(&self) -> usize {
        self.pending + self.running + self.succeeded + self.failed + self.cancelled
    }
}

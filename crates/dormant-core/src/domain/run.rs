//! TaskRun: one scheduled occurrence of a task, with its retry history.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::errors::{FailureKind, RunError};
use super::ids::RunId;
use super::names::TaskName;

/// Run state.
///
/// State transitions:
/// - Pending -> Running -> Succeeded
/// - Pending -> Running -> Failed -> Pending (retry armed by the policy)
/// - Pending -> Running -> Cancelled (definition disarmed mid-flight)
/// - Pending -> Failed (handler unbound, attempt not consumed)
/// - Running -> Failed(Interrupted) (process died; reclassified on restart)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RunState {
    /// Waiting for a wake (first try or retry-scheduled).
    Pending,

    /// A handler is executing.
    Running,

    Succeeded,

    Failed,

    /// Disarmed while running.
    Cancelled,
}

impl RunState {
    /// Is this a terminal state (no further transitions without the retry policy)?
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunState::Succeeded | RunState::Failed | RunState::Cancelled
        )
    }
}

/// Durable record of a run.
///
/// Design:
/// - Mutated only by dispatch and the retry policy.
/// - State transitions happen through methods, never by assigning `state`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRun {
    pub id: RunId,
    pub task: TaskName,
    pub state: RunState,

    /// Number of handler executions started for this run.
    pub attempt_count: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_attempt_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<RunError>,

    /// Earliest time this run is due.
    pub scheduled_for: DateTime<Utc>,

    /// Set when the run was reclassified to Interrupted and the retry policy
    /// has not been applied yet (its definition may not be registered yet).
    #[serde(default)]
    pub pending_decision: bool,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TaskRun {
    pub fn new(id: RunId, task: TaskName, scheduled_for: DateTime<Utc>, now: DateTime<Utc>) -> Self {
        Self {
            id,
            task,
            state: RunState::Pending,
            attempt_count: 0,
            last_attempt_at: None,
            last_error: None,
            scheduled_for,
            pending_decision: false,
            created_at: now,
            updated_at: now,
        }
    }

    /// Pending after at least one failed attempt.
    pub fn is_retry_scheduled(&self) -> bool {
        self.state == RunState::Pending && self.attempt_count > 0
    }

    pub fn failure_kind(&self) -> Option<FailureKind> {
        self.last_error.as_ref().map(|e| e.kind)
    }

    /// Mark as running (increment attempts).
    pub fn start_attempt(&mut self, now: DateTime<Utc>) {
        self.state = RunState::Running;
        self.attempt_count += 1;
        self.last_attempt_at = Some(now);
        self.updated_at = now;
    }

    pub fn mark_succeeded(&mut self, now: DateTime<Utc>) {
        self.state = RunState::Succeeded;
        self.updated_at = now;
    }

    pub fn mark_failed(&mut self, error: RunError, now: DateTime<Utc>) {
        self.state = RunState::Failed;
        self.last_error = Some(error);
        self.updated_at = now;
    }

    pub fn mark_cancelled(&mut self, now: DateTime<Utc>) {
        self.state = RunState::Cancelled;
        self.updated_at = now;
    }

    /// Running from a previous process lifetime -> Failed(Interrupted).
    pub fn mark_interrupted(&mut self, now: DateTime<Utc>) {
        self.mark_failed(
            RunError::new(FailureKind::Interrupted, "process ended while running"),
            now,
        );
        self.pending_decision = true;
    }

    /// Failed -> Pending with a new due time. Attempts and last error are kept.
    pub fn schedule_retry(&mut self, at: DateTime<Utc>, now: DateTime<Utc>) {
        self.state = RunState::Pending;
        self.scheduled_for = at;
        self.pending_decision = false;
        self.updated_at = now;
    }

    /// Move a pending run to a new due time (trigger changed before it ran).
    pub fn reschedule(&mut self, at: DateTime<Utc>, now: DateTime<Utc>) {
        self.scheduled_for = at;
        self.updated_at = now;
    }

    /// The retry policy has been applied and chose to stop.
    pub fn settle(&mut self, now: DateTime<Utc>) {
        self.pending_decision = false;
        self.updated_at = now;
    }
}

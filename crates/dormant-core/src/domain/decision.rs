//! Decision model: what happens to a run after an attempt settles.
//!
//! The Decider is a pure function of the run and its definition; applying the
//! decision (saving the run, arming the host scheduler) is dispatch's job.

use std::time::Duration;

use chrono::{DateTime, Utc};

use super::definition::{TaskDefinition, Trigger};
use super::errors::FailureKind;
use super::retry::RetryPolicy;
use super::run::{RunState, TaskRun};
use super::time::{add_duration, elapsed_between};

/// The next action to take for a settled run.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// Arm the task again at `at`.
    ///
    /// For one-off tasks the same run is retried; for periodic tasks a new
    /// run is created for the next occurrence.
    Reschedule { at: DateTime<Utc>, reason: String },

    /// Stop scheduling.
    GiveUp { reason: String },
}

impl Decision {
    pub fn is_give_up(&self) -> bool {
        matches!(self, Decision::GiveUp { .. })
    }
}

/// Trait for deciding the next action based on the run and its definition.
pub trait Decider: Send + Sync {
    fn next(&self, run: &TaskRun, definition: &TaskDefinition) -> Decision;
}

/// Default decider: exponential backoff for one-off tasks, natural interval
/// for periodic tasks.
///
/// - Cancelled runs and `HandlerUnbound` failures are never rescheduled.
/// - One-off: retry while `attempt_count < max_retries`.
/// - Periodic: always the next occurrence after the last attempt, whatever the
///   outcome of this one.
#[derive(Debug, Clone, Default)]
pub struct DefaultDecider {
    retry_policy: RetryPolicy,
}

impl DefaultDecider {
    pub fn new(retry_policy: RetryPolicy) -> Self {
        Self { retry_policy }
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry_policy
    }
}

impl Decider for DefaultDecider {
    fn next(&self, run: &TaskRun, definition: &TaskDefinition) -> Decision {
        match run.state {
            RunState::Pending | RunState::Running => {
                return Decision::GiveUp {
                    reason: format!("run is {:?}, nothing to decide", run.state),
                };
            }
            RunState::Cancelled => {
                return Decision::GiveUp {
                    reason: "run was cancelled".to_string(),
                };
            }
            RunState::Failed if run.failure_kind() == Some(FailureKind::HandlerUnbound) => {
                return Decision::GiveUp {
                    reason: "handler unbound (configuration error)".to_string(),
                };
            }
            RunState::Succeeded | RunState::Failed => {}
        }

        let anchor = run.last_attempt_at.unwrap_or(run.scheduled_for);

        match &definition.trigger {
            Trigger::Periodic { interval, .. } => {
                let at = next_occurrence(run.scheduled_for, *interval, anchor);
                Decision::Reschedule {
                    at,
                    reason: format!("periodic: next occurrence every {interval:?}"),
                }
            }
            Trigger::OneOff { .. } if run.state == RunState::Succeeded => Decision::GiveUp {
                reason: "completed".to_string(),
            },
            Trigger::OneOff { .. } => {
                if run.attempt_count >= definition.max_retries {
                    Decision::GiveUp {
                        reason: format!(
                            "max attempts reached: {}/{}",
                            run.attempt_count, definition.max_retries
                        ),
                    }
                } else {
                    let delay = self.retry_policy.next_delay(run.attempt_count);
                    Decision::Reschedule {
                        at: add_duration(anchor, delay),
                        reason: format!(
                            "retry attempt {}/{} after {:?}",
                            run.attempt_count + 1,
                            definition.max_retries,
                            delay
                        ),
                    }
                }
            }
        }
    }
}

/// First `origin + k * interval` (k >= 1) strictly after `after`.
pub fn next_occurrence(
    origin: DateTime<Utc>,
    interval: Duration,
    after: DateTime<Utc>,
) -> DateTime<Utc> {
    let step = interval.as_nanos().max(1);
    let elapsed = elapsed_between(origin, after).as_nanos();
    let k = elapsed / step + 1;
    let total = u64::try_from(step.saturating_mul(k)).unwrap_or(u64::MAX);
    add_duration(origin, Duration::from_nanos(total))
}

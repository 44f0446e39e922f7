//! SchedulerAdapter - TaskDefinition と HostScheduler の間の変換
//!
//! # 責務
//! - arm: pending run を用意して SchedulerRequest を submit
//! - disarm: host の request を取り消し、実行中の handler に cancel を伝える
//! - on_wake: host からの唯一の入口。Dispatcher に渡して、結果に応じて再 arm
//!
//! # deferred request
//! wake 後の再 arm を host が拒否した場合（quota など一時的な理由）、
//! task → run の対応だけ覚えておき、次の wake の冒頭で再送する。
//! 登録時の arm 失敗は呼び出し側に返し、自動では再送しない。
//! re-anchor した予定時刻は host が受け付けてから保存する。

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::dispatch::Dispatcher;
use super::error::BridgeError;
use super::registry::TaskRegistry;
use crate::domain::{RunId, RunState, TaskDefinition, TaskName, TaskRun, Trigger, WakeOutcome};
use crate::ports::{
    Clock, HostCapabilities, HostScheduler, RequestKind, SchedulerRejection, SchedulerRequest,
    StoreError,
};

/// Build the host request for `run` of `definition`.
pub fn encode_request(
    definition: &TaskDefinition,
    run: &TaskRun,
    now: DateTime<Utc>,
) -> SchedulerRequest {
    let kind = match definition.trigger {
        Trigger::Periodic { interval, .. } => RequestKind::Periodic { interval },
        Trigger::OneOff { .. } => RequestKind::OneOff,
    };
    SchedulerRequest {
        task: definition.name.clone(),
        run_id: run.id,
        kind,
        earliest_start: run.scheduled_for.max(now),
        requires_network: definition.constraints.requires_network,
        requires_external_power: definition.constraints.requires_external_power,
    }
}

/// The host must be at least at the definition's minimum OS version.
pub fn check_platform(
    definition: &TaskDefinition,
    capabilities: &HostCapabilities,
) -> Result<(), SchedulerRejection> {
    match definition.constraints.min_os_version {
        Some(required) if required > capabilities.os_version => {
            Err(SchedulerRejection::UnsupportedPlatform {
                required,
                actual: capabilities.os_version,
            })
        }
        _ => Ok(()),
    }
}

pub struct SchedulerAdapter {
    host: Arc<dyn HostScheduler>,
    dispatcher: Arc<Dispatcher>,
    registry: Arc<TaskRegistry>,
    clock: Arc<dyn Clock>,
    deferred: DashMap<TaskName, RunId>,
}

impl SchedulerAdapter {
    pub fn new(
        host: Arc<dyn HostScheduler>,
        dispatcher: Arc<Dispatcher>,
        registry: Arc<TaskRegistry>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            host,
            dispatcher,
            registry,
            clock,
            deferred: DashMap::new(),
        }
    }

    pub fn is_armed(&self, task: &TaskName) -> bool {
        self.dispatcher.is_armed(task)
    }

    /// Tasks whose re-arm is waiting to be resubmitted, sorted.
    pub fn deferred_tasks(&self) -> Vec<TaskName> {
        let mut tasks: Vec<TaskName> = self.deferred.iter().map(|e| e.key().clone()).collect();
        tasks.sort();
        tasks
    }

    /// Arm the host for `definition`.
    ///
    /// Rejections are returned as `SchedulerRejected` and not retried.
    pub async fn arm(&self, definition: &TaskDefinition, reanchor: bool) -> Result<(), BridgeError> {
        let rejected = |source: SchedulerRejection| BridgeError::SchedulerRejected {
            task: definition.name.clone(),
            source,
        };

        check_platform(definition, &self.host.capabilities()).map_err(rejected)?;

        if let Some(plan) = self.dispatcher.prepare_arm(definition, reanchor).await? {
            let request = encode_request(definition, &plan.run, self.clock.now());
            let earliest_start = request.earliest_start;
            self.host.submit(request).await.map_err(rejected)?;
            if plan.reanchored {
                self.dispatcher.commit_reanchor(&plan.run).await?;
            }
            info!(
                task = %definition.name,
                run_id = %plan.run.id,
                at = %earliest_start,
                "armed"
            );
        }

        self.deferred.remove(&definition.name);
        self.dispatcher.mark_armed(&definition.name);
        Ok(())
    }

    /// Cancel the host request and signal a running handler.
    ///
    /// Stored runs are left as they are; a Pending run stays Pending.
    pub async fn disarm(&self, task: &TaskName) -> Result<(), SchedulerRejection> {
        self.deferred.remove(task);
        if self.dispatcher.disarm(task) {
            info!(task = %task, "signalled cancellation to running handler");
        }
        self.host.cancel(task).await?;
        info!(task = %task, "disarmed");
        Ok(())
    }

    /// Host callback entry point.
    ///
    /// The budget is counted from the moment the wake arrives.
    pub async fn on_wake(&self, task: &TaskName, budget: Duration) -> WakeOutcome {
        let woke_at = Instant::now();
        self.retry_deferred().await;

        if !self.is_armed(task) {
            warn!(task = %task, "wake for a task that is not armed; dropping");
            return WakeOutcome::Failure;
        }

        let report = match self.dispatcher.dispatch(task, budget, woke_at).await {
            Ok(report) => report,
            Err(e) => {
                error!(task = %task, error = %e, "state store failure during wake");
                return WakeOutcome::Failure;
            }
        };

        if let Some(run) = &report.rearm
            && self.is_armed(task)
            && let Some(definition) = self.registry.get(task).await
        {
            self.submit_or_defer(&definition, run).await;
        }
        report.outcome
    }

    async fn submit_or_defer(&self, definition: &TaskDefinition, run: &TaskRun) {
        let result = match check_platform(definition, &self.host.capabilities()) {
            Ok(()) => {
                self.host
                    .submit(encode_request(definition, run, self.clock.now()))
                    .await
            }
            Err(rejection) => Err(rejection),
        };

        match result {
            Ok(()) => {
                self.deferred.remove(&definition.name);
                debug!(task = %definition.name, run_id = %run.id, "re-armed");
            }
            Err(rejection) if rejection.is_transient() => {
                warn!(
                    task = %definition.name,
                    run_id = %run.id,
                    error = %rejection,
                    "host rejected re-arm; deferring"
                );
                self.deferred.insert(definition.name.clone(), run.id);
            }
            Err(rejection) => {
                error!(
                    task = %definition.name,
                    run_id = %run.id,
                    error = %rejection,
                    "host rejected re-arm permanently"
                );
            }
        }
    }

    /// Resubmit deferred re-arms. Entries whose run is no longer pending are dropped.
    pub async fn retry_deferred(&self) {
        let entries: Vec<(TaskName, RunId)> = self
            .deferred
            .iter()
            .map(|e| (e.key().clone(), *e.value()))
            .collect();

        for (task, run_id) in entries {
            let Some(definition) = self.registry.get(&task).await else {
                self.deferred.remove(&task);
                continue;
            };
            let run = match self.dispatcher.store().load(run_id).await {
                Ok(run) if run.state == RunState::Pending => run,
                Ok(_) | Err(StoreError::NotFound(_)) => {
                    self.deferred.remove(&task);
                    continue;
                }
                Err(e) => {
                    warn!(task = %task, error = %e, "could not load deferred run");
                    continue;
                }
            };

            let request = encode_request(&definition, &run, self.clock.now());
            match self.host.submit(request).await {
                Ok(()) => {
                    self.deferred.remove(&task);
                    info!(task = %task, run_id = %run_id, "deferred re-arm submitted");
                }
                Err(rejection) => {
                    debug!(task = %task, error = %rejection, "deferred re-arm still rejected");
                }
            }
        }
    }
}

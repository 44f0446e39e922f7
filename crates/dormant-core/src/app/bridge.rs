//! Bridge - アプリケーションと OS スケジューラの間の窓口
//!
//! BridgeBuilder で組み立てる。すべてのメソッドは `&self` なので
//! `Arc<Bridge>` にして wake ごとに共有してよい。

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use super::adapter::SchedulerAdapter;
use super::dispatch::Dispatcher;
use super::error::BridgeError;
use super::reaper;
use super::registry::{Registration, TaskRegistry};
use super::status::RunCounts;
use crate::config::BridgeConfig;
use crate::domain::{TaskDefinition, TaskName, TaskRun, WakeOutcome};
use crate::ports::{Clock, StateStore};

pub struct Bridge {
    pub(super) registry: Arc<TaskRegistry>,
    pub(super) dispatcher: Arc<Dispatcher>,
    pub(super) adapter: SchedulerAdapter,
    pub(super) store: Arc<dyn StateStore>,
    pub(super) clock: Arc<dyn Clock>,
    pub(super) config: BridgeConfig,
}

impl Bridge {
    /// Register (or replace) a task and arm the host scheduler for it.
    ///
    /// Identical re-registration of an armed task does nothing. When the host
    /// rejects the arm, the registry is rolled back and the rejection returned.
    pub async fn register_task(
        &self,
        definition: TaskDefinition,
    ) -> Result<Registration, BridgeError> {
        let name = definition.name.clone();
        let registration = self
            .registry
            .register(definition.clone(), self.clock.now())
            .await?;

        if !registration.needs_arm() && self.adapter.is_armed(&name) {
            debug!(task = %name, "identical re-registration; nothing to do");
            return Ok(registration);
        }

        let reanchor = matches!(registration, Registration::Replaced(_));
        if let Err(e) = self.adapter.arm(&definition, reanchor).await {
            if registration.needs_arm() {
                self.registry
                    .restore(&name, registration.previous().cloned())
                    .await;
            }
            warn!(task = %name, error = %e, "registration rolled back");
            return Err(e);
        }

        info!(
            task = %name,
            replaced = reanchor,
            periodic = definition.is_periodic(),
            "task registered"
        );
        Ok(registration)
    }

    /// Disarm a task but keep its definition. Registering it again re-arms it.
    pub async fn disarm(&self, name: &TaskName) -> Result<(), BridgeError> {
        self.registry.lookup(name).await?;
        self.adapter
            .disarm(name)
            .await
            .map_err(|source| BridgeError::SchedulerRejected {
                task: name.clone(),
                source,
            })
    }

    /// Disarm a task and forget its definition. Stored runs are kept.
    pub async fn unregister(&self, name: &TaskName) -> Result<TaskDefinition, BridgeError> {
        let definition = self
            .registry
            .remove(name)
            .await
            .ok_or_else(|| BridgeError::NotFound(name.clone()))?;
        self.adapter
            .disarm(name)
            .await
            .map_err(|source| BridgeError::SchedulerRejected {
                task: name.clone(),
                source,
            })?;
        info!(task = %name, "task unregistered");
        Ok(definition)
    }

    pub async fn lookup(&self, name: &TaskName) -> Result<TaskDefinition, BridgeError> {
        self.registry.lookup(name).await
    }

    pub async fn registered_tasks(&self) -> Vec<TaskName> {
        self.registry.names().await
    }

    pub fn is_armed(&self, name: &TaskName) -> bool {
        self.adapter.is_armed(name)
    }

    pub fn deferred_tasks(&self) -> Vec<TaskName> {
        self.adapter.deferred_tasks()
    }

    /// The host calls this when it wakes the process for `name`.
    ///
    /// `budget` is the execution time the host grants for this wake.
    pub async fn on_wake(&self, name: &TaskName, budget: Duration) -> WakeOutcome {
        self.adapter.on_wake(name, budget).await
    }

    /// Most recently created run of a task.
    pub async fn latest_run(&self, name: &TaskName) -> Result<Option<TaskRun>, BridgeError> {
        Ok(self.store.list_by_task(name).await?.pop())
    }

    /// Every stored run of a task, oldest first.
    pub async fn runs(&self, name: &TaskName) -> Result<Vec<TaskRun>, BridgeError> {
        Ok(self.store.list_by_task(name).await?)
    }

    pub async fn pending_runs(&self) -> Result<Vec<TaskRun>, BridgeError> {
        Ok(self.store.list_pending().await?)
    }

    pub async fn counts(&self) -> Result<RunCounts, BridgeError> {
        let runs = self.store.list_all().await?;
        Ok(RunCounts::from_runs(&runs))
    }

    /// Purge settled runs older than the retention window.
    pub async fn collect_garbage(&self) -> Result<usize, BridgeError> {
        Ok(reaper::purge_expired(&*self.store, self.clock.now(), self.config.retention()).await?)
    }

    /// Cancel in-flight handlers (`Interrupted`) and drop the handler table.
    ///
    /// Wakes after this are dropped. Returns `false` when handlers were still
    /// running when the shutdown grace ran out.
    pub async fn shutdown(&self) -> bool {
        let clean = self.dispatcher.shutdown(self.config.shutdown_grace()).await;
        if clean {
            info!("bridge shut down");
        } else {
            warn!(
                in_flight = self.dispatcher.in_flight_count(),
                "bridge shut down with handlers still running"
            );
        }
        clean
    }

    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }
}

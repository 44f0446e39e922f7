//! HostScheduler port - OS のバックグラウンドスケジューラ
//!
//! BGTaskScheduler / WorkManager などの実体はこの trait の裏側に置く。
//! ブリッジは SchedulerRequest を渡すだけで、OS の API を直接呼ばない。

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{OsVersion, RunId, TaskName};

/// What the host can do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostCapabilities {
    /// Shortest periodic interval the host accepts.
    pub min_periodic_interval: Duration,

    pub os_version: OsVersion,
}

/// Request flavour. Hosts usually map these onto different OS primitives
/// (app-refresh vs processing tasks, periodic vs one-time work).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestKind {
    Periodic { interval: Duration },
    OneOff,
}

/// Ephemeral encoding of one run's trigger and constraints.
///
/// Regenerated on every arm; never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerRequest {
    pub task: TaskName,
    pub run_id: RunId,
    pub kind: RequestKind,
    pub earliest_start: DateTime<Utc>,
    pub requires_network: bool,
    pub requires_external_power: bool,
}

/// SchedulerRejection は OS が arm を拒否した理由
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SchedulerRejection {
    #[error("host scheduler quota exhausted")]
    QuotaExhausted,

    #[error("requires OS {required}, host runs {actual}")]
    UnsupportedPlatform {
        required: OsVersion,
        actual: OsVersion,
    },

    #[error("host scheduler unavailable: {0}")]
    Unavailable(String),
}

impl SchedulerRejection {
    /// Worth resubmitting at the next opportunity.
    pub fn is_transient(&self) -> bool {
        !matches!(self, SchedulerRejection::UnsupportedPlatform { .. })
    }
}

/// HostScheduler は OS スケジューラへの要求を受け付ける
///
/// # 設計原則
/// - 1 task につき有効な request は高々 1 つ（submit は同名の request を置き換える）
/// - cancel は存在しない task に対しても成功する
#[async_trait]
pub trait HostScheduler: Send + Sync {
    fn capabilities(&self) -> HostCapabilities;

    async fn submit(&self, request: SchedulerRequest) -> Result<(), SchedulerRejection>;

    async fn cancel(&self, task: &TaskName) -> Result<(), SchedulerRejection>;
}

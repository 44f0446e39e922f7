//! StateStore port - TaskRun の正本（source of truth）
//!
//! wake はプロセス再起動をまたいで届くので、メモリ上の状態は信用しない。
//! dispatch は毎回ここから TaskRun を読み直す。
//!
//! # 実装
//! - **InMemoryStateStore**: テスト・揮発ホスト用
//! - **JsonFileStateStore**: バージョン付き JSON ファイル（アトミック置換）

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::{RunId, RunState, TaskName, TaskRun};

/// StoreError は永続化層のエラー
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("run not found: {0}")]
    NotFound(RunId),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("unsupported store version {found} (newest known {supported})")]
    UnsupportedVersion { found: u32, supported: u32 },
}

/// StateStore は TaskRun を run id で保存する
///
/// # 設計原則
/// - 1 run の read-modify-write は呼び出し側（task ごとのロック）が直列化する
/// - 実装は各操作を単体でアトミックにする
/// - list 系は有限のスナップショットを返す（途中で失敗しても再実行できる）
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Insert or replace a run.
    async fn save(&self, run: &TaskRun) -> Result<(), StoreError>;

    /// Load a run; `StoreError::NotFound` when absent.
    async fn load(&self, id: RunId) -> Result<TaskRun, StoreError>;

    async fn remove(&self, id: RunId) -> Result<(), StoreError>;

    /// Every stored run, oldest first.
    async fn list_all(&self) -> Result<Vec<TaskRun>, StoreError>;

    /// Pending runs ordered by due time.
    async fn list_pending(&self) -> Result<Vec<TaskRun>, StoreError> {
        let mut runs: Vec<TaskRun> = self
            .list_all()
            .await?
            .into_iter()
            .filter(|r| r.state == RunState::Pending)
            .collect();
        runs.sort_by_key(|r| (r.scheduled_for, r.id));
        Ok(runs)
    }

    async fn list_running(&self) -> Result<Vec<TaskRun>, StoreError> {
        Ok(self
            .list_all()
            .await?
            .into_iter()
            .filter(|r| r.state == RunState::Running)
            .collect())
    }

    /// Runs of one task, oldest first.
    async fn list_by_task(&self, task: &TaskName) -> Result<Vec<TaskRun>, StoreError> {
        Ok(self
            .list_all()
            .await?
            .into_iter()
            .filter(|r| &r.task == task)
            .collect())
    }

    /// Drop terminal runs last updated before `cutoff`. Returns how many were removed.
    async fn purge_terminal_before(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
        let mut removed = 0;
        for run in self.list_all().await? {
            if run.state.is_terminal() && !run.pending_decision && run.updated_at < cutoff {
                self.remove(run.id).await?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}

//! InMemoryStateStore - テスト・揮発ホスト用のストア
//!
//! プロセス終了で消えるので「再起動後の回復」は同じインスタンスを使い回して再現する。

use std::collections::BTreeMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::domain::{RunId, TaskRun};
use crate::ports::{StateStore, StoreError};

/// BTreeMap<RunId, TaskRun> を RwLock で包んだだけのストア
///
/// RunId は ULID なので、BTreeMap の順序がそのまま作成順になる。
#[derive(Default)]
pub struct InMemoryStateStore {
    runs: RwLock<BTreeMap<RunId, TaskRun>>,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    async fn save(&self, run: &TaskRun) -> Result<(), StoreError> {
        self.runs.write().await.insert(run.id, run.clone());
        Ok(())
    }

    async fn load(&self, id: RunId) -> Result<TaskRun, StoreError> {
        self.runs
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound(id))
    }

    async fn remove(&self, id: RunId) -> Result<(), StoreError> {
        self.runs.write().await.remove(&id);
        Ok(())
    }

    async fn list_all(&self) -> Result<Vec<TaskRun>, StoreError> {
        Ok(self.runs.read().await.values().cloned().collect())
    }
}

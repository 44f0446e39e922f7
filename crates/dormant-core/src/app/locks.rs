//! Per-task async locks.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::domain::TaskName;

/// task 名ごとの Mutex
///
/// store の read-modify-write だけを囲む。handler 実行中は保持しない。
#[derive(Default)]
pub struct KeyedLocks {
    locks: DashMap<TaskName, Arc<Mutex<()>>>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, task: &TaskName) -> OwnedMutexGuard<()> {
        let mutex = self
            .locks
            .entry(task.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        mutex.lock_owned().await
    }
}

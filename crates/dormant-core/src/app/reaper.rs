//! Startup recovery and retention.
//!
//! # 起動時
//! 1. Running のまま残った run → `Failed(Interrupted)` + pending_decision
//!    （前のプロセスが handler 実行中に終了した）
//! 2. 保持期間を過ぎた終端 run を削除
//!
//! リトライポリシーの適用は task 登録時（arm）まで待つ。定義がまだ無いので。

use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::domain::time::sub_duration;
use crate::ports::{StateStore, StoreError};

/// Reclassify runs left `Running` by a previous process lifetime.
///
/// Must run before any wake is processed.
pub async fn reclassify_interrupted(
    store: &dyn StateStore,
    now: DateTime<Utc>,
) -> Result<usize, StoreError> {
    let running = store.list_running().await?;
    for mut run in running.iter().cloned() {
        run.mark_interrupted(now);
        warn!(
            task = %run.task,
            run_id = %run.id,
            attempt = run.attempt_count,
            "run was interrupted by a restart"
        );
        store.save(&run).await?;
    }
    Ok(running.len())
}

/// Drop settled terminal runs last updated more than `retention` ago.
pub async fn purge_expired(
    store: &dyn StateStore,
    now: DateTime<Utc>,
    retention: Duration,
) -> Result<usize, StoreError> {
    let cutoff = sub_duration(now, retention);
    let removed = store.purge_terminal_before(cutoff).await?;
    if removed > 0 {
        info!(removed, %cutoff, "purged expired runs");
    }
    Ok(removed)
}

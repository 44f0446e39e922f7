//! JsonFileStateStore - バージョン付き JSON ファイルに TaskRun を保存する
//!
//! # レイアウト
//! ```json
//! { "version": 2, "runs": [ { "id": "01H...", "task": "feed.refresh", ... } ] }
//! ```
//!
//! # 旧フォーマット (version 1)
//! task 名 → `{ state, attemptCount, lastAttemptAt, lastErrorKind }` のマップ。
//! 読み込み時に run へ変換し、未完了だったものは `Failed(Interrupted)` +
//! `pending_decision` にして、task 登録時にリトライポリシーへ回す。
//!
//! # 書き込み
//! 毎回ドキュメント全体を一時ファイルに書いてから rename する。
//! 途中でプロセスが落ちても、直前の完全なドキュメントが残る。

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::domain::{FailureKind, RunError, RunId, TaskName, TaskRun};
use crate::ports::{Clock, IdGenerator, StateStore, StoreError, UlidGenerator};

/// Layout version written by this store.
pub const STORE_VERSION: u32 = 2;

#[derive(Serialize)]
struct StoreDocumentRef<'a> {
    version: u32,
    runs: Vec<&'a TaskRun>,
}

#[derive(Deserialize)]
struct VersionHeader {
    #[serde(default)]
    version: u32,
}

#[derive(Deserialize)]
struct StoreDocument {
    runs: Vec<TaskRun>,
}

#[derive(Deserialize)]
struct LegacyDocument {
    #[serde(default)]
    tasks: HashMap<String, LegacyEntry>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct LegacyEntry {
    #[serde(default)]
    state: Option<String>,
    #[serde(default)]
    attempt_count: u32,
    #[serde(default)]
    last_attempt_at: Option<DateTime<Utc>>,
    #[serde(default)]
    last_error_kind: Option<FailureKind>,
}

/// JSON ファイルに全 run を保持するストア
///
/// 内容はメモリにも持ち、読み取りはファイルを触らない。
/// 書き込みは Mutex で直列化する（rename の順序を保つため）。
pub struct JsonFileStateStore {
    path: PathBuf,
    runs: Mutex<BTreeMap<RunId, TaskRun>>,
}

impl JsonFileStateStore {
    /// Open (or create) the store at `path`.
    ///
    /// `clock` stamps migrated entries and seeds their new run ids.
    pub async fn open(path: impl Into<PathBuf>, clock: Arc<dyn Clock>) -> Result<Self, StoreError> {
        let path = path.into();

        let (runs, migrated) = match fs::read_to_string(&path).await {
            Ok(content) => Self::parse(&content, clock, &path)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                if let Some(parent) = path.parent()
                    && !parent.as_os_str().is_empty()
                {
                    fs::create_dir_all(parent).await?;
                }
                debug!(path = %path.display(), "state file does not exist yet");
                (BTreeMap::new(), false)
            }
            Err(e) => return Err(e.into()),
        };

        let store = Self {
            path,
            runs: Mutex::new(runs),
        };
        if migrated {
            let runs = store.runs.lock().await;
            store.persist(&runs).await?;
        }
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the runs and whether the document had to be migrated.
    fn parse(
        content: &str,
        clock: Arc<dyn Clock>,
        path: &Path,
    ) -> Result<(BTreeMap<RunId, TaskRun>, bool), StoreError> {
        let header: VersionHeader = serde_json::from_str(content)?;
        match header.version {
            STORE_VERSION => {
                let doc: StoreDocument = serde_json::from_str(content)?;
                Ok((doc.runs.into_iter().map(|r| (r.id, r)).collect(), false))
            }
            v if v > STORE_VERSION => Err(StoreError::UnsupportedVersion {
                found: v,
                supported: STORE_VERSION,
            }),
            v => {
                let doc: LegacyDocument = serde_json::from_str(content)?;
                let runs = migrate_legacy(doc, clock);
                info!(
                    path = %path.display(),
                    from_version = v,
                    to_version = STORE_VERSION,
                    runs = runs.len(),
                    "migrated state file"
                );
                Ok((runs, true))
            }
        }
    }

    async fn persist(&self, runs: &BTreeMap<RunId, TaskRun>) -> Result<(), StoreError> {
        let doc = StoreDocumentRef {
            version: STORE_VERSION,
            runs: runs.values().collect(),
        };
        let content = serde_json::to_string_pretty(&doc)?;

        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        fs::write(&tmp, content).await?;
        if let Err(e) = fs::rename(&tmp, &self.path).await {
            warn!(path = %self.path.display(), error = %e, "failed to replace state file");
            let _ = fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        Ok(())
    }
}

fn migrate_legacy(doc: LegacyDocument, clock: Arc<dyn Clock>) -> BTreeMap<RunId, TaskRun> {
    let now = clock.now();
    let ids = UlidGenerator::new(clock);
    let mut runs = BTreeMap::new();

    for (task, entry) in doc.tasks {
        let task = match TaskName::new(task.clone()) {
            Ok(t) => t,
            Err(e) => {
                warn!(task = %task, error = %e, "dropping legacy entry with invalid task name");
                continue;
            }
        };

        let mut run = TaskRun::new(ids.generate_run_id(), task, now, now);
        run.attempt_count = entry.attempt_count;
        run.last_attempt_at = entry.last_attempt_at;

        match entry.state.as_deref() {
            Some("Succeeded") => run.mark_succeeded(now),
            Some("Cancelled") => run.mark_cancelled(now),
            Some("Failed") => {
                let kind = entry.last_error_kind.unwrap_or(FailureKind::HandlerError);
                run.mark_failed(RunError::new(kind, "recorded before upgrade"), now);
            }
            // Pending / Running / 不明: 中断扱いにしてポリシーに任せる
            _ => run.mark_interrupted(now),
        }
        runs.insert(run.id, run);
    }
    runs
}

#[async_trait]
impl StateStore for JsonFileStateStore {
    async fn save(&self, run: &TaskRun) -> Result<(), StoreError> {
        let mut runs = self.runs.lock().await;
        let previous = runs.insert(run.id, run.clone());
        if let Err(e) = self.persist(&runs).await {
            // メモリとファイルを揃えておく
            match previous {
                Some(prev) => runs.insert(run.id, prev),
                None => runs.remove(&run.id),
            };
            return Err(e);
        }
        Ok(())
    }

    async fn load(&self, id: RunId) -> Result<TaskRun, StoreError> {
        self.runs
            .lock()
            .await
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound(id))
    }

    async fn remove(&self, id: RunId) -> Result<(), StoreError> {
        let mut runs = self.runs.lock().await;
        if let Some(prev) = runs.remove(&id)
            && let Err(e) = self.persist(&runs).await
        {
            runs.insert(id, prev);
            return Err(e);
        }
        Ok(())
    }

    async fn list_all(&self) -> Result<Vec<TaskRun>, StoreError> {
        Ok(self.runs.lock().await.values().cloned().collect())
    }

    /// One rewrite for the whole purge instead of one per run.
    async fn purge_terminal_before(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
        let mut runs = self.runs.lock().await;
        let expired: Vec<RunId> = runs
            .values()
            .filter(|r| r.state.is_terminal() && !r.pending_decision && r.updated_at < cutoff)
            .map(|r| r.id)
            .collect();
        if expired.is_empty() {
            return Ok(0);
        }

        let mut removed = Vec::with_capacity(expired.len());
        for id in &expired {
            if let Some(run) = runs.remove(id) {
                removed.push(run);
            }
        }
        if let Err(e) = self.persist(&runs).await {
            for run in removed {
                runs.insert(run.id, run);
            }
            return Err(e);
        }
        Ok(expired.len())
    }
}

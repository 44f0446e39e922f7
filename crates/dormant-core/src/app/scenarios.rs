//! End-to-end scenarios: Bridge + InMemoryHostScheduler + FixedClock.
//!
//! Wakes are driven the way a host would: advance the clock, take the due
//! requests from the host, call `on_wake` for each.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;
use tokio::sync::Notify;

use crate::app::{Bridge, BridgeBuilder, BridgeError, Registration};
use crate::config::BridgeConfig;
use crate::domain::{
    FailureKind, HandlerFailure, HandlerKey, OsVersion, RunId, RunState, TaskDefinition, TaskName,
    TaskRun, Trigger, WakeOutcome,
};
use crate::impls::{InMemoryHostScheduler, InMemoryStateStore};
use crate::ports::{
    FixedClock, IdGenerator, RequestKind, SchedulerRejection, StateStore, StoreError,
    UlidGenerator,
};
use crate::typed::{DynHandler, FnHandler, WakeContext};

const BUDGET: Duration = Duration::from_secs(30);
const FIFTEEN_MIN: Duration = Duration::from_secs(15 * 60);

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap()
}

fn name(s: &str) -> TaskName {
    TaskName::new(s).unwrap()
}

struct Harness {
    bridge: Arc<Bridge>,
    host: Arc<InMemoryHostScheduler>,
    clock: Arc<FixedClock>,
}

impl Harness {
    async fn new(handlers: Vec<Arc<dyn DynHandler>>) -> Self {
        Self::with_store(handlers, Arc::new(InMemoryStateStore::new())).await
    }

    async fn with_store(handlers: Vec<Arc<dyn DynHandler>>, store: Arc<dyn StateStore>) -> Self {
        let host = Arc::new(InMemoryHostScheduler::default());
        let clock = Arc::new(FixedClock::new(t0()));
        let mut builder = BridgeBuilder::new(host.clone())
            .clock(clock.clone())
            .store(store);
        for handler in handlers {
            builder = builder.register_dyn(handler).unwrap();
        }
        let bridge = Arc::new(builder.build().await.unwrap());
        Self {
            bridge,
            host,
            clock,
        }
    }

    /// Advance the virtual clock and deliver every due wake.
    async fn advance(&self, by: Duration) -> Vec<(TaskName, WakeOutcome)> {
        let now = self.clock.advance(by);
        let mut outcomes = Vec::new();
        for task in self.host.take_due(now) {
            let outcome = self.bridge.on_wake(&task, BUDGET).await;
            outcomes.push((task, outcome));
        }
        outcomes
    }

    async fn latest(&self, task: &str) -> TaskRun {
        self.bridge.latest_run(&name(task)).await.unwrap().unwrap()
    }
}

fn counting(key: &str, calls: Arc<AtomicU32>, fail_first: u32) -> Arc<dyn DynHandler> {
    Arc::new(FnHandler::new(key, move |_input: Value, _ctx: WakeContext| {
        let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
        async move {
            if n <= fail_first {
                Err(HandlerFailure::new(format!("failure #{n}")))
            } else {
                Ok(())
            }
        }
    }))
}

fn one_off(task: &str, handler: &str, max_retries: u32) -> TaskDefinition {
    TaskDefinition::builder(
        name(task),
        HandlerKey::new(handler).unwrap(),
        Trigger::one_off_at(t0()),
    )
    .max_retries(max_retries)
    .build()
}

fn periodic(task: &str, handler: &str, interval: Duration) -> TaskDefinition {
    TaskDefinition::builder(
        name(task),
        HandlerKey::new(handler).unwrap(),
        Trigger::periodic(interval),
    )
    .build()
}

/// InMemoryStateStore whose next `list_by_task` can be held open or slowed.
///
/// A wake reads the task's runs under the task lock right before it starts
/// the handler, so this parks a wake inside that window.
#[derive(Default)]
struct GatedStore {
    inner: InMemoryStateStore,
    hold_next: AtomicBool,
    held: AtomicU32,
    release: Notify,
    stall_next_ms: AtomicU64,
}

impl GatedStore {
    fn hold_next_listing(&self) {
        self.hold_next.store(true, Ordering::SeqCst);
    }

    fn stall_next_listing(&self, by: Duration) {
        self.stall_next_ms
            .store(by.as_millis() as u64, Ordering::SeqCst);
    }
}

#[async_trait]
impl StateStore for GatedStore {
    async fn save(&self, run: &TaskRun) -> Result<(), StoreError> {
        self.inner.save(run).await
    }

    async fn load(&self, id: RunId) -> Result<TaskRun, StoreError> {
        self.inner.load(id).await
    }

    async fn remove(&self, id: RunId) -> Result<(), StoreError> {
        self.inner.remove(id).await
    }

    async fn list_all(&self) -> Result<Vec<TaskRun>, StoreError> {
        self.inner.list_all().await
    }

    async fn list_by_task(&self, task: &TaskName) -> Result<Vec<TaskRun>, StoreError> {
        let runs = self.inner.list_by_task(task).await?;
        if self.hold_next.swap(false, Ordering::SeqCst) {
            let released = self.release.notified();
            self.held.fetch_add(1, Ordering::SeqCst);
            released.await;
        }
        let stall = self.stall_next_ms.swap(0, Ordering::SeqCst);
        if stall > 0 {
            tokio::time::sleep(Duration::from_millis(stall)).await;
        }
        Ok(runs)
    }
}

async fn wait_for(calls: &AtomicU32, n: u32) {
    while calls.load(Ordering::SeqCst) < n {
        tokio::task::yield_now().await;
    }
}

#[tokio::test]
async fn one_off_gives_up_after_max_retries() {
    let calls = Arc::new(AtomicU32::new(0));
    let h = Harness::new(vec![counting("upload", calls.clone(), u32::MAX)]).await;
    h.bridge
        .register_task(one_off("upload.logs", "upload", 2))
        .await
        .unwrap();

    let first = h.advance(Duration::ZERO).await;
    assert_eq!(first, vec![(name("upload.logs"), WakeOutcome::NeedsRetry)]);
    let run = h.latest("upload.logs").await;
    assert!(run.is_retry_scheduled());
    assert_eq!(run.scheduled_for, t0() + chrono::TimeDelta::seconds(30));

    let second = h.advance(Duration::from_secs(30)).await;
    assert_eq!(second, vec![(name("upload.logs"), WakeOutcome::Failure)]);

    // 3 回目の wake は来ない
    assert!(h.advance(Duration::from_secs(3600)).await.is_empty());
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(h.host.submit_count(), 2);

    let run = h.latest("upload.logs").await;
    assert_eq!(run.state, RunState::Failed);
    assert_eq!(run.attempt_count, 2);
    assert_eq!(run.failure_kind(), Some(FailureKind::HandlerError));
    assert_eq!(h.bridge.runs(&name("upload.logs")).await.unwrap().len(), 1);
}

#[tokio::test]
async fn periodic_failure_does_not_block_next_interval() {
    let calls = Arc::new(AtomicU32::new(0));
    let h = Harness::new(vec![counting("feed", calls.clone(), 1)]).await;
    h.bridge
        .register_task(periodic("feed.refresh", "feed", FIFTEEN_MIN))
        .await
        .unwrap();

    assert_eq!(
        h.advance(Duration::ZERO).await,
        vec![(name("feed.refresh"), WakeOutcome::Failure)]
    );
    assert_eq!(
        h.advance(FIFTEEN_MIN).await,
        vec![(name("feed.refresh"), WakeOutcome::Success)]
    );

    let states: Vec<RunState> = h
        .bridge
        .runs(&name("feed.refresh"))
        .await
        .unwrap()
        .iter()
        .map(|r| r.state)
        .collect();
    assert_eq!(
        states,
        vec![RunState::Failed, RunState::Succeeded, RunState::Pending]
    );

    let request = h.host.request(&name("feed.refresh")).unwrap();
    assert_eq!(request.kind, RequestKind::Periodic { interval: FIFTEEN_MIN });
    assert_eq!(request.earliest_start, t0() + chrono::TimeDelta::minutes(30));
}

#[tokio::test]
async fn disarm_while_pending_stops_wakes() {
    let calls = Arc::new(AtomicU32::new(0));
    let h = Harness::new(vec![counting("feed", calls.clone(), 0)]).await;
    h.bridge
        .register_task(periodic("feed.refresh", "feed", FIFTEEN_MIN))
        .await
        .unwrap();

    h.bridge.disarm(&name("feed.refresh")).await.unwrap();
    assert!(h.host.pending_requests().is_empty());
    assert!(h.advance(FIFTEEN_MIN).await.is_empty());

    // host が遅れて wake を届けても実行しない
    let late = h.bridge.on_wake(&name("feed.refresh"), BUDGET).await;
    assert_eq!(late, WakeOutcome::Failure);
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    let run = h.latest("feed.refresh").await;
    assert_eq!(run.state, RunState::Pending);
    assert_eq!(run.attempt_count, 0);
}

#[tokio::test]
async fn concurrent_wakes_never_run_twice() {
    let started = Arc::new(AtomicU32::new(0));
    let release = Arc::new(Notify::new());
    let handler: Arc<dyn DynHandler> = {
        let started = started.clone();
        let release = release.clone();
        Arc::new(FnHandler::new("slow", move |_input: Value, _ctx: WakeContext| {
            let started = started.clone();
            let release = release.clone();
            async move {
                started.fetch_add(1, Ordering::SeqCst);
                release.notified().await;
                Ok::<(), HandlerFailure>(())
            }
        }))
    };
    let h = Harness::new(vec![handler]).await;
    h.bridge
        .register_task(periodic("sync", "slow", FIFTEEN_MIN))
        .await
        .unwrap();

    let bridge = h.bridge.clone();
    let first = tokio::spawn(async move { bridge.on_wake(&name("sync"), BUDGET).await });
    wait_for(&started, 1).await;

    let second = h.bridge.on_wake(&name("sync"), BUDGET).await;
    assert_eq!(second, WakeOutcome::Success);
    assert_eq!(h.bridge.counts().await.unwrap().running, 1);

    release.notify_one();
    assert_eq!(first.await.unwrap(), WakeOutcome::Success);
    assert_eq!(started.load(Ordering::SeqCst), 1);
    assert_eq!(h.bridge.counts().await.unwrap().running, 0);
}

#[tokio::test]
async fn interrupted_run_is_retried_after_restart() {
    let store: Arc<dyn StateStore> = Arc::new(InMemoryStateStore::new());

    // 前のプロセスが attempt 1 の途中で落ちた
    let ids = UlidGenerator::new(Arc::new(FixedClock::new(t0())));
    let mut run = TaskRun::new(ids.generate_run_id(), name("upload.logs"), t0(), t0());
    run.start_attempt(t0());
    store.save(&run).await.unwrap();

    let calls = Arc::new(AtomicU32::new(0));
    let h = Harness::with_store(vec![counting("upload", calls.clone(), 0)], store.clone()).await;

    let observed = store.load(run.id).await.unwrap();
    assert_eq!(observed.failure_kind(), Some(FailureKind::Interrupted));
    assert!(observed.pending_decision);

    h.bridge
        .register_task(one_off("upload.logs", "upload", 3))
        .await
        .unwrap();

    let retried = store.load(run.id).await.unwrap();
    assert!(retried.is_retry_scheduled());
    assert!(!retried.pending_decision);
    assert_eq!(retried.scheduled_for, t0() + chrono::TimeDelta::seconds(30));

    assert_eq!(
        h.advance(Duration::from_secs(30)).await,
        vec![(name("upload.logs"), WakeOutcome::Success)]
    );
    let done = store.load(run.id).await.unwrap();
    assert_eq!(done.state, RunState::Succeeded);
    assert_eq!(done.attempt_count, 2);
    assert_eq!(h.bridge.runs(&name("upload.logs")).await.unwrap().len(), 1);
}

#[tokio::test]
async fn interrupted_run_survives_a_file_store_restart() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("runs.json");
    let clock: Arc<FixedClock> = Arc::new(FixedClock::new(t0()));

    let run_id = {
        let store = crate::impls::JsonFileStateStore::open(&path, clock.clone())
            .await
            .unwrap();
        // 前のプロセスの id は今の id より前に並ぶ
        let earlier = Arc::new(FixedClock::new(t0() - chrono::TimeDelta::minutes(1)));
        let mut run = TaskRun::new(
            UlidGenerator::new(earlier).generate_run_id(),
            name("feed.refresh"),
            t0(),
            t0(),
        );
        run.start_attempt(t0());
        store.save(&run).await.unwrap();
        run.id
    };

    let mut config = BridgeConfig::default();
    config.store.path = Some(path.clone());
    let host = Arc::new(InMemoryHostScheduler::default());
    let bridge = BridgeBuilder::new(host.clone())
        .clock(clock.clone())
        .config(config)
        .build()
        .await
        .unwrap();

    let run = bridge.store().load(run_id).await.unwrap();
    assert_eq!(run.state, RunState::Failed);
    assert_eq!(run.failure_kind(), Some(FailureKind::Interrupted));

    // periodic: 中断した run は閉じて、次の occurrence を作る
    bridge
        .register_task(periodic("feed.refresh", "feed", FIFTEEN_MIN))
        .await
        .unwrap();
    let runs = bridge.runs(&name("feed.refresh")).await.unwrap();
    assert_eq!(runs.len(), 2);
    assert!(!runs[0].pending_decision);
    assert_eq!(runs[1].state, RunState::Pending);
    assert_eq!(runs[1].scheduled_for, t0() + chrono::TimeDelta::minutes(15));
    assert_eq!(
        host.request(&name("feed.refresh")).unwrap().run_id,
        runs[1].id
    );
}

#[tokio::test]
async fn identical_registration_does_not_rearm() {
    let h = Harness::new(vec![counting("feed", Arc::new(AtomicU32::new(0)), 0)]).await;
    let def = periodic("feed.refresh", "feed", FIFTEEN_MIN);

    assert_eq!(
        h.bridge.register_task(def.clone()).await.unwrap(),
        Registration::Created
    );
    assert_eq!(
        h.bridge.register_task(def.clone()).await.unwrap(),
        Registration::Unchanged
    );
    assert_eq!(h.host.submit_count(), 1);
    assert_eq!(h.bridge.runs(&def.name).await.unwrap().len(), 1);

    // disarm 後の同一登録は arm し直す
    h.bridge.disarm(&def.name).await.unwrap();
    h.bridge.register_task(def.clone()).await.unwrap();
    assert!(h.bridge.is_armed(&def.name));
    assert_eq!(h.host.submit_count(), 2);
    assert_eq!(h.bridge.runs(&def.name).await.unwrap().len(), 1);
}

#[tokio::test]
async fn replacing_a_definition_rearms_with_the_new_trigger() {
    let h = Harness::new(vec![counting("feed", Arc::new(AtomicU32::new(0)), 0)]).await;
    let quarter = TaskDefinition::builder(
        name("feed.refresh"),
        HandlerKey::new("feed").unwrap(),
        Trigger::Periodic {
            interval: FIFTEEN_MIN,
            initial_delay: FIFTEEN_MIN,
        },
    )
    .build();
    h.bridge.register_task(quarter.clone()).await.unwrap();

    let hourly = TaskDefinition::builder(
        name("feed.refresh"),
        HandlerKey::new("feed").unwrap(),
        Trigger::Periodic {
            interval: Duration::from_secs(3600),
            initial_delay: Duration::from_secs(3600),
        },
    )
    .build();
    let registration = h.bridge.register_task(hourly.clone()).await.unwrap();
    assert_eq!(registration, Registration::Replaced(quarter));
    assert_eq!(h.host.submit_count(), 2);

    let request = h.host.request(&hourly.name).unwrap();
    assert_eq!(
        request.kind,
        RequestKind::Periodic {
            interval: Duration::from_secs(3600)
        }
    );
    assert_eq!(request.earliest_start, t0() + chrono::TimeDelta::hours(1));

    // pending run は 1 つのまま、新しい trigger に合わせて移動
    let runs = h.bridge.runs(&hourly.name).await.unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].scheduled_for, t0() + chrono::TimeDelta::hours(1));
}

#[tokio::test]
async fn unbound_handler_fails_without_consuming_an_attempt() {
    let h = Harness::new(vec![]).await;
    h.bridge
        .register_task(one_off("upload.logs", "nobody", 3))
        .await
        .unwrap();

    assert_eq!(
        h.advance(Duration::ZERO).await,
        vec![(name("upload.logs"), WakeOutcome::Failure)]
    );
    let run = h.latest("upload.logs").await;
    assert_eq!(run.state, RunState::Failed);
    assert_eq!(run.failure_kind(), Some(FailureKind::HandlerUnbound));
    assert_eq!(run.attempt_count, 0);
    assert!(h.host.request(&name("upload.logs")).is_none());
    assert_eq!(h.host.submit_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn soft_deadline_cancels_cooperative_handler() {
    let handler: Arc<dyn DynHandler> = Arc::new(FnHandler::new(
        "slow",
        |_input: Value, ctx: WakeContext| async move {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(60)) => Ok(()),
                _ = ctx.cancelled() => Err(HandlerFailure::cancelled()),
            }
        },
    ));
    let h = Harness::new(vec![handler]).await;
    h.bridge
        .register_task(one_off("sync", "slow", 3))
        .await
        .unwrap();

    let outcome = h.bridge.on_wake(&name("sync"), Duration::from_secs(10)).await;
    assert_eq!(outcome, WakeOutcome::NeedsRetry);

    let run = h.latest("sync").await;
    assert!(run.is_retry_scheduled());
    let error = run.last_error.unwrap();
    assert_eq!(error.kind, FailureKind::BudgetExceeded);
    assert!(error.message.contains("5s"));
}

#[tokio::test(start_paused = true)]
async fn handler_ignoring_cancellation_is_aborted() {
    let handler: Arc<dyn DynHandler> = Arc::new(FnHandler::new(
        "stubborn",
        |_input: Value, _ctx: WakeContext| async move {
            tokio::time::sleep(Duration::from_secs(600)).await;
            Ok::<(), HandlerFailure>(())
        },
    ));
    let h = Harness::new(vec![handler]).await;
    h.bridge
        .register_task(one_off("sync", "stubborn", 1))
        .await
        .unwrap();

    let started = tokio::time::Instant::now();
    let outcome = h.bridge.on_wake(&name("sync"), Duration::from_secs(10)).await;
    // 5s のソフトデッドライン + 1s の猶予で打ち切り
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_secs(6) && elapsed < Duration::from_secs(60));
    assert_eq!(outcome, WakeOutcome::Failure);
    assert_eq!(
        h.latest("sync").await.failure_kind(),
        Some(FailureKind::BudgetExceeded)
    );
}

#[tokio::test]
async fn disarm_while_running_cancels_the_run() {
    let started = Arc::new(AtomicU32::new(0));
    let handler: Arc<dyn DynHandler> = {
        let started = started.clone();
        Arc::new(FnHandler::new("waits", move |_input: Value, ctx: WakeContext| {
            let started = started.clone();
            async move {
                started.fetch_add(1, Ordering::SeqCst);
                ctx.cancelled().await;
                Err(HandlerFailure::cancelled())
            }
        }))
    };
    let h = Harness::new(vec![handler]).await;
    h.bridge
        .register_task(periodic("sync", "waits", FIFTEEN_MIN))
        .await
        .unwrap();

    let bridge = h.bridge.clone();
    let wake = tokio::spawn(async move { bridge.on_wake(&name("sync"), BUDGET).await });
    wait_for(&started, 1).await;

    h.bridge.disarm(&name("sync")).await.unwrap();
    assert_eq!(wake.await.unwrap(), WakeOutcome::Failure);

    let runs = h.bridge.runs(&name("sync")).await.unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].state, RunState::Cancelled);
    assert!(h.host.pending_requests().is_empty());
}

#[tokio::test]
async fn rejected_registration_is_rolled_back() {
    let h = Harness::new(vec![counting("feed", Arc::new(AtomicU32::new(0)), 0)]).await;
    let def = periodic("feed.refresh", "feed", FIFTEEN_MIN);

    h.host.reject_next(SchedulerRejection::QuotaExhausted);
    let err = h.bridge.register_task(def.clone()).await.unwrap_err();
    assert!(matches!(
        err,
        BridgeError::SchedulerRejected {
            source: SchedulerRejection::QuotaExhausted,
            ..
        }
    ));
    assert!(matches!(
        h.bridge.lookup(&def.name).await,
        Err(BridgeError::NotFound(_))
    ));
    assert!(!h.bridge.is_armed(&def.name));

    // 置き換えの失敗は旧定義に戻す
    h.bridge.register_task(def.clone()).await.unwrap();
    h.host.reject_next(SchedulerRejection::Unavailable("busy".into()));
    let hourly = periodic("feed.refresh", "feed", Duration::from_secs(3600));
    assert!(h.bridge.register_task(hourly).await.is_err());
    assert_eq!(h.bridge.lookup(&def.name).await.unwrap(), def);
}

#[tokio::test]
async fn unsupported_os_version_is_rejected() {
    let h = Harness::new(vec![counting("feed", Arc::new(AtomicU32::new(0)), 0)]).await;
    let def = TaskDefinition::builder(
        name("feed.refresh"),
        HandlerKey::new("feed").unwrap(),
        Trigger::periodic(FIFTEEN_MIN),
    )
    .min_os_version(OsVersion::new(18, 0, 0))
    .build();

    let err = h.bridge.register_task(def).await.unwrap_err();
    assert!(matches!(
        err,
        BridgeError::SchedulerRejected {
            source: SchedulerRejection::UnsupportedPlatform { .. },
            ..
        }
    ));
    assert_eq!(h.host.submit_count(), 0);
    assert!(h.bridge.runs(&name("feed.refresh")).await.unwrap().is_empty());
}

#[tokio::test]
async fn rejected_rearm_is_deferred_to_the_next_wake() {
    let h = Harness::new(vec![counting("upload", Arc::new(AtomicU32::new(0)), u32::MAX)]).await;
    h.bridge
        .register_task(one_off("upload.logs", "upload", 3))
        .await
        .unwrap();

    h.host.reject_next(SchedulerRejection::QuotaExhausted);
    assert_eq!(
        h.advance(Duration::ZERO).await,
        vec![(name("upload.logs"), WakeOutcome::NeedsRetry)]
    );
    assert_eq!(h.bridge.deferred_tasks(), vec![name("upload.logs")]);
    assert!(h.host.request(&name("upload.logs")).is_none());

    // 別 task の wake でも、冒頭で deferred を再送する
    assert_eq!(
        h.bridge.on_wake(&name("something.else"), BUDGET).await,
        WakeOutcome::Failure
    );
    assert!(h.bridge.deferred_tasks().is_empty());
    let request = h.host.request(&name("upload.logs")).unwrap();
    assert_eq!(request.earliest_start, t0() + chrono::TimeDelta::seconds(30));
}

#[tokio::test]
async fn panicking_handler_is_a_handler_error() {
    let handler: Arc<dyn DynHandler> = Arc::new(FnHandler::new(
        "panics",
        |_input: Value, ctx: WakeContext| async move {
            if ctx.attempt > 0 {
                panic!("kaboom");
            }
            Ok::<(), HandlerFailure>(())
        },
    ));
    let h = Harness::new(vec![handler]).await;
    h.bridge
        .register_task(one_off("sync", "panics", 1))
        .await
        .unwrap();

    assert_eq!(
        h.bridge.on_wake(&name("sync"), BUDGET).await,
        WakeOutcome::Failure
    );
    let error = h.latest("sync").await.last_error.unwrap();
    assert_eq!(error.kind, FailureKind::HandlerError);
    assert_eq!(error.message, "handler panicked: kaboom");
}

#[tokio::test]
async fn lowered_budget_fails_pending_run_without_running() {
    let calls = Arc::new(AtomicU32::new(0));
    let h = Harness::new(vec![counting("upload", calls.clone(), u32::MAX)]).await;
    h.bridge
        .register_task(one_off("upload.logs", "upload", 3))
        .await
        .unwrap();
    h.advance(Duration::ZERO).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    h.bridge
        .register_task(one_off("upload.logs", "upload", 1))
        .await
        .unwrap();
    assert_eq!(
        h.advance(Duration::from_secs(30)).await,
        vec![(name("upload.logs"), WakeOutcome::Failure)]
    );

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    let run = h.latest("upload.logs").await;
    assert_eq!(run.state, RunState::Failed);
    assert_eq!(run.attempt_count, 1);
}

#[tokio::test]
async fn shutdown_interrupts_running_handlers() {
    let started = Arc::new(AtomicU32::new(0));
    let handler: Arc<dyn DynHandler> = {
        let started = started.clone();
        Arc::new(FnHandler::new("waits", move |_input: Value, ctx: WakeContext| {
            let started = started.clone();
            async move {
                started.fetch_add(1, Ordering::SeqCst);
                ctx.cancelled().await;
                Err(HandlerFailure::cancelled())
            }
        }))
    };
    let h = Harness::new(vec![handler]).await;
    h.bridge
        .register_task(one_off("sync", "waits", 3))
        .await
        .unwrap();

    let bridge = h.bridge.clone();
    let wake = tokio::spawn(async move { bridge.on_wake(&name("sync"), BUDGET).await });
    wait_for(&started, 1).await;

    assert!(h.bridge.shutdown().await);
    assert_eq!(wake.await.unwrap(), WakeOutcome::NeedsRetry);

    let run = h.latest("sync").await;
    assert_eq!(run.failure_kind(), Some(FailureKind::Interrupted));
    assert!(run.pending_decision);

    assert_eq!(
        h.bridge.on_wake(&name("sync"), BUDGET).await,
        WakeOutcome::Failure
    );
    assert_eq!(started.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn unknown_wake_is_dropped_without_touching_runs() {
    let h = Harness::new(vec![]).await;
    assert_eq!(
        h.bridge.on_wake(&name("never.registered"), BUDGET).await,
        WakeOutcome::Failure
    );
    assert_eq!(h.bridge.counts().await.unwrap().total(), 0);
}

#[tokio::test]
async fn unregister_keeps_history_and_garbage_collection_purges_it() {
    let h = Harness::new(vec![counting("upload", Arc::new(AtomicU32::new(0)), 0)]).await;
    h.bridge
        .register_task(one_off("upload.logs", "upload", 3))
        .await
        .unwrap();
    h.advance(Duration::ZERO).await;

    let removed = h.bridge.unregister(&name("upload.logs")).await.unwrap();
    assert_eq!(removed.name, name("upload.logs"));
    assert!(h.bridge.registered_tasks().await.is_empty());
    assert_eq!(h.bridge.counts().await.unwrap().succeeded, 1);

    h.clock.advance(Duration::from_secs(8 * 24 * 3600));
    assert_eq!(h.bridge.collect_garbage().await.unwrap(), 1);
    assert_eq!(h.bridge.counts().await.unwrap().total(), 0);
}

#[tokio::test]
async fn disarm_before_the_handler_starts_drops_the_wake() {
    let calls = Arc::new(AtomicU32::new(0));
    let store = Arc::new(GatedStore::default());
    let h = Harness::with_store(vec![counting("feed", calls.clone(), 0)], store.clone()).await;
    h.bridge
        .register_task(periodic("feed.refresh", "feed", FIFTEEN_MIN))
        .await
        .unwrap();

    store.hold_next_listing();
    let bridge = h.bridge.clone();
    let wake = tokio::spawn(async move { bridge.on_wake(&name("feed.refresh"), BUDGET).await });
    wait_for(&store.held, 1).await;

    // wake は task ロックを持ったまま止まっている。disarm はそれを待たない
    h.bridge.disarm(&name("feed.refresh")).await.unwrap();
    store.release.notify_one();

    assert_eq!(wake.await.unwrap(), WakeOutcome::Failure);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    let runs = h.bridge.runs(&name("feed.refresh")).await.unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].state, RunState::Pending);
    assert_eq!(runs[0].attempt_count, 0);
    assert!(h.host.pending_requests().is_empty());
}

#[tokio::test]
async fn shutdown_before_the_handler_starts_drops_the_wake() {
    let calls = Arc::new(AtomicU32::new(0));
    let store = Arc::new(GatedStore::default());
    let h = Harness::with_store(vec![counting("upload", calls.clone(), 0)], store.clone()).await;
    h.bridge
        .register_task(one_off("upload.logs", "upload", 3))
        .await
        .unwrap();

    store.hold_next_listing();
    let bridge = h.bridge.clone();
    let wake = tokio::spawn(async move { bridge.on_wake(&name("upload.logs"), BUDGET).await });
    wait_for(&store.held, 1).await;

    let bridge = h.bridge.clone();
    let shutdown = tokio::spawn(async move { bridge.shutdown().await });
    while !h.bridge.dispatcher.is_shut_down().await {
        tokio::task::yield_now().await;
    }
    store.release.notify_one();

    assert_eq!(wake.await.unwrap(), WakeOutcome::Failure);
    assert!(shutdown.await.unwrap());
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    let run = h.latest("upload.logs").await;
    assert_eq!(run.state, RunState::Pending);
    assert_eq!(run.attempt_count, 0);
    assert!(run.last_error.is_none());
}

#[tokio::test(start_paused = true)]
async fn soft_deadline_counts_from_the_wake() {
    let handler: Arc<dyn DynHandler> = Arc::new(FnHandler::new(
        "stubborn",
        |_input: Value, _ctx: WakeContext| async move {
            tokio::time::sleep(Duration::from_secs(600)).await;
            Ok::<(), HandlerFailure>(())
        },
    ));
    let store = Arc::new(GatedStore::default());
    let h = Harness::with_store(vec![handler], store.clone()).await;
    h.bridge
        .register_task(one_off("sync", "stubborn", 1))
        .await
        .unwrap();

    store.stall_next_listing(Duration::from_secs(4));
    let started = tokio::time::Instant::now();
    let outcome = h.bridge.on_wake(&name("sync"), Duration::from_secs(10)).await;
    // 読み込みの 4s もソフトデッドライン 5s に含まれる。猶予 1s を足して 6s
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_secs(6) && elapsed < Duration::from_secs(8));
    assert_eq!(outcome, WakeOutcome::Failure);
    assert_eq!(
        h.latest("sync").await.failure_kind(),
        Some(FailureKind::BudgetExceeded)
    );
}

#[tokio::test]
async fn rejected_replacement_keeps_the_pending_schedule() {
    let h = Harness::new(vec![counting("feed", Arc::new(AtomicU32::new(0)), 0)]).await;
    let delayed = |interval: Duration, initial_delay: Duration| {
        TaskDefinition::builder(
            name("feed.refresh"),
            HandlerKey::new("feed").unwrap(),
            Trigger::Periodic {
                interval,
                initial_delay,
            },
        )
        .build()
    };
    let def = delayed(FIFTEEN_MIN, FIFTEEN_MIN);
    h.bridge.register_task(def.clone()).await.unwrap();
    let due = t0() + chrono::TimeDelta::minutes(15);
    assert_eq!(h.latest("feed.refresh").await.scheduled_for, due);

    h.host.reject_next(SchedulerRejection::QuotaExhausted);
    let hourly = delayed(Duration::from_secs(3600), Duration::from_secs(3600));
    assert!(h.bridge.register_task(hourly).await.is_err());

    assert_eq!(h.bridge.lookup(&def.name).await.unwrap(), def);
    let runs = h.bridge.runs(&name("feed.refresh")).await.unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].scheduled_for, due);
    let request = h.host.request(&name("feed.refresh")).unwrap();
    assert_eq!(request.earliest_start, due);
    assert_eq!(request.kind, RequestKind::Periodic { interval: FIFTEEN_MIN });

    // 受け付けられた置き換えは予定を移す
    let hourly = delayed(Duration::from_secs(3600), Duration::from_secs(3600));
    h.bridge.register_task(hourly).await.unwrap();
    assert_eq!(
        h.latest("feed.refresh").await.scheduled_for,
        t0() + chrono::TimeDelta::hours(1)
    );
}

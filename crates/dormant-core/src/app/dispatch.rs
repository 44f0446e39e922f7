//! Dispatcher - wake 1 回分の実行
//!
//! # フロー
//! 1. in-flight 表に task を登録（既にあれば coalesce して終了）
//! 2. task ロック下で store から run を選ぶ → Running にして保存
//!    （ここまでに disarm / shutdown されていたら run に触らず終了）
//! 3. ロックを外して handler を spawn（ソフトデッドラインで cooperative cancel）
//! 4. task ロック下で run を読み直し、終端状態を書く
//! 5. Decider の判定を適用（retry / 次の occurrence / 打ち切り）
//!
//! # 不変条件
//! - 同じ task の run が同時に 2 つ Running になることはない（in-flight 表）
//! - store の read-modify-write は task ロックの中だけ
//! - handler 実行中はロックを持たない（disarm や登録をブロックしない）
//! - ソフトデッドラインは wake を受けた時刻から数える

use std::any::Any;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::{DashMap, DashSet};
use dashmap::mapref::entry::Entry;
use tokio::sync::{Notify, RwLock};
use tokio::task::JoinError;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::locks::KeyedLocks;
use super::registry::TaskRegistry;
use crate::domain::{
    Decider, Decision, FailureKind, HandlerFailure, RunError, RunId, RunState, TaskDefinition,
    TaskName, TaskRun, WakeOutcome,
};
use crate::ports::{Clock, IdGenerator, StateStore, StoreError};
use crate::typed::{DynHandler, HandlerTable, WakeContext};

/// Why a running handler was cancelled. The first reason recorded wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    /// Disarm / unregister -> `Cancelled`.
    Disarmed,
    /// Soft deadline -> `Failed(BudgetExceeded)`.
    Deadline,
    /// Bridge shutdown -> `Failed(Interrupted)`.
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchTiming {
    pub soft_deadline_margin: Duration,
    pub cancel_grace: Duration,
}

impl Default for DispatchTiming {
    fn default() -> Self {
        Self {
            soft_deadline_margin: Duration::from_secs(5),
            cancel_grace: Duration::from_secs(1),
        }
    }
}

impl DispatchTiming {
    /// Budget minus the margin; half the budget when the margin does not fit.
    pub fn soft_deadline(&self, budget: Duration) -> Duration {
        if budget > self.soft_deadline_margin {
            budget - self.soft_deadline_margin
        } else {
            budget / 2
        }
    }

    /// How long a cancelled handler may keep running. Never past the host budget.
    pub fn grace(&self, budget: Duration) -> Duration {
        self.cancel_grace
            .min(budget.saturating_sub(self.soft_deadline(budget)))
    }
}

/// What one wake did.
#[derive(Debug, Clone)]
pub struct WakeReport {
    pub outcome: WakeOutcome,

    /// The run this wake settled, if any.
    pub run: Option<TaskRun>,

    pub decision: Option<Decision>,

    /// Pending run the host scheduler has to be armed for.
    pub rearm: Option<TaskRun>,
}

impl WakeReport {
    /// Nothing ran.
    fn dropped(outcome: WakeOutcome) -> Self {
        Self {
            outcome,
            run: None,
            decision: None,
            rearm: None,
        }
    }
}

struct InFlight {
    token: CancellationToken,
    reason: OnceLock<CancelReason>,
}

impl InFlight {
    fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            reason: OnceLock::new(),
        }
    }

    fn cancel(&self, reason: CancelReason) {
        let _ = self.reason.set(reason);
        self.token.cancel();
    }
}

/// The run `prepare_arm` wants the host armed for.
#[derive(Debug, Clone)]
pub struct ArmPlan {
    pub run: TaskRun,

    /// `run.scheduled_for` was moved to the new trigger in memory only.
    /// `commit_reanchor` persists it once the host accepted the request.
    pub reanchored: bool,
}

/// Removes the in-flight entry however the wake ends.
struct SlotGuard<'a> {
    dispatcher: &'a Dispatcher,
    task: TaskName,
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        self.dispatcher.in_flight.remove(&self.task);
        self.dispatcher.idle.notify_waiters();
    }
}

enum HandlerResult {
    Completed(Result<(), HandlerFailure>),
    Panicked(String),
    Aborted,
}

impl HandlerResult {
    fn from_join(result: Result<Result<(), HandlerFailure>, JoinError>) -> Self {
        match result {
            Ok(r) => HandlerResult::Completed(r),
            Err(e) if e.is_panic() => HandlerResult::Panicked(panic_message(e.into_panic())),
            Err(_) => HandlerResult::Aborted,
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

enum Start {
    Run {
        run: TaskRun,
        definition: TaskDefinition,
        handler: Arc<dyn DynHandler>,
    },
    Done(WakeReport),
}

pub struct Dispatcher {
    store: Arc<dyn StateStore>,
    registry: Arc<TaskRegistry>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
    decider: Arc<dyn Decider>,
    handlers: RwLock<Option<Arc<HandlerTable>>>,
    timing: DispatchTiming,
    locks: KeyedLocks,
    in_flight: DashMap<TaskName, Arc<InFlight>>,
    armed: DashSet<TaskName>,
    idle: Notify,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn StateStore>,
        registry: Arc<TaskRegistry>,
        clock: Arc<dyn Clock>,
        ids: Arc<dyn IdGenerator>,
        decider: Arc<dyn Decider>,
        handlers: HandlerTable,
        timing: DispatchTiming,
    ) -> Self {
        Self {
            store,
            registry,
            clock,
            ids,
            decider,
            handlers: RwLock::new(Some(Arc::new(handlers))),
            timing,
            locks: KeyedLocks::new(),
            in_flight: DashMap::new(),
            armed: DashSet::new(),
            idle: Notify::new(),
        }
    }

    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    pub fn timing(&self) -> &DispatchTiming {
        &self.timing
    }

    pub fn is_in_flight(&self, task: &TaskName) -> bool {
        self.in_flight.contains_key(task)
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    pub fn is_armed(&self, task: &TaskName) -> bool {
        self.armed.contains(task)
    }

    pub fn mark_armed(&self, task: &TaskName) {
        self.armed.insert(task.clone());
    }

    /// Stop accepting wakes for `task` and signal its running handler.
    ///
    /// A wake that has not started its handler yet leaves the run untouched.
    /// Returns whether a wake was in flight.
    pub fn disarm(&self, task: &TaskName) -> bool {
        self.armed.remove(task);
        self.cancel(task, CancelReason::Disarmed)
    }

    pub async fn is_shut_down(&self) -> bool {
        self.handlers.read().await.is_none()
    }

    /// Handle one wake for `task` with the host-granted `budget`, counted
    /// from `woke_at`.
    ///
    /// Store errors are returned; every other failure is recorded on the run.
    pub async fn dispatch(
        &self,
        task: &TaskName,
        budget: Duration,
        woke_at: Instant,
    ) -> Result<WakeReport, StoreError> {
        let slot = Arc::new(InFlight::new());
        match self.in_flight.entry(task.clone()) {
            Entry::Occupied(_) => {
                info!(task = %task, "a run is already in flight; coalescing wake");
                return Ok(WakeReport::dropped(WakeOutcome::Success));
            }
            Entry::Vacant(entry) => {
                entry.insert(Arc::clone(&slot));
            }
        }
        let _slot_guard = SlotGuard {
            dispatcher: self,
            task: task.clone(),
        };

        // slot を入れてから読む。shutdown が後から来れば cancel_all がこの slot を拾う
        let Some(handlers) = self.handlers.read().await.clone() else {
            warn!(task = %task, "bridge is shut down; dropping wake");
            return Ok(WakeReport::dropped(WakeOutcome::Failure));
        };

        let (run, snapshot, handler) = match self.begin_attempt(task, &handlers, &slot).await? {
            Start::Run {
                run,
                definition,
                handler,
            } => (run, definition, handler),
            Start::Done(report) => return Ok(report),
        };

        let result = self
            .run_handler(&slot, &run, &snapshot, handler, budget, woke_at)
            .await;
        let reason = slot.reason.get().copied();

        self.finish_attempt(run.id, task, &snapshot, result, reason, budget)
            .await
    }

    /// Pick (or create) the run to execute and mark it Running.
    async fn begin_attempt(
        &self,
        task: &TaskName,
        handlers: &HandlerTable,
        slot: &InFlight,
    ) -> Result<Start, StoreError> {
        let _lock = self.locks.lock(task).await;

        let Some(definition) = self.registry.get(task).await else {
            warn!(task = %task, "wake for an unregistered task; dropping");
            return Ok(Start::Done(WakeReport::dropped(WakeOutcome::Failure)));
        };
        let now = self.clock.now();

        let runs = self.store.list_by_task(task).await?;

        // ここから start_attempt の保存までは await しない
        if slot.token.is_cancelled() || !self.is_armed(task) {
            info!(
                task = %task,
                reason = ?slot.reason.get(),
                "disarmed or shut down before the handler started; dropping wake"
            );
            return Ok(Start::Done(WakeReport::dropped(WakeOutcome::Failure)));
        }

        let pending = runs
            .iter()
            .filter(|r| r.state == RunState::Pending)
            .min_by_key(|r| (r.scheduled_for, r.id))
            .cloned();

        let mut run = match pending {
            Some(run) => run,
            None if definition.is_periodic() || runs.is_empty() => {
                let run = TaskRun::new(self.ids.generate_run_id(), task.clone(), now, now);
                debug!(task = %task, run_id = %run.id, "no pending run; created one for this wake");
                run
            }
            None => {
                info!(task = %task, "one-off task has nothing pending; dropping wake");
                return Ok(Start::Done(WakeReport::dropped(WakeOutcome::Success)));
            }
        };

        if run.attempt_count >= definition.max_retries {
            let kind = run.failure_kind().unwrap_or(FailureKind::HandlerError);
            run.mark_failed(
                RunError::new(
                    kind,
                    format!(
                        "attempt budget of {} already spent",
                        definition.max_retries
                    ),
                ),
                now,
            );
            warn!(
                task = %task,
                run_id = %run.id,
                attempt = run.attempt_count,
                "pending run has no attempts left; failing without running"
            );
            return Ok(Start::Done(self.settle(run, &definition, now).await?));
        }

        let Some(handler) = handlers.get(&definition.handler) else {
            run.mark_failed(
                RunError::new(
                    FailureKind::HandlerUnbound,
                    format!("no handler registered for '{}'", definition.handler),
                ),
                now,
            );
            error!(
                task = %task,
                run_id = %run.id,
                handler = %definition.handler,
                kind = %FailureKind::HandlerUnbound,
                "handler unbound"
            );
            return Ok(Start::Done(self.settle(run, &definition, now).await?));
        };

        run.start_attempt(now);
        self.store.save(&run).await?;
        info!(
            task = %task,
            run_id = %run.id,
            attempt = run.attempt_count,
            "run started"
        );

        Ok(Start::Run {
            run,
            definition,
            handler,
        })
    }

    async fn run_handler(
        &self,
        slot: &InFlight,
        run: &TaskRun,
        definition: &TaskDefinition,
        handler: Arc<dyn DynHandler>,
        budget: Duration,
        woke_at: Instant,
    ) -> HandlerResult {
        let soft = self.timing.soft_deadline(budget);
        let grace = self.timing.grace(budget);
        let deadline = woke_at + soft;

        let ctx = WakeContext::new(
            run.task.clone(),
            run.id,
            run.attempt_count,
            deadline,
            slot.token.clone(),
        );
        let input = definition.input.clone();
        let mut join = tokio::spawn(async move { handler.handle_dyn(input, ctx).await });

        let finished = tokio::select! {
            res = &mut join => Some(res),
            _ = tokio::time::sleep_until(deadline) => {
                slot.cancel(CancelReason::Deadline);
                None
            }
            _ = slot.token.cancelled() => None,
        };
        if let Some(res) = finished {
            return HandlerResult::from_join(res);
        }

        match tokio::time::timeout(grace, &mut join).await {
            Ok(res) => HandlerResult::from_join(res),
            Err(_) => {
                join.abort();
                warn!(
                    task = %run.task,
                    run_id = %run.id,
                    grace = ?grace,
                    "handler ignored cancellation; aborted"
                );
                HandlerResult::Aborted
            }
        }
    }

    async fn finish_attempt(
        &self,
        run_id: RunId,
        task: &TaskName,
        snapshot: &TaskDefinition,
        result: HandlerResult,
        reason: Option<CancelReason>,
        budget: Duration,
    ) -> Result<WakeReport, StoreError> {
        let _lock = self.locks.lock(task).await;
        let now = self.clock.now();
        let mut run = self.store.load(run_id).await?;

        match reason {
            Some(CancelReason::Disarmed) => run.mark_cancelled(now),
            Some(CancelReason::Deadline) => run.mark_failed(
                RunError::new(
                    FailureKind::BudgetExceeded,
                    format!(
                        "soft deadline of {:?} exceeded",
                        self.timing.soft_deadline(budget)
                    ),
                ),
                now,
            ),
            Some(CancelReason::Shutdown) => {
                // 次の起動で登録されたときにポリシーを適用する
                run.mark_interrupted(now);
                self.store.save(&run).await?;
                warn!(
                    task = %task,
                    run_id = %run.id,
                    attempt = run.attempt_count,
                    kind = %FailureKind::Interrupted,
                    "run interrupted by shutdown"
                );
                return Ok(WakeReport {
                    outcome: WakeOutcome::NeedsRetry,
                    run: Some(run),
                    decision: None,
                    rearm: None,
                });
            }
            None => match result {
                HandlerResult::Completed(Ok(())) => run.mark_succeeded(now),
                HandlerResult::Completed(Err(failure)) => run.mark_failed(
                    RunError::new(FailureKind::HandlerError, failure.message),
                    now,
                ),
                HandlerResult::Panicked(message) => run.mark_failed(
                    RunError::new(
                        FailureKind::HandlerError,
                        format!("handler panicked: {message}"),
                    ),
                    now,
                ),
                HandlerResult::Aborted => run.mark_failed(
                    RunError::new(FailureKind::HandlerError, "handler task was aborted"),
                    now,
                ),
            },
        }

        match &run.last_error {
            Some(err) if run.state == RunState::Failed => warn!(
                task = %task,
                run_id = %run.id,
                attempt = run.attempt_count,
                kind = %err.kind,
                error = %err.message,
                "run failed"
            ),
            _ => info!(
                task = %task,
                run_id = %run.id,
                attempt = run.attempt_count,
                state = ?run.state,
                "run finished"
            ),
        }

        // 実行中に置き換えられていれば新しい定義で判定する
        let definition = self
            .registry
            .get(task)
            .await
            .unwrap_or_else(|| snapshot.clone());
        self.settle(run, &definition, now).await
    }

    /// Apply the decider to a terminal run and save the result.
    ///
    /// Caller holds the task lock.
    async fn settle(
        &self,
        mut run: TaskRun,
        definition: &TaskDefinition,
        now: DateTime<Utc>,
    ) -> Result<WakeReport, StoreError> {
        let decision = self.decider.next(&run, definition);
        let mut rearm = None;

        match &decision {
            Decision::Reschedule { at, reason } if definition.is_periodic() => {
                run.settle(now);
                self.store.save(&run).await?;

                let existing = self
                    .store
                    .list_by_task(&run.task)
                    .await?
                    .into_iter()
                    .find(|r| r.state == RunState::Pending && r.id != run.id);
                let next = match existing {
                    Some(next) => next,
                    None => {
                        let next = TaskRun::new(self.ids.generate_run_id(), run.task.clone(), *at, now);
                        self.store.save(&next).await?;
                        next
                    }
                };
                info!(
                    task = %run.task,
                    run_id = %next.id,
                    at = %next.scheduled_for,
                    reason = %reason,
                    "next occurrence scheduled"
                );
                rearm = Some(next);
            }
            Decision::Reschedule { at, reason } => {
                run.schedule_retry(*at, now);
                self.store.save(&run).await?;
                info!(
                    task = %run.task,
                    run_id = %run.id,
                    attempt = run.attempt_count,
                    at = %at,
                    reason = %reason,
                    "retry scheduled"
                );
                rearm = Some(run.clone());
            }
            Decision::GiveUp { reason } => {
                run.settle(now);
                self.store.save(&run).await?;
                info!(
                    task = %run.task,
                    run_id = %run.id,
                    attempt = run.attempt_count,
                    state = ?run.state,
                    reason = %reason,
                    "run settled"
                );
            }
        }

        let outcome = match run.state {
            RunState::Succeeded => WakeOutcome::Success,
            RunState::Pending => WakeOutcome::NeedsRetry,
            _ => WakeOutcome::Failure,
        };
        Ok(WakeReport {
            outcome,
            run: Some(run),
            decision: Some(decision),
            rearm,
        })
    }

    /// Settle interrupted runs and make sure one Pending run exists.
    ///
    /// Returns the run to arm the host for, or `None` when a run is in flight
    /// (it re-arms when it settles) or an interrupted one-off just gave up.
    /// `reanchor` moves a never-attempted pending run to the trigger's
    /// current first due time; that move is not saved here (see `ArmPlan`).
    pub async fn prepare_arm(
        &self,
        definition: &TaskDefinition,
        reanchor: bool,
    ) -> Result<Option<ArmPlan>, StoreError> {
        let task = &definition.name;
        let _lock = self.locks.lock(task).await;
        let now = self.clock.now();

        let mut interrupted_gave_up = false;
        for run in self.store.list_by_task(task).await? {
            if run.pending_decision {
                let report = self.settle(run, definition, now).await?;
                interrupted_gave_up |= report.rearm.is_none();
            }
        }

        if self.is_in_flight(task) {
            debug!(task = %task, "run in flight; it re-arms when it settles");
            return Ok(None);
        }

        let pending = self
            .store
            .list_by_task(task)
            .await?
            .into_iter()
            .filter(|r| r.state == RunState::Pending)
            .min_by_key(|r| (r.scheduled_for, r.id));

        match pending {
            Some(mut run) => {
                let due = definition.trigger.first_due(now);
                let reanchored = reanchor && run.attempt_count == 0 && run.scheduled_for != due;
                if reanchored {
                    run.reschedule(due, now);
                }
                Ok(Some(ArmPlan { run, reanchored }))
            }
            None if interrupted_gave_up && !definition.is_periodic() => Ok(None),
            None => {
                let run = TaskRun::new(
                    self.ids.generate_run_id(),
                    task.clone(),
                    definition.trigger.first_due(now),
                    now,
                );
                self.store.save(&run).await?;
                info!(
                    task = %task,
                    run_id = %run.id,
                    at = %run.scheduled_for,
                    "run created"
                );
                Ok(Some(ArmPlan {
                    run,
                    reanchored: false,
                }))
            }
        }
    }

    /// Persist a re-anchored schedule after the host accepted it.
    ///
    /// Skipped when the run has been attempted in the meantime.
    pub async fn commit_reanchor(&self, planned: &TaskRun) -> Result<(), StoreError> {
        let _lock = self.locks.lock(&planned.task).await;
        let mut run = self.store.load(planned.id).await?;
        if run.state == RunState::Pending && run.attempt_count == 0 {
            run.reschedule(planned.scheduled_for, self.clock.now());
            self.store.save(&run).await?;
            debug!(task = %run.task, run_id = %run.id, at = %run.scheduled_for, "run re-anchored");
        }
        Ok(())
    }

    /// Signal cooperative cancellation to the running handler of `task`.
    pub fn cancel(&self, task: &TaskName, reason: CancelReason) -> bool {
        match self.in_flight.get(task) {
            Some(slot) => {
                slot.cancel(reason);
                true
            }
            None => false,
        }
    }

    pub fn cancel_all(&self, reason: CancelReason) -> usize {
        let mut n = 0;
        for slot in self.in_flight.iter() {
            slot.value().cancel(reason);
            n += 1;
        }
        n
    }

    /// Resolves once no wake is in flight.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.in_flight.is_empty() {
                return;
            }
            notified.await;
        }
    }

    /// Drop the handler table, cancel running handlers and wait up to `grace`.
    ///
    /// Returns `false` when handlers were still running after `grace`.
    pub async fn shutdown(&self, grace: Duration) -> bool {
        let table = self.handlers.write().await.take();
        if table.is_none() {
            return true;
        }
        let cancelled = self.cancel_all(CancelReason::Shutdown);
        if cancelled > 0 {
            info!(cancelled, "cancelling in-flight handlers for shutdown");
        }
        tokio::time::timeout(grace, self.wait_idle()).await.is_ok()
    }
}

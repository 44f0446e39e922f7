//! InMemoryHostScheduler - OS スケジューラのシミュレータ
//!
//! テストと CLI の `simulate` で使う。
//!
//! # 再現するもの
//! - task ごとに有効な request は 1 つ（submit は置き換え）
//! - 同時に保持できる request 数の上限（quota）
//! - 次の submit を指定した理由で拒否する（scripted rejection）
//! - `take_due` で期限が来た request を取り出す（= OS が wake する）

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::time::add_duration;
use crate::domain::{OsVersion, TaskName};
use crate::ports::{
    HostCapabilities, HostScheduler, RequestKind, SchedulerRejection, SchedulerRequest,
};

#[derive(Default)]
struct HostState {
    requests: BTreeMap<TaskName, SchedulerRequest>,
    quota: Option<usize>,
    scripted: VecDeque<SchedulerRejection>,
    submit_count: usize,
    cancel_count: usize,
}

pub struct InMemoryHostScheduler {
    capabilities: HostCapabilities,
    state: Mutex<HostState>,
}

impl InMemoryHostScheduler {
    pub fn new(capabilities: HostCapabilities) -> Self {
        Self {
            capabilities,
            state: Mutex::new(HostState::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, HostState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Cap on simultaneously held requests. `None` removes the cap.
    pub fn set_quota(&self, quota: Option<usize>) {
        self.state().quota = quota;
    }

    /// Reject the next submit with `rejection` (queued, one per submit).
    pub fn reject_next(&self, rejection: SchedulerRejection) {
        self.state().scripted.push_back(rejection);
    }

    pub fn request(&self, task: &TaskName) -> Option<SchedulerRequest> {
        self.state().requests.get(task).cloned()
    }

    /// Held requests ordered by earliest start.
    pub fn pending_requests(&self) -> Vec<SchedulerRequest> {
        let mut requests: Vec<SchedulerRequest> = self.state().requests.values().cloned().collect();
        requests.sort_by(|a, b| {
            a.earliest_start
                .cmp(&b.earliest_start)
                .then_with(|| a.task.cmp(&b.task))
        });
        requests
    }

    /// Accepted submits so far.
    pub fn submit_count(&self) -> usize {
        self.state().submit_count
    }

    pub fn cancel_count(&self) -> usize {
        self.state().cancel_count
    }

    /// Earliest start among held requests.
    pub fn next_due(&self) -> Option<DateTime<Utc>> {
        self.state().requests.values().map(|r| r.earliest_start).min()
    }

    /// Fire every request due at `now`, like the OS waking the process.
    ///
    /// One-off requests are consumed. Periodic requests stay and move to
    /// their next slot after `now`.
    pub fn take_due(&self, now: DateTime<Utc>) -> Vec<TaskName> {
        let mut state = self.state();
        let mut due: Vec<(DateTime<Utc>, TaskName)> = state
            .requests
            .values()
            .filter(|r| r.earliest_start <= now)
            .map(|r| (r.earliest_start, r.task.clone()))
            .collect();
        due.sort();

        for (_, task) in &due {
            let Some(kind) = state.requests.get(task).map(|r| r.kind) else {
                continue;
            };
            match kind {
                RequestKind::OneOff => {
                    state.requests.remove(task);
                }
                RequestKind::Periodic { interval } => {
                    if let Some(request) = state.requests.get_mut(task) {
                        request.earliest_start = next_slot(request.earliest_start, interval, now);
                    }
                }
            }
        }
        due.into_iter().map(|(_, task)| task).collect()
    }
}

impl Default for InMemoryHostScheduler {
    /// 15 minute minimum interval on OS 17.0.0.
    fn default() -> Self {
        Self::new(HostCapabilities {
            min_periodic_interval: Duration::from_secs(15 * 60),
            os_version: OsVersion::new(17, 0, 0),
        })
    }
}

fn next_slot(start: DateTime<Utc>, interval: Duration, now: DateTime<Utc>) -> DateTime<Utc> {
    if interval.is_zero() {
        return now;
    }
    let mut next = add_duration(start, interval);
    while next <= now {
        next = add_duration(next, interval);
    }
    next
}

#[async_trait]
impl HostScheduler for InMemoryHostScheduler {
    fn capabilities(&self) -> HostCapabilities {
        self.capabilities
    }

    async fn submit(&self, request: SchedulerRequest) -> Result<(), SchedulerRejection> {
        let mut state = self.state();
        if let Some(rejection) = state.scripted.pop_front() {
            return Err(rejection);
        }
        if let Some(quota) = state.quota
            && !state.requests.contains_key(&request.task)
            && state.requests.len() >= quota
        {
            return Err(SchedulerRejection::QuotaExhausted);
        }
        state.requests.insert(request.task.clone(), request);
        state.submit_count += 1;
        Ok(())
    }

    async fn cancel(&self, task: &TaskName) -> Result<(), SchedulerRejection> {
        let mut state = self.state();
        state.requests.remove(task);
        state.cancel_count += 1;
        Ok(())
    }
}

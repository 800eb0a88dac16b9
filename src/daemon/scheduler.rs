use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::{self, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::core::error::{QueryError, ScheduleError};
use crate::core::query::{QueryDescriptor, SlotId};
use crate::core::retry::{RetryPolicy, RetryState};
use crate::core::settings::FailurePolicy;
use crate::daemon::poller::Poller;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotStatus {
    Idle,
    InFlight,
    Halted,
}

#[derive(Debug)]
struct SlotState {
    id: SlotId,
    refresh_interval: Duration,
    retry: RetryState,
    status: SlotStatus,
    next_due: Instant,
}

/// Timing state for every slot.
///
/// Idle slots sit in a min-heap keyed by their next due time. Entries are
/// never removed in place: an entry whose instant no longer matches the slot,
/// or whose slot is not idle, is stale and skipped when it reaches the top.
#[derive(Debug)]
pub struct Schedule {
    slots: Vec<SlotState>,
    heap: BinaryHeap<Reverse<(Instant, usize)>>,
    policy: RetryPolicy,
}

impl Schedule {
    /// Every slot starts idle and due at `now`.
    pub fn new(slots: Vec<(SlotId, Duration)>, policy: RetryPolicy, now: Instant) -> Self {
        let mut schedule = Self {
            slots: Vec::with_capacity(slots.len()),
            heap: BinaryHeap::with_capacity(slots.len()),
            policy,
        };
        for (id, refresh_interval) in slots {
            schedule.slots.push(SlotState {
                id,
                refresh_interval,
                retry: RetryState::new(),
                status: SlotStatus::Idle,
                next_due: now,
            });
            schedule.arm(schedule.slots.len() - 1, now);
        }
        schedule
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn slot_id(&self, index: usize) -> &SlotId {
        &self.slots[index].id
    }

    pub fn status(&self, index: usize) -> SlotStatus {
        self.slots[index].status
    }

    pub fn failures(&self, index: usize) -> u32 {
        self.slots[index].retry.consecutive_failures()
    }

    pub fn next_due(&self, index: usize) -> Instant {
        self.slots[index].next_due
    }

    fn arm(&mut self, index: usize, at: Instant) {
        let slot = &mut self.slots[index];
        slot.status = SlotStatus::Idle;
        slot.next_due = at;
        self.heap.push(Reverse((at, index)));
    }

    fn is_live(&self, at: Instant, index: usize) -> bool {
        let slot = &self.slots[index];
        slot.status == SlotStatus::Idle && slot.next_due == at
    }

    /// Earliest due time among idle slots, `None` when nothing is waiting.
    pub fn next_deadline(&mut self) -> Option<Instant> {
        while let Some(&Reverse((at, index))) = self.heap.peek() {
            if self.is_live(at, index) {
                return Some(at);
            }
            self.heap.pop();
        }
        None
    }

    /// Marks every slot due at `now` as in flight and returns their indices.
    pub fn take_due(&mut self, now: Instant) -> Vec<usize> {
        let mut due = Vec::new();
        while let Some(at) = self.next_deadline() {
            if at > now {
                break;
            }
            if let Some(Reverse((_, index))) = self.heap.pop() {
                self.slots[index].status = SlotStatus::InFlight;
                due.push(index);
            }
        }
        due
    }

    pub fn record_success(&mut self, index: usize, now: Instant) -> Instant {
        let slot = &mut self.slots[index];
        slot.retry.record_success();
        let at = now + self.policy.next_delay(&slot.retry, slot.refresh_interval);
        self.arm(index, at);
        at
    }

    /// Re-arms the slot for a retry, or halts it once the budget is spent.
    pub fn record_failure(&mut self, index: usize, now: Instant) -> Result<Instant, ScheduleError> {
        let slot = &mut self.slots[index];
        let failures = slot.retry.record_failure();

        if self.policy.budget_exceeded(&slot.retry) {
            slot.status = SlotStatus::Halted;
            return Err(ScheduleError::RetryBudgetExceeded {
                slot: slot.id.clone(),
                failures,
            });
        }

        let at = now + self.policy.next_delay(&slot.retry, slot.refresh_interval);
        self.arm(index, at);
        Ok(at)
    }

    /// Clears failure streaks and makes every slot that is not in flight due
    /// at `now`, halted ones included.
    pub fn reset_all(&mut self, now: Instant) {
        for index in 0..self.slots.len() {
            self.slots[index].retry.record_success();
            if self.slots[index].status != SlotStatus::InFlight {
                self.arm(index, now);
            }
        }
    }
}

/// A slot together with the query it runs and the client it runs it on.
pub struct Job {
    pub id: SlotId,
    pub descriptor: Arc<QueryDescriptor>,
    pub poller: Poller,
}

/// Poll tasks in flight. A panicking task only reports its task id, so the
/// slot is looked up here.
#[derive(Default)]
struct InFlight {
    tasks: JoinSet<Result<(), QueryError>>,
    slots: HashMap<task::Id, usize>,
}

pub struct Scheduler {
    schedule: Schedule,
    jobs: Vec<Job>,
    failure_policy: FailurePolicy,
}

impl Scheduler {
    pub fn new(jobs: Vec<Job>, policy: RetryPolicy, failure_policy: FailurePolicy) -> Self {
        let slots = jobs
            .iter()
            .map(|job| (job.id.clone(), job.descriptor.granularity().refresh_interval()))
            .collect();

        Self {
            schedule: Schedule::new(slots, policy, Instant::now()),
            jobs,
            failure_policy,
        }
    }

    fn spawn_poll(&self, polls: &mut InFlight, index: usize) {
        let job = &self.jobs[index];
        let poller = job.poller.clone();
        let id = job.id.clone();
        let descriptor = Arc::clone(&job.descriptor);

        tracing::debug!(slot = %id, "Polling slot");
        let handle = polls
            .tasks
            .spawn(async move { poller.poll(&id, &descriptor).await });
        polls.slots.insert(handle.id(), index);
    }

    async fn reload_clients(&self) {
        for job in &self.jobs {
            job.poller.reload_client().await;
        }
    }

    /// Drives every slot until `cancel` fires.
    ///
    /// Paths received on `resets` signal a credentials change. Returns an
    /// error only when a slot exhausts its retry budget under
    /// [`FailurePolicy::Abort`], after cancelling `cancel`.
    pub async fn run(
        mut self,
        mut resets: mpsc::UnboundedReceiver<PathBuf>,
        cancel: CancellationToken,
    ) -> Result<(), ScheduleError> {
        let mut polls = InFlight::default();
        let mut resets_open = true;

        tracing::info!(
            slots = self.schedule.len(),
            policy = ?self.failure_policy,
            "Scheduler started"
        );

        loop {
            for index in self.schedule.take_due(Instant::now()) {
                self.spawn_poll(&mut polls, index);
            }
            let deadline = self.schedule.next_deadline();

            tokio::select! {
                biased;

                _ = cancel.cancelled() => break,

                Some(joined) = polls.tasks.join_next_with_id(), if !polls.tasks.is_empty() => {
                    let (task_id, result) = match joined {
                        Ok(done) => done,
                        Err(e) => (e.id(), Err(QueryError::Aborted(e.to_string()))),
                    };
                    let Some(index) = polls.slots.remove(&task_id) else {
                        tracing::error!(task = %task_id, "Finished poll task has no slot");
                        continue;
                    };
                    self.complete(index, result, &cancel)?;
                }

                path = resets.recv(), if resets_open => match path {
                    Some(path) => {
                        tracing::info!(?path, "Credentials changed, rescheduling all slots");
                        self.reload_clients().await;
                        self.schedule.reset_all(Instant::now());
                    }
                    None => resets_open = false,
                },

                _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {}
            }
        }

        tracing::info!(in_flight = polls.tasks.len(), "Scheduler stopped");
        Ok(())
    }

    fn complete(
        &mut self,
        index: usize,
        result: Result<(), QueryError>,
        cancel: &CancellationToken,
    ) -> Result<(), ScheduleError> {
        let now = Instant::now();

        let error = match result {
            Ok(()) => {
                let next = self.schedule.record_success(index, now);
                tracing::debug!(
                    slot = %self.schedule.slot_id(index),
                    next_in_secs = (next - now).as_secs(),
                    "Slot re-armed"
                );
                return Ok(());
            }
            Err(error) => error,
        };

        match self.schedule.record_failure(index, now) {
            Ok(next) => {
                tracing::warn!(
                    slot = %self.schedule.slot_id(index),
                    error = %error,
                    consecutive_failures = self.schedule.failures(index),
                    retry_in_secs = (next - now).as_secs(),
                    "Poll failed"
                );
                Ok(())
            }
            Err(exceeded) => match self.failure_policy {
                FailurePolicy::Isolate => {
                    tracing::error!(error = %error, "{exceeded}, halting slot");
                    Ok(())
                }
                FailurePolicy::Abort => {
                    tracing::error!(error = %error, "{exceeded}, shutting down");
                    cancel.cancel();
                    Err(exceeded)
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::cache::MetricsCache;
    use crate::core::error::ClientError;
    use crate::core::models::CostAndUsageResponse;
    use crate::daemon::self_metrics::SelfMetrics;
    use crate::sources::testing::{ok_page, ScriptedClient};

    const DAY: Duration = Duration::from_secs(86400);
    const HOUR: Duration = Duration::from_secs(3600);

    fn schedule(n: usize) -> Schedule {
        let slots = (0..n).map(|i| (SlotId::new("aws", i), DAY)).collect();
        Schedule::new(slots, RetryPolicy::default(), Instant::now())
    }

    fn job(index: usize, granularity: &str, client: Arc<ScriptedClient>, cache: &MetricsCache) -> Job {
        Job {
            id: SlotId::new("aws", index),
            descriptor: Arc::new(
                QueryDescriptor::new(granularity, vec!["UnblendedCost".to_string()], vec![], None)
                    .unwrap(),
            ),
            poller: Poller::new(client, cache.clone(), SelfMetrics::new().unwrap(), None),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_slot_per_descriptor() {
        let mut schedule = schedule(5);
        assert_eq!(schedule.len(), 5);

        let due = schedule.take_due(Instant::now());
        assert_eq!(due, vec![0, 1, 2, 3, 4]);
        assert!(due.iter().all(|&i| schedule.status(i) == SlotStatus::InFlight));
        assert_eq!(schedule.next_deadline(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rearm_intervals() {
        let mut schedule = schedule(2);
        let now = Instant::now();
        schedule.take_due(now);

        assert_eq!(schedule.record_success(0, now), now + DAY);
        assert_eq!(schedule.record_failure(1, now).unwrap(), now + Duration::from_secs(10));
        assert_eq!(schedule.next_deadline(), Some(now + Duration::from_secs(10)));
        assert!(schedule.take_due(now + Duration::from_secs(9)).is_empty());
        assert_eq!(schedule.take_due(now + Duration::from_secs(10)), vec![1]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_budget() {
        let mut schedule = schedule(1);
        let now = Instant::now();

        for expected in 1..=3 {
            schedule.take_due(now);
            schedule.record_failure(0, now).unwrap();
            assert_eq!(schedule.failures(0), expected);
        }

        let err = schedule.record_failure(0, now).unwrap_err();
        let ScheduleError::RetryBudgetExceeded { slot, failures } = err;
        assert_eq!(slot, SlotId::new("aws", 0));
        assert_eq!(failures, 4);
        assert_eq!(schedule.status(0), SlotStatus::Halted);
        assert_eq!(schedule.next_deadline(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_failures() {
        let mut schedule = schedule(1);
        let now = Instant::now();
        schedule.record_failure(0, now).unwrap();
        schedule.record_failure(0, now).unwrap();

        schedule.record_success(0, now);
        assert_eq!(schedule.failures(0), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_revives_halted_slots() {
        let mut schedule = schedule(3);
        let now = Instant::now();
        schedule.take_due(now);

        for _ in 0..4 {
            let _ = schedule.record_failure(0, now);
        }
        schedule.record_success(1, now);
        assert_eq!(schedule.status(0), SlotStatus::Halted);

        let later = now + HOUR;
        schedule.reset_all(later);

        assert_eq!(schedule.status(0), SlotStatus::Idle);
        assert_eq!(schedule.failures(0), 0);
        assert_eq!(schedule.next_due(1), later);
        // Slot 2 is still in flight and keeps its state.
        assert_eq!(schedule.status(2), SlotStatus::InFlight);
        assert_eq!(schedule.take_due(later), vec![0, 1]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failing_slot_is_isolated() {
        let cache = MetricsCache::new();
        let failing = Arc::new(ScriptedClient::default());
        let healthy = Arc::new(ScriptedClient::default().with_fallback(ok_page));

        let scheduler = Scheduler::new(
            vec![
                job(0, "daily", failing.clone(), &cache),
                job(1, "hourly", healthy.clone(), &cache),
            ],
            RetryPolicy::default(),
            FailurePolicy::Isolate,
        );
        let cancel = CancellationToken::new();
        let (_reset_tx, reset_rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(scheduler.run(reset_rx, cancel.clone()));

        tokio::time::sleep(Duration::from_secs(2 * 3600 + 60)).await;

        // t=0, 10s, 20s, 30s then halted.
        assert_eq!(failing.calls(), 4);
        // t=0, 1h, 2h.
        assert_eq!(healthy.calls(), 3);
        assert!(cache.get("raw:aws_1").is_some());
        assert!(cache.get("raw:aws_0").is_none());

        cancel.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_abort_policy_cancels() {
        let cache = MetricsCache::new();
        let failing = Arc::new(ScriptedClient::default());

        let scheduler = Scheduler::new(
            vec![job(0, "daily", failing.clone(), &cache)],
            RetryPolicy::default(),
            FailurePolicy::Abort,
        );
        let cancel = CancellationToken::new();
        let (_reset_tx, reset_rx) = mpsc::unbounded_channel();

        let result = scheduler.run(reset_rx, cancel.clone()).await;

        assert!(matches!(result, Err(ScheduleError::RetryBudgetExceeded { failures: 4, .. })));
        assert!(cancel.is_cancelled());
        assert_eq!(failing.calls(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_credentials_change_revives_slot() {
        let cache = MetricsCache::new();
        let failing = Arc::new(ScriptedClient::default());

        let scheduler = Scheduler::new(
            vec![job(0, "daily", failing.clone(), &cache)],
            RetryPolicy::default(),
            FailurePolicy::Isolate,
        );
        let cancel = CancellationToken::new();
        let (reset_tx, reset_rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(scheduler.run(reset_rx, cancel.clone()));

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(failing.calls(), 4);

        reset_tx.send(PathBuf::from("/tmp/credentials")).unwrap();
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(failing.calls(), 8);

        cancel.cancel();
        handle.await.unwrap().unwrap();
    }

    fn panicking_page() -> Result<CostAndUsageResponse, ClientError> {
        panic!("billing client bug")
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_poll_counts_as_failure() {
        let cache = MetricsCache::new();
        let broken = Arc::new(ScriptedClient::default().with_fallback(panicking_page));
        let healthy = Arc::new(ScriptedClient::default().with_fallback(ok_page));

        let scheduler = Scheduler::new(
            vec![
                job(0, "hourly", broken.clone(), &cache),
                job(1, "hourly", healthy.clone(), &cache),
            ],
            RetryPolicy::default(),
            FailurePolicy::Isolate,
        );
        let cancel = CancellationToken::new();
        let (reset_tx, reset_rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(scheduler.run(reset_rx, cancel.clone()));

        tokio::time::sleep(Duration::from_secs(30 * 60)).await;
        // Retried like any failed poll, then halted.
        assert_eq!(broken.calls(), 4);
        assert_eq!(healthy.calls(), 1);

        reset_tx.send(PathBuf::from("/tmp/credentials")).unwrap();
        tokio::time::sleep(Duration::from_secs(45 * 60)).await;
        assert_eq!(broken.calls(), 8);
        // t=0 and again on the reset.
        assert_eq!(healthy.calls(), 2);

        cancel.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_poll_aborts_under_abort_policy() {
        let cache = MetricsCache::new();
        let broken = Arc::new(ScriptedClient::default().with_fallback(panicking_page));

        let scheduler = Scheduler::new(
            vec![job(0, "daily", broken.clone(), &cache)],
            RetryPolicy::default(),
            FailurePolicy::Abort,
        );
        let (_reset_tx, reset_rx) = mpsc::unbounded_channel();

        let result = scheduler.run(reset_rx, CancellationToken::new()).await;

        assert!(matches!(result, Err(ScheduleError::RetryBudgetExceeded { failures: 4, .. })));
        assert_eq!(broken.calls(), 4);
    }
}

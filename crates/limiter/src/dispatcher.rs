//! Task dispatcher
//!
//! Endlessly generates tasks and admits them through the [`SlotPool`]. Each
//! iteration draws a random duration, waits for a slot, then hands the
//! reservation to a freshly spawned [`TaskRunner`] without waiting for it.
//! Waiting for a slot is the backpressure point: when every slot is taken,
//! task creation pauses until one is released.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, info_span, instrument, warn, Instrument};

use crate::config::LimiterConfig;
use crate::slot_pool::{Reservation, SlotPool, SlotPoolError};
use crate::task::{TaskOutcome, TaskRunner, TaskState, Work};

/// Dispatcher errors
#[derive(Debug, thiserror::Error)]
pub enum DispatcherError {
    /// Slot pool error
    #[error("slot pool error: {0}")]
    SlotPool(#[from] SlotPoolError),

    /// In-flight tasks did not finish in time
    #[error("drain timed out after {timeout:?} with {remaining} task(s) still running")]
    DrainTimeout { timeout: Duration, remaining: usize },
}

/// Draws task durations uniformly from a range of time units
#[derive(Debug, Clone)]
pub struct DurationSampler {
    rng: StdRng,
    min_units: u32,
    max_units: u32,
    time_unit: Duration,
}

impl DurationSampler {
    pub fn new(config: &LimiterConfig) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        Self {
            rng,
            min_units: config.min_task_units.max(1),
            max_units: config.max_task_units.max(config.min_task_units.max(1)),
            time_unit: config.time_unit,
        }
    }

    /// Next duration, in time units
    pub fn next_units(&mut self) -> u32 {
        self.rng.gen_range(self.min_units..=self.max_units)
    }

    /// Next duration
    pub fn next_duration(&mut self) -> Duration {
        self.time_unit.saturating_mul(self.next_units())
    }
}

/// Dispatch counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchStats {
    /// Tasks admitted and spawned
    pub dispatched: u64,
    /// Tasks that finished their work
    pub completed: u64,
    /// Tasks whose work returned an error
    pub failed: u64,
}

impl DispatchStats {
    /// Tasks that never reported an outcome (still running, panicked or cancelled)
    pub fn unfinished(&self) -> u64 {
        self.dispatched
            .saturating_sub(self.completed)
            .saturating_sub(self.failed)
    }
}

#[derive(Debug, Default)]
struct StatsCounters {
    dispatched: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
}

impl StatsCounters {
    fn record_dispatched(&self) {
        self.dispatched.fetch_add(1, Ordering::Relaxed);
    }

    fn record_outcome(&self, outcome: &TaskOutcome) {
        match outcome.state {
            TaskState::Completed => {
                self.completed.fetch_add(1, Ordering::Relaxed);
            }
            TaskState::Failed => {
                self.failed.fetch_add(1, Ordering::Relaxed);
            }
            TaskState::Created | TaskState::SlotReserved | TaskState::Running => {
                debug_assert!(false, "outcome with non-terminal state {:?}", outcome.state);
                warn!(
                    task_id = %outcome.task_id,
                    state = ?outcome.state,
                    "Ignoring outcome with non-terminal state"
                );
            }
        }
    }

    fn snapshot(&self) -> DispatchStats {
        DispatchStats {
            dispatched: self.dispatched.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

/// Admits tasks into the slot pool and spawns their runners
///
/// # Example
///
/// ```ignore
/// use std::sync::Arc;
/// use concurrency_limiter::{Dispatcher, LimiterConfig, SleepWork, SlotPool};
///
/// let config = LimiterConfig::default();
/// let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
/// let mut dispatcher = Dispatcher::new(
///     SlotPool::new(config.max_concurrency),
///     &config,
///     Arc::new(SleepWork),
///     shutdown_rx,
/// );
///
/// // Runs until `shutdown_tx.send(true)`
/// dispatcher.run().await?;
/// let stats = dispatcher.drain(config.shutdown_timeout).await?;
/// ```
pub struct Dispatcher {
    pool: SlotPool,
    work: Arc<dyn Work>,
    sampler: DurationSampler,
    tracker: TaskTracker,
    stats: Arc<StatsCounters>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Dispatcher {
    pub fn new(
        pool: SlotPool,
        config: &LimiterConfig,
        work: Arc<dyn Work>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            pool,
            work,
            sampler: DurationSampler::new(config),
            tracker: TaskTracker::new(),
            stats: Arc::new(StatsCounters::default()),
            shutdown_rx,
        }
    }

    pub fn pool(&self) -> &SlotPool {
        &self.pool
    }

    /// Current counters
    pub fn stats(&self) -> DispatchStats {
        self.stats.snapshot()
    }

    /// Number of spawned tasks that have not finished
    pub fn in_flight(&self) -> usize {
        self.tracker.len()
    }

    /// Dispatch tasks until shutdown is signalled
    ///
    /// In-flight tasks keep running after this returns; call
    /// [`Dispatcher::drain`] to wait for them.
    #[instrument(skip(self), fields(capacity = self.pool.capacity()))]
    pub async fn run(&mut self) -> Result<(), DispatcherError> {
        info!("Dispatcher started");
        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            // Drawn before acquiring so a seeded run is reproducible
            let duration = self.sampler.next_duration();

            let reservation = tokio::select! {
                reservation = self.pool.acquire() => reservation?,
                _ = shutdown_rx.changed() => {
                    debug!("Dispatcher: shutdown requested while waiting for a slot");
                    break;
                }
            };

            self.spawn_task(duration, reservation);
        }

        info!(dispatched = self.stats().dispatched, "Dispatcher stopped");
        Ok(())
    }

    /// Dispatch a fixed sequence of durations and wait for every task
    ///
    /// Outcomes are returned in dispatch order. Tasks that panic are logged
    /// and left out.
    pub async fn dispatch<I>(&self, durations: I) -> Result<Vec<TaskOutcome>, DispatcherError>
    where
        I: IntoIterator<Item = Duration>,
    {
        let mut handles = Vec::new();
        for duration in durations {
            let reservation = self.pool.acquire().await?;
            handles.push(self.spawn_task(duration, reservation));
        }

        let mut outcomes = Vec::with_capacity(handles.len());
        for handle in handles {
            match handle.await {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => warn!(error = %e, "Task did not finish"),
            }
        }
        Ok(outcomes)
    }

    /// Wait for in-flight tasks, then close the pool
    ///
    /// Returns the final counters, or [`DispatcherError::DrainTimeout`] when
    /// tasks are still running after `timeout`.
    #[instrument(skip(self))]
    pub async fn drain(&self, timeout: Duration) -> Result<DispatchStats, DispatcherError> {
        self.tracker.close();
        info!(in_flight = self.tracker.len(), "Draining in-flight tasks");

        if tokio::time::timeout(timeout, self.tracker.wait()).await.is_err() {
            let remaining = self.tracker.len();
            warn!(remaining, "Drain timeout reached");
            return Err(DispatcherError::DrainTimeout { timeout, remaining });
        }

        self.pool.close();
        let stats = self.stats();
        info!(
            dispatched = stats.dispatched,
            completed = stats.completed,
            failed = stats.failed,
            "All tasks drained"
        );
        Ok(stats)
    }

    fn spawn_task(&self, duration: Duration, reservation: Reservation) -> JoinHandle<TaskOutcome> {
        let runner = TaskRunner::new(duration, reservation);
        let task_id = runner.id();
        let work = Arc::clone(&self.work);
        let stats = Arc::clone(&self.stats);

        self.stats.record_dispatched();
        debug!(
            %task_id,
            duration_ms = duration.as_millis() as u64,
            in_use = self.pool.in_use(),
            "Dispatching task"
        );

        self.tracker.spawn(
            async move {
                let outcome = runner.run(work.as_ref()).await;
                stats.record_outcome(&outcome);
                outcome
            }
            .instrument(info_span!("task", %task_id)),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{SleepWork, WorkError};
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use tokio::time::Instant;
    use uuid::Uuid;

    /// Sleeps like [`SleepWork`] and records peak concurrency
    #[derive(Default)]
    struct TrackingWork {
        current: AtomicUsize,
        peak: AtomicUsize,
    }

    impl TrackingWork {
        fn peak(&self) -> usize {
            self.peak.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Work for TrackingWork {
        async fn perform(&self, _task_id: Uuid, duration: Duration) -> Result<(), WorkError> {
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(duration).await;
            self.current.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct FlakyWork;

    #[async_trait]
    impl Work for FlakyWork {
        async fn perform(&self, _task_id: Uuid, duration: Duration) -> Result<(), WorkError> {
            tokio::time::sleep(duration).await;
            if duration >= Duration::from_secs(2) {
                return Err(WorkError::Failed("too slow".into()));
            }
            Ok(())
        }
    }

    struct PanickingWork;

    #[async_trait]
    impl Work for PanickingWork {
        async fn perform(&self, _task_id: Uuid, _duration: Duration) -> Result<(), WorkError> {
            panic!("task exploded");
        }
    }

    fn build_dispatcher(capacity: usize, work: Arc<dyn Work>) -> (Dispatcher, watch::Sender<bool>) {
        let config = LimiterConfig::default()
            .with_max_concurrency(capacity)
            .with_seed(42);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let dispatcher = Dispatcher::new(SlotPool::new(capacity), &config, work, shutdown_rx);
        (dispatcher, shutdown_tx)
    }

    fn secs(values: &[u64]) -> Vec<Duration> {
        values.iter().copied().map(Duration::from_secs).collect()
    }

    #[test]
    fn test_sampler_stays_in_range() {
        let mut sampler = DurationSampler::new(&LimiterConfig::default());
        for _ in 0..1_000 {
            let units = sampler.next_units();
            assert!((1..=5).contains(&units));
        }
    }

    #[test]
    fn test_sampler_is_reproducible_with_seed() {
        let config = LimiterConfig::default().with_seed(1234);
        let mut a = DurationSampler::new(&config);
        let mut b = DurationSampler::new(&config);

        let first: Vec<_> = (0..50).map(|_| a.next_duration()).collect();
        let second: Vec<_> = (0..50).map(|_| b.next_duration()).collect();
        assert_eq!(first, second);
    }

    #[test]
    fn test_sampler_scales_by_time_unit() {
        let config = LimiterConfig::default()
            .with_time_unit(Duration::from_millis(10))
            .with_task_units(3, 3);
        let mut sampler = DurationSampler::new(&config);
        assert_eq!(sampler.next_duration(), Duration::from_millis(30));
    }

    #[test]
    fn test_stats_unfinished() {
        let stats = DispatchStats {
            dispatched: 10,
            completed: 6,
            failed: 1,
        };
        assert_eq!(stats.unfinished(), 3);
    }

    fn outcome_with(state: TaskState) -> TaskOutcome {
        TaskOutcome {
            task_id: Uuid::now_v7(),
            duration: Duration::from_secs(1),
            state,
            transitions: vec![TaskState::Created, state],
            started_at: Instant::now(),
            elapsed: Duration::from_secs(1),
            error: None,
        }
    }

    #[test]
    fn test_record_outcome_counts_terminal_states() {
        let counters = StatsCounters::default();
        counters.record_outcome(&outcome_with(TaskState::Completed));
        counters.record_outcome(&outcome_with(TaskState::Completed));
        counters.record_outcome(&outcome_with(TaskState::Failed));

        let stats = counters.snapshot();
        assert_eq!(stats.completed, 2);
        assert_eq!(stats.failed, 1);
    }

    #[test]
    #[cfg(not(debug_assertions))]
    fn test_record_outcome_ignores_non_terminal_states() {
        let counters = StatsCounters::default();
        counters.record_outcome(&outcome_with(TaskState::Running));
        counters.record_outcome(&outcome_with(TaskState::SlotReserved));

        assert_eq!(counters.snapshot(), DispatchStats::default());
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "non-terminal state")]
    fn test_record_outcome_rejects_non_terminal_states() {
        let counters = StatsCounters::default();
        counters.record_outcome(&outcome_with(TaskState::Running));
    }

    #[tokio::test(start_paused = true)]
    async fn test_two_slots_five_short_tasks() {
        let work = Arc::new(TrackingWork::default());
        let (dispatcher, _shutdown_tx) = build_dispatcher(2, work.clone());

        let start = Instant::now();
        let outcomes = dispatcher.dispatch(secs(&[1, 1, 1, 1, 1])).await.unwrap();

        assert_eq!(outcomes.len(), 5);
        assert!(outcomes.iter().all(|o| o.state == TaskState::Completed));
        assert!(work.peak() <= 2);
        assert!(start.elapsed() >= Duration::from_secs(3));
        assert_eq!(dispatcher.pool().in_use(), 0);
        assert_eq!(
            dispatcher.stats(),
            DispatchStats {
                dispatched: 5,
                completed: 5,
                failed: 0
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_slot_serializes_tasks() {
        let work = Arc::new(TrackingWork::default());
        let (dispatcher, _shutdown_tx) = build_dispatcher(1, work.clone());

        let start = Instant::now();
        let outcomes = dispatcher.dispatch(secs(&[2, 3])).await.unwrap();
        let total = start.elapsed();

        assert_eq!(outcomes.len(), 2);
        assert_eq!(work.peak(), 1);
        // Second task starts only once the first released its slot
        assert!(outcomes[1].started_at >= outcomes[0].started_at + Duration::from_secs(2));
        assert!(total >= Duration::from_secs(5));
        assert!(total < Duration::from_secs(6));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_work_releases_slots() {
        let (dispatcher, _shutdown_tx) = build_dispatcher(2, Arc::new(FlakyWork));

        let outcomes = dispatcher.dispatch(secs(&[1, 2, 3, 1])).await.unwrap();

        let failed = outcomes
            .iter()
            .filter(|o| o.state == TaskState::Failed)
            .count();
        assert_eq!(failed, 2);
        assert_eq!(dispatcher.stats().completed, 2);
        assert_eq!(dispatcher.stats().failed, 2);
        assert_eq!(dispatcher.pool().in_use(), 0);
    }

    #[tokio::test]
    async fn test_panicking_work_does_not_leak_slots() {
        let (dispatcher, _shutdown_tx) = build_dispatcher(2, Arc::new(PanickingWork));

        let outcomes = dispatcher.dispatch(secs(&[1, 1, 1, 1])).await.unwrap();

        assert!(outcomes.is_empty());
        assert_eq!(dispatcher.pool().in_use(), 0);
        assert_eq!(dispatcher.stats().unfinished(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_until_shutdown_then_drain() {
        let work = Arc::new(TrackingWork::default());
        let (mut dispatcher, shutdown_tx) = build_dispatcher(3, work.clone());
        let pool = dispatcher.pool().clone();

        let handle = tokio::spawn(async move {
            dispatcher.run().await?;
            dispatcher.drain(Duration::from_secs(30)).await
        });

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(pool.in_use() <= 3);
        shutdown_tx.send(true).unwrap();

        let stats = handle.await.unwrap().unwrap();
        // Saturated for 30s with tasks of at most 5s
        assert!(stats.dispatched >= 18);
        assert_eq!(stats.completed, stats.dispatched);
        assert_eq!(stats.unfinished(), 0);
        assert!(work.peak() <= 3);
        assert_eq!(pool.in_use(), 0);
        assert!(pool.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_blocks_on_saturated_pool() {
        let work = Arc::new(TrackingWork::default());
        let (mut dispatcher, shutdown_tx) = build_dispatcher(2, work.clone());
        let pool = dispatcher.pool().clone();

        // Hold every slot so the dispatcher can never admit anything
        let held = (pool.acquire().await.unwrap(), pool.acquire().await.unwrap());

        let handle = tokio::spawn(async move {
            dispatcher.run().await.unwrap();
            dispatcher.stats()
        });

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(!handle.is_finished());

        shutdown_tx.send(true).unwrap();
        let stats = handle.await.unwrap();
        assert_eq!(stats.dispatched, 0);
        drop(held);
        assert_eq!(pool.in_use(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_times_out_on_long_tasks() {
        let (dispatcher, _shutdown_tx) = build_dispatcher(1, Arc::new(SleepWork));
        let reservation = dispatcher.pool().acquire().await.unwrap();
        dispatcher.spawn_task(Duration::from_secs(3600), reservation);

        let err = dispatcher.drain(Duration::from_secs(1)).await.unwrap_err();
        match err {
            DispatcherError::DrainTimeout { remaining, .. } => assert_eq!(remaining, 1),
            other => panic!("unexpected error: {other}"),
        }
        assert!(!dispatcher.pool().is_closed());
        assert_eq!(dispatcher.in_flight(), 1);
    }

    #[tokio::test]
    async fn test_run_fails_when_pool_closed() {
        let (mut dispatcher, _shutdown_tx) = build_dispatcher(1, Arc::new(SleepWork));
        dispatcher.pool().close();

        let err = dispatcher.run().await.unwrap_err();
        assert!(matches!(
            err,
            DispatcherError::SlotPool(SlotPoolError::Closed)
        ));
    }
}

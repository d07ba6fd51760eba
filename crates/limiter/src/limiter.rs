//! Limiter assembly
//!
//! Wires one [`SlotPool`], one [`Dispatcher`] and one [`LivenessReporter`]
//! together behind a shared shutdown channel.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, instrument};

use crate::config::{ConfigError, LimiterConfig};
use crate::dispatcher::{DispatchStats, Dispatcher, DispatcherError};
use crate::reporter::{LiveCount, LivenessReporter, ReportSink, RuntimeLiveCount, StdoutSink};
use crate::slot_pool::SlotPool;
use crate::task::{SleepWork, Work};

/// Limiter errors
#[derive(Debug, thiserror::Error)]
pub enum LimiterError {
    /// Configuration error
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    /// Dispatcher error
    #[error("dispatcher error: {0}")]
    Dispatcher(#[from] DispatcherError),

    /// A background loop panicked
    #[error("background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Final figures of a stopped limiter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimiterSummary {
    pub stats: DispatchStats,
    /// Liveness reports emitted
    pub reports: u64,
}

/// Bounded-concurrency task launcher
///
/// # Example
///
/// ```ignore
/// use concurrency_limiter::{Limiter, LimiterConfig};
///
/// let limiter = Limiter::new(LimiterConfig::from_env())?.start();
/// tokio::signal::ctrl_c().await?;
/// let summary = limiter.shutdown().await?;
/// ```
pub struct Limiter {
    config: LimiterConfig,
    work: Arc<dyn Work>,
    counter: Option<Box<dyn LiveCount>>,
    sink: Box<dyn ReportSink>,
}

impl Limiter {
    /// Create a limiter with sleeping tasks and stdout reports
    pub fn new(config: LimiterConfig) -> Result<Self, LimiterError> {
        config.validate()?;
        Ok(Self {
            config,
            work: Arc::new(SleepWork),
            counter: None,
            sink: Box::new(StdoutSink),
        })
    }

    /// Replace the task body
    pub fn with_work(mut self, work: Arc<dyn Work>) -> Self {
        self.work = work;
        self
    }

    /// Replace the report destination
    pub fn with_sink(mut self, sink: impl ReportSink + 'static) -> Self {
        self.sink = Box::new(sink);
        self
    }

    /// Replace the live-count sampler (default: the current tokio runtime)
    pub fn with_live_count(mut self, counter: impl LiveCount + 'static) -> Self {
        self.counter = Some(Box::new(counter));
        self
    }

    pub fn config(&self) -> &LimiterConfig {
        &self.config
    }

    /// Spawn the dispatcher and reporter loops
    ///
    /// Must be called from within a tokio runtime.
    #[instrument(skip(self), fields(capacity = self.config.max_concurrency))]
    pub fn start(self) -> RunningLimiter {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let pool = SlotPool::new(self.config.max_concurrency);

        let counter: Box<dyn LiveCount> = match self.counter {
            Some(counter) => counter,
            None => Box::new(RuntimeLiveCount::current()),
        };
        let reporter = LivenessReporter::new(&self.config, counter, self.sink, shutdown_rx.clone());
        let reporter_handle = tokio::spawn(reporter.run());

        let mut dispatcher = Dispatcher::new(pool.clone(), &self.config, self.work, shutdown_rx);
        let shutdown_timeout = self.config.shutdown_timeout;
        let dispatcher_handle = tokio::spawn(async move {
            dispatcher.run().await?;
            dispatcher.drain(shutdown_timeout).await
        });

        info!(
            max_concurrency = self.config.max_concurrency,
            time_unit_ms = self.config.time_unit.as_millis() as u64,
            report_interval_ms = self.config.report_interval().as_millis() as u64,
            "Limiter started"
        );

        RunningLimiter {
            pool,
            shutdown_tx,
            dispatcher_handle,
            reporter_handle,
        }
    }
}

/// Handle to a started [`Limiter`]
pub struct RunningLimiter {
    pool: SlotPool,
    shutdown_tx: watch::Sender<bool>,
    dispatcher_handle: JoinHandle<Result<DispatchStats, DispatcherError>>,
    reporter_handle: JoinHandle<u64>,
}

impl RunningLimiter {
    pub fn pool(&self) -> &SlotPool {
        &self.pool
    }

    /// Stop dispatching, drain in-flight tasks and stop the reporter
    #[instrument(skip(self))]
    pub async fn shutdown(self) -> Result<LimiterSummary, LimiterError> {
        info!("Initiating graceful shutdown");
        let _ = self.shutdown_tx.send(true);

        // Join the reporter before surfacing a drain error
        let drained = self.dispatcher_handle.await;
        let reports = self.reporter_handle.await?;
        let stats = drained??;

        info!(
            dispatched = stats.dispatched,
            completed = stats.completed,
            failed = stats.failed,
            reports,
            "Limiter stopped"
        );
        Ok(LimiterSummary { stats, reports })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reporter::ChannelSink;
    use std::time::Duration;
    use tokio::sync::mpsc::error::TryRecvError;

    #[test]
    fn test_rejects_invalid_config() {
        let result = Limiter::new(LimiterConfig::default().with_max_concurrency(0));
        assert!(matches!(result, Err(LimiterError::Config(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_and_shutdown_without_reports() {
        let limiter = Limiter::new(LimiterConfig::default().with_seed(3))
            .unwrap()
            .with_live_count(|| 0usize)
            .start();

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(limiter.pool().in_use() <= 6);

        let summary = limiter.shutdown().await.unwrap();
        assert_eq!(summary.reports, 0);
        assert!(summary.stats.dispatched >= 6);
        assert_eq!(summary.stats.unfinished(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_timeout_still_stops_reporter() {
        let (sink, mut rx) = ChannelSink::new();
        let config = LimiterConfig::default()
            .with_task_units(100, 100)
            .with_shutdown_timeout(Duration::from_secs(1))
            .with_seed(11);
        let limiter = Limiter::new(config)
            .unwrap()
            .with_live_count(|| 1usize)
            .with_sink(sink)
            .start();

        tokio::time::sleep(Duration::from_secs(6)).await;
        let result = limiter.shutdown().await;

        assert!(matches!(
            result,
            Err(LimiterError::Dispatcher(DispatcherError::DrainTimeout { remaining: 6, .. }))
        ));
        // One report was sent before shutdown, then the reporter dropped its sink
        assert_eq!(rx.try_recv().unwrap().count, 1);
        assert_eq!(rx.try_recv().unwrap_err(), TryRecvError::Disconnected);
    }
}

//! Liveness reporting
//!
//! Periodically samples how many units of execution are alive in the runtime
//! and emits a single `key=value` line per interval.
//!
//! The default sampler reads tokio's alive-task count, which includes the
//! dispatcher loop and the reporter itself. The figure is a diagnostic upper
//! bound on running tasks, not an exact count of task runners.

use std::fmt;
use std::io::Write;
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, instrument, warn};

use crate::config::LimiterConfig;

/// Reporter errors
#[derive(Debug, thiserror::Error)]
pub enum ReportError {
    /// Writing to the sink failed
    #[error("report sink I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The receiving side of the sink is gone
    #[error("report sink is closed")]
    SinkClosed,
}

/// Source of the live unit-of-execution count
pub trait LiveCount: Send + Sync {
    fn sample(&self) -> usize;
}

impl<F> LiveCount for F
where
    F: Fn() -> usize + Send + Sync,
{
    fn sample(&self) -> usize {
        self()
    }
}

/// Samples the number of alive tasks in a tokio runtime
#[derive(Debug, Clone)]
pub struct RuntimeLiveCount {
    handle: Handle,
}

impl RuntimeLiveCount {
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }

    /// Sample the runtime this is called from
    ///
    /// Panics outside a tokio runtime, like [`Handle::current`].
    pub fn current() -> Self {
        Self::new(Handle::current())
    }
}

impl LiveCount for RuntimeLiveCount {
    fn sample(&self) -> usize {
        self.handle.metrics().num_alive_tasks()
    }
}

/// A single liveness observation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Report {
    pub label: String,
    pub count: usize,
    pub at: Instant,
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.label, self.count)
    }
}

/// Destination for liveness reports
pub trait ReportSink: Send {
    fn emit(&mut self, report: &Report) -> Result<(), ReportError>;
}

/// Writes one line per report to stdout
#[derive(Debug, Default)]
pub struct StdoutSink;

impl ReportSink for StdoutSink {
    fn emit(&mut self, report: &Report) -> Result<(), ReportError> {
        let mut out = std::io::stdout().lock();
        writeln!(out, "{report}")?;
        out.flush()?;
        Ok(())
    }
}

/// Forwards reports over an mpsc channel
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<Report>,
}

impl ChannelSink {
    /// Create a sink and the receiver that observes it
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Report>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl ReportSink for ChannelSink {
    fn emit(&mut self, report: &Report) -> Result<(), ReportError> {
        self.tx
            .send(report.clone())
            .map_err(|_| ReportError::SinkClosed)
    }
}

/// Periodic liveness reporter
///
/// Runs independently of the dispatcher and never touches the slot pool.
pub struct LivenessReporter {
    label: String,
    interval: Duration,
    counter: Box<dyn LiveCount>,
    sink: Box<dyn ReportSink>,
    shutdown_rx: watch::Receiver<bool>,
}

impl LivenessReporter {
    pub fn new(
        config: &LimiterConfig,
        counter: Box<dyn LiveCount>,
        sink: Box<dyn ReportSink>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            label: config.report_label.clone(),
            interval: config.report_interval(),
            counter,
            sink,
            shutdown_rx,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Sample once and emit the report
    ///
    /// Sink failures are logged; the reporter keeps running.
    pub fn report_once(&mut self) -> Report {
        let report = Report {
            label: self.label.clone(),
            count: self.counter.sample(),
            at: Instant::now(),
        };

        debug!(label = %report.label, count = report.count, "Liveness sample");

        if let Err(e) = self.sink.emit(&report) {
            warn!(error = %e, "Failed to emit liveness report");
        }

        report
    }

    /// Report every interval until shutdown
    ///
    /// The first report is emitted one full interval after start. Returns the
    /// number of reports emitted.
    #[instrument(skip(self), fields(interval_ms = self.interval.as_millis() as u64))]
    pub async fn run(mut self) -> u64 {
        let mut ticker = tokio::time::interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut shutdown_rx = self.shutdown_rx.clone();
        let mut emitted = 0u64;

        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            tokio::select! {
                _ = ticker.tick() => {
                    self.report_once();
                    emitted += 1;
                }
                _ = shutdown_rx.changed() => {
                    debug!("Reporter: shutdown requested");
                    break;
                }
            }
        }

        debug!(emitted, "Reporter loop exited");
        emitted
    }
}

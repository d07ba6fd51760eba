//! # Concurrency Limiter
//!
//! A bounded-concurrency task launcher. An endless stream of short-lived tasks
//! is generated, but at most N of them run at the same time.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────┐        ┌──────────────────────────┐
//! │      Dispatcher      │        │     LivenessReporter     │
//! │ (draw duration,      │        │ (every 5 units: emit     │
//! │  acquire, spawn)     │        │  live_tasks=<n>)         │
//! └──────────┬───────────┘        └──────────────────────────┘
//!            │ acquire (blocks when saturated)
//!            ▼
//! ┌──────────────────────┐
//! │       SlotPool       │  capacity N
//! └──────────┬───────────┘
//!            │ Reservation (released on drop)
//!            ▼
//! ┌──────────────────────────────────────────┐
//! │  [TaskRunner 1] [TaskRunner 2] ... [N]   │
//! └──────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use concurrency_limiter::prelude::*;
//!
//! let limiter = Limiter::new(LimiterConfig::default().with_max_concurrency(6))?.start();
//! tokio::signal::ctrl_c().await?;
//! let summary = limiter.shutdown().await?;
//! ```

pub mod config;
pub mod dispatcher;
pub mod limiter;
pub mod reporter;
pub mod slot_pool;
pub mod task;
pub mod telemetry;

/// Prelude for common imports
pub mod prelude {
    pub use crate::config::{ConfigError, LimiterConfig};
    pub use crate::dispatcher::{DispatchStats, Dispatcher, DispatcherError};
    pub use crate::limiter::{Limiter, LimiterError, LimiterSummary, RunningLimiter};
    pub use crate::reporter::{ChannelSink, LiveCount, LivenessReporter, Report, ReportSink};
    pub use crate::slot_pool::{Reservation, SlotPool, SlotPoolError};
    pub use crate::task::{SleepWork, TaskOutcome, TaskState, Work, WorkError};
}

// Re-export key types at crate root
pub use config::{ConfigError, LimiterConfig};
pub use dispatcher::{DispatchStats, Dispatcher, DispatcherError, DurationSampler};
pub use limiter::{Limiter, LimiterError, LimiterSummary, RunningLimiter};
pub use reporter::{
    ChannelSink, LiveCount, LivenessReporter, Report, ReportError, ReportSink, RuntimeLiveCount,
    StdoutSink,
};
pub use slot_pool::{Reservation, SlotPool, SlotPoolError};
pub use task::{SleepWork, TaskOutcome, TaskRunner, TaskState, Work, WorkError};

//! Limiter configuration
//!
//! Defaults reproduce the reference behaviour: six slots, tasks lasting one
//! to five seconds, a liveness report every five seconds.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;

/// Default number of concurrently running tasks
pub const DEFAULT_MAX_CONCURRENCY: usize = 6;

/// Default label of the liveness report line
pub const DEFAULT_REPORT_LABEL: &str = "live_tasks";

/// Configuration errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    /// Invalid configuration
    #[error("invalid limiter configuration: {0}")]
    InvalidConfig(String),
}

/// Limiter configuration
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use concurrency_limiter::LimiterConfig;
///
/// let config = LimiterConfig::default()
///     .with_max_concurrency(2)
///     .with_time_unit(Duration::from_millis(100))
///     .with_seed(42);
///
/// assert!(config.validate().is_ok());
/// assert_eq!(config.report_interval(), Duration::from_millis(500));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LimiterConfig {
    /// Maximum concurrently running tasks (slot pool capacity)
    pub max_concurrency: usize,

    /// Length of one time unit
    #[serde(with = "duration_millis")]
    pub time_unit: Duration,

    /// Shortest task, in time units
    pub min_task_units: u32,

    /// Longest task, in time units
    pub max_task_units: u32,

    /// Liveness report cadence, in time units
    pub report_interval_units: u32,

    /// Key of the `key=value` report line
    pub report_label: String,

    /// Seed for task durations (None = seeded from entropy)
    pub seed: Option<u64>,

    /// How long shutdown waits for in-flight tasks
    #[serde(with = "duration_millis")]
    pub shutdown_timeout: Duration,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            time_unit: Duration::from_secs(1),
            min_task_units: 1,
            max_task_units: 5,
            report_interval_units: 5,
            report_label: DEFAULT_REPORT_LABEL.to_string(),
            seed: None,
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl LimiterConfig {
    /// Create configuration from environment variables
    ///
    /// Environment variables:
    /// - `MAX_CONCURRENCY`: Slot pool capacity (default: 6)
    /// - `TIME_UNIT_MS`: Length of one time unit (default: 1000)
    /// - `MIN_TASK_UNITS` / `MAX_TASK_UNITS`: Task duration range (default: 1 / 5)
    /// - `REPORT_INTERVAL_UNITS`: Report cadence (default: 5)
    /// - `REPORT_LABEL`: Report key (default: "live_tasks")
    /// - `DISPATCH_SEED`: Seed for task durations
    /// - `SHUTDOWN_TIMEOUT_MS`: Drain timeout (default: 30000)
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Create configuration from an arbitrary key lookup
    ///
    /// Missing or unparsable values fall back to the defaults.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let parse = |key: &str| lookup(key).and_then(|s| s.trim().parse::<u64>().ok());

        Self {
            max_concurrency: parse("MAX_CONCURRENCY")
                .map(|v| v as usize)
                .unwrap_or(defaults.max_concurrency),
            time_unit: parse("TIME_UNIT_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.time_unit),
            min_task_units: parse("MIN_TASK_UNITS")
                .and_then(|v| u32::try_from(v).ok())
                .unwrap_or(defaults.min_task_units),
            max_task_units: parse("MAX_TASK_UNITS")
                .and_then(|v| u32::try_from(v).ok())
                .unwrap_or(defaults.max_task_units),
            report_interval_units: parse("REPORT_INTERVAL_UNITS")
                .and_then(|v| u32::try_from(v).ok())
                .unwrap_or(defaults.report_interval_units),
            report_label: lookup("REPORT_LABEL")
                .filter(|s| !s.trim().is_empty())
                .unwrap_or(defaults.report_label),
            seed: parse("DISPATCH_SEED"),
            shutdown_timeout: parse("SHUTDOWN_TIMEOUT_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.shutdown_timeout),
        }
    }

    /// Set maximum concurrency
    pub fn with_max_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = max;
        self
    }

    /// Set the length of one time unit
    pub fn with_time_unit(mut self, unit: Duration) -> Self {
        self.time_unit = unit;
        self
    }

    /// Set the task duration range, in time units (inclusive)
    pub fn with_task_units(mut self, min: u32, max: u32) -> Self {
        self.min_task_units = min;
        self.max_task_units = max;
        self
    }

    /// Set the report cadence, in time units
    pub fn with_report_interval_units(mut self, units: u32) -> Self {
        self.report_interval_units = units;
        self
    }

    /// Set the report key
    pub fn with_report_label(mut self, label: impl Into<String>) -> Self {
        self.report_label = label.into();
        self
    }

    /// Seed the task duration generator
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Set the shutdown drain timeout
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Duration of `units` time units
    pub fn units(&self, units: u32) -> Duration {
        self.time_unit.saturating_mul(units)
    }

    /// Interval between liveness reports
    pub fn report_interval(&self) -> Duration {
        self.units(self.report_interval_units)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrency == 0 {
            return Err(ConfigError::InvalidConfig(
                "max_concurrency must be at least 1".into(),
            ));
        }
        if self.max_concurrency > Semaphore::MAX_PERMITS {
            return Err(ConfigError::InvalidConfig(format!(
                "max_concurrency must be at most {}",
                Semaphore::MAX_PERMITS
            )));
        }
        if self.time_unit.is_zero() {
            return Err(ConfigError::InvalidConfig(
                "time_unit must be greater than zero".into(),
            ));
        }
        if self.min_task_units == 0 || self.min_task_units > self.max_task_units {
            return Err(ConfigError::InvalidConfig(format!(
                "task duration range {}..={} is invalid",
                self.min_task_units, self.max_task_units
            )));
        }
        if self.report_interval_units == 0 {
            return Err(ConfigError::InvalidConfig(
                "report_interval_units must be at least 1".into(),
            ));
        }
        if self.report_label.contains(|c: char| c == '=' || c == '\n') {
            return Err(ConfigError::InvalidConfig(
                "report_label must not contain '=' or newlines".into(),
            ));
        }
        Ok(())
    }
}

/// Serde support for Duration as milliseconds
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

use anyhow::{Context, Result};
use concurrency_limiter::telemetry::{init_telemetry, TelemetryConfig};
use concurrency_limiter::{Limiter, LimiterConfig};

#[tokio::main]
async fn main() -> Result<()> {
    // Optional .env file; real environment variables take precedence
    let _ = dotenvy::dotenv();

    // Configure via environment variables:
    // - RUST_LOG or LOG_LEVEL: Log filter (default: "info")
    // - MAX_CONCURRENCY, TIME_UNIT_MS, REPORT_INTERVAL_UNITS, ...: see LimiterConfig::from_env
    init_telemetry(TelemetryConfig::from_env());

    tracing::info!("concurrency-limiter starting...");

    let config = LimiterConfig::from_env();
    let limiter = Limiter::new(config).context("Failed to create limiter")?;

    tracing::info!(
        max_concurrency = limiter.config().max_concurrency,
        seed = ?limiter.config().seed,
        "Starting limiter"
    );

    let running = limiter.start();

    // Runs until interrupted
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    tracing::info!("Received shutdown signal");

    let summary = running
        .shutdown()
        .await
        .context("Limiter did not shut down cleanly")?;

    tracing::info!(
        dispatched = summary.stats.dispatched,
        completed = summary.stats.completed,
        failed = summary.stats.failed,
        "Limiter shutdown complete"
    );
    Ok(())
}

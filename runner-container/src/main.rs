use anyhow::{Context, Result};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use etl_core::config::load_config;
use etl_core::ingestor::Ingestor;
use etl_core::telemetry::init_tracing;

/// This is the entry point for running replication on container hosting
/// services like AWS EKS, ECS, or a plain cron-driven container.
///
/// What it does at a high-level:
///     Load config (file from ETL_CONFIG_PATH, otherwise environment).
///     Without a schedule: run one replication and exit.
///     With a schedule: run on every tick until a shutdown signal is received.
///         - a retryable failure waits for the next tick
///         - a fatal failure exits non-zero
#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config_path = std::env::var("ETL_CONFIG_PATH").ok();
    let config = load_config(config_path.as_deref())
        .await
        .context("Failed to load replication config")?;
    let schedule = config.schedule.clone();
    let engine = Ingestor::new(config).context("Invalid replication config")?;

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Shutdown signal received, stopping after the current batch");
                shutdown.cancel();
            }
        }
    });

    let Some(schedule) = schedule else {
        engine
            .run_once(&shutdown)
            .await
            .context("Replication run failed")?;
        return Ok(());
    };

    info!(interval_secs = schedule.interval_secs, "Starting scheduled replication");
    let mut ticker = tokio::time::interval(Duration::from_secs(schedule.interval_secs));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("Scheduler stopped");
                return Ok(());
            }
            _ = ticker.tick() => {}
        }

        match engine.run_once(&shutdown).await {
            Ok(report) => {
                info!(
                    records_loaded = report.metrics.records_loaded,
                    watermark_advanced = report.watermark_advanced(),
                    "Replication cycle finished"
                );
            }
            Err(e) if shutdown.is_cancelled() => {
                warn!("Replication cycle interrupted: {}", e);
                return Ok(());
            }
            Err(e) if e.is_retryable() => {
                warn!(stage = e.stage(), "A transient error occurred, will retry on next tick: {}", e);
            }
            Err(e) => {
                error!(stage = e.stage(), "A fatal error occurred: {}", e);
                return Err(e).context("Replication cycle failed");
            }
        }
    }
}

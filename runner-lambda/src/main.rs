use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use lambda_runtime::{service_fn, Error, LambdaEvent};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use etl_core::config::load_config;
use etl_core::ingestor::Ingestor;
use etl_core::pipeline::RunReport;
use etl_core::telemetry::init_tracing;

/// Time left for flushing logs and returning the response after a stop.
const DEADLINE_MARGIN: Duration = Duration::from_secs(30);
const DEFAULT_MAX_RUNTIME_SECS: u64 = 840; // 14 minutes

/// How long the run may go on before it is asked to stop between batches:
/// the smaller of the requested budget and the invocation deadline minus
/// [`DEADLINE_MARGIN`].
fn run_budget(deadline_ms: u64, now_ms: u64, max_runtime_secs: Option<u64>) -> Duration {
    let requested = Duration::from_secs(max_runtime_secs.unwrap_or(DEFAULT_MAX_RUNTIME_SECS));
    let remaining = Duration::from_millis(deadline_ms.saturating_sub(now_ms));
    requested.min(remaining.saturating_sub(DEADLINE_MARGIN))
}

/// Runs one replication per invocation, typically from an EventBridge schedule.
pub async fn lambda_handler(event: LambdaEvent<ReplicationRequest>) -> Result<ReplicationResponse, Error> {
    let request = event.payload;
    let started = Instant::now();
    let now_ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default();
    let budget = run_budget(event.context.deadline, now_ms, request.max_runtime_seconds);
    let config_path = request
        .config_path
        .or_else(|| std::env::var("ETL_CONFIG_PATH").ok());

    let config = load_config(config_path.as_deref()).await?;
    let engine = Ingestor::new(config)?;

    let shutdown = CancellationToken::new();
    let timer = tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            tokio::time::sleep(budget).await;
            warn!(budget_secs = budget.as_secs(), "Run budget exhausted, stopping after the current batch");
            shutdown.cancel();
        }
    });

    let result = engine.run_once(&shutdown).await;
    timer.abort();

    let response = match result {
        Ok(report) => {
            info!(records_loaded = report.metrics.records_loaded, "Invocation finished");
            ReplicationResponse {
                status: "success".to_string(),
                records_loaded: report.metrics.records_loaded,
                report: Some(report),
                runtime_seconds: started.elapsed().as_secs_f64(),
                errors: Vec::new(),
            }
        }
        Err(e) => {
            error!(stage = e.stage(), "Invocation failed: {}", e);
            ReplicationResponse {
                status: "failed".to_string(),
                records_loaded: 0,
                report: None,
                runtime_seconds: started.elapsed().as_secs_f64(),
                errors: vec![e.to_string()],
            }
        }
    };
    Ok(response)
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    init_tracing();
    lambda_runtime::run(service_fn(lambda_handler)).await
}

#[derive(Debug, Default, Deserialize)]
pub struct ReplicationRequest {
    #[serde(default)]
    pub config_path: Option<String>,
    #[serde(default)]
    pub max_runtime_seconds: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct ReplicationResponse {
    pub status: String,
    pub records_loaded: usize,
    pub report: Option<RunReport>,
    pub runtime_seconds: f64,
    pub errors: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_budget_stops_before_deadline() {
        let now = 1_700_000_000_000;
        // 5 minutes left: stop 30 seconds early.
        assert_eq!(
            run_budget(now + 300_000, now, None),
            Duration::from_secs(270)
        );
        // 15 minutes left: the default budget wins.
        assert_eq!(
            run_budget(now + 900_000, now, None),
            Duration::from_secs(840)
        );
        assert_eq!(
            run_budget(now + 900_000, now, Some(60)),
            Duration::from_secs(60)
        );
    }

    #[test]
    fn test_budget_past_deadline_is_zero() {
        let now = 1_700_000_000_000;
        assert_eq!(run_budget(now + 10_000, now, None), Duration::ZERO);
        assert_eq!(run_budget(now - 1, now, None), Duration::ZERO);
    }

    #[test]
    fn test_request_defaults() {
        let request: ReplicationRequest = serde_json::from_str("{}").unwrap();
        assert!(request.config_path.is_none());
        assert!(request.max_runtime_seconds.is_none());
    }
}

use serde::Serialize;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "etl_core=info,runner_container=info,bootstrap=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Counters for one replication run.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct RunMetrics {
    pub pages_fetched: usize,
    pub rows_extracted: usize,
    pub rows_skipped: usize,
    pub records_loaded: usize,
    pub batches_loaded: usize,
    pub elapsed_ms: u64,
}

impl RunMetrics {
    pub fn avg_batch_size(&self) -> f64 {
        if self.batches_loaded == 0 {
            0.0
        } else {
            self.records_loaded as f64 / self.batches_loaded as f64
        }
    }
}

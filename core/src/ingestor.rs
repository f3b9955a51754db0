use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::EtlConfig;
use crate::errors;
use crate::pipeline::{Pipeline, PipelineOptions, RunReport};
use crate::sink::clickhouse::ClickHouseSink;
use crate::source::postgres::PostgresSource;
use crate::watermark::FileWatermarkStore;

/// Wires configuration to concrete clients, one set per run.
///
/// Connections are never shared between runs: every call to
/// [`Ingestor::run_once`] opens its own source connection and sink client
/// and drops them when the run ends, whatever the outcome.
pub struct Ingestor {
    config: EtlConfig,
}

impl Ingestor {
    pub fn new(config: EtlConfig) -> errors::Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    /// Runs a single extract-batch-load-commit cycle.
    /// This is the main unit of work to be called by a runner.
    pub async fn run_once(&self, shutdown: &CancellationToken) -> errors::Result<RunReport> {
        let store = FileWatermarkStore::new(&self.config.processing.watermark_path);
        let source = PostgresSource::connect(&self.config.source).await?;
        let sink = ClickHouseSink::new(&self.config.sink);

        let mut pipeline = Pipeline::new(
            source,
            sink,
            store,
            PipelineOptions::from(&self.config.processing),
        );
        let result = pipeline.run_once(shutdown).await;

        drop(pipeline);
        info!("Source connection and sink client released");
        result
    }
}

//! Run orchestration: extract → batch → load → commit watermark.
//!
//! A run walks `Init → LoadingWatermark → Streaming → (LoadingBatch)* →
//! Finalizing → Done`, or ends in `Failed`. Batches are loaded one at a
//! time in extraction order. The watermark is written at most once, after
//! the last batch has been accepted by the sink, so a failed or interrupted
//! run always restarts from the previously persisted value.

use std::time::Instant;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::batch::{Batch, BatchAccumulator};
use crate::config::ProcessingConfig;
use crate::errors::{EtlError, Result};
use crate::record::ChangeRecord;
use crate::sink::SinkLoader;
use crate::source::{ChangeSource, ExtractRequest, SelectionPolicy};
use crate::telemetry::RunMetrics;
use crate::watermark::{Watermark, WatermarkStore};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    #[default]
    Init,
    LoadingWatermark,
    Streaming,
    LoadingBatch,
    Finalizing,
    Done,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineOptions {
    pub batch_size: usize,
    pub page_size: usize,
    pub policy: SelectionPolicy,
}

impl From<&ProcessingConfig> for PipelineOptions {
    fn from(config: &ProcessingConfig) -> Self {
        Self {
            batch_size: config.batch_size,
            page_size: config.page_size,
            policy: config.selection_policy,
        }
    }
}

/// Outcome of a successful run.
#[derive(Debug, Default, Clone, Serialize)]
pub struct RunReport {
    pub state: PipelineState,
    /// Watermark the run started from.
    pub watermark_before: Option<Watermark>,
    /// Watermark stored when the run ended.
    pub watermark_after: Option<Watermark>,
    pub metrics: RunMetrics,
}

impl RunReport {
    pub fn watermark_advanced(&self) -> bool {
        self.watermark_after != self.watermark_before
    }
}

/// Sequences one replication run over a source, a sink and a watermark
/// store that it owns for its whole lifetime.
pub struct Pipeline<S, K, W> {
    source: S,
    sink: K,
    store: W,
    options: PipelineOptions,
    state: PipelineState,
}

impl<S, K, W> Pipeline<S, K, W>
where
    S: ChangeSource,
    K: SinkLoader,
    W: WatermarkStore,
{
    pub fn new(source: S, sink: K, store: W, options: PipelineOptions) -> Self {
        Self {
            source,
            sink,
            store,
            options,
            state: PipelineState::Init,
        }
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn into_parts(self) -> (S, K, W) {
        (self.source, self.sink, self.store)
    }

    /// Runs one extraction to completion.
    ///
    /// `shutdown` is honoured between batch loads: once cancelled, no further
    /// batch is written and the run fails with [`EtlError::Interrupted`]
    /// without touching the watermark.
    pub async fn run_once(&mut self, shutdown: &CancellationToken) -> Result<RunReport> {
        let started = Instant::now();
        self.state = PipelineState::Init;
        info!(
            batch_size = self.options.batch_size,
            policy = %self.options.policy,
            "Starting replication run"
        );

        let mut report = RunReport::default();
        let result = self.execute(shutdown, &mut report).await;
        report.metrics.elapsed_ms = started.elapsed().as_millis() as u64;

        // Releases the server-side cursor when the run stopped mid-extraction.
        if let Err(e) = self.source.close().await {
            warn!("Failed to close extraction: {}", e);
        }

        match result {
            Ok(()) => {
                self.transition(PipelineState::Done);
                report.state = PipelineState::Done;
                info!(
                    records_loaded = report.metrics.records_loaded,
                    batches_loaded = report.metrics.batches_loaded,
                    rows_skipped = report.metrics.rows_skipped,
                    avg_batch_size = report.metrics.avg_batch_size(),
                    watermark = ?report.watermark_after.map(|w| w.to_canonical()),
                    "Replication completed: processed {} records in {:.2} seconds",
                    report.metrics.records_loaded,
                    started.elapsed().as_secs_f64()
                );
                Ok(report)
            }
            Err(e) => {
                let stage = self.state;
                self.transition(PipelineState::Failed);
                error!(
                    stage = ?stage,
                    component = e.stage(),
                    records_loaded = report.metrics.records_loaded,
                    batches_loaded = report.metrics.batches_loaded,
                    rows_skipped = report.metrics.rows_skipped,
                    watermark = ?report.watermark_before.map(|w| w.to_canonical()),
                    "Replication run failed, watermark not advanced: {}", e
                );
                Err(e)
            }
        }
    }

    async fn execute(&mut self, shutdown: &CancellationToken, report: &mut RunReport) -> Result<()> {
        self.sink.prepare().await?;

        self.transition(PipelineState::LoadingWatermark);
        let since = self.store.load().await;
        report.watermark_before = since;
        report.watermark_after = since;
        info!(watermark = ?since.map(|w| w.to_canonical()), "Loaded last watermark");

        self.transition(PipelineState::Streaming);
        let request = ExtractRequest {
            since,
            policy: self.options.policy,
            page_size: self.options.page_size,
        };
        self.source.open(&request).await?;

        let mut accumulator = BatchAccumulator::new(self.options.batch_size);
        // Highest `updated_at` of a batch the sink has accepted.
        let mut committed: Option<Watermark> = None;
        let mut newest_seen: Option<Watermark> = None;

        loop {
            if shutdown.is_cancelled() {
                return Err(EtlError::Interrupted {
                    batches_loaded: report.metrics.batches_loaded,
                });
            }

            let page = self.source.next_page().await?;
            if page.is_empty() {
                break;
            }
            report.metrics.pages_fetched += 1;
            report.metrics.rows_extracted += page.len();
            debug!(rows = page.len(), page = report.metrics.pages_fetched, "Fetched page");

            for row in page {
                let record = match ChangeRecord::try_from(row) {
                    Ok(record) => record,
                    Err(e) => {
                        report.metrics.rows_skipped += 1;
                        warn!(skipped = report.metrics.rows_skipped, "Skipping malformed row: {}", e);
                        continue;
                    }
                };

                let observed = record.watermark();
                if newest_seen.is_some_and(|newest| observed < newest) {
                    warn!(
                        id = record.id,
                        updated_at = %observed,
                        "Source returned a row out of updated_at order"
                    );
                }
                newest_seen = newest_seen.max(Some(observed));

                if let Some(batch) = accumulator.accept(record) {
                    self.load_batch(&batch, shutdown, &mut report.metrics).await?;
                    committed = batch.high_water();
                }
            }
        }
        self.source.close().await?;

        if let Some(batch) = accumulator.flush_remainder() {
            self.load_batch(&batch, shutdown, &mut report.metrics).await?;
            committed = batch.high_water();
        }

        self.transition(PipelineState::Finalizing);
        match committed {
            Some(candidate)
                if report.metrics.records_loaded > 0
                    && since.is_none_or(|previous| candidate > previous) =>
            {
                self.store.save(&candidate).await?;
                report.watermark_after = Some(candidate);
                info!(watermark = %candidate, "Updated watermark saved");
            }
            Some(candidate) => {
                debug!(
                    candidate = %candidate,
                    "Candidate watermark is not newer than the stored one, leaving it unchanged"
                );
            }
            None => info!("No new records, watermark unchanged"),
        }
        Ok(())
    }

    async fn load_batch(
        &mut self,
        batch: &Batch,
        shutdown: &CancellationToken,
        metrics: &mut RunMetrics,
    ) -> Result<()> {
        if shutdown.is_cancelled() {
            return Err(EtlError::Interrupted {
                batches_loaded: metrics.batches_loaded,
            });
        }

        self.transition(PipelineState::LoadingBatch);
        self.sink.load(batch).await?;
        metrics.records_loaded += batch.len();
        metrics.batches_loaded += 1;
        info!(
            batch = metrics.batches_loaded,
            total = metrics.records_loaded,
            "Successfully inserted {} rows",
            batch.len()
        );
        self.transition(PipelineState::Streaming);
        Ok(())
    }

    fn transition(&mut self, next: PipelineState) {
        debug!(from = ?self.state, to = ?next, "Pipeline state transition");
        self.state = next;
    }
}

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, TimeZone, Utc};
use tokio_util::sync::CancellationToken;

use etl_core::batch::Batch;
use etl_core::errors::{CheckpointError, SinkError, SourceError};
use etl_core::record::{ChangeRecord, RawRow};
use etl_core::sink::SinkLoader;
use etl_core::source::{ChangeSource, ExtractRequest};
use etl_core::watermark::{FileWatermarkStore, Watermark, WatermarkStore};

pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap()
}

pub fn at(offset_secs: i64) -> DateTime<Utc> {
    t0() + Duration::seconds(offset_secs)
}

pub fn pg_text(at: DateTime<Utc>) -> String {
    at.naive_utc().format("%Y-%m-%d %H:%M:%S%.6f").to_string()
}

/// A tombstoned row updated `offset_secs` after `t0()`.
pub fn tombstone(id: i64, offset_secs: i64) -> RawRow {
    let updated = pg_text(at(offset_secs));
    RawRow {
        id: Some(id),
        customer_id: Some(1000 + id),
        last_status: Some("CANCELLED".to_string()),
        pos_origin: Some("JKT".to_string()),
        pos_destination: Some("SBY".to_string()),
        created_at: Some(pg_text(t0() - Duration::days(30))),
        updated_at: Some(updated.clone()),
        deleted_at: Some(updated),
    }
}

/// A live (not deleted) row updated `offset_secs` after `t0()`.
pub fn live(id: i64, offset_secs: i64) -> RawRow {
    RawRow {
        deleted_at: None,
        last_status: Some("SHIPPED".to_string()),
        ..tombstone(id, offset_secs)
    }
}

/// In-memory source that pages rows the way the PostgreSQL cursor does.
pub struct MemorySource {
    rows: Vec<RawRow>,
    pending: Option<VecDeque<RawRow>>,
    page_size: usize,
    fail_open: bool,
    fail_on_page: Option<usize>,
    pages_served: usize,
    pub requests: Vec<ExtractRequest>,
}

impl MemorySource {
    pub fn new(rows: Vec<RawRow>) -> Self {
        Self {
            rows,
            pending: None,
            page_size: 0,
            fail_open: false,
            fail_on_page: None,
            pages_served: 0,
            requests: Vec::new(),
        }
    }

    pub fn failing_open(mut self) -> Self {
        self.fail_open = true;
        self
    }

    /// Fails the `page`-th fetch (1-based).
    pub fn failing_on_page(mut self, page: usize) -> Self {
        self.fail_on_page = Some(page);
        self
    }

    pub fn is_open(&self) -> bool {
        self.pending.is_some()
    }
}

impl ChangeSource for MemorySource {
    async fn open(&mut self, request: &ExtractRequest) -> Result<(), SourceError> {
        if self.fail_open {
            return Err(SourceError::Connection {
                reason: "connection refused".to_string(),
            });
        }
        self.requests.push(request.clone());

        let parse = |row: &RawRow| {
            row.updated_at
                .as_deref()
                .and_then(|text| Watermark::parse(text).ok())
        };

        // Unparseable timestamps behave like `infinity`: newer than anything.
        let mut selected: Vec<RawRow> = self
            .rows
            .iter()
            .filter(|row| request.policy.accepts(row))
            .filter(|row| match (request.since, parse(row)) {
                (Some(since), Some(updated)) => updated > since,
                _ => true,
            })
            .cloned()
            .collect();
        selected.sort_by_key(|row| (parse(row).is_none(), parse(row)));

        self.page_size = request.page_size;
        self.pages_served = 0;
        self.pending = Some(selected.into());
        Ok(())
    }

    async fn next_page(&mut self) -> Result<Vec<RawRow>, SourceError> {
        self.pages_served += 1;
        if self.fail_on_page == Some(self.pages_served) {
            return Err(SourceError::Query {
                reason: "server closed the connection unexpectedly".to_string(),
            });
        }

        let page_size = self.page_size;
        let pending = self.pending.as_mut().ok_or(SourceError::NotOpen)?;
        let take = page_size.min(pending.len());
        Ok(pending.drain(..take).collect())
    }

    async fn close(&mut self) -> Result<(), SourceError> {
        self.pending = None;
        Ok(())
    }
}

/// Contents of the fake sink, shared across runs.
#[derive(Debug, Default)]
pub struct SinkState {
    /// Resolved view, as a ReplacingMergeTree exposes after merges.
    pub table: HashMap<u64, ChangeRecord>,
    pub loads: Vec<usize>,
    pub prepared: usize,
}

pub type SharedSink = Arc<Mutex<SinkState>>;

pub fn shared_sink() -> SharedSink {
    Arc::new(Mutex::new(SinkState::default()))
}

/// Identity-keyed sink where the greatest `updated_at` wins.
pub struct MemorySink {
    state: SharedSink,
    calls: AtomicUsize,
    fail_on_load: Option<usize>,
    cancel_after_load: Option<(usize, CancellationToken)>,
}

impl MemorySink {
    pub fn new(state: SharedSink) -> Self {
        Self {
            state,
            calls: AtomicUsize::new(0),
            fail_on_load: None,
            cancel_after_load: None,
        }
    }

    /// Rejects the `load`-th batch (1-based).
    pub fn failing_on_load(mut self, load: usize) -> Self {
        self.fail_on_load = Some(load);
        self
    }

    /// Cancels `token` right after the `load`-th batch is written.
    pub fn cancelling_after_load(mut self, load: usize, token: CancellationToken) -> Self {
        self.cancel_after_load = Some((load, token));
        self
    }
}

impl SinkLoader for MemorySink {
    async fn prepare(&self) -> Result<(), SinkError> {
        self.state.lock().unwrap().prepared += 1;
        Ok(())
    }

    async fn load(&self, batch: &Batch) -> Result<(), SinkError> {
        if batch.is_empty() {
            return Ok(());
        }

        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if self.fail_on_load == Some(call) {
            return Err(SinkError::Write {
                table: "retail_transaction".to_string(),
                rows: batch.len(),
                reason: "Code: 252. DB::Exception: Too many parts".to_string(),
            });
        }

        let mut state = self.state.lock().unwrap();
        for record in batch.records() {
            match state.table.get(&record.id) {
                Some(existing) if existing.updated_at > record.updated_at => {}
                _ => {
                    state.table.insert(record.id, record.clone());
                }
            }
        }
        state.loads.push(batch.len());
        drop(state);

        if let Some((after, token)) = &self.cancel_after_load {
            if *after == call {
                token.cancel();
            }
        }
        Ok(())
    }
}

/// Reads like a file store but every save fails.
pub struct ReadOnlyStore(pub FileWatermarkStore);

impl WatermarkStore for ReadOnlyStore {
    async fn load(&self) -> Option<Watermark> {
        self.0.load().await
    }

    async fn save(&self, _watermark: &Watermark) -> Result<(), CheckpointError> {
        Err(CheckpointError::Write {
            path: self.0.path().to_path_buf(),
            reason: "Read-only file system (os error 30)".to_string(),
        })
    }
}

pub fn file_store(dir: &Path) -> FileWatermarkStore {
    FileWatermarkStore::new(dir.join("etl_watermark.json"))
}

//! ClickHouse sink.
//!
//! Rows are inserted over HTTP with `RowBinary` encoding into a
//! `ReplacingMergeTree(updated_at)` table ordered by `id`. Background merges
//! keep the version with the greatest `updated_at` per identity, so loading
//! the same record twice is harmless. Timestamps are `DateTime64(6)` and are
//! written as microseconds since the epoch, the same precision the
//! watermark uses.

use clickhouse::{Client, Row};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::batch::Batch;
use crate::config::ClickHouseOptions;
use crate::errors::SinkError;
use crate::record::ChangeRecord;
use crate::sink::SinkLoader;

/// Target table definition.
pub fn create_table_ddl(table: &str) -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {table} (
    id UInt64,
    customer_id UInt64,
    last_status String,
    pos_origin String,
    pos_destination String,
    created_at DateTime64(6),
    updated_at DateTime64(6),
    deleted_at Nullable(DateTime64(6))
) ENGINE = ReplacingMergeTree(updated_at)
ORDER BY (id)"
    )
}

/// Column-ordered wire row. Field order must match the table definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Row)]
pub struct TransactionRow {
    pub id: u64,
    pub customer_id: u64,
    pub last_status: String,
    pub pos_origin: String,
    pub pos_destination: String,
    pub created_at: i64,
    pub updated_at: i64,
    pub deleted_at: Option<i64>,
}

impl From<&ChangeRecord> for TransactionRow {
    fn from(record: &ChangeRecord) -> Self {
        Self {
            id: record.id,
            customer_id: record.attributes.customer_id,
            last_status: record.attributes.last_status.clone(),
            pos_origin: record.attributes.pos_origin.clone(),
            pos_destination: record.attributes.pos_destination.clone(),
            created_at: record.created_at.timestamp_micros(),
            updated_at: record.updated_at.timestamp_micros(),
            deleted_at: record.deleted_at.map(|at| at.timestamp_micros()),
        }
    }
}

pub struct ClickHouseSink {
    client: Client,
    table: String,
}

impl ClickHouseSink {
    pub fn new(options: &ClickHouseOptions) -> Self {
        let mut client = Client::default()
            .with_url(options.url())
            .with_database(&options.database)
            .with_user(&options.user)
            // DateTime64 columns are written as raw Int64 ticks.
            .with_validation(false);
        if let Some(password) = &options.password {
            client = client.with_password(password);
        }

        info!(url = %options.url(), database = %options.database, "ClickHouse client created successfully");
        Self {
            client,
            table: options.table.clone(),
        }
    }
}

impl SinkLoader for ClickHouseSink {
    async fn prepare(&self) -> Result<(), SinkError> {
        self.client
            .query(&create_table_ddl(&self.table))
            .execute()
            .await
            .map_err(|e| SinkError::TableCreation {
                table: self.table.clone(),
                reason: e.to_string(),
            })?;

        info!(table = %self.table, "ClickHouse table setup completed (ReplacingMergeTree)");
        Ok(())
    }

    async fn load(&self, batch: &Batch) -> Result<(), SinkError> {
        if batch.is_empty() {
            debug!(table = %self.table, "Skipping empty batch");
            return Ok(());
        }

        let write_err =
            |e: clickhouse::error::Error| classify_write_error(&self.table, batch.len(), e.to_string());

        let mut insert = self
            .client
            .insert::<TransactionRow>(&self.table)
            .await
            .map_err(|e| SinkError::Connection {
                reason: format!("Failed to begin insert: {}", e),
            })?;

        for record in batch.records() {
            insert
                .write(&TransactionRow::from(record))
                .await
                .map_err(write_err)?;
        }
        insert.end().await.map_err(write_err)?;

        debug!(table = %self.table, rows = batch.len(), "Inserted batch");
        Ok(())
    }
}

/// Errors carrying a server exception code mean ClickHouse refused the rows;
/// anything else is a transport failure.
fn classify_write_error(table: &str, rows: usize, reason: String) -> SinkError {
    if reason.contains("DB::Exception") {
        SinkError::Rejected {
            table: table.to_string(),
            rows,
            reason,
        }
    } else {
        SinkError::Write {
            table: table.to_string(),
            rows,
            reason,
        }
    }
}

//! PostgreSQL change source.
//!
//! Rows are read through a server-side cursor declared inside a
//! `REPEATABLE READ` read-only transaction, so the whole extraction sees one
//! snapshot while only `page_size` rows are held in memory at a time.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_postgres::{Client, NoTls, Row};
use tracing::{debug, error, info, warn};

use crate::config::PostgresOptions;
use crate::errors::SourceError;
use crate::record::RawRow;
use crate::source::{ChangeSource, ExtractRequest, SelectionPolicy};

const CURSOR_NAME: &str = "etl_cursor";

/// Run once per connection. Timestamps are read as text, so both the zone
/// and the output format must be fixed regardless of server defaults.
pub const SESSION_SETUP: &str = "SET TIME ZONE 'UTC'; SET DateStyle = 'ISO, YMD'";

/// Identities are widened to `bigint` and timestamps cast to text so decoding
/// does not depend on the exact column types (`serial` vs `bigint`,
/// `timestamp` vs `timestamptz`).
const SELECT_COLUMNS: &str = "id::bigint, customer_id::bigint, last_status::text, \
     pos_origin::text, pos_destination::text, created_at::text, updated_at::text, \
     deleted_at::text";

/// Builds the extraction query. `$1` is bound to the watermark when
/// `incremental` is set.
pub fn build_select(table: &str, policy: SelectionPolicy, incremental: bool) -> String {
    let mut conditions = Vec::new();
    if incremental {
        conditions.push("updated_at > $1::text::timestamp");
    }
    if let Some(predicate) = policy.predicate() {
        conditions.push(predicate);
    }

    let mut sql = format!("SELECT {} FROM {}", SELECT_COLUMNS, table);
    if !conditions.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&conditions.join(" AND "));
    }
    sql.push_str(" ORDER BY updated_at");
    sql
}

pub struct PostgresSource {
    client: Client,
    connection: JoinHandle<()>,
    table: String,
    /// `FETCH` statement of the open extraction.
    fetch_query: Option<String>,
}

impl PostgresSource {
    pub async fn connect(options: &PostgresOptions) -> Result<Self, SourceError> {
        let mut config = tokio_postgres::Config::new();
        config
            .host(&options.host)
            .port(options.port)
            .dbname(&options.database)
            .user(&options.user)
            .application_name("watermark-etl");
        if let Some(password) = &options.password {
            config.password(password);
        }
        if let Some(timeout) = options.connect_timeout_secs {
            config.connect_timeout(Duration::from_secs(timeout));
        }

        let (client, connection) =
            config
                .connect(NoTls)
                .await
                .map_err(|e| SourceError::Connection {
                    reason: e.to_string(),
                })?;

        // Spawn the connection handler
        let connection = tokio::spawn(async move {
            if let Err(e) = connection.await {
                error!("PostgreSQL connection error: {}", e);
            }
        });

        if let Err(e) = client.batch_execute(SESSION_SETUP).await {
            connection.abort();
            return Err(SourceError::Connection {
                reason: e.to_string(),
            });
        }

        info!(
            host = %options.host,
            database = %options.database,
            "PostgreSQL connection established successfully"
        );

        Ok(Self {
            client,
            connection,
            table: options.table.clone(),
            fetch_query: None,
        })
    }

    async fn rollback(&self) {
        if let Err(e) = self.client.batch_execute("ROLLBACK").await {
            warn!("ROLLBACK failed: {}", e);
        }
    }
}

impl ChangeSource for PostgresSource {
    async fn open(&mut self, request: &ExtractRequest) -> Result<(), SourceError> {
        if self.fetch_query.is_some() {
            self.close().await?;
        }

        self.client
            .batch_execute("BEGIN TRANSACTION ISOLATION LEVEL REPEATABLE READ READ ONLY")
            .await
            .map_err(|e| SourceError::Query {
                reason: format!("BEGIN failed: {e}"),
            })?;

        let select = build_select(&self.table, request.policy, request.since.is_some());
        let declare = format!("DECLARE {} NO SCROLL CURSOR FOR {}", CURSOR_NAME, select);
        let declared = match &request.since {
            Some(since) => {
                let literal = since.to_source_literal();
                self.client.execute(declare.as_str(), &[&literal]).await
            }
            None => self.client.execute(declare.as_str(), &[]).await,
        };
        if let Err(e) = declared {
            self.rollback().await;
            return Err(SourceError::Query {
                reason: format!("DECLARE CURSOR failed: {e}"),
            });
        }

        debug!(
            table = %self.table,
            policy = %request.policy,
            since = ?request.since.map(|s| s.to_canonical()),
            page_size = request.page_size,
            "Extraction cursor declared"
        );
        self.fetch_query = Some(format!(
            "FETCH {} FROM {}",
            request.page_size.max(1),
            CURSOR_NAME
        ));
        Ok(())
    }

    async fn next_page(&mut self) -> Result<Vec<RawRow>, SourceError> {
        let fetch = self.fetch_query.as_deref().ok_or(SourceError::NotOpen)?;
        let rows = self
            .client
            .query(fetch, &[])
            .await
            .map_err(|e| SourceError::Query {
                reason: format!("FETCH failed for {}: {e}", self.table),
            })?;

        rows.iter().map(raw_row).collect()
    }

    async fn close(&mut self) -> Result<(), SourceError> {
        if self.fetch_query.take().is_none() {
            return Ok(());
        }

        let close_query = format!("CLOSE {CURSOR_NAME}");
        if let Err(e) = self.client.batch_execute(&close_query).await {
            warn!(
                "Cursor CLOSE failed for {}: {} (transaction end will close it)",
                self.table, e
            );
        }
        self.client
            .batch_execute("COMMIT")
            .await
            .map_err(|e| SourceError::Query {
                reason: format!("COMMIT failed: {e}"),
            })
    }
}

impl Drop for PostgresSource {
    fn drop(&mut self) {
        self.connection.abort();
        debug!("PostgreSQL connection closed");
    }
}

fn raw_row(row: &Row) -> Result<RawRow, SourceError> {
    let decode_err = |e: tokio_postgres::Error| SourceError::Query {
        reason: format!("unexpected column type: {e}"),
    };

    Ok(RawRow {
        id: row.try_get(0).map_err(decode_err)?,
        customer_id: row.try_get(1).map_err(decode_err)?,
        last_status: row.try_get(2).map_err(decode_err)?,
        pos_origin: row.try_get(3).map_err(decode_err)?,
        pos_destination: row.try_get(4).map_err(decode_err)?,
        created_at: row.try_get(5).map_err(decode_err)?,
        updated_at: row.try_get(6).map_err(decode_err)?,
        deleted_at: row.try_get(7).map_err(decode_err)?,
    })
}

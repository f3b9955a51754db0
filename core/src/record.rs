//! Change records and the raw rows they are decoded from.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::RowError;
use crate::watermark::Watermark;

/// Mutable business attributes of a retail transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionAttributes {
    pub customer_id: u64,
    pub last_status: String,
    pub pos_origin: String,
    pub pos_destination: String,
}

/// One changed source record, immutable once decoded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub id: u64,
    pub attributes: TransactionAttributes,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Tombstone. `None` means the record is not deleted.
    pub deleted_at: Option<DateTime<Utc>>,
}

impl ChangeRecord {
    pub fn is_tombstone(&self) -> bool {
        self.deleted_at.is_some()
    }

    pub fn watermark(&self) -> Watermark {
        Watermark::new(self.updated_at)
    }
}

/// A row as returned by the source, before validation. Timestamps are kept
/// as the text the source produced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawRow {
    pub id: Option<i64>,
    pub customer_id: Option<i64>,
    pub last_status: Option<String>,
    pub pos_origin: Option<String>,
    pub pos_destination: Option<String>,
    pub created_at: Option<String>,
    pub updated_at: Option<String>,
    pub deleted_at: Option<String>,
}

impl TryFrom<RawRow> for ChangeRecord {
    type Error = RowError;

    fn try_from(row: RawRow) -> Result<Self, Self::Error> {
        Ok(ChangeRecord {
            id: unsigned("id", row.id)?,
            attributes: TransactionAttributes {
                customer_id: unsigned("customer_id", row.customer_id)?,
                last_status: required("last_status", row.last_status)?,
                pos_origin: required("pos_origin", row.pos_origin)?,
                pos_destination: required("pos_destination", row.pos_destination)?,
            },
            created_at: timestamp("created_at", required("created_at", row.created_at)?)?,
            updated_at: timestamp("updated_at", required("updated_at", row.updated_at)?)?,
            deleted_at: row
                .deleted_at
                .map(|value| timestamp("deleted_at", value))
                .transpose()?,
        })
    }
}

fn required<T>(field: &'static str, value: Option<T>) -> Result<T, RowError> {
    value.ok_or(RowError::MissingField { field })
}

fn unsigned(field: &'static str, value: Option<i64>) -> Result<u64, RowError> {
    let value = required(field, value)?;
    u64::try_from(value).map_err(|_| RowError::OutOfRange { field, value })
}

fn timestamp(field: &'static str, value: String) -> Result<DateTime<Utc>, RowError> {
    match Watermark::parse(&value) {
        Ok(parsed) => Ok(parsed.as_datetime()),
        Err(_) => Err(RowError::InvalidTimestamp { field, value }),
    }
}

pub mod postgres;

use std::fmt;
use std::future::Future;

use serde::{Deserialize, Serialize};

use crate::errors::SourceError;
use crate::record::RawRow;
use crate::watermark::Watermark;

/// Which source records are eligible for replication.
///
/// `TombstonesOnly` selects only rows with a `deleted_at`, for both the full
/// and the incremental load, so live updates are never replicated.
/// `AllChanges` lifts that restriction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionPolicy {
    #[default]
    TombstonesOnly,
    AllChanges,
}

impl SelectionPolicy {
    /// SQL condition added to the extraction query, if any.
    pub fn predicate(&self) -> Option<&'static str> {
        match self {
            SelectionPolicy::TombstonesOnly => Some("deleted_at IS NOT NULL"),
            SelectionPolicy::AllChanges => None,
        }
    }

    /// Row-level equivalent of [`SelectionPolicy::predicate`].
    pub fn accepts(&self, row: &RawRow) -> bool {
        match self {
            SelectionPolicy::TombstonesOnly => row.deleted_at.is_some(),
            SelectionPolicy::AllChanges => true,
        }
    }
}

impl fmt::Display for SelectionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SelectionPolicy::TombstonesOnly => f.write_str("tombstones_only"),
            SelectionPolicy::AllChanges => f.write_str("all_changes"),
        }
    }
}

impl std::str::FromStr for SelectionPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "tombstones_only" => Ok(SelectionPolicy::TombstonesOnly),
            "all_changes" => Ok(SelectionPolicy::AllChanges),
            other => Err(format!("unknown selection policy '{}'", other)),
        }
    }
}

/// Parameters of one extraction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractRequest {
    /// Exclusive lower bound on `updated_at`. `None` means a full load.
    pub since: Option<Watermark>,
    pub policy: SelectionPolicy,
    pub page_size: usize,
}

/// A relational source that can stream changed rows ordered by `updated_at`.
///
/// One extraction is `open`, then `next_page` until it returns an empty
/// page, then `close`. Pages are fetched server-side so memory stays bounded
/// by `page_size`.
pub trait ChangeSource {
    fn open(
        &mut self,
        request: &ExtractRequest,
    ) -> impl Future<Output = Result<(), SourceError>> + Send;

    /// Next page of rows in non-decreasing `updated_at` order. An empty page
    /// means the extraction is exhausted.
    fn next_page(&mut self) -> impl Future<Output = Result<Vec<RawRow>, SourceError>> + Send;

    /// Ends the extraction and releases server-side resources. Safe to call
    /// when nothing is open.
    fn close(&mut self) -> impl Future<Output = Result<(), SourceError>> + Send;
}

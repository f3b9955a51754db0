//! High-water mark persistence.
//!
//! The watermark is the `updated_at` of the newest record known to be durably
//! replicated. It is stored as `{ "last_updated_at": "<timestamp>" }` using a
//! canonical RFC 3339 encoding: UTC, `Z` suffix, exactly six fractional digits
//! (`2024-03-01T12:00:00.250000Z`). All watermarks are truncated to
//! microseconds on construction so the encoding round-trips exactly.

use std::cmp::Ordering;
use std::fmt;
use std::future::Future;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::{DateTime, NaiveDateTime, SecondsFormat, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::errors::{CheckpointError, SerializationError};

/// Formats accepted for legacy checkpoints, which were written as the
/// `str()` of a datetime (`2024-01-01 12:00:00.123456`, optionally with an
/// offset).
const LEGACY_NAIVE_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.f";
const LEGACY_OFFSET_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.f%#z";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Watermark(DateTime<Utc>);

impl Watermark {
    pub fn new(at: DateTime<Utc>) -> Self {
        Self(at.trunc_subsecs(6))
    }

    pub fn as_datetime(&self) -> DateTime<Utc> {
        self.0
    }

    /// Canonical text stored in the checkpoint file.
    pub fn to_canonical(&self) -> String {
        self.0.to_rfc3339_opts(SecondsFormat::Micros, true)
    }

    /// Literal bound into the source query. The source session runs in UTC,
    /// so a naive timestamp compares correctly against both `timestamp` and
    /// `timestamptz` columns.
    pub fn to_source_literal(&self) -> String {
        self.0.naive_utc().format("%Y-%m-%d %H:%M:%S%.6f").to_string()
    }

    /// Parse either the canonical encoding or the text PostgreSQL emits for
    /// `timestamp` / `timestamptz` values cast to text.
    pub fn parse(value: &str) -> Result<Self, SerializationError> {
        let trimmed = value.trim();
        if let Ok(at) = DateTime::parse_from_rfc3339(trimmed) {
            return Ok(Self::new(at.with_timezone(&Utc)));
        }
        if let Ok(at) = DateTime::parse_from_str(trimmed, LEGACY_OFFSET_FORMAT) {
            return Ok(Self::new(at.with_timezone(&Utc)));
        }
        NaiveDateTime::parse_from_str(trimmed, LEGACY_NAIVE_FORMAT)
            .map(|naive| Self::new(naive.and_utc()))
            .map_err(|e| SerializationError::Timestamp {
                value: value.to_string(),
                reason: e.to_string(),
            })
    }
}

impl From<DateTime<Utc>> for Watermark {
    fn from(at: DateTime<Utc>) -> Self {
        Self::new(at)
    }
}

impl FromStr for Watermark {
    type Err = SerializationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl PartialOrd for Watermark {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Watermark {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.cmp(&other.0)
    }
}

impl fmt::Display for Watermark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_canonical())
    }
}

impl Serialize for Watermark {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_canonical())
    }
}

impl<'de> Deserialize<'de> for Watermark {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        Watermark::parse(&text).map_err(serde::de::Error::custom)
    }
}

/// Persists the single checkpoint value of the pipeline.
pub trait WatermarkStore {
    /// Returns the stored watermark, or `None` when there is none or it
    /// cannot be read. Read problems are logged, never returned.
    fn load(&self) -> impl Future<Output = Option<Watermark>> + Send;

    /// Replaces the stored watermark. Either the old or the new value must
    /// remain readable if the process dies mid-write.
    fn save(&self, watermark: &Watermark) -> impl Future<Output = Result<(), CheckpointError>> + Send;
}

#[derive(Debug, Serialize, Deserialize)]
struct CheckpointFile {
    last_updated_at: Option<Watermark>,
}

/// Watermark stored in a small JSON file.
#[derive(Debug, Clone)]
pub struct FileWatermarkStore {
    path: PathBuf,
}

impl FileWatermarkStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }

    fn read(&self) -> Result<Option<Watermark>, CheckpointError> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(CheckpointError::Read {
                    path: self.path.clone(),
                    reason: e.to_string(),
                });
            }
        };

        let file: CheckpointFile =
            serde_json::from_str(&content).map_err(|e| CheckpointError::Corrupted {
                path: self.path.clone(),
                reason: e.to_string(),
            })?;
        Ok(file.last_updated_at)
    }

    fn write(&self, watermark: &Watermark) -> Result<(), CheckpointError> {
        let write_err = |e: std::io::Error| CheckpointError::Write {
            path: self.path.clone(),
            reason: e.to_string(),
        };

        let content = serde_json::to_string_pretty(&CheckpointFile {
            last_updated_at: Some(*watermark),
        })
        .map_err(|e| CheckpointError::Write {
            path: self.path.clone(),
            reason: e.to_string(),
        })?;

        // Write to temp file first, then rename over the old checkpoint.
        let temp_path = self.temp_path();
        {
            let mut file = std::fs::File::create(&temp_path).map_err(write_err)?;
            file.write_all(content.as_bytes()).map_err(write_err)?;
            file.sync_all().map_err(write_err)?;
        }
        std::fs::rename(&temp_path, &self.path).map_err(write_err)?;
        Ok(())
    }
}

impl WatermarkStore for FileWatermarkStore {
    async fn load(&self) -> Option<Watermark> {
        match self.read() {
            Ok(watermark) => watermark,
            Err(e) => {
                warn!(
                    path = %self.path.display(),
                    "Ignoring unreadable watermark, falling back to a full load: {}", e
                );
                None
            }
        }
    }

    async fn save(&self, watermark: &Watermark) -> Result<(), CheckpointError> {
        self.write(watermark)?;
        info!(path = %self.path.display(), watermark = %watermark, "Watermark saved");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn ts(s: &str) -> Watermark {
        Watermark::parse(s).unwrap()
    }

    #[test]
    fn test_canonical_encoding_keeps_microseconds() {
        let at = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
            + chrono::Duration::microseconds(250_001);
        let watermark = Watermark::new(at);
        assert_eq!(watermark.to_canonical(), "2024-03-01T12:00:00.250001Z");
        assert_eq!(Watermark::parse(&watermark.to_canonical()).unwrap(), watermark);
    }

    #[test]
    fn test_nanoseconds_are_truncated() {
        let at = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
            + chrono::Duration::nanoseconds(1_999);
        assert_eq!(
            Watermark::new(at).to_canonical(),
            "2024-03-01T12:00:00.000001Z"
        );
    }

    #[test]
    fn test_parse_postgres_text() {
        assert_eq!(
            ts("2024-01-05 08:30:00.5"),
            ts("2024-01-05T08:30:00.500000Z")
        );
        assert_eq!(ts("2024-01-05 08:30:00"), ts("2024-01-05T08:30:00Z"));
        assert_eq!(
            ts("2024-01-05 10:30:00.000001+02"),
            ts("2024-01-05T08:30:00.000001Z")
        );
        assert_eq!(
            ts("2024-01-05 08:30:00+00:00"),
            ts("2024-01-05T08:30:00Z")
        );
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(Watermark::parse("infinity").is_err());
        assert!(Watermark::parse("").is_err());
    }

    #[test]
    fn test_source_literal() {
        assert_eq!(
            ts("2024-01-05T08:30:00.5Z").to_source_literal(),
            "2024-01-05 08:30:00.500000"
        );
    }

    #[tokio::test]
    async fn test_missing_file_is_absent() {
        let dir = TempDir::new().unwrap();
        let store = FileWatermarkStore::new(dir.path().join("etl_watermark.json"));
        assert_eq!(store.load().await, None);
    }

    #[tokio::test]
    async fn test_save_then_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("etl_watermark.json");
        let store = FileWatermarkStore::new(&path);

        let first = ts("2024-01-05T08:30:00.123456Z");
        store.save(&first).await.unwrap();
        assert_eq!(store.load().await, Some(first));

        let second = ts("2024-01-06T00:00:00Z");
        store.save(&second).await.unwrap();
        assert_eq!(store.load().await, Some(second));

        let content = std::fs::read_to_string(&path).unwrap();
        let json: serde_json::Value = serde_json::from_str(&content).unwrap();
        assert_eq!(json["last_updated_at"], "2024-01-06T00:00:00.000000Z");
        assert!(!dir.path().join("etl_watermark.json.tmp").exists());
    }

    #[tokio::test]
    async fn test_interrupted_save_leaves_previous_value() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("etl_watermark.json");
        let temp = dir.path().join("etl_watermark.json.tmp");
        let store = FileWatermarkStore::new(&path);

        let old = ts("2024-01-05T08:30:00.123456Z");
        store.save(&old).await.unwrap();

        // A save that died before the rename.
        std::fs::write(&temp, "{\"last_updated_at\": \"2024-01-0").unwrap();
        assert_eq!(store.load().await, Some(old));

        let new = ts("2024-01-06T00:00:00Z");
        store.save(&new).await.unwrap();
        assert_eq!(store.load().await, Some(new));
        assert!(!temp.exists());
    }

    #[tokio::test]
    async fn test_corrupted_file_is_absent() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("etl_watermark.json");
        std::fs::write(&path, "{\"last_updated_at\": \"2024-01").unwrap();

        let store = FileWatermarkStore::new(&path);
        assert_eq!(store.load().await, None);

        std::fs::write(&path, "{\"last_updated_at\": \"yesterday\"}").unwrap();
        assert_eq!(store.load().await, None);
    }

    #[tokio::test]
    async fn test_legacy_checkpoint_is_accepted() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("etl_watermark.json");
        std::fs::write(
            &path,
            "{\n  \"last_updated_at\": \"2024-02-10 17:45:12.000310\"\n}",
        )
        .unwrap();

        let store = FileWatermarkStore::new(&path);
        assert_eq!(store.load().await, Some(ts("2024-02-10T17:45:12.000310Z")));
    }

    #[tokio::test]
    async fn test_null_checkpoint_is_absent() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("etl_watermark.json");
        std::fs::write(&path, "{\"last_updated_at\": null}").unwrap();
        assert_eq!(FileWatermarkStore::new(&path).load().await, None);
    }

    #[tokio::test]
    async fn test_save_into_missing_directory_fails() {
        let dir = TempDir::new().unwrap();
        let store = FileWatermarkStore::new(dir.path().join("missing").join("wm.json"));
        let err = store.save(&ts("2024-01-01T00:00:00Z")).await.unwrap_err();
        assert!(matches!(err, CheckpointError::Write { .. }));
    }
}

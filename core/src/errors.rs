use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum EtlError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Source error: {0}")]
    Source(#[from] SourceError),

    #[error("Sink error: {0}")]
    Sink(#[from] SinkError),

    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    #[error("Run interrupted by shutdown signal after {batches_loaded} batch(es)")]
    Interrupted { batches_loaded: usize },
}

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("Failed to connect to the source: {reason}")]
    Connection { reason: String },

    #[error("Source query failed: {reason}")]
    Query { reason: String },

    #[error("Extraction is not open")]
    NotOpen,
}

/// A single source row that cannot be turned into a change record.
///
/// Row errors never abort a run; the row is skipped and logged.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RowError {
    #[error("required field `{field}` is null")]
    MissingField { field: &'static str },

    #[error("field `{field}` has unparseable timestamp {value:?}")]
    InvalidTimestamp { field: &'static str, value: String },

    #[error("field `{field}` has out-of-range value {value}")]
    OutOfRange { field: &'static str, value: i64 },
}

#[derive(Error, Debug)]
pub enum SinkError {
    #[error("Failed to connect to the sink: {reason}")]
    Connection { reason: String },

    #[error("Failed to create table {table}: {reason}")]
    TableCreation { table: String, reason: String },

    #[error("Failed to write {rows} row(s) to {table}: {reason}")]
    Write {
        table: String,
        rows: usize,
        reason: String,
    },

    #[error("{table} rejected {rows} row(s): {reason}")]
    Rejected {
        table: String,
        rows: usize,
        reason: String,
    },
}

#[derive(Error, Debug)]
pub enum CheckpointError {
    #[error("Failed to read checkpoint {path}: {reason}")]
    Read { path: PathBuf, reason: String },

    #[error("Checkpoint {path} is corrupted: {reason}")]
    Corrupted { path: PathBuf, reason: String },

    #[error("Failed to write checkpoint {path}: {reason}")]
    Write { path: PathBuf, reason: String },
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Configuration validation failed: {reason}")]
    ValidationFailed { reason: String },
}

#[derive(Error, Debug)]
pub enum SerializationError {
    #[error("Timestamp {value:?} is not a valid watermark: {reason}")]
    Timestamp { value: String, reason: String },
}

pub type Result<T> = std::result::Result<T, EtlError>;

impl EtlError {
    /// Whether a later run, started from the same checkpoint, may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            EtlError::Config(_) => false,
            EtlError::Interrupted { .. } => false,
            EtlError::Source(_) | EtlError::Sink(_) | EtlError::Checkpoint(_) => true,
        }
    }

    /// Short name of the component that failed, used in failure logs.
    pub fn stage(&self) -> &'static str {
        match self {
            EtlError::Config(_) => "config",
            EtlError::Source(_) => "extract",
            EtlError::Sink(_) => "load",
            EtlError::Checkpoint(_) => "checkpoint",
            EtlError::Interrupted { .. } => "shutdown",
        }
    }
}

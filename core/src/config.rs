use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::errors::ConfigError;
use crate::source::SelectionPolicy;

pub const DEFAULT_BATCH_SIZE: usize = 5000;
pub const DEFAULT_WATERMARK_FILE: &str = "etl_watermark.json";
const DEFAULT_TABLE: &str = "retail_transaction";

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EtlConfig {
    pub source: PostgresOptions,
    pub sink: ClickHouseOptions,
    #[serde(default)]
    pub processing: ProcessingConfig,
    /// Interval trigger for the container runner. Absent means run once.
    #[serde(default)]
    pub schedule: Option<ScheduleConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PostgresOptions {
    pub host: String,
    #[serde(default = "default_pg_port")]
    pub port: u16,
    pub database: String,
    pub user: String,
    pub password: Option<String>,
    #[serde(default = "default_table")]
    pub table: String,
    pub connect_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClickHouseOptions {
    pub host: String,
    #[serde(default = "default_ch_port")]
    pub port: u16,
    #[serde(default = "default_ch_database")]
    pub database: String,
    #[serde(default = "default_ch_user")]
    pub user: String,
    pub password: Option<String>,
    #[serde(default = "default_table")]
    pub table: String,
    #[serde(default)]
    pub secure: bool,
}

impl ClickHouseOptions {
    pub fn url(&self) -> String {
        let scheme = if self.secure { "https" } else { "http" };
        format!("{}://{}:{}", scheme, self.host, self.port)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProcessingConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Rows fetched per server-side cursor page.
    #[serde(default = "default_batch_size")]
    pub page_size: usize,
    #[serde(default)]
    pub selection_policy: SelectionPolicy,
    #[serde(default = "default_watermark_path")]
    pub watermark_path: PathBuf,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            page_size: DEFAULT_BATCH_SIZE,
            selection_policy: SelectionPolicy::default(),
            watermark_path: default_watermark_path(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ScheduleConfig {
    pub interval_secs: u64,
}

fn default_pg_port() -> u16 {
    5432
}

fn default_ch_port() -> u16 {
    8123
}

fn default_ch_database() -> String {
    "default".to_string()
}

fn default_ch_user() -> String {
    "default".to_string()
}

fn default_table() -> String {
    DEFAULT_TABLE.to_string()
}

fn default_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}

fn default_watermark_path() -> PathBuf {
    PathBuf::from(DEFAULT_WATERMARK_FILE)
}

pub async fn load_config(config_path: Option<&str>) -> anyhow::Result<EtlConfig> {
    let config = match config_path {
        Some(path) => EtlConfig::from_file(path)?,
        None => EtlConfig::from_env()?,
    };
    config.validate()?;
    Ok(config)
}

impl EtlConfig {
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: EtlConfig = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// YAML from `ETL_CONFIG` when set, otherwise the discrete `PG_*`,
    /// `CH_*` and `ETL_*` variables.
    pub fn from_env() -> anyhow::Result<Self> {
        if let Ok(config_str) = std::env::var("ETL_CONFIG") {
            let config: EtlConfig = serde_yaml::from_str(&config_str)?;
            return Ok(config);
        }
        Ok(Self::from_vars(|key| std::env::var(key).ok())?)
    }

    pub fn from_vars<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required = |key: &str| {
            lookup(key)
                .filter(|v| !v.trim().is_empty())
                .ok_or_else(|| ConfigError::MissingField {
                    field: key.to_string(),
                })
        };
        let parsed = |key: &str| -> Result<Option<u64>, ConfigError> {
            match lookup(key) {
                None => Ok(None),
                Some(raw) => raw
                    .trim()
                    .parse::<u64>()
                    .map(Some)
                    .map_err(|e| ConfigError::Invalid {
                        message: format!("{} must be a non-negative integer: {}", key, e),
                    }),
            }
        };
        let port = |key: &str, default: u16| -> Result<u16, ConfigError> {
            match parsed(key)? {
                None => Ok(default),
                Some(port) => u16::try_from(port).map_err(|_| ConfigError::Invalid {
                    message: format!("{} is not a valid port: {}", key, port),
                }),
            }
        };

        let mut processing = ProcessingConfig::default();
        if let Some(size) = parsed("ETL_BATCH_SIZE")? {
            processing.batch_size = size as usize;
            processing.page_size = size as usize;
        }
        if let Some(size) = parsed("ETL_PAGE_SIZE")? {
            processing.page_size = size as usize;
        }
        if let Some(policy) = lookup("ETL_SELECTION_POLICY") {
            processing.selection_policy = policy
                .parse()
                .map_err(|message| ConfigError::Invalid { message })?;
        }
        if let Some(path) = lookup("ETL_WATERMARK_FILE") {
            processing.watermark_path = PathBuf::from(path);
        }

        Ok(EtlConfig {
            source: PostgresOptions {
                host: required("PG_HOST")?,
                port: port("PG_PORT", default_pg_port())?,
                database: required("PG_DB")?,
                user: required("PG_USER")?,
                password: lookup("PG_PASSWORD"),
                table: lookup("PG_TABLE").unwrap_or_else(default_table),
                connect_timeout_secs: parsed("PG_CONNECT_TIMEOUT_SECS")?,
            },
            sink: ClickHouseOptions {
                host: required("CH_HOST")?,
                port: port("CH_PORT", default_ch_port())?,
                database: lookup("CH_DB").unwrap_or_else(default_ch_database),
                user: lookup("CH_USER").unwrap_or_else(default_ch_user),
                password: lookup("CH_PASSWORD"),
                table: lookup("CH_TABLE").unwrap_or_else(default_table),
                secure: lookup("CH_SECURE").is_some_and(|v| v == "true"),
            },
            processing,
            schedule: parsed("ETL_INTERVAL_SECS")?
                .map(|interval_secs| ScheduleConfig { interval_secs }),
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |reason: &str| ConfigError::ValidationFailed {
            reason: reason.to_string(),
        };

        if self.source.host.is_empty() {
            return Err(invalid("PostgreSQL host cannot be empty"));
        }
        if self.source.database.is_empty() {
            return Err(invalid("PostgreSQL database cannot be empty"));
        }
        if self.sink.host.is_empty() {
            return Err(invalid("ClickHouse host cannot be empty"));
        }
        if !is_identifier(&self.source.table) {
            return Err(invalid("Source table name must be a plain SQL identifier"));
        }
        if !is_identifier(&self.sink.table) {
            return Err(invalid("Sink table name must be a plain SQL identifier"));
        }
        if self.processing.batch_size == 0 {
            return Err(invalid("batch_size must be a positive integer"));
        }
        if self.processing.page_size == 0 {
            return Err(invalid("page_size must be a positive integer"));
        }
        if let Some(schedule) = &self.schedule {
            if schedule.interval_secs == 0 {
                return Err(invalid("schedule interval_secs must be positive"));
            }
        }
        Ok(())
    }
}

/// `name` or `schema.name`, letters, digits and underscores only.
fn is_identifier(name: &str) -> bool {
    !name.is_empty()
        && name.split('.').count() <= 2
        && name.split('.').all(|part| {
            let mut chars = part.chars();
            matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
                && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        })
}

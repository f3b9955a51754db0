pub mod batch;
pub mod config;
pub mod errors;
pub mod ingestor;
pub mod pipeline;
pub mod record;
pub mod sink;
pub mod source;
pub mod telemetry;
pub mod watermark;

pub use config::EtlConfig;
pub use errors::{EtlError, Result};
pub use ingestor::Ingestor;
pub use pipeline::{Pipeline, PipelineOptions, PipelineState, RunReport};
pub use watermark::{FileWatermarkStore, Watermark, WatermarkStore};

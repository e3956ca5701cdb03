/// Backfill configuration
use serde::Deserialize;

pub mod loader;

pub use loader::{load_config, load_config_with_env, resolve_retention_days};

/// Trading days backfilled into an empty store when nothing else is configured
pub const DEFAULT_RETENTION_DAYS: u8 = 14;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BackfillConfig {
    // Database
    pub database_url: String,
    pub max_connections: u32,
    pub run_migrations: bool,
    pub migrations_dir: String,

    // Retention, as written in the file; see `retention_days`
    pub retention_period_days: Option<i64>,

    /// Effective retention after env overrides and range checks
    #[serde(skip)]
    pub retention_days: u8,

    pub flatfiles: FlatFileConfig,
    pub pipeline: PipelineConfig,
}

impl Default for BackfillConfig {
    fn default() -> Self {
        Self {
            database_url: String::new(),
            max_connections: 4,
            run_migrations: true,
            migrations_dir: "migrations".to_string(),
            retention_period_days: None,
            retention_days: DEFAULT_RETENTION_DAYS,
            flatfiles: FlatFileConfig::default(),
            pipeline: PipelineConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlatFileBackend {
    S3,
    Local,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FlatFileConfig {
    pub backend: FlatFileBackend,
    pub endpoint: String,
    pub bucket: String,
    pub prefix: String,
    pub local_root: String,
    pub access_key_id: String,
    pub secret_access_key: String,
}

impl Default for FlatFileConfig {
    fn default() -> Self {
        Self {
            backend: FlatFileBackend::S3,
            endpoint: "https://files.polygon.io".to_string(),
            bucket: "flatfiles".to_string(),
            prefix: "us_stocks_sip/minute_aggs_v1".to_string(),
            local_root: "data/flatfiles".to_string(),
            access_key_id: String::new(),
            secret_access_key: String::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub channel_capacity: usize,
    pub merge_batch_size: usize,
    pub bulk_chunk_rows: usize,
    pub progress_interval_ms: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 1000,
            merge_batch_size: 1000,
            bulk_chunk_rows: 1000,
            progress_interval_ms: 5000,
        }
    }
}

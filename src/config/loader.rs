/// Configuration loading from TOML file plus environment overrides
use std::path::Path;
use tracing::{info, warn};

use super::{BackfillConfig, FlatFileBackend, DEFAULT_RETENTION_DAYS};
use crate::error::{BackfillError, Result};

/// Columns per row in the merge upsert
const UPSERT_COLUMNS: usize = 8;
/// PostgreSQL caps bind parameters per statement at u16::MAX
const MAX_BIND_PARAMS: usize = u16::MAX as usize;

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<BackfillConfig> {
    load_config_with_env(path, |key| std::env::var(key).ok())
}

/// Read `path` if it exists, then apply `env` overrides and validate.
pub fn load_config_with_env<P, F>(path: P, env: F) -> Result<BackfillConfig>
where
    P: AsRef<Path>,
    F: Fn(&str) -> Option<String>,
{
    let path = path.as_ref();
    let mut config = if path.exists() {
        let content = std::fs::read_to_string(path)
            .map_err(|e| BackfillError::ConfigError(format!("Failed to read config file: {}", e)))?;

        toml::from_str::<BackfillConfig>(&content)
            .map_err(|e| BackfillError::ConfigError(format!("Failed to parse config: {}", e)))?
    } else {
        info!("No config file at {}, using defaults", path.display());
        BackfillConfig::default()
    };

    if let Some(url) = env("DATABASE_URL") {
        config.database_url = url;
    }
    if let Some(key) = env("POLYGON_FLAT_FILES_ACCESS_KEY_ID") {
        config.flatfiles.access_key_id = key;
    }
    if let Some(secret) = env("POLYGON_FLAT_FILES_SECRET_ACCESS_KEY") {
        config.flatfiles.secret_access_key = secret;
    }
    config.retention_days = resolve_retention_days(
        env("RETENTION_PERIOD_DAYS").as_deref(),
        config.retention_period_days,
    );

    validate_config(&config)?;

    Ok(config)
}

/// Effective retention: a valid env value wins, then a valid file value, then 14.
pub fn resolve_retention_days(env_value: Option<&str>, file_value: Option<i64>) -> u8 {
    if let Some(raw) = env_value {
        match raw.trim().parse::<u8>() {
            Ok(days) => return days,
            Err(_) => warn!(
                "RETENTION_PERIOD_DAYS={:?} is not in [0, 255], ignoring",
                raw
            ),
        }
    }

    if let Some(days) = file_value {
        match u8::try_from(days) {
            Ok(days) => return days,
            Err(_) => warn!("retention_period_days={} is not in [0, 255], ignoring", days),
        }
    }

    DEFAULT_RETENTION_DAYS
}

fn validate_config(config: &BackfillConfig) -> Result<()> {
    if config.database_url.is_empty() {
        return Err(BackfillError::ConfigError(
            "database_url is empty (set DATABASE_URL)".to_string(),
        ));
    }

    // One connection holds the COPY while the other serves upserts.
    if config.max_connections < 2 {
        return Err(BackfillError::ConfigError(format!(
            "max_connections must be >= 2, got {}",
            config.max_connections
        )));
    }

    let pipeline = &config.pipeline;
    if pipeline.channel_capacity == 0 || pipeline.bulk_chunk_rows == 0 {
        return Err(BackfillError::ConfigError(
            "channel_capacity and bulk_chunk_rows must be > 0".to_string(),
        ));
    }
    if pipeline.merge_batch_size == 0 || pipeline.merge_batch_size * UPSERT_COLUMNS > MAX_BIND_PARAMS {
        return Err(BackfillError::ConfigError(format!(
            "merge_batch_size must be in 1..={}, got {}",
            MAX_BIND_PARAMS / UPSERT_COLUMNS,
            pipeline.merge_batch_size
        )));
    }

    let flatfiles = &config.flatfiles;
    match flatfiles.backend {
        FlatFileBackend::S3 => {
            if flatfiles.access_key_id.is_empty() || flatfiles.secret_access_key.is_empty() {
                return Err(BackfillError::ConfigError(
                    "S3 flat files need POLYGON_FLAT_FILES_ACCESS_KEY_ID and POLYGON_FLAT_FILES_SECRET_ACCESS_KEY"
                        .to_string(),
                ));
            }
            if flatfiles.bucket.is_empty() {
                return Err(BackfillError::ConfigError("flatfiles.bucket is empty".to_string()));
            }
        }
        FlatFileBackend::Local => {
            if flatfiles.local_root.is_empty() {
                return Err(BackfillError::ConfigError("flatfiles.local_root is empty".to_string()));
            }
        }
    }

    Ok(())
}

/// Backfill entry point: one run against PostgreSQL, then exit
use anyhow::Context;
use std::path::Path;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use ohlcv_backfill::{
    config::{load_config, BackfillConfig, FlatFileBackend},
    source::{FlatFileProvider, FlatFileStore, LocalFlatFiles, S3FlatFiles},
    store::PgBarStore,
    Backfill, BackfillOptions,
};

fn init_logging() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("ohlcv_backfill=debug,info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn flat_file_store(config: &BackfillConfig) -> anyhow::Result<Arc<dyn FlatFileStore>> {
    let store: Arc<dyn FlatFileStore> = match config.flatfiles.backend {
        FlatFileBackend::S3 => Arc::new(S3FlatFiles::new(&config.flatfiles)?),
        FlatFileBackend::Local => Arc::new(LocalFlatFiles::new(&config.flatfiles.local_root)),
    };
    Ok(store)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    init_logging();

    let config_path = std::env::var("CONFIG_PATH")
        .unwrap_or_else(|_| "backfill.toml".to_string());

    let config = load_config(&config_path)
        .with_context(|| format!("loading configuration from {}", config_path))?;
    info!(
        "Configuration loaded (retention {} trading days, flat files via {:?})",
        config.retention_days, config.flatfiles.backend
    );

    let store = PgBarStore::connect(&config.database_url, config.max_connections)
        .await
        .context("connecting to PostgreSQL")?;

    if config.run_migrations {
        store
            .run_migrations(Path::new(&config.migrations_dir))
            .await
            .context("applying migrations")?;
    }

    let provider = FlatFileProvider::new(flat_file_store(&config)?, config.flatfiles.prefix.clone());
    let backfill = Backfill::new(
        Arc::new(store),
        Arc::new(provider),
        BackfillOptions::from_config(&config),
    );

    match backfill.run().await {
        Ok(report) => {
            info!("Backfill report: {}", serde_json::to_string(&report)?);
            Ok(())
        }
        Err(e) => {
            let outcome = if e.is_pre_write() {
                "nothing was written"
            } else {
                "rows committed before the failure are kept"
            };
            error!(
                "Backfill failed [{} {:?}]: {} ({})",
                e.error_code(),
                e.category(),
                e,
                outcome
            );
            Err(e.into())
        }
    }
}

/// Centralized error types for the backfill engine
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BackfillError {
    // Boundary Probe Errors
    #[error("Boundary probe failed: {0}")]
    BoundaryProbeFailed(String),

    // Source Acquisition Errors
    #[error("Row source unavailable: {0}")]
    SourceUnavailable(String),

    #[error("Object storage error: {0}")]
    ObjectStoreError(String),

    // Row Parse / Transport Errors
    #[error("Invalid bar data: {0}")]
    InvalidBarData(String),

    #[error("CSV error: {0}")]
    CsvError(#[from] csv::Error),

    #[error("File I/O error: {0}")]
    FileError(#[from] std::io::Error),

    // Write Path Errors
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Bulk load failed: {0}")]
    BulkLoadFailed(String),

    #[error("Merge failed: {0}")]
    MergeFailed(String),

    // Configuration Errors
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Migration failed: {0}")]
    MigrationFailed(#[from] sqlx::migrate::MigrateError),

    // Pipeline Errors
    #[error("Pipeline stage failed: {0}")]
    StageFailed(String),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, BackfillError>;

/// Where in a run an error originates
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    BoundaryProbe,
    SourceAcquisition,
    RowTransport,
    WritePath,
    Configuration,
    Pipeline,
}

impl BackfillError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            BackfillError::BoundaryProbeFailed(_) => ErrorCategory::BoundaryProbe,
            BackfillError::SourceUnavailable(_) => ErrorCategory::SourceAcquisition,
            BackfillError::ObjectStoreError(_)
            | BackfillError::InvalidBarData(_)
            | BackfillError::CsvError(_)
            | BackfillError::FileError(_) => ErrorCategory::RowTransport,
            BackfillError::Database(_)
            | BackfillError::BulkLoadFailed(_)
            | BackfillError::MergeFailed(_) => ErrorCategory::WritePath,
            BackfillError::ConfigError(_) | BackfillError::MigrationFailed(_) => {
                ErrorCategory::Configuration
            }
            BackfillError::StageFailed(_) | BackfillError::Other(_) => ErrorCategory::Pipeline,
        }
    }

    /// Check if the error aborts a run before anything is written
    pub fn is_pre_write(&self) -> bool {
        matches!(
            self.category(),
            ErrorCategory::BoundaryProbe | ErrorCategory::SourceAcquisition | ErrorCategory::Configuration
        )
    }

    /// Get error code for logging/monitoring
    pub fn error_code(&self) -> &str {
        match self {
            BackfillError::BoundaryProbeFailed(_) => "PROBE_001",
            BackfillError::SourceUnavailable(_) => "SRC_001",
            BackfillError::ObjectStoreError(_) => "SRC_002",
            BackfillError::InvalidBarData(_) => "DATA_001",
            BackfillError::CsvError(_) => "DATA_002",
            BackfillError::FileError(_) => "FILE_001",
            BackfillError::Database(_) => "DB_001",
            BackfillError::BulkLoadFailed(_) => "DB_002",
            BackfillError::MergeFailed(_) => "DB_003",
            BackfillError::ConfigError(_) => "CFG_001",
            BackfillError::MigrationFailed(_) => "CFG_002",
            BackfillError::StageFailed(_) => "SYS_001",
            BackfillError::Other(_) => "GEN_001",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_categories() {
        assert!(BackfillError::BoundaryProbeFailed("down".into()).is_pre_write());
        assert!(BackfillError::SourceUnavailable("no root".into()).is_pre_write());
        assert!(!BackfillError::MergeFailed("conn reset".into()).is_pre_write());
        assert_eq!(
            BackfillError::InvalidBarData("bad".into()).category(),
            ErrorCategory::RowTransport
        );
        assert_eq!(BackfillError::BulkLoadFailed("dup".into()).error_code(), "DB_002");
    }
}

/// Row sources: where backfilled bars come from
use chrono::{DateTime, NaiveDate, Utc};

use crate::error::Result;
use crate::types::Bar;

pub mod flatfile;
pub mod object_store;

pub use flatfile::{flat_file_key, FlatFileProvider, FlatFileRowSource, DEFAULT_PREFIX};
pub use object_store::{FlatFileStore, LocalFlatFiles, S3FlatFiles};

/// Ordered, forward-only bar stream. Not restartable; one consumer only.
///
/// Implementations block on I/O and are driven from a blocking thread.
pub trait RowSource: Send {
    /// Next bar at or after the start timestamp, `Ok(None)` once every source
    /// file is exhausted.
    fn next_bar(&mut self) -> Result<Option<Bar>>;

    /// Name of the file currently being read
    fn current_source(&self) -> Option<&str> {
        None
    }

    /// Rows discarded for being earlier than the start timestamp
    fn skipped_rows(&self) -> u64 {
        0
    }

    fn files_read(&self) -> u64 {
        0
    }

    /// Days with no source file even though a later day had one
    fn missing_days(&self) -> &[NaiveDate] {
        &[]
    }
}

pub trait RowSourceProvider: Send + Sync {
    /// Open a source positioned at `start`.
    fn open(&self, start: DateTime<Utc>) -> Result<Box<dyn RowSource>>;
}

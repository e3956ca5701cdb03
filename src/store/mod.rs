/// Bar persistence: the write paths the pipeline drives and the probe it reads
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::types::Bar;

pub mod memory;
pub mod postgres;

pub use memory::MemoryBarStore;
pub use postgres::PgBarStore;

#[async_trait]
pub trait BarStore: Send + Sync {
    /// Latest stored timestamp for every symbol with at least one bar.
    async fn latest_per_symbol(&self) -> Result<Vec<(String, DateTime<Utc>)>>;

    /// Start an append-only load. Rows become visible only on `finish`, and the
    /// whole load is rejected if any row collides with a stored key.
    async fn begin_bulk_load(&self) -> Result<Box<dyn BulkLoad>>;

    /// Insert `bars`, overwriting every non-key column where the key exists.
    /// Returns the number of rows written.
    async fn upsert(&self, bars: &[Bar]) -> Result<u64>;
}

#[async_trait]
pub trait BulkLoad: Send {
    async fn send(&mut self, bars: &[Bar]) -> Result<()>;

    /// Commit the load, returning the number of rows appended.
    async fn finish(self: Box<Self>) -> Result<u64>;

    async fn abort(self: Box<Self>, reason: &str) -> Result<()>;
}

pub mod types;
pub mod error;
pub mod config;
pub mod time;
pub mod store;
pub mod source;
pub mod ingestion;

pub use types::*;
pub use error::{BackfillError, Result};
pub use ingestion::{Backfill, BackfillOptions, BackfillReport};

/// Ingestion pipeline: boundary probe, row routing and the two write paths
pub mod backfill;
pub mod metrics;
pub mod range_probe;
pub mod router;
pub mod writers;

pub use backfill::{Backfill, BackfillOptions, BackfillReport};
pub use metrics::{IngestionMetrics, ProgressEvent, ProgressHandle, ProgressTracker};
pub use range_probe::RangeProbe;
pub use router::{Router, RouterSummary};
pub use writers::{BulkWriter, MergeSummary, MergeWriter};

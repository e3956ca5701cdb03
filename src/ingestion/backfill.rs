/// Backfill orchestrator
///
/// One run: probe the store, pick a start, then drive Router, BulkWriter and
/// MergeWriter concurrently until all three finish. The first error any stage
/// reports becomes the run's result; whatever was committed before it stays.
use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinError;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::metrics::{IngestionMetrics, ProgressTracker};
use super::range_probe::RangeProbe;
use super::router::{Router, RouterSummary};
use super::writers::{
    BulkWriter, MergeSummary, MergeWriter, DEFAULT_BULK_CHUNK_ROWS, DEFAULT_MERGE_BATCH_SIZE,
};
use crate::config::{BackfillConfig, DEFAULT_RETENTION_DAYS};
use crate::error::{BackfillError, Result};
use crate::source::RowSourceProvider;
use crate::store::BarStore;
use crate::time::last_retained_instant;
use crate::types::{Bar, FillBoundary};

/// One slot per stage, so no stage ever blocks reporting
const ERROR_CHANNEL_CAPACITY: usize = 3;

#[derive(Debug, Clone)]
pub struct BackfillOptions {
    pub retention_days: u8,
    pub channel_capacity: usize,
    pub merge_batch_size: usize,
    pub bulk_chunk_rows: usize,
    pub progress_interval: Duration,
}

impl Default for BackfillOptions {
    fn default() -> Self {
        Self {
            retention_days: DEFAULT_RETENTION_DAYS,
            channel_capacity: 1000,
            merge_batch_size: DEFAULT_MERGE_BATCH_SIZE,
            bulk_chunk_rows: DEFAULT_BULK_CHUNK_ROWS,
            progress_interval: Duration::from_secs(5),
        }
    }
}

impl BackfillOptions {
    pub fn from_config(config: &BackfillConfig) -> Self {
        Self {
            retention_days: config.retention_days,
            channel_capacity: config.pipeline.channel_capacity,
            merge_batch_size: config.pipeline.merge_batch_size,
            bulk_chunk_rows: config.pipeline.bulk_chunk_rows,
            progress_interval: Duration::from_millis(config.pipeline.progress_interval_ms),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BackfillReport {
    pub run_id: Uuid,
    pub start: DateTime<Utc>,
    pub boundary: FillBoundary,
    pub bulk_rows: u64,
    pub merge_rows: u64,
    pub skipped_rows: u64,
    pub dropped_rows: u64,
    pub files_read: u64,
    /// Trading days skipped over because their source file was absent
    pub missing_days: Vec<NaiveDate>,
    pub bulk_written: u64,
    pub merge_written: u64,
    pub merge_batches: u64,
    pub duration_ms: u64,
}

/// Channels for a single run. Built at entry, consumed by the stages.
struct PipelineRun {
    bulk_tx: mpsc::Sender<Bar>,
    bulk_rx: mpsc::Receiver<Bar>,
    merge_tx: mpsc::Sender<Bar>,
    merge_rx: mpsc::Receiver<Bar>,
    error_tx: mpsc::Sender<BackfillError>,
    error_rx: mpsc::Receiver<BackfillError>,
}

impl PipelineRun {
    fn new(channel_capacity: usize) -> Self {
        let capacity = channel_capacity.max(1);
        let (bulk_tx, bulk_rx) = mpsc::channel(capacity);
        let (merge_tx, merge_rx) = mpsc::channel(capacity);
        let (error_tx, error_rx) = mpsc::channel(ERROR_CHANNEL_CAPACITY);

        Self {
            bulk_tx,
            bulk_rx,
            merge_tx,
            merge_rx,
            error_tx,
            error_rx,
        }
    }
}

pub struct Backfill {
    store: Arc<dyn BarStore>,
    provider: Arc<dyn RowSourceProvider>,
    options: BackfillOptions,
}

impl Backfill {
    pub fn new(
        store: Arc<dyn BarStore>,
        provider: Arc<dyn RowSourceProvider>,
        options: BackfillOptions,
    ) -> Self {
        Self {
            store,
            provider,
            options,
        }
    }

    pub async fn run(&self) -> Result<BackfillReport> {
        self.run_at(Utc::now()).await
    }

    /// Same as [`Backfill::run`] with a fixed clock for the retention window.
    pub async fn run_at(&self, now: DateTime<Utc>) -> Result<BackfillReport> {
        let started = Instant::now();
        let run_id = Uuid::new_v4();
        info!("📊 Backfill run {} starting", run_id);

        let boundary = RangeProbe::new(Arc::clone(&self.store))
            .compute_boundary()
            .await?;

        let start = match boundary.filled_before {
            Some(filled_before) => filled_before,
            None => {
                let start = last_retained_instant(now, self.options.retention_days);
                info!(
                    "No stored bars, backfilling {} trading days",
                    self.options.retention_days
                );
                start
            }
        };
        info!("Backfill start: {}", start);

        let provider = Arc::clone(&self.provider);
        let source = tokio::task::spawn_blocking(move || provider.open(start))
            .await
            .map_err(|e| stage_failed("source open", e))?
            .map_err(|e| match e {
                BackfillError::SourceUnavailable(_) => e,
                other => BackfillError::SourceUnavailable(other.to_string()),
            })?;

        let PipelineRun {
            bulk_tx,
            bulk_rx,
            merge_tx,
            merge_rx,
            error_tx,
            mut error_rx,
        } = PipelineRun::new(self.options.channel_capacity);
        let (progress, tracker) = ProgressTracker::spawn(self.options.progress_interval);

        let router = Router::new(boundary, bulk_tx, merge_tx, progress.clone());
        let router_errors = error_tx.clone();
        let router_task = tokio::task::spawn_blocking(move || match router.run(source) {
            Ok(summary) => Some(summary),
            Err(e) => {
                let _ = router_errors.try_send(e);
                None
            }
        });

        let bulk = BulkWriter::new(
            Arc::clone(&self.store),
            self.options.bulk_chunk_rows,
            progress.clone(),
        );
        let bulk_errors = error_tx.clone();
        let bulk_task = tokio::spawn(async move {
            match bulk.run(bulk_rx).await {
                Ok(rows) => Some(rows),
                Err(e) => {
                    let _ = bulk_errors.try_send(e);
                    None
                }
            }
        });

        let merge = MergeWriter::new(
            Arc::clone(&self.store),
            self.options.merge_batch_size,
            progress,
        );
        let merge_errors = error_tx;
        let merge_task = tokio::spawn(async move {
            match merge.run(merge_rx).await {
                Ok(summary) => Some(summary),
                Err(e) => {
                    let _ = merge_errors.try_send(e);
                    None
                }
            }
        });

        let (router_result, bulk_result, merge_result) =
            tokio::join!(router_task, bulk_task, merge_task);

        let metrics = match tracker.await {
            Ok(metrics) => metrics,
            Err(e) => {
                warn!("Progress tracker ended abnormally: {}", e);
                IngestionMetrics::default()
            }
        };
        info!("{}", metrics.summary_line());

        let mut failures = Vec::new();
        while let Ok(e) = error_rx.try_recv() {
            failures.push(e);
        }

        let routed = collect_stage("router", router_result, &mut failures);
        let bulk_written = collect_stage("bulk writer", bulk_result, &mut failures);
        let merged = collect_stage("merge writer", merge_result, &mut failures);

        let mut failures = failures.into_iter();
        if let Some(first) = failures.next() {
            for other in failures {
                warn!("Additional stage failure: {}", other);
            }
            error!(
                "❌ Backfill run {} failed ({} routed rows not written): {}",
                run_id, metrics.dropped_rows, first
            );
            return Err(first);
        }

        let routed: RouterSummary = routed.unwrap_or_default();
        let merged: MergeSummary = merged.unwrap_or_default();
        let report = BackfillReport {
            run_id,
            start,
            boundary,
            bulk_rows: routed.bulk_rows,
            merge_rows: routed.merge_rows,
            skipped_rows: routed.skipped_rows,
            dropped_rows: routed.dropped_rows,
            files_read: routed.files_read,
            missing_days: routed.missing_days,
            bulk_written: bulk_written.unwrap_or_default(),
            merge_written: merged.rows_written,
            merge_batches: merged.batches,
            duration_ms: started.elapsed().as_millis() as u64,
        };

        info!(
            "✅ Backfill run {} complete: {} bulk, {} merge, {} skipped in {} ms",
            run_id, report.bulk_rows, report.merge_rows, report.skipped_rows, report.duration_ms
        );
        Ok(report)
    }
}

/// Unwrap a stage's join result. A panic is recorded after any reported errors.
fn collect_stage<T>(
    stage: &str,
    result: std::result::Result<Option<T>, JoinError>,
    failures: &mut Vec<BackfillError>,
) -> Option<T> {
    match result {
        Ok(value) => value,
        Err(e) => {
            failures.push(stage_failed(stage, e));
            None
        }
    }
}

fn stage_failed(stage: &str, e: JoinError) -> BackfillError {
    BackfillError::StageFailed(format!("{} task did not complete: {}", stage, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::testing::VecSourceProvider;
    use crate::store::MemoryBarStore;
    use chrono::{Duration as ChronoDuration, TimeZone};

    // Friday 2025-07-11, 10:00 New York
    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 7, 11, 14, 0, 0).unwrap()
    }

    fn at(hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 7, 10, hour, minute, 0).unwrap()
    }

    fn bar(symbol: &str, timestamp: DateTime<Utc>, volume: i64, transactions: i64) -> Bar {
        Bar {
            symbol: symbol.to_string(),
            timestamp,
            open: 100.0,
            high: 101.0,
            low: 99.0,
            close: 100.5,
            volume,
            transactions,
        }
    }

    fn minutes(symbol: &str, from: DateTime<Utc>, count: i64) -> Vec<Bar> {
        (0..count)
            .map(|i| bar(symbol, from + ChronoDuration::minutes(i), 10 + i, 1))
            .collect()
    }

    fn options() -> BackfillOptions {
        BackfillOptions {
            retention_days: 2,
            channel_capacity: 16,
            merge_batch_size: 1000,
            bulk_chunk_rows: 7,
            progress_interval: Duration::from_secs(60),
        }
    }

    fn backfill(store: &MemoryBarStore, provider: &VecSourceProvider) -> Backfill {
        Backfill::new(
            Arc::new(store.clone()),
            Arc::new(provider.clone()),
            options(),
        )
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_empty_store_starts_at_retention_window() {
        let store = MemoryBarStore::new();
        let start = last_retained_instant(now(), 2);
        let mut rows = minutes("AAPL", start, 30);
        rows.extend(minutes("MSFT", start, 30));
        let provider = VecSourceProvider::new(rows);

        let report = backfill(&store, &provider).run_at(now()).await.unwrap();

        assert_eq!(provider.opened_at(), vec![start]);
        assert_eq!(report.start, start);
        assert!(report.boundary.is_empty());
        assert_eq!(report.bulk_rows, 60);
        assert_eq!(report.merge_rows, 0);
        assert_eq!(report.bulk_written, 60);
        assert_eq!(store.len().await, 60);
        assert!(store.upsert_batch_sizes().await.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_first_row_of_fresh_run_goes_bulk() {
        let store = MemoryBarStore::new();
        let start = last_retained_instant(now(), 2);
        let provider = VecSourceProvider::new(vec![bar("SPY", start, 1, 1)]);

        let report = backfill(&store, &provider).run_at(now()).await.unwrap();

        assert_eq!(report.bulk_rows, 1);
        assert_eq!(report.merge_rows, 0);
        assert_eq!(store.bulk_load_sizes().await, vec![1]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_resume_routes_partial_window_to_merge() {
        let store = MemoryBarStore::new();
        store.insert_existing(minutes("AAPL", at(13, 30), 31)).await; // through 14:00
        store.insert_existing(minutes("MSFT", at(13, 30), 91)).await; // through 15:00

        let mut rows = minutes("AAPL", at(13, 30), 151);
        rows.extend(minutes("MSFT", at(13, 30), 151));
        let total_from_start = rows.iter().filter(|b| b.timestamp >= at(14, 0)).count() as u64;
        let provider = VecSourceProvider::new(rows);

        let report = backfill(&store, &provider).run_at(now()).await.unwrap();

        assert_eq!(provider.opened_at(), vec![at(14, 0)]);
        assert_eq!(report.boundary.filled_before, Some(at(14, 0)));
        assert_eq!(report.boundary.unfilled_after, Some(at(15, 0)));
        assert_eq!(report.merge_rows, 2 * 61);
        assert_eq!(report.bulk_rows + report.merge_rows, total_from_start);
        assert_eq!(report.skipped_rows, 60);
        assert_eq!(report.dropped_rows, 0);
        assert_eq!(store.len().await, 2 * 151);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_second_run_is_idempotent() {
        let store = MemoryBarStore::new();
        let start = last_retained_instant(now(), 2);
        let mut rows = minutes("AAPL", start, 20);
        rows.extend(minutes("MSFT", start, 25));
        let provider = VecSourceProvider::new(rows);

        backfill(&store, &provider).run_at(now()).await.unwrap();
        let after_first = store.snapshot().await;

        let second = backfill(&store, &provider).run_at(now()).await.unwrap();
        assert_eq!(store.snapshot().await, after_first);
        assert_eq!(second.bulk_rows, 0);
        assert_eq!(second.dropped_rows, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_merge_overwrites_instead_of_summing() {
        let store = MemoryBarStore::new();
        let t = at(14, 0);
        store.insert_existing(vec![bar("SYM", t, 100, 10)]).await;
        let provider = VecSourceProvider::new(vec![bar("SYM", t, 200, 20)]);

        let report = backfill(&store, &provider).run_at(now()).await.unwrap();

        assert_eq!(report.merge_rows, 1);
        let stored = store.get("SYM", t).await.unwrap();
        assert_eq!(stored.volume, 200);
        assert_eq!(stored.transactions, 20);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_probe_failure_aborts_before_reading() {
        let store = MemoryBarStore::new().with_failing_probe("connection reset");
        let provider = VecSourceProvider::new(minutes("AAPL", at(14, 0), 5));

        let result = backfill(&store, &provider).run_at(now()).await;

        assert!(matches!(result, Err(BackfillError::BoundaryProbeFailed(_))));
        assert!(provider.opened_at().is_empty());
        assert!(store.is_empty().await);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_unavailable_source_aborts_before_writes() {
        let store = MemoryBarStore::new();
        let provider = VecSourceProvider::unavailable();

        let result = backfill(&store, &provider).run_at(now()).await;

        assert!(matches!(result, Err(BackfillError::SourceUnavailable(_))));
        assert!(store.bulk_load_sizes().await.is_empty());
        assert!(store.upsert_batch_sizes().await.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_bulk_failure_keeps_merged_rows() {
        let store = MemoryBarStore::new().with_failing_bulk_loads("unique violation");
        store.insert_existing(vec![bar("AAPL", at(14, 0), 1, 1)]).await;
        store.insert_existing(vec![bar("MSFT", at(14, 10), 1, 1)]).await;

        let mut rows = minutes("AAPL", at(14, 0), 20);
        rows.extend(minutes("MSFT", at(14, 0), 20));
        let provider = VecSourceProvider::new(rows);

        let result = backfill(&store, &provider).run_at(now()).await;

        assert!(matches!(result, Err(BackfillError::BulkLoadFailed(_))));
        // [14:00, 14:10] for both symbols landed through the merge path
        assert_eq!(store.upsert_batch_sizes().await, vec![22]);
        assert_eq!(store.get("AAPL", at(14, 10)).await.unwrap().volume, 20);
        assert!(store.get("AAPL", at(14, 11)).await.is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_parse_error_ends_run_after_flushing_earlier_rows() {
        let store = MemoryBarStore::new();
        let start = last_retained_instant(now(), 2);
        let rows = vec![
            Ok(bar("AAPL", start, 1, 1)),
            Ok(bar("AAPL", start + ChronoDuration::minutes(1), 1, 1)),
            Err("2025-07-09.csv.gz line 4: invalid close".to_string()),
            Ok(bar("AAPL", start + ChronoDuration::minutes(2), 1, 1)),
        ];
        let provider = VecSourceProvider::with_rows(rows);

        let result = backfill(&store, &provider).run_at(now()).await;

        match result {
            Err(BackfillError::InvalidBarData(msg)) => assert!(msg.contains("line 4")),
            other => panic!("unexpected result: {:?}", other.map(|r| r.bulk_rows)),
        }
        assert_eq!(store.len().await, 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_report_lists_missing_days() {
        let store = MemoryBarStore::new();
        let start = last_retained_instant(now(), 2);
        let gap = NaiveDate::from_ymd_opt(2025, 7, 9).unwrap();
        let provider = VecSourceProvider::new(minutes("AAPL", start, 3)).with_missing_days(vec![gap]);

        let report = backfill(&store, &provider).run_at(now()).await.unwrap();

        assert_eq!(report.bulk_rows, 3);
        assert_eq!(report.missing_days, vec![gap]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_report_serializes() {
        let store = MemoryBarStore::new();
        let provider = VecSourceProvider::new(Vec::new());

        let report = backfill(&store, &provider).run_at(now()).await.unwrap();
        let json = serde_json::to_value(&report).unwrap();

        assert_eq!(json["bulk_rows"], 0);
        assert!(json["boundary"]["filled_before"].is_null());
        assert!(json["run_id"].is_string());
    }
}

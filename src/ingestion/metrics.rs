/// Progress metrics actor
///
/// Pipeline stages never share counters. Each holds a [`ProgressHandle`] and sends
/// [`ProgressEvent`]s to a single task that owns [`IngestionMetrics`] and logs a
/// progress line on a timer.
use serde::Serialize;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::info;

use crate::types::RoutePath;

const PROGRESS_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub enum ProgressEvent {
    /// The Router started reading a new source file
    Source(String),
    /// Counts routed since the previous report
    Routed {
        bulk: u64,
        merge: u64,
        dropped: u64,
        skipped: u64,
        last_symbol: Option<String>,
    },
    /// Rows streamed into the open bulk load (not yet committed)
    Streamed { rows: u64 },
    /// Rows committed by a writer
    Written { path: RoutePath, rows: u64 },
    /// Routed rows a failed writer will never commit
    Discarded { path: RoutePath, rows: u64 },
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct IngestionMetrics {
    pub current_source: Option<String>,
    pub current_symbol: Option<String>,
    pub files_started: u64,
    pub rows_read: u64,
    pub skipped_rows: u64,
    pub dropped_rows: u64,
    pub bulk_routed: u64,
    pub merge_routed: u64,
    pub bulk_streamed: u64,
    pub bulk_written: u64,
    pub merge_written: u64,
    pub merge_batches: u64,
}

impl IngestionMetrics {
    pub fn apply(&mut self, event: ProgressEvent) {
        match event {
            ProgressEvent::Source(name) => {
                self.files_started += 1;
                self.current_source = Some(name);
            }
            ProgressEvent::Routed {
                bulk,
                merge,
                dropped,
                skipped,
                last_symbol,
            } => {
                self.bulk_routed += bulk;
                self.merge_routed += merge;
                self.dropped_rows += dropped;
                self.skipped_rows += skipped;
                self.rows_read += bulk + merge + dropped;
                if last_symbol.is_some() {
                    self.current_symbol = last_symbol;
                }
            }
            ProgressEvent::Streamed { rows } => self.bulk_streamed += rows,
            ProgressEvent::Written { path: RoutePath::Bulk, rows } => self.bulk_written += rows,
            ProgressEvent::Written { path: RoutePath::Merge, rows } => {
                self.merge_written += rows;
                self.merge_batches += 1;
            }
            ProgressEvent::Discarded { path, rows } => {
                let routed = match path {
                    RoutePath::Bulk => &mut self.bulk_routed,
                    RoutePath::Merge => &mut self.merge_routed,
                };
                *routed = routed.saturating_sub(rows);
                self.dropped_rows += rows;
            }
        }
    }

    pub fn summary_line(&self) -> String {
        format!(
            "[{}] {} bars read, {} bars skipped, {} bulk / {} merge routed, {} dropped, {} merged in {} batches (current ticker: {})",
            self.current_source.as_deref().unwrap_or("-"),
            self.rows_read,
            self.skipped_rows,
            self.bulk_routed,
            self.merge_routed,
            self.dropped_rows,
            self.merge_written,
            self.merge_batches,
            self.current_symbol.as_deref().unwrap_or("-"),
        )
    }
}

/// Cloneable sender side of the metrics actor. Reports are best-effort.
#[derive(Clone)]
pub struct ProgressHandle {
    tx: mpsc::Sender<ProgressEvent>,
}

impl ProgressHandle {
    /// For use on blocking threads.
    pub fn report_blocking(&self, event: ProgressEvent) {
        let _ = self.tx.blocking_send(event);
    }

    pub async fn report(&self, event: ProgressEvent) {
        let _ = self.tx.send(event).await;
    }
}

pub struct ProgressTracker;

impl ProgressTracker {
    /// Start the actor. It runs until every handle is dropped and then yields the
    /// final metrics.
    pub fn spawn(interval: Duration) -> (ProgressHandle, JoinHandle<IngestionMetrics>) {
        let (tx, mut rx) = mpsc::channel(PROGRESS_CHANNEL_CAPACITY);

        let task = tokio::spawn(async move {
            let mut metrics = IngestionMetrics::default();
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            ticker.tick().await;

            loop {
                tokio::select! {
                    event = rx.recv() => match event {
                        Some(event) => metrics.apply(event),
                        None => break,
                    },
                    _ = ticker.tick() => info!("{}", metrics.summary_line()),
                }
            }

            metrics
        });

        (ProgressHandle { tx }, task)
    }
}

/// Sends each source row down exactly one write path
use chrono::NaiveDate;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::metrics::{ProgressEvent, ProgressHandle};
use crate::error::Result;
use crate::source::RowSource;
use crate::types::{Bar, FillBoundary, RoutePath};

/// Rows between progress reports
const REPORT_EVERY: u64 = 1000;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RouterSummary {
    pub bulk_rows: u64,
    pub merge_rows: u64,
    /// Rows whose writer had already stopped
    pub dropped_rows: u64,
    pub skipped_rows: u64,
    pub files_read: u64,
    pub missing_days: Vec<NaiveDate>,
}

impl RouterSummary {
    pub fn rows_read(&self) -> u64 {
        self.bulk_rows + self.merge_rows + self.dropped_rows
    }
}

#[derive(Default)]
struct PendingReport {
    bulk: u64,
    merge: u64,
    dropped: u64,
    skipped_reported: u64,
    symbol: Option<String>,
}

/// Runs on a blocking thread: the source does synchronous I/O and rows are
/// handed to the writers with `blocking_send`.
pub struct Router {
    boundary: FillBoundary,
    bulk_tx: Option<mpsc::Sender<Bar>>,
    merge_tx: Option<mpsc::Sender<Bar>>,
    progress: ProgressHandle,
}

impl Router {
    pub fn new(
        boundary: FillBoundary,
        bulk_tx: mpsc::Sender<Bar>,
        merge_tx: mpsc::Sender<Bar>,
        progress: ProgressHandle,
    ) -> Self {
        Self {
            boundary,
            bulk_tx: Some(bulk_tx),
            merge_tx: Some(merge_tx),
            progress,
        }
    }

    /// Drain `source` into the two channels. Both channels close when this
    /// returns, whether the source was exhausted or failed.
    pub fn run(mut self, mut source: Box<dyn RowSource>) -> Result<RouterSummary> {
        let mut summary = RouterSummary::default();
        let mut pending = PendingReport::default();
        let mut last_source: Option<String> = None;

        loop {
            let bar = match source.next_bar() {
                Ok(Some(bar)) => bar,
                Ok(None) => break,
                Err(e) => {
                    error!("❌ Row source failed after {} rows: {}", summary.rows_read(), e);
                    self.flush_report(&mut pending, source.skipped_rows());
                    return Err(e);
                }
            };

            if let Some(name) = source.current_source() {
                if last_source.as_deref() != Some(name) {
                    debug!("Routing rows from {}", name);
                    self.progress
                        .report_blocking(ProgressEvent::Source(name.to_string()));
                    last_source = Some(name.to_string());
                }
            }

            let path = self.boundary.route(bar.timestamp);
            if pending.symbol.as_deref() != Some(bar.symbol.as_str()) {
                pending.symbol = Some(bar.symbol.clone());
            }

            if self.dispatch(path, bar) {
                match path {
                    RoutePath::Bulk => {
                        summary.bulk_rows += 1;
                        pending.bulk += 1;
                    }
                    RoutePath::Merge => {
                        summary.merge_rows += 1;
                        pending.merge += 1;
                    }
                }
            } else {
                summary.dropped_rows += 1;
                pending.dropped += 1;
            }

            if self.bulk_tx.is_none() && self.merge_tx.is_none() {
                warn!("Both writers stopped; ending routing early");
                break;
            }

            if summary.rows_read() % REPORT_EVERY == 0 {
                self.flush_report(&mut pending, source.skipped_rows());
            }
        }

        summary.skipped_rows = source.skipped_rows();
        summary.files_read = source.files_read();
        summary.missing_days = source.missing_days().to_vec();
        self.flush_report(&mut pending, summary.skipped_rows);

        info!(
            "Routing complete: {} files, {} bulk, {} merge, {} skipped, {} dropped",
            summary.files_read,
            summary.bulk_rows,
            summary.merge_rows,
            summary.skipped_rows,
            summary.dropped_rows
        );
        if !summary.missing_days.is_empty() {
            warn!(
                "⚠️ {} trading days had no source file: {:?}",
                summary.missing_days.len(),
                summary.missing_days
            );
        }
        Ok(summary)
    }

    /// `false` when the path's writer has gone away. The channel is then
    /// released so later rows for that path are counted as dropped.
    fn dispatch(&mut self, path: RoutePath, bar: Bar) -> bool {
        let slot = match path {
            RoutePath::Bulk => &mut self.bulk_tx,
            RoutePath::Merge => &mut self.merge_tx,
        };

        let sent = match slot.as_ref() {
            Some(tx) => tx.blocking_send(bar).is_ok(),
            None => return false,
        };

        if !sent {
            warn!("{} writer stopped; its remaining rows will be dropped", path.as_str());
            *slot = None;
        }
        sent
    }

    fn flush_report(&self, pending: &mut PendingReport, skipped_total: u64) {
        let skipped = skipped_total.saturating_sub(pending.skipped_reported);
        pending.skipped_reported = skipped_total;

        self.progress.report_blocking(ProgressEvent::Routed {
            bulk: std::mem::take(&mut pending.bulk),
            merge: std::mem::take(&mut pending.merge),
            dropped: std::mem::take(&mut pending.dropped),
            skipped,
            last_symbol: pending.symbol.clone(),
        });
    }
}

/// Bulk and merge writers: the two consumers of routed rows
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::metrics::{ProgressEvent, ProgressHandle};
use crate::error::Result;
use crate::store::{BarStore, BulkLoad};
use crate::types::{Bar, RoutePath};

pub const DEFAULT_MERGE_BATCH_SIZE: usize = 1000;
pub const DEFAULT_BULK_CHUNK_ROWS: usize = 1000;

/// Streams every bulk-path row into one append-only load, opened on the first
/// row and committed once the channel closes.
pub struct BulkWriter {
    store: Arc<dyn BarStore>,
    chunk_rows: usize,
    progress: ProgressHandle,
}

impl BulkWriter {
    pub fn new(store: Arc<dyn BarStore>, chunk_rows: usize, progress: ProgressHandle) -> Self {
        Self {
            store,
            chunk_rows: chunk_rows.max(1),
            progress,
        }
    }

    /// Returns the number of rows committed. On error the load is aborted and
    /// the channel closed so the Router stops sending. Every row taken off or
    /// left in the channel is then reported as discarded.
    pub async fn run(self, mut rx: mpsc::Receiver<Bar>) -> Result<u64> {
        let mut load: Option<Box<dyn BulkLoad>> = None;
        let mut received = 0u64;

        if let Err(e) = self.stream(&mut rx, &mut load, &mut received).await {
            let discarded = received + discard_remaining(&mut rx).await;
            error!("❌ Bulk load failed, {} rows not written: {}", discarded, e);
            if let Some(load) = load {
                if let Err(abort_err) = load.abort(&e.to_string()).await {
                    warn!("Bulk load abort also failed: {}", abort_err);
                }
            }
            report_discarded(&self.progress, RoutePath::Bulk, discarded).await;
            return Err(e);
        }

        let Some(load) = load else {
            debug!("No rows for the bulk path");
            return Ok(0);
        };

        let written = match load.finish().await {
            Ok(rows) => rows,
            Err(e) => {
                error!("❌ Bulk load of {} rows rejected at commit: {}", received, e);
                report_discarded(&self.progress, RoutePath::Bulk, received).await;
                return Err(e);
            }
        };

        self.progress
            .report(ProgressEvent::Written {
                path: RoutePath::Bulk,
                rows: written,
            })
            .await;
        info!("✅ Bulk load committed {} rows", written);
        Ok(written)
    }

    async fn stream(
        &self,
        rx: &mut mpsc::Receiver<Bar>,
        load: &mut Option<Box<dyn BulkLoad>>,
        received: &mut u64,
    ) -> Result<()> {
        let mut chunk = Vec::with_capacity(self.chunk_rows);

        while let Some(bar) = rx.recv().await {
            *received += 1;
            chunk.push(bar);
            if chunk.len() >= self.chunk_rows {
                self.send_chunk(load, &mut chunk).await?;
            }
        }

        if !chunk.is_empty() {
            self.send_chunk(load, &mut chunk).await?;
        }
        Ok(())
    }

    async fn send_chunk(
        &self,
        load: &mut Option<Box<dyn BulkLoad>>,
        chunk: &mut Vec<Bar>,
    ) -> Result<()> {
        if load.is_none() {
            debug!("Opening bulk load");
            *load = Some(self.store.begin_bulk_load().await?);
        }

        if let Some(active) = load.as_mut() {
            active.send(chunk).await?;
        }

        self.progress
            .report(ProgressEvent::Streamed {
                rows: chunk.len() as u64,
            })
            .await;
        chunk.clear();
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MergeSummary {
    pub rows_written: u64,
    pub batches: u64,
}

/// Upserts merge-path rows in batches of `batch_size`, flushing any remainder
/// when the channel closes.
pub struct MergeWriter {
    store: Arc<dyn BarStore>,
    batch_size: usize,
    progress: ProgressHandle,
}

impl MergeWriter {
    pub fn new(store: Arc<dyn BarStore>, batch_size: usize, progress: ProgressHandle) -> Self {
        Self {
            store,
            batch_size: batch_size.max(1),
            progress,
        }
    }

    /// Batches committed before a failure stay committed.
    pub async fn run(self, mut rx: mpsc::Receiver<Bar>) -> Result<MergeSummary> {
        let mut summary = MergeSummary::default();
        let mut batch = Vec::with_capacity(self.batch_size);

        while let Some(bar) = rx.recv().await {
            batch.push(bar);
            if batch.len() >= self.batch_size {
                if let Err(e) = self.flush(&mut batch, &mut summary).await {
                    let discarded = batch.len() as u64 + discard_remaining(&mut rx).await;
                    error!(
                        "❌ Merge batch failed after {} batches, {} rows not written: {}",
                        summary.batches, discarded, e
                    );
                    report_discarded(&self.progress, RoutePath::Merge, discarded).await;
                    return Err(e);
                }
            }
        }

        if !batch.is_empty() {
            if let Err(e) = self.flush(&mut batch, &mut summary).await {
                error!("❌ Final merge batch of {} rows failed: {}", batch.len(), e);
                report_discarded(&self.progress, RoutePath::Merge, batch.len() as u64).await;
                return Err(e);
            }
        }

        if summary.batches > 0 {
            info!(
                "✅ Merged {} rows in {} batches",
                summary.rows_written, summary.batches
            );
        }
        Ok(summary)
    }

    async fn flush(&self, batch: &mut Vec<Bar>, summary: &mut MergeSummary) -> Result<()> {
        let rows = self.store.upsert(batch).await?;
        summary.rows_written += rows;
        summary.batches += 1;
        debug!("Merge batch {} wrote {} rows", summary.batches, rows);

        self.progress
            .report(ProgressEvent::Written {
                path: RoutePath::Merge,
                rows,
            })
            .await;
        batch.clear();
        Ok(())
    }
}

/// Close `rx` and count the rows still buffered in it.
async fn discard_remaining(rx: &mut mpsc::Receiver<Bar>) -> u64 {
    rx.close();
    let mut rows = 0;
    while rx.recv().await.is_some() {
        rows += 1;
    }
    rows
}

async fn report_discarded(progress: &ProgressHandle, path: RoutePath, rows: u64) {
    if rows > 0 {
        progress.report(ProgressEvent::Discarded { path, rows }).await;
    }
}

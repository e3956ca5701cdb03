/// Derives the partially-filled window from what the store already holds
use std::sync::Arc;
use tracing::{debug, info};

use crate::error::{BackfillError, Result};
use crate::store::BarStore;
use crate::types::FillBoundary;

pub struct RangeProbe {
    store: Arc<dyn BarStore>,
}

impl RangeProbe {
    pub fn new(store: Arc<dyn BarStore>) -> Self {
        Self { store }
    }

    /// One read of per-symbol latest timestamps, reduced to min and max.
    pub async fn compute_boundary(&self) -> Result<FillBoundary> {
        let latest = self
            .store
            .latest_per_symbol()
            .await
            .map_err(|e| BackfillError::BoundaryProbeFailed(e.to_string()))?;

        debug!("Probed latest bar for {} symbols", latest.len());
        let boundary = FillBoundary::from_latest(latest.into_iter().map(|(_, ts)| ts));

        match (boundary.filled_before, boundary.unfilled_after) {
            (Some(lo), Some(hi)) => info!("Partially filled range: {} .. {}", lo, hi),
            _ => info!("Store is empty, nothing to merge"),
        }

        Ok(boundary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryBarStore;
    use crate::types::Bar;
    use chrono::{TimeZone, Utc};

    fn bar(symbol: &str, hour: u32) -> Bar {
        Bar {
            symbol: symbol.to_string(),
            timestamp: Utc.with_ymd_and_hms(2025, 7, 10, hour, 0, 0).unwrap(),
            open: 1.0,
            high: 1.0,
            low: 1.0,
            close: 1.0,
            volume: 1,
            transactions: 1,
        }
    }

    #[tokio::test]
    async fn test_empty_store_gives_empty_boundary() {
        let probe = RangeProbe::new(Arc::new(MemoryBarStore::new()));
        assert!(probe.compute_boundary().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_boundary_spans_least_to_most_advanced_symbol() {
        let store = MemoryBarStore::new();
        store
            .insert_existing(vec![bar("AAPL", 13), bar("AAPL", 14), bar("MSFT", 15), bar("TSLA", 16)])
            .await;

        let boundary = RangeProbe::new(Arc::new(store)).compute_boundary().await.unwrap();
        assert_eq!(boundary.filled_before, Some(bar("AAPL", 14).timestamp));
        assert_eq!(boundary.unfilled_after, Some(bar("TSLA", 16).timestamp));
    }

    #[tokio::test]
    async fn test_single_symbol_gives_degenerate_window() {
        let store = MemoryBarStore::new();
        store.insert_existing(vec![bar("SPY", 14)]).await;

        let boundary = RangeProbe::new(Arc::new(store)).compute_boundary().await.unwrap();
        assert_eq!(boundary.filled_before, boundary.unfilled_after);
        assert!(boundary.contains(bar("SPY", 14).timestamp));
    }

    #[tokio::test]
    async fn test_probe_failure_is_categorized() {
        let store = MemoryBarStore::new().with_failing_probe("connection refused");
        let result = RangeProbe::new(Arc::new(store)).compute_boundary().await;

        match result {
            Err(BackfillError::BoundaryProbeFailed(msg)) => assert!(msg.contains("connection refused")),
            other => panic!("unexpected result: {:?}", other),
        }
    }
}

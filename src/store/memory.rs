/// In-process bar store with the same write semantics as PostgreSQL
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

use super::{BarStore, BulkLoad};
use crate::error::{BackfillError, Result};
use crate::types::Bar;

type BarMap = BTreeMap<(String, DateTime<Utc>), Bar>;

/// Keyed by (symbol, timestamp). Records every write call so callers can
/// observe batching.
#[derive(Clone, Default)]
pub struct MemoryBarStore {
    bars: Arc<RwLock<BarMap>>,
    upsert_batches: Arc<RwLock<Vec<usize>>>,
    bulk_loads: Arc<RwLock<Vec<usize>>>,
    fail_probe: Option<String>,
    fail_upserts: Option<String>,
    fail_bulk_loads: Option<String>,
}

impl MemoryBarStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every probe returns `reason` as a database failure.
    pub fn with_failing_probe(mut self, reason: &str) -> Self {
        self.fail_probe = Some(reason.to_string());
        self
    }

    /// Every upsert fails with `reason`.
    pub fn with_failing_upserts(mut self, reason: &str) -> Self {
        self.fail_upserts = Some(reason.to_string());
        self
    }

    /// Every bulk load is rejected at commit with `reason`.
    pub fn with_failing_bulk_loads(mut self, reason: &str) -> Self {
        self.fail_bulk_loads = Some(reason.to_string());
        self
    }

    /// Seed rows directly, bypassing both write paths.
    pub async fn insert_existing(&self, bars: Vec<Bar>) {
        let mut map = self.bars.write().await;
        for bar in bars {
            map.insert((bar.symbol.clone(), bar.timestamp), bar);
        }
    }

    pub async fn get(&self, symbol: &str, timestamp: DateTime<Utc>) -> Option<Bar> {
        let map = self.bars.read().await;
        map.get(&(symbol.to_string(), timestamp)).cloned()
    }

    /// All rows in key order
    pub async fn snapshot(&self) -> Vec<Bar> {
        let map = self.bars.read().await;
        map.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.bars.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.bars.read().await.is_empty()
    }

    /// Row count of each upsert call, in call order
    pub async fn upsert_batch_sizes(&self) -> Vec<usize> {
        self.upsert_batches.read().await.clone()
    }

    /// Row count of each committed bulk load
    pub async fn bulk_load_sizes(&self) -> Vec<usize> {
        self.bulk_loads.read().await.clone()
    }
}

#[async_trait]
impl BarStore for MemoryBarStore {
    async fn latest_per_symbol(&self) -> Result<Vec<(String, DateTime<Utc>)>> {
        if let Some(reason) = &self.fail_probe {
            return Err(BackfillError::Other(reason.clone()));
        }

        let map = self.bars.read().await;
        let mut latest: BTreeMap<&str, DateTime<Utc>> = BTreeMap::new();
        for (symbol, ts) in map.keys() {
            latest
                .entry(symbol.as_str())
                .and_modify(|cur| *cur = (*cur).max(*ts))
                .or_insert(*ts);
        }

        Ok(latest.into_iter().map(|(s, ts)| (s.to_string(), ts)).collect())
    }

    async fn begin_bulk_load(&self) -> Result<Box<dyn BulkLoad>> {
        Ok(Box::new(MemoryBulkLoad {
            bars: Arc::clone(&self.bars),
            loads: Arc::clone(&self.bulk_loads),
            fail: self.fail_bulk_loads.clone(),
            staged: Vec::new(),
        }))
    }

    async fn upsert(&self, bars: &[Bar]) -> Result<u64> {
        self.upsert_batches.write().await.push(bars.len());

        if let Some(reason) = &self.fail_upserts {
            return Err(BackfillError::MergeFailed(reason.clone()));
        }

        let mut map = self.bars.write().await;
        for bar in bars {
            map.insert((bar.symbol.clone(), bar.timestamp), bar.clone());
        }
        Ok(bars.len() as u64)
    }
}

struct MemoryBulkLoad {
    bars: Arc<RwLock<BarMap>>,
    loads: Arc<RwLock<Vec<usize>>>,
    fail: Option<String>,
    staged: Vec<Bar>,
}

#[async_trait]
impl BulkLoad for MemoryBulkLoad {
    async fn send(&mut self, bars: &[Bar]) -> Result<()> {
        self.staged.extend_from_slice(bars);
        Ok(())
    }

    async fn finish(self: Box<Self>) -> Result<u64> {
        let MemoryBulkLoad {
            bars,
            loads,
            fail,
            staged,
        } = *self;

        if let Some(reason) = fail {
            return Err(BackfillError::BulkLoadFailed(reason));
        }

        let mut map = bars.write().await;
        let mut seen = HashSet::with_capacity(staged.len());
        for bar in &staged {
            let key = (bar.symbol.clone(), bar.timestamp);
            if map.contains_key(&key) || !seen.insert(key) {
                return Err(BackfillError::BulkLoadFailed(format!(
                    "duplicate key ({}, {}) rejects the whole load",
                    bar.symbol, bar.timestamp
                )));
            }
        }

        let rows = staged.len();
        for bar in staged {
            map.insert((bar.symbol.clone(), bar.timestamp), bar);
        }
        loads.write().await.push(rows);
        debug!("Bulk load committed {} rows", rows);

        Ok(rows as u64)
    }

    async fn abort(self: Box<Self>, _reason: &str) -> Result<()> {
        Ok(())
    }
}

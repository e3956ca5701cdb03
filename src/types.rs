/// Core type definitions for the backfill engine
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{BackfillError, Result};

/// Longest ticker the `bars.symbol_id` column accepts
pub const MAX_SYMBOL_LEN: usize = 16;

/// One minute OHLCV observation, keyed by (symbol, timestamp)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub symbol: String,
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: i64,
    pub transactions: i64,
}

impl Bar {
    /// Storage primary key
    pub fn key(&self) -> (&str, DateTime<Utc>) {
        (self.symbol.as_str(), self.timestamp)
    }

    /// Reject values the `bars` table must never see.
    pub fn validate(&self) -> Result<()> {
        if self.symbol.is_empty()
            || self.symbol.chars().count() > MAX_SYMBOL_LEN
            || self.symbol.chars().any(|c| c.is_whitespace() || c.is_control())
        {
            return Err(BackfillError::InvalidBarData(format!(
                "malformed symbol {:?}",
                self.symbol
            )));
        }

        for (name, price) in [
            ("open", self.open),
            ("high", self.high),
            ("low", self.low),
            ("close", self.close),
        ] {
            if !price.is_finite() || price <= 0.0 {
                return Err(BackfillError::InvalidBarData(format!(
                    "{} {} price must be positive, got {}",
                    self.symbol, name, price
                )));
            }
        }

        if self.volume < 0 {
            return Err(BackfillError::InvalidBarData(format!(
                "{} volume must be non-negative, got {}",
                self.symbol, self.volume
            )));
        }
        if self.transactions < 0 {
            return Err(BackfillError::InvalidBarData(format!(
                "{} transactions must be non-negative, got {}",
                self.symbol, self.transactions
            )));
        }

        Ok(())
    }
}

/// Window of timestamps where some symbols have stored bars and others may not.
///
/// `filled_before` is the least-advanced symbol's latest bar, `unfilled_after` the
/// most-advanced one. Both are `None` when the store holds no bars at all.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FillBoundary {
    pub filled_before: Option<DateTime<Utc>>,
    pub unfilled_after: Option<DateTime<Utc>>,
}

impl FillBoundary {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Reduce per-symbol latest timestamps into a boundary.
    pub fn from_latest<I>(latest: I) -> Self
    where
        I: IntoIterator<Item = DateTime<Utc>>,
    {
        latest.into_iter().fold(Self::empty(), |acc, ts| FillBoundary {
            filled_before: Some(acc.filled_before.map_or(ts, |cur| cur.min(ts))),
            unfilled_after: Some(acc.unfilled_after.map_or(ts, |cur| cur.max(ts))),
        })
    }

    pub fn is_empty(&self) -> bool {
        self.filled_before.is_none() && self.unfilled_after.is_none()
    }

    /// Inclusive `filled_before <= t <= unfilled_after`.
    pub fn contains(&self, t: DateTime<Utc>) -> bool {
        match (self.filled_before, self.unfilled_after) {
            (Some(lo), Some(hi)) => lo <= t && t <= hi,
            _ => false,
        }
    }

    pub fn route(&self, t: DateTime<Utc>) -> RoutePath {
        if self.contains(t) {
            RoutePath::Merge
        } else {
            RoutePath::Bulk
        }
    }
}

/// Write path chosen for a single row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RoutePath {
    Bulk,
    Merge,
}

impl RoutePath {
    pub fn as_str(&self) -> &'static str {
        match self {
            RoutePath::Bulk => "BULK",
            RoutePath::Merge => "MERGE",
        }
    }
}

/// PostgreSQL bar store: COPY for the bulk path, multi-row upsert for merges
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::migrate::Migrator;
use sqlx::pool::PoolConnection;
use sqlx::postgres::{PgCopyIn, PgPool, PgPoolCopyExt, PgPoolOptions, Postgres};
use sqlx::QueryBuilder;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{BarStore, BulkLoad};
use crate::error::{BackfillError, Result};
use crate::types::Bar;

const COPY_BARS: &str = "COPY bars (symbol_id, ts, open, high, low, close, volume, transactions) \
                         FROM STDIN WITH (FORMAT csv)";

const INSERT_BARS: &str = "INSERT INTO bars (symbol_id, ts, open, high, low, close, volume, transactions) ";

const ON_CONFLICT_OVERWRITE: &str = " ON CONFLICT (symbol_id, ts) DO UPDATE SET \
                                     open = EXCLUDED.open, \
                                     high = EXCLUDED.high, \
                                     low = EXCLUDED.low, \
                                     close = EXCLUDED.close, \
                                     volume = EXCLUDED.volume, \
                                     transactions = EXCLUDED.transactions";

#[derive(Clone)]
pub struct PgBarStore {
    pool: PgPool,
}

impl PgBarStore {
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(1)
            .acquire_timeout(Duration::from_secs(30))
            .connect(database_url)
            .await?;

        info!("Connected to database (max {} connections)", max_connections);
        Ok(Self { pool })
    }

    /// Apply pending `.sql` migrations from `dir`.
    pub async fn run_migrations(&self, dir: &Path) -> Result<()> {
        let migrator = Migrator::new(dir).await?;
        migrator.run(&self.pool).await?;
        info!("Migrations in {} applied", dir.display());
        Ok(())
    }
}

#[async_trait]
impl BarStore for PgBarStore {
    async fn latest_per_symbol(&self) -> Result<Vec<(String, DateTime<Utc>)>> {
        let rows: Vec<(String, DateTime<Utc>)> =
            sqlx::query_as("SELECT symbol_id, MAX(ts) FROM bars GROUP BY symbol_id")
                .fetch_all(&self.pool)
                .await?;

        debug!("Latest bar timestamps loaded for {} symbols", rows.len());
        Ok(rows)
    }

    async fn begin_bulk_load(&self) -> Result<Box<dyn BulkLoad>> {
        let copy = self
            .pool
            .copy_in_raw(COPY_BARS)
            .await
            .map_err(|e| BackfillError::BulkLoadFailed(format!("COPY could not start: {}", e)))?;

        Ok(Box::new(PgBulkLoad { copy, rows: 0 }))
    }

    async fn upsert(&self, bars: &[Bar]) -> Result<u64> {
        if bars.is_empty() {
            return Ok(0);
        }

        let rows = dedupe_last_wins(bars);
        if rows.len() != bars.len() {
            warn!(
                "Merge batch had {} duplicate keys, keeping the last of each",
                bars.len() - rows.len()
            );
        }

        let mut builder = upsert_query(rows);
        let result = builder
            .build()
            .execute(&self.pool)
            .await
            .map_err(|e| BackfillError::MergeFailed(e.to_string()))?;

        Ok(result.rows_affected())
    }
}

struct PgBulkLoad {
    copy: PgCopyIn<PoolConnection<Postgres>>,
    rows: u64,
}

#[async_trait]
impl BulkLoad for PgBulkLoad {
    async fn send(&mut self, bars: &[Bar]) -> Result<()> {
        let chunk = encode_csv(bars)?;
        self.copy
            .send(chunk)
            .await
            .map_err(|e| BackfillError::BulkLoadFailed(e.to_string()))?;
        self.rows += bars.len() as u64;
        Ok(())
    }

    async fn finish(self: Box<Self>) -> Result<u64> {
        let sent = self.rows;
        let appended = self
            .copy
            .finish()
            .await
            .map_err(|e| BackfillError::BulkLoadFailed(e.to_string()))?;

        if appended != sent {
            warn!("COPY reported {} rows, {} were sent", appended, sent);
        }
        Ok(appended)
    }

    async fn abort(self: Box<Self>, reason: &str) -> Result<()> {
        self.copy
            .abort(reason)
            .await
            .map_err(|e| BackfillError::BulkLoadFailed(e.to_string()))
    }
}

/// Multi-row `INSERT ... ON CONFLICT DO UPDATE`, eight binds per row.
fn upsert_query<'a>(rows: Vec<&'a Bar>) -> QueryBuilder<'a, Postgres> {
    let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(INSERT_BARS);
    builder.push_values(rows, |mut b, bar| {
        b.push_bind(bar.symbol.as_str())
            .push_bind(bar.timestamp)
            .push_bind(bar.open)
            .push_bind(bar.high)
            .push_bind(bar.low)
            .push_bind(bar.close)
            .push_bind(bar.volume)
            .push_bind(bar.transactions);
    });
    builder.push(ON_CONFLICT_OVERWRITE);
    builder
}

/// Render rows in the column order of `COPY_BARS`.
fn encode_csv(bars: &[Bar]) -> Result<Vec<u8>> {
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(Vec::with_capacity(bars.len() * 64));

    for bar in bars {
        writer.serialize((
            bar.symbol.as_str(),
            bar.timestamp.to_rfc3339_opts(SecondsFormat::AutoSi, true),
            bar.open,
            bar.high,
            bar.low,
            bar.close,
            bar.volume,
            bar.transactions,
        ))?;
    }

    writer
        .into_inner()
        .map_err(|e| BackfillError::BulkLoadFailed(format!("CSV encoding failed: {}", e)))
}

/// One row per key, keeping the last occurrence. A single upsert statement
/// cannot touch the same key twice.
fn dedupe_last_wins(bars: &[Bar]) -> Vec<&Bar> {
    let mut last: HashMap<(&str, DateTime<Utc>), usize> = HashMap::with_capacity(bars.len());
    for (idx, bar) in bars.iter().enumerate() {
        last.insert(bar.key(), idx);
    }

    if last.len() == bars.len() {
        return bars.iter().collect();
    }

    bars.iter()
        .enumerate()
        .filter(|(idx, bar)| last.get(&bar.key()) == Some(idx))
        .map(|(_, bar)| bar)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn bar(symbol: &str, minute: u32, volume: i64) -> Bar {
        Bar {
            symbol: symbol.to_string(),
            timestamp: Utc.with_ymd_and_hms(2025, 7, 10, 13, minute, 0).unwrap(),
            open: 1.0,
            high: 2.0,
            low: 0.5,
            close: 1.5,
            volume,
            transactions: 10,
        }
    }

    #[test]
    fn test_encode_csv_column_order() {
        let encoded = encode_csv(&[bar("AAPL", 30, 100)]).unwrap();
        let line = String::from_utf8(encoded).unwrap();
        assert_eq!(line, "AAPL,2025-07-10T13:30:00Z,1.0,2.0,0.5,1.5,100,10\n");
    }

    const MIGRATION: &str = include_str!("../../migrations/0001_create_bars.sql");
    const VALUE_COLUMNS: [&str; 6] = ["open", "high", "low", "close", "volume", "transactions"];

    fn column_list(sql: &str) -> Vec<String> {
        let open = sql.find('(').unwrap();
        let close = sql[open..].find(')').unwrap() + open;
        sql[open + 1..close]
            .split(',')
            .map(|c| c.trim().to_string())
            .collect()
    }

    #[test]
    fn test_upsert_overwrites_every_value_column() {
        let bars = vec![bar("AAPL", 30, 1), bar("MSFT", 30, 2)];
        let builder = upsert_query(bars.iter().collect());
        let sql = builder.sql();

        assert!(sql.starts_with(INSERT_BARS));
        assert!(sql.contains("ON CONFLICT (symbol_id, ts) DO UPDATE SET"));
        for col in VALUE_COLUMNS {
            assert!(sql.contains(&format!("{col} = EXCLUDED.{col}")), "{} not overwritten", col);
        }
        assert!(!sql.contains("symbol_id = EXCLUDED"));
        assert!(!sql.contains("ts = EXCLUDED"));
    }

    #[test]
    fn test_upsert_binds_eight_values_per_row() {
        let bars: Vec<Bar> = (0..3).map(|m| bar("AAPL", m, 1)).collect();
        let builder = upsert_query(bars.iter().collect());
        let sql = builder.sql();

        assert_eq!(sql.matches('$').count(), 3 * 8);
        assert!(sql.contains("$24"));
        assert!(!sql.contains("$25"));
    }

    #[test]
    fn test_copy_and_insert_columns_match_schema() {
        let copy_columns = column_list(COPY_BARS);
        assert_eq!(copy_columns, column_list(INSERT_BARS));
        assert_eq!(copy_columns.len(), 8);
        assert_eq!(copy_columns[..2], ["symbol_id", "ts"]);
        assert_eq!(copy_columns[2..], VALUE_COLUMNS);

        for col in &copy_columns {
            assert!(
                MIGRATION.lines().any(|l| l.trim_start().starts_with(&format!("{} ", col))),
                "{} missing from migration",
                col
            );
        }
        assert!(MIGRATION.contains(&format!("VARCHAR({})", crate::types::MAX_SYMBOL_LEN)));
    }

    #[test]
    fn test_dedupe_keeps_last_occurrence() {
        let bars = vec![bar("AAPL", 30, 1), bar("MSFT", 30, 2), bar("AAPL", 30, 3)];
        let rows = dedupe_last_wins(&bars);

        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].symbol, "MSFT");
        assert_eq!(rows[1].volume, 3);
    }

    #[test]
    fn test_dedupe_passthrough_without_duplicates() {
        let bars = vec![bar("AAPL", 30, 1), bar("AAPL", 31, 2)];
        assert_eq!(dedupe_last_wins(&bars).len(), 2);
    }
}

/// Minute aggregates read from per-day gzipped CSV flat files
///
/// One file per trading day at `<prefix>/YYYY/MM/YYYY-MM-DD.csv.gz` (New York
/// date), header `ticker,volume,open,close,high,low,window_start,transactions`,
/// `window_start` in Unix nanoseconds.
use chrono::{DateTime, Datelike, NaiveDate, TimeZone, Utc};
use csv::StringRecord;
use flate2::read::MultiGzDecoder;
use serde::Deserialize;
use std::io::Read;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::object_store::FlatFileStore;
use super::{RowSource, RowSourceProvider};
use crate::error::{BackfillError, Result};
use crate::time::{is_trading_day, market_date, next_trading_day};
use crate::types::Bar;

pub const DEFAULT_PREFIX: &str = "us_stocks_sip/minute_aggs_v1";

const REQUIRED_COLUMNS: [&str; 8] = [
    "ticker",
    "volume",
    "open",
    "close",
    "high",
    "low",
    "window_start",
    "transactions",
];

/// Object key of the flat file holding `date`'s bars
pub fn flat_file_key(prefix: &str, date: NaiveDate) -> String {
    format!(
        "{}/{:04}/{:02}/{}.csv.gz",
        prefix.trim_end_matches('/'),
        date.year(),
        date.month(),
        date.format("%Y-%m-%d")
    )
}

#[derive(Debug, Deserialize)]
struct FlatFileRecord {
    ticker: String,
    volume: f64,
    open: f64,
    close: f64,
    high: f64,
    low: f64,
    window_start: i64,
    transactions: u64,
}

impl FlatFileRecord {
    fn into_bar(self) -> std::result::Result<Bar, String> {
        if self.window_start < 0 {
            return Err(format!("window_start {} is before the epoch", self.window_start));
        }

        let volume = self.volume;
        if !volume.is_finite() || volume < 0.0 || volume.fract() != 0.0 || volume > i64::MAX as f64 {
            return Err(format!("volume {} is not a non-negative integer", volume));
        }

        let transactions = i64::try_from(self.transactions)
            .map_err(|_| format!("transactions {} out of range", self.transactions))?;

        let bar = Bar {
            symbol: self.ticker,
            timestamp: Utc.timestamp_nanos(self.window_start),
            open: self.open,
            high: self.high,
            low: self.low,
            close: self.close,
            volume: volume as i64,
            transactions,
        };
        bar.validate().map_err(|e| e.to_string())?;
        Ok(bar)
    }
}

/// Opens [`FlatFileRowSource`]s over a [`FlatFileStore`]
pub struct FlatFileProvider {
    store: Arc<dyn FlatFileStore>,
    prefix: String,
    last_day: Option<NaiveDate>,
}

impl FlatFileProvider {
    pub fn new(store: Arc<dyn FlatFileStore>, prefix: impl Into<String>) -> Self {
        Self {
            store,
            prefix: prefix.into(),
            last_day: None,
        }
    }

    /// Never read past `day` (defaults to today in New York).
    pub fn with_last_day(mut self, day: NaiveDate) -> Self {
        self.last_day = Some(day);
        self
    }
}

impl RowSourceProvider for FlatFileProvider {
    fn open(&self, start: DateTime<Utc>) -> Result<Box<dyn RowSource>> {
        self.store.check()?;

        let last_day = self.last_day.unwrap_or_else(|| market_date(Utc::now()));
        info!(
            "Reading flat files from {} starting {} ({} through {})",
            self.store.describe(),
            start,
            market_date(start),
            last_day
        );

        Ok(Box::new(FlatFileRowSource::new(
            Arc::clone(&self.store),
            self.prefix.clone(),
            start,
            last_day,
        )))
    }
}

struct OpenFile {
    key: String,
    reader: csv::Reader<MultiGzDecoder<Box<dyn Read + Send>>>,
    headers: StringRecord,
    record: StringRecord,
}

impl OpenFile {
    fn new(key: String, body: Box<dyn Read + Send>) -> Result<Self> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .from_reader(MultiGzDecoder::new(body));

        let headers = reader.headers()?.clone();
        if let Some(missing) = REQUIRED_COLUMNS
            .iter()
            .find(|col| !headers.iter().any(|h| h == **col))
        {
            return Err(BackfillError::InvalidBarData(format!(
                "{} header is missing column {:?}",
                key, missing
            )));
        }

        Ok(Self {
            key,
            reader,
            headers,
            record: StringRecord::new(),
        })
    }

    fn read_bar(&mut self) -> Result<Option<Bar>> {
        if !self.reader.read_record(&mut self.record)? {
            return Ok(None);
        }

        let line = self.record.position().map_or(0, |p| p.line());
        let parsed: FlatFileRecord = self
            .record
            .deserialize(Some(&self.headers))
            .map_err(|e| BackfillError::InvalidBarData(format!("{} line {}: {}", self.key, line, e)))?;

        parsed
            .into_bar()
            .map(Some)
            .map_err(|msg| BackfillError::InvalidBarData(format!("{} line {}: {}", self.key, line, msg)))
    }
}

/// Walks one flat file per trading day from `start`'s New York date up to
/// `last_day`, yielding rows at or after `start`.
///
/// A trading day without a file is recorded as a gap once a later day's file
/// turns up. Missing days at the tail have not been published yet and are not
/// gaps. The source ends after `last_day`.
pub struct FlatFileRowSource {
    store: Arc<dyn FlatFileStore>,
    prefix: String,
    start: DateTime<Utc>,
    next_day: NaiveDate,
    last_day: NaiveDate,
    file: Option<OpenFile>,
    exhausted: bool,
    skipped: u64,
    files_read: u64,
    unpublished: Vec<NaiveDate>,
    gaps: Vec<NaiveDate>,
}

impl FlatFileRowSource {
    pub fn new(
        store: Arc<dyn FlatFileStore>,
        prefix: String,
        start: DateTime<Utc>,
        last_day: NaiveDate,
    ) -> Self {
        Self {
            store,
            prefix,
            start,
            next_day: market_date(start),
            last_day,
            file: None,
            exhausted: false,
            skipped: 0,
            files_read: 0,
            unpublished: Vec::new(),
            gaps: Vec::new(),
        }
    }

    fn advance(&mut self) -> Result<Option<Bar>> {
        loop {
            let file = match self.file.as_mut() {
                Some(file) => file,
                None => {
                    if !self.open_next_file()? {
                        return Ok(None);
                    }
                    continue;
                }
            };

            match file.read_bar()? {
                Some(bar) if bar.timestamp < self.start => self.skipped += 1,
                Some(bar) => return Ok(Some(bar)),
                None => {
                    debug!("Finished {}", file.key);
                    self.file = None;
                }
            }
        }
    }

    /// Open the next trading day's file. `false` once `last_day` is passed.
    fn open_next_file(&mut self) -> Result<bool> {
        while self.next_day <= self.last_day {
            let day = self.next_day;
            self.next_day = next_trading_day(day);

            if !is_trading_day(day) {
                debug!("Skipping {} (market closed)", day);
                continue;
            }

            let key = flat_file_key(&self.prefix, day);
            match self.store.open(&key)? {
                Some(body) => {
                    if !self.unpublished.is_empty() {
                        warn!(
                            "⚠️ No flat files for {}, continuing with {}",
                            format_days(&self.unpublished),
                            day
                        );
                        self.gaps.append(&mut self.unpublished);
                    }
                    debug!("Opened {}", key);
                    self.file = Some(OpenFile::new(key, body)?);
                    self.files_read += 1;
                    return Ok(true);
                }
                None => {
                    debug!("Flat file {} does not exist", key);
                    self.unpublished.push(day);
                }
            }
        }

        if let Some(first) = self.unpublished.first() {
            info!(
                "No flat files published from {} through {}",
                first, self.last_day
            );
        }
        Ok(false)
    }
}

impl RowSource for FlatFileRowSource {
    fn next_bar(&mut self) -> Result<Option<Bar>> {
        if self.exhausted {
            return Ok(None);
        }

        match self.advance() {
            Ok(Some(bar)) => Ok(Some(bar)),
            Ok(None) => {
                self.exhausted = true;
                Ok(None)
            }
            Err(e) => {
                self.exhausted = true;
                self.file = None;
                Err(e)
            }
        }
    }

    fn current_source(&self) -> Option<&str> {
        self.file.as_ref().map(|f| f.key.as_str())
    }

    fn skipped_rows(&self) -> u64 {
        self.skipped
    }

    fn files_read(&self) -> u64 {
        self.files_read
    }

    fn missing_days(&self) -> &[NaiveDate] {
        &self.gaps
    }
}

fn format_days(days: &[NaiveDate]) -> String {
    days.iter()
        .map(|d| d.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

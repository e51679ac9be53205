//! Bar data: CSV loading and the SQLite bar cache
//!
//! The cache is keyed by (symbol, timestamp, timeframe) with upsert
//! semantics, so repeated ingests are idempotent. Timestamps are stored as
//! naive UTC text. Range scans return bars ordered by timestamp.

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::{params, Connection};
use std::collections::HashMap;
use std::path::Path;
use tracing::{info, warn};

use crate::types::{Bar, Symbol};

const TS_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Anything that can serve ordered historical bars
pub trait BarSource {
    fn bars(
        &self,
        symbol: &Symbol,
        timeframe: &str,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Result<Vec<Bar>>;
}

// =============================================================================
// CSV loading
// =============================================================================

/// Load OHLCV bars from a CSV file with columns
/// datetime,open,high,low,close,volume
pub fn load_csv(path: impl AsRef<Path>, symbol: &Symbol, timeframe: &str) -> Result<Vec<Bar>> {
    let mut reader = csv::Reader::from_path(path.as_ref()).context("Failed to open CSV file")?;

    let mut bars: Vec<Bar> = Vec::new();

    for (row_idx, result) in reader.records().enumerate() {
        let record = result.context(format!("Failed to read row {}", row_idx + 1))?;

        let dt_str = record.get(0).context("Missing datetime column")?;
        let timestamp = parse_timestamp(dt_str)
            .context(format!("Failed to parse datetime: {}", dt_str))?;

        let field = |idx: usize, name: &str| -> Result<f64> {
            record
                .get(idx)
                .context(format!("Missing {} column", name))?
                .parse()
                .context(format!("Failed to parse {}", name))
        };

        let bar = Bar::new(
            symbol.clone(),
            timestamp,
            timeframe,
            field(1, "open")?,
            field(2, "high")?,
            field(3, "low")?,
            field(4, "close")?,
            field(5, "volume")?,
        )?;

        if let Some(last) = bars.last() {
            if bar.timestamp < last.timestamp {
                anyhow::bail!(
                    "bars out of order at row {}: {} after {}",
                    row_idx + 1,
                    bar.timestamp,
                    last.timestamp
                );
            }
        }
        bars.push(bar);
    }

    Ok(bars)
}

/// Load data for multiple symbols from `{symbol}_{timeframe}.csv` files
pub fn load_multi_symbol(
    data_dir: impl AsRef<Path>,
    symbols: &[Symbol],
    timeframe: &str,
) -> Result<HashMap<Symbol, Vec<Bar>>> {
    let mut data = HashMap::new();

    for symbol in symbols {
        let filename = format!("{}_{}.csv", symbol.as_str(), timeframe);
        let path = data_dir.as_ref().join(&filename);

        if !path.exists() {
            warn!("Data file not found: {}", path.display());
            continue;
        }

        let bars = load_csv(&path, symbol, timeframe)
            .context(format!("Failed to load data for {}", symbol))?;

        info!("Loaded {} bars for {}", bars.len(), symbol);
        data.insert(symbol.clone(), bars);
    }

    if data.is_empty() {
        anyhow::bail!("No data loaded for any symbol");
    }

    Ok(data)
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
    if let Ok(dt) = s.parse::<DateTime<Utc>>() {
        return Ok(dt);
    }
    let naive = NaiveDateTime::parse_from_str(s, TS_FORMAT)
        .or_else(|_| {
            chrono::NaiveDate::parse_from_str(s, "%Y-%m-%d").map(|d| d.and_hms_opt(0, 0, 0).unwrap())
        })
        .context("unrecognized timestamp format")?;
    Ok(DateTime::from_naive_utc_and_offset(naive, Utc))
}

// =============================================================================
// SQLite bar cache
// =============================================================================

/// Bar cache keyed by (symbol, timestamp, timeframe)
pub struct BarStore {
    conn: Connection,
}

impl BarStore {
    /// Open (or create) a cache at the given path
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let conn = Connection::open(path.as_ref())
            .with_context(|| format!("Failed to open bar cache: {}", path.as_ref().display()))?;
        Self::init(conn)
    }

    /// In-memory cache, used by tests
    pub fn in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS bars (
                symbol    TEXT NOT NULL,
                timestamp TEXT NOT NULL,
                timeframe TEXT NOT NULL,
                open      REAL NOT NULL,
                high      REAL NOT NULL,
                low       REAL NOT NULL,
                close     REAL NOT NULL,
                volume    REAL NOT NULL,
                PRIMARY KEY (symbol, timestamp, timeframe)
            );",
        )?;
        Ok(Self { conn })
    }

    /// Insert or replace one bar (idempotent by primary key)
    pub fn upsert(&self, bar: &Bar) -> Result<()> {
        self.conn.execute(
            "INSERT INTO bars (symbol, timestamp, timeframe, open, high, low, close, volume)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT (symbol, timestamp, timeframe) DO UPDATE SET
                open = excluded.open,
                high = excluded.high,
                low = excluded.low,
                close = excluded.close,
                volume = excluded.volume",
            params![
                bar.symbol.as_str(),
                bar.timestamp.naive_utc().format(TS_FORMAT).to_string(),
                bar.timeframe,
                bar.open,
                bar.high,
                bar.low,
                bar.close,
                bar.volume,
            ],
        )?;
        Ok(())
    }

    /// Upsert a batch inside one transaction, returning the count written
    pub fn upsert_batch(&mut self, bars: &[Bar]) -> Result<usize> {
        let tx = self.conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO bars (symbol, timestamp, timeframe, open, high, low, close, volume)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT (symbol, timestamp, timeframe) DO UPDATE SET
                    open = excluded.open,
                    high = excluded.high,
                    low = excluded.low,
                    close = excluded.close,
                    volume = excluded.volume",
            )?;
            for bar in bars {
                stmt.execute(params![
                    bar.symbol.as_str(),
                    bar.timestamp.naive_utc().format(TS_FORMAT).to_string(),
                    bar.timeframe,
                    bar.open,
                    bar.high,
                    bar.low,
                    bar.close,
                    bar.volume,
                ])?;
            }
        }
        tx.commit()?;
        Ok(bars.len())
    }

    /// Ingest a CSV file for one symbol/timeframe
    pub fn import_csv(
        &mut self,
        path: impl AsRef<Path>,
        symbol: &Symbol,
        timeframe: &str,
    ) -> Result<usize> {
        let bars = load_csv(path, symbol, timeframe)?;
        self.upsert_batch(&bars)
    }

    /// Count of cached bars for a symbol/timeframe
    pub fn count(&self, symbol: &Symbol, timeframe: &str) -> Result<usize> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM bars WHERE symbol = ?1 AND timeframe = ?2",
            params![symbol.as_str(), timeframe],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }
}

impl BarSource for BarStore {
    fn bars(
        &self,
        symbol: &Symbol,
        timeframe: &str,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Result<Vec<Bar>> {
        let start = start
            .map(|t| t.naive_utc().format(TS_FORMAT).to_string())
            .unwrap_or_else(|| "0000-01-01 00:00:00".to_string());
        let end = end
            .map(|t| t.naive_utc().format(TS_FORMAT).to_string())
            .unwrap_or_else(|| "9999-12-31 23:59:59".to_string());

        let mut stmt = self.conn.prepare(
            "SELECT timestamp, open, high, low, close, volume FROM bars
             WHERE symbol = ?1 AND timeframe = ?2 AND timestamp >= ?3 AND timestamp <= ?4
             ORDER BY timestamp ASC",
        )?;

        let rows = stmt.query_map(params![symbol.as_str(), timeframe, start, end], |row| {
            let ts: String = row.get(0)?;
            Ok((
                ts,
                row.get::<_, f64>(1)?,
                row.get::<_, f64>(2)?,
                row.get::<_, f64>(3)?,
                row.get::<_, f64>(4)?,
                row.get::<_, f64>(5)?,
            ))
        })?;

        let mut bars = Vec::new();
        for row in rows {
            let (ts, open, high, low, close, volume) = row?;
            let naive = NaiveDateTime::parse_from_str(&ts, TS_FORMAT)
                .context("corrupt timestamp in bar cache")?;
            bars.push(Bar::new(
                symbol.clone(),
                DateTime::from_naive_utc_and_offset(naive, Utc),
                timeframe,
                open,
                high,
                low,
                close,
                volume,
            )?);
        }
        Ok(bars)
    }
}

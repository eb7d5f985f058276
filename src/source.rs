//! External market-data fetch collaborators
//!
//! The warehouse core never scrapes anything itself; it depends on the
//! [`MarketDataSource`] contract and treats every call as blocking. A
//! CSV-snapshot implementation is provided for offline fixtures and replay.

use crate::error::{Result, WarehouseError};
use crate::types::{DateWindow, Row, Symbol};
use chrono::{Datelike, NaiveDate};
use csv::ReaderBuilder;
use std::path::{Path, PathBuf};

/// Fetch contract per raw table
///
/// Implementations must return rows keyed by `(base_dt, symbol)` with no
/// duplicate keys, covering exactly the requested window and entity set, and
/// fail with [`WarehouseError::SourceUnavailable`] when the upstream cannot
/// be reached. `offset` asks for that many extra leading periods of context;
/// `full_backfill` marks a whole-history request rather than an incremental
/// slice, for sources that route the two differently.
pub trait MarketDataSource {
    /// Non-trading dates of one calendar year
    fn fetch_holidays(&self, year: i32) -> Result<Vec<NaiveDate>>;

    /// Month-end snapshot rows; each row carries the `base_mt` apply month
    /// and the `sym_obj` tradable flag
    fn fetch_month_end(&self, window: &DateWindow) -> Result<Vec<Row>>;

    fn fetch_daily(
        &self,
        window: &DateWindow,
        symbols: &[Symbol],
        offset: u32,
        full_backfill: bool,
    ) -> Result<Vec<Row>>;

    /// Confirmed quarterly fundamentals
    fn fetch_quarterly(
        &self,
        window: &DateWindow,
        symbols: &[Symbol],
        offset: u32,
        full_backfill: bool,
    ) -> Result<Vec<Row>>;

    /// Preliminary quarterly fundamentals, later superseded by confirmed ones
    fn fetch_quarterly_prv(
        &self,
        window: &DateWindow,
        symbols: &[Symbol],
        offset: u32,
        full_backfill: bool,
    ) -> Result<Vec<Row>>;

    fn fetch_annual(
        &self,
        window: &DateWindow,
        symbols: &[Symbol],
        offset: u32,
        full_backfill: bool,
    ) -> Result<Vec<Row>>;

    /// Daily returns; with `include_index` the source adds its benchmark
    /// index series alongside the requested symbols
    fn fetch_returns(
        &self,
        window: &DateWindow,
        symbols: &[Symbol],
        offset: u32,
        include_index: bool,
    ) -> Result<Vec<Row>>;
}

/// Data source reading per-table CSV snapshot files from a directory
///
/// Each `<table>.csv` has a header row with a `base_dt` column (`%Y-%m-%d`),
/// an optional `symbol` column and arbitrary value columns. Values parse as
/// booleans or numbers where possible and fall back to strings.
pub struct CsvDataSource {
    dir: PathBuf,
    index_symbols: Vec<Symbol>,
}

impl CsvDataSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            index_symbols: Vec::new(),
        }
    }

    /// Benchmark index series appended to returns when requested
    pub fn with_index_symbols<I, S>(mut self, symbols: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<Symbol>,
    {
        self.index_symbols = symbols.into_iter().map(Into::into).collect();
        self
    }

    fn load_table(&self, table: &str) -> Result<Vec<Row>> {
        let path = self.dir.join(format!("{}.csv", table));
        read_rows_csv(&path)
    }

    fn fetch_slice(
        &self,
        table: &str,
        window: &DateWindow,
        symbols: &[Symbol],
    ) -> Result<Vec<Row>> {
        let rows = self.load_table(table)?;
        Ok(rows
            .into_iter()
            .filter(|r| window.contains(r.base_dt) && symbols.contains(&r.symbol))
            .collect())
    }
}

/// Read warehouse rows from a CSV snapshot file
pub fn read_rows_csv(path: &Path) -> Result<Vec<Row>> {
    let mut reader = ReaderBuilder::new()
        .has_headers(true)
        .from_path(path)
        .map_err(|e| {
            WarehouseError::SourceUnavailable(format!("failed to open {}: {}", path.display(), e))
        })?;

    let headers = reader
        .headers()
        .map_err(|e| {
            WarehouseError::SourceUnavailable(format!(
                "failed to read headers of {}: {}",
                path.display(),
                e
            ))
        })?
        .clone();

    let date_idx = headers
        .iter()
        .position(|h| h.eq_ignore_ascii_case("base_dt"))
        .ok_or_else(|| {
            WarehouseError::SourceUnavailable(format!(
                "column 'base_dt' not found in {}",
                path.display()
            ))
        })?;
    let symbol_idx = headers.iter().position(|h| h.eq_ignore_ascii_case("symbol"));

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record.map_err(|e| {
            WarehouseError::SourceUnavailable(format!("bad record in {}: {}", path.display(), e))
        })?;

        let date_str = record.get(date_idx).unwrap_or_default();
        let base_dt = NaiveDate::parse_from_str(date_str, "%Y-%m-%d").map_err(|_| {
            WarehouseError::SourceUnavailable(format!(
                "invalid base_dt {:?} in {}",
                date_str,
                path.display()
            ))
        })?;
        let symbol = symbol_idx
            .and_then(|i| record.get(i))
            .unwrap_or_default()
            .to_string();

        let mut row = Row::new(base_dt, symbol);
        for (idx, value) in record.iter().enumerate() {
            if idx == date_idx || Some(idx) == symbol_idx || value.is_empty() {
                continue;
            }
            row = row.with_field(&headers[idx], parse_field(value));
        }
        rows.push(row);
    }

    rows.sort_by(|a, b| a.key().cmp(&b.key()));
    Ok(rows)
}

fn parse_field(value: &str) -> serde_json::Value {
    match value {
        "true" | "True" => serde_json::Value::Bool(true),
        "false" | "False" => serde_json::Value::Bool(false),
        _ => value
            .parse::<f64>()
            .ok()
            .and_then(serde_json::Number::from_f64)
            .map(serde_json::Value::Number)
            .unwrap_or_else(|| serde_json::Value::String(value.to_string())),
    }
}

impl MarketDataSource for CsvDataSource {
    fn fetch_holidays(&self, year: i32) -> Result<Vec<NaiveDate>> {
        let rows = self.load_table("holidays")?;
        Ok(rows
            .into_iter()
            .map(|r| r.base_dt)
            .filter(|d| d.year() == year)
            .collect())
    }

    fn fetch_month_end(&self, window: &DateWindow) -> Result<Vec<Row>> {
        let rows = self.load_table("month_end")?;
        Ok(rows
            .into_iter()
            .filter(|r| window.contains(r.base_dt))
            .collect())
    }

    fn fetch_daily(
        &self,
        window: &DateWindow,
        symbols: &[Symbol],
        _offset: u32,
        _full_backfill: bool,
    ) -> Result<Vec<Row>> {
        self.fetch_slice("daily", window, symbols)
    }

    fn fetch_quarterly(
        &self,
        window: &DateWindow,
        symbols: &[Symbol],
        _offset: u32,
        _full_backfill: bool,
    ) -> Result<Vec<Row>> {
        self.fetch_slice("quarterly", window, symbols)
    }

    fn fetch_quarterly_prv(
        &self,
        window: &DateWindow,
        symbols: &[Symbol],
        _offset: u32,
        _full_backfill: bool,
    ) -> Result<Vec<Row>> {
        self.fetch_slice("quarterly_prv", window, symbols)
    }

    fn fetch_annual(
        &self,
        window: &DateWindow,
        symbols: &[Symbol],
        _offset: u32,
        _full_backfill: bool,
    ) -> Result<Vec<Row>> {
        self.fetch_slice("annual", window, symbols)
    }

    fn fetch_returns(
        &self,
        window: &DateWindow,
        symbols: &[Symbol],
        _offset: u32,
        include_index: bool,
    ) -> Result<Vec<Row>> {
        let rows = self.load_table("returns")?;
        Ok(rows
            .into_iter()
            .filter(|r| {
                window.contains(r.base_dt)
                    && (symbols.contains(&r.symbol)
                        || (include_index && self.index_symbols.contains(&r.symbol)))
            })
            .collect())
    }
}

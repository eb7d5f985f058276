//! Table store abstraction and watermark helpers
//!
//! The orchestrator treats storage as a set of named row tables supporting
//! append, predicate-scoped removal and windowed reads. Replacing a key range
//! is remove-then-append as one logical unit; backends make it atomic where
//! they can so partial failure between the two halves cannot be observed.

pub mod memory;
#[cfg(feature = "rusqlite-support")]
pub mod sqlite;

pub use memory::MemoryStore;
#[cfg(feature = "rusqlite-support")]
pub use sqlite::SqliteStore;

use crate::error::{Result, WarehouseError};
use crate::types::{Row, Symbol};
use chrono::NaiveDate;
use hashbrown::HashSet;
use serde_json::Value;

/// Row filter for reads and removals
///
/// All constraints are conjunctive. An empty predicate matches every row.
#[derive(Debug, Clone, Default)]
pub struct Predicate {
    date_from: Option<NaiveDate>,
    date_to: Option<NaiveDate>,
    date_any: Option<Vec<NaiveDate>>,
    symbols: Option<HashSet<Symbol>>,
    field_eq: Vec<(String, Value)>,
    str_field_ge: Option<(String, String)>,
}

impl Predicate {
    /// Match every row
    pub fn all() -> Self {
        Self::default()
    }

    /// Keep rows with `base_dt >= date`
    pub fn date_from(mut self, date: NaiveDate) -> Self {
        self.date_from = Some(date);
        self
    }

    /// Keep rows with `base_dt <= date`
    pub fn date_to(mut self, date: NaiveDate) -> Self {
        self.date_to = Some(date);
        self
    }

    /// Keep rows with `base_dt` equal to `date`
    pub fn date_eq(self, date: NaiveDate) -> Self {
        self.date_from(date).date_to(date)
    }

    /// Keep rows whose `base_dt` is one of the given dates
    pub fn date_in(mut self, dates: impl IntoIterator<Item = NaiveDate>) -> Self {
        self.date_any = Some(dates.into_iter().collect());
        self
    }

    /// Keep rows whose symbol is in the given set
    pub fn symbols_in<I, S>(mut self, symbols: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<Symbol>,
    {
        self.symbols = Some(symbols.into_iter().map(Into::into).collect());
        self
    }

    /// Keep rows whose field equals the given value
    pub fn field_eq(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.field_eq.push((name.to_string(), value.into()));
        self
    }

    /// Keep rows whose string field is lexicographically `>=` the bound;
    /// used for period keys such as `quarter >= "2024-03"`
    pub fn str_field_ge(mut self, name: &str, bound: impl Into<String>) -> Self {
        self.str_field_ge = Some((name.to_string(), bound.into()));
        self
    }

    pub fn matches(&self, row: &Row) -> bool {
        if let Some(from) = self.date_from {
            if row.base_dt < from {
                return false;
            }
        }
        if let Some(to) = self.date_to {
            if row.base_dt > to {
                return false;
            }
        }
        if let Some(dates) = &self.date_any {
            if !dates.contains(&row.base_dt) {
                return false;
            }
        }
        if let Some(symbols) = &self.symbols {
            if !symbols.contains(row.symbol.as_str()) {
                return false;
            }
        }
        for (name, value) in &self.field_eq {
            if row.field(name) != Some(value) {
                return false;
            }
        }
        if let Some((name, bound)) = &self.str_field_ge {
            match row.field_str(name) {
                Some(value) if value >= bound.as_str() => {}
                _ => return false,
            }
        }
        true
    }

    /// Date bounds usable for backend pushdown
    pub(crate) fn date_bounds(&self) -> (Option<NaiveDate>, Option<NaiveDate>) {
        (self.date_from, self.date_to)
    }
}

/// Slice of the matching rows to return, in `(base_dt, symbol)` order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Position {
    All,
    /// First `n` matching rows
    First(usize),
    /// Last `n` matching rows
    Last(usize),
}

pub(crate) fn apply_position(rows: Vec<Row>, position: Position) -> Vec<Row> {
    match position {
        Position::All => rows,
        Position::First(n) => rows.into_iter().take(n).collect(),
        Position::Last(n) => {
            let skip = rows.len().saturating_sub(n);
            rows.into_iter().skip(skip).collect()
        }
    }
}

/// Named-table row storage
///
/// Rows are kept ordered by `(base_dt, symbol)`. `append` performs no
/// dedup check; the caller guarantees disjoint keys. Reading a table that
/// was never created fails with `DataGap`, the signal that the initial
/// full-load path is required; removal from a missing table is a no-op.
pub trait TableStore {
    /// Replace the table's full contents
    fn put(&mut self, table: &str, rows: Vec<Row>) -> Result<()>;

    /// Append rows, creating the table if needed
    fn append(&mut self, table: &str, rows: Vec<Row>) -> Result<()>;

    /// Delete matching rows, returning how many were removed
    fn remove(&mut self, table: &str, predicate: &Predicate) -> Result<usize>;

    /// Read matching rows at the given position
    fn read(&self, table: &str, predicate: &Predicate, position: Position) -> Result<Vec<Row>>;

    /// Names of all stored tables
    fn tables(&self) -> Vec<String>;

    /// Remove matching rows and append their replacements as one unit
    fn replace_window(&mut self, table: &str, predicate: &Predicate, rows: Vec<Row>) -> Result<usize> {
        self.remove(table, predicate)?;
        let count = rows.len();
        self.append(table, rows)?;
        Ok(count)
    }
}

/// Earliest stored `base_dt`; `DataGap` when the table holds no rows
pub fn first_date<S: TableStore + ?Sized>(store: &S, table: &str) -> Result<NaiveDate> {
    let rows = store.read(table, &Predicate::all(), Position::First(1))?;
    rows.first()
        .map(|r| r.base_dt)
        .ok_or_else(|| empty_table(table))
}

/// Latest stored `base_dt`; `DataGap` when the table holds no rows
pub fn last_date<S: TableStore + ?Sized>(store: &S, table: &str) -> Result<NaiveDate> {
    let rows = store.read(table, &Predicate::all(), Position::Last(1))?;
    rows.first()
        .map(|r| r.base_dt)
        .ok_or_else(|| empty_table(table))
}

/// String field of the latest stored row, e.g. the `base_mt` watermark
pub fn last_field_str<S: TableStore + ?Sized>(store: &S, table: &str, field: &str) -> Result<String> {
    let rows = store.read(table, &Predicate::all(), Position::Last(1))?;
    rows.first()
        .and_then(|r| r.field_str(field))
        .map(str::to_string)
        .ok_or_else(|| empty_table(table))
}

fn empty_table(table: &str) -> WarehouseError {
    WarehouseError::DataGap(format!(
        "table {} holds no rows; run the initial load first",
        table
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ymd(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_predicate_date_bounds() {
        let row = Row::new(ymd(2024, 2, 15), "005930");
        assert!(Predicate::all().matches(&row));
        assert!(Predicate::all().date_from(ymd(2024, 2, 15)).matches(&row));
        assert!(!Predicate::all().date_from(ymd(2024, 2, 16)).matches(&row));
        assert!(Predicate::all().date_to(ymd(2024, 2, 15)).matches(&row));
        assert!(!Predicate::all().date_to(ymd(2024, 2, 14)).matches(&row));
        assert!(Predicate::all().date_eq(ymd(2024, 2, 15)).matches(&row));
        assert!(Predicate::all()
            .date_in([ymd(2024, 2, 15), ymd(2024, 3, 15)])
            .matches(&row));
        assert!(!Predicate::all().date_in([ymd(2024, 3, 15)]).matches(&row));
    }

    #[test]
    fn test_predicate_symbols_and_fields() {
        let row = Row::new(ymd(2024, 2, 15), "005930")
            .with_field("sym_obj", true)
            .with_field("quarter", "2024-03");

        assert!(Predicate::all().symbols_in(["005930"]).matches(&row));
        assert!(!Predicate::all().symbols_in(["000660"]).matches(&row));
        assert!(Predicate::all().field_eq("sym_obj", true).matches(&row));
        assert!(!Predicate::all().field_eq("sym_obj", false).matches(&row));
        assert!(Predicate::all()
            .str_field_ge("quarter", "2024-03")
            .matches(&row));
        assert!(Predicate::all()
            .str_field_ge("quarter", "2023-12")
            .matches(&row));
        assert!(!Predicate::all()
            .str_field_ge("quarter", "2024-06")
            .matches(&row));
        // A missing field never satisfies an ordered comparison
        assert!(!Predicate::all().str_field_ge("year", "2023").matches(&row));
    }

    #[test]
    fn test_position_slicing() {
        let rows: Vec<Row> = (1..=5)
            .map(|d| Row::new(ymd(2024, 2, d), "A"))
            .collect();
        assert_eq!(apply_position(rows.clone(), Position::All).len(), 5);
        let first = apply_position(rows.clone(), Position::First(2));
        assert_eq!(first.len(), 2);
        assert_eq!(first[0].base_dt, ymd(2024, 2, 1));
        let last = apply_position(rows, Position::Last(2));
        assert_eq!(last.len(), 2);
        assert_eq!(last[1].base_dt, ymd(2024, 2, 5));
    }
}

//! Core types shared across the warehouse

use crate::error::{Result, WarehouseError};
use chrono::{Datelike, Duration, NaiveDate};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

/// Symbol identifier for traded entities
pub type Symbol = String;

/// Field payload of a warehouse row
pub type FieldMap = Map<String, Value>;

/// Field name of the apply-month watermark on month-end rows
pub const FIELD_BASE_MT: &str = "base_mt";

/// Field name of the tradable-object flag on month-end rows
pub const FIELD_SYM_OBJ: &str = "sym_obj";

/// Field name of the period key on derived quarterly rows
pub const FIELD_QUARTER: &str = "quarter";

/// Field name of the fiscal-year key on derived annual rows
pub const FIELD_YEAR: &str = "year";

/// A calendar year and month, ordered chronologically
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct YearMonth {
    year: i32,
    month: u32,
}

impl YearMonth {
    /// Create a new year-month; the month must be in `1..=12`
    pub fn new(year: i32, month: u32) -> Result<Self> {
        if !(1..=12).contains(&month) {
            return Err(WarehouseError::Parse(format!(
                "month out of range: {}",
                month
            )));
        }
        Ok(Self { year, month })
    }

    /// The year-month containing the given date
    pub fn of(date: NaiveDate) -> Self {
        Self {
            year: date.year(),
            month: date.month(),
        }
    }

    pub fn year(&self) -> i32 {
        self.year
    }

    pub fn month(&self) -> u32 {
        self.month
    }

    /// First calendar day of the month
    pub fn first_day(&self) -> NaiveDate {
        NaiveDate::from_ymd_opt(self.year, self.month, 1)
            .expect("month validated on construction")
    }

    /// Last calendar day of the month
    pub fn last_day(&self) -> NaiveDate {
        self.add_months(1).first_day() - Duration::days(1)
    }

    /// Shift by a signed number of months
    pub fn add_months(&self, n: i32) -> Self {
        let zero_based = self.year * 12 + self.month as i32 - 1 + n;
        Self {
            year: zero_based.div_euclid(12),
            month: zero_based.rem_euclid(12) as u32 + 1,
        }
    }

    /// Previous month
    pub fn prev(&self) -> Self {
        self.add_months(-1)
    }

    /// Last month of the calendar quarter containing this month
    /// (March, June, September or December)
    pub fn quarter_end_month(&self) -> Self {
        let month = ((self.month - 1) / 3 + 1) * 3;
        Self {
            year: self.year,
            month,
        }
    }
}

impl fmt::Display for YearMonth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}

impl FromStr for YearMonth {
    type Err = WarehouseError;

    fn from_str(s: &str) -> Result<Self> {
        let (year, month) = s
            .split_once('-')
            .ok_or_else(|| WarehouseError::Parse(format!("invalid year-month: {}", s)))?;
        let year: i32 = year
            .parse()
            .map_err(|_| WarehouseError::Parse(format!("invalid year-month: {}", s)))?;
        let month: u32 = month
            .parse()
            .map_err(|_| WarehouseError::Parse(format!("invalid year-month: {}", s)))?;
        Self::new(year, month)
    }
}

/// Granularity of a period index or resolved window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Granularity {
    Day,
    Month,
    Quarter,
    Year,
}

impl fmt::Display for Granularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Granularity::Day => "day",
            Granularity::Month => "month",
            Granularity::Quarter => "quarter",
            Granularity::Year => "year",
        };
        write!(f, "{}", name)
    }
}

/// Heterogeneous date input accepted by the window resolver
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DateSpec {
    /// A whole month, expanded to its business days
    Month(YearMonth),
    /// A single date, snapped to the nearest prior business day
    Day(NaiveDate),
    /// An inclusive range, snapped inward to covering business days
    Range(NaiveDate, NaiveDate),
}

impl From<YearMonth> for DateSpec {
    fn from(ym: YearMonth) -> Self {
        DateSpec::Month(ym)
    }
}

impl From<NaiveDate> for DateSpec {
    fn from(date: NaiveDate) -> Self {
        DateSpec::Day(date)
    }
}

impl From<(NaiveDate, NaiveDate)> for DateSpec {
    fn from((start, end): (NaiveDate, NaiveDate)) -> Self {
        DateSpec::Range(start, end)
    }
}

impl FromStr for DateSpec {
    type Err = WarehouseError;

    /// Parse a `YYYY-MM` month token or a `YYYY-MM-DD` date
    fn from_str(s: &str) -> Result<Self> {
        if let Ok(date) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
            return Ok(DateSpec::Day(date));
        }
        s.parse::<YearMonth>().map(DateSpec::Month)
    }
}

/// An inclusive `[start, end]` window of calendar dates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateWindow {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateWindow {
    /// Create a window; fails when `start` is after `end`
    pub fn new(start: NaiveDate, end: NaiveDate) -> Result<Self> {
        if start > end {
            return Err(WarehouseError::Configuration(format!(
                "window start {} is after end {}",
                start, end
            )));
        }
        Ok(Self { start, end })
    }

    /// A single-date window
    pub fn single(date: NaiveDate) -> Self {
        Self {
            start: date,
            end: date,
        }
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start <= date && date <= self.end
    }
}

impl fmt::Display for DateWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..{}", self.start, self.end)
    }
}

/// A single warehouse record
///
/// Raw tables key rows by `(base_dt, symbol)`. Derived tables reuse the same
/// shape with `base_dt` holding the period-end business day and a period key
/// (`quarter` or `year`) among the fields. Tables without an entity dimension
/// (holidays) leave the symbol empty.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Row {
    pub base_dt: NaiveDate,
    pub symbol: Symbol,
    #[serde(default)]
    pub fields: FieldMap,
}

impl Row {
    pub fn new(base_dt: NaiveDate, symbol: impl Into<Symbol>) -> Self {
        Self {
            base_dt,
            symbol: symbol.into(),
            fields: FieldMap::new(),
        }
    }

    /// Attach a field value, builder style
    pub fn with_field(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.fields.insert(name.to_string(), value.into());
        self
    }

    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    pub fn field_str(&self, name: &str) -> Option<&str> {
        self.fields.get(name).and_then(Value::as_str)
    }

    pub fn field_bool(&self, name: &str) -> Option<bool> {
        self.fields.get(name).and_then(Value::as_bool)
    }

    pub fn field_f64(&self, name: &str) -> Option<f64> {
        self.fields.get(name).and_then(Value::as_f64)
    }

    /// The `(base_dt, symbol)` key
    pub fn key(&self) -> (NaiveDate, &str) {
        (self.base_dt, &self.symbol)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_year_month_arithmetic() {
        let ym: YearMonth = "2024-01".parse().unwrap();
        assert_eq!(ym.prev().to_string(), "2023-12");
        assert_eq!(ym.add_months(-13).to_string(), "2022-12");
        assert_eq!(ym.add_months(11).to_string(), "2024-12");
        assert_eq!(ym.add_months(12).to_string(), "2025-01");
    }

    #[test]
    fn test_year_month_days() {
        let feb: YearMonth = "2024-02".parse().unwrap();
        assert_eq!(
            feb.first_day(),
            NaiveDate::from_ymd_opt(2024, 2, 1).unwrap()
        );
        // 2024 is a leap year
        assert_eq!(feb.last_day(), NaiveDate::from_ymd_opt(2024, 2, 29).unwrap());
    }

    #[test]
    fn test_quarter_end_month() {
        let jan: YearMonth = "2024-01".parse().unwrap();
        let may: YearMonth = "2024-05".parse().unwrap();
        let dec: YearMonth = "2024-12".parse().unwrap();
        assert_eq!(jan.quarter_end_month().to_string(), "2024-03");
        assert_eq!(may.quarter_end_month().to_string(), "2024-06");
        assert_eq!(dec.quarter_end_month().to_string(), "2024-12");
    }

    #[test]
    fn test_year_month_rejects_bad_month() {
        assert!("2024-13".parse::<YearMonth>().is_err());
        assert!("2024".parse::<YearMonth>().is_err());
    }

    #[test]
    fn test_date_spec_parsing() {
        assert_eq!(
            "2024-02".parse::<DateSpec>().unwrap(),
            DateSpec::Month(YearMonth::new(2024, 2).unwrap())
        );
        assert_eq!(
            "2024-02-15".parse::<DateSpec>().unwrap(),
            DateSpec::Day(NaiveDate::from_ymd_opt(2024, 2, 15).unwrap())
        );
        assert!("yesterday".parse::<DateSpec>().is_err());
    }

    #[test]
    fn test_window_rejects_inverted_bounds() {
        let d1 = NaiveDate::from_ymd_opt(2024, 2, 1).unwrap();
        let d2 = NaiveDate::from_ymd_opt(2024, 2, 2).unwrap();
        assert!(DateWindow::new(d2, d1).is_err());
        assert!(DateWindow::new(d1, d1).is_ok());
    }

    #[test]
    fn test_row_fields() {
        let date = NaiveDate::from_ymd_opt(2024, 1, 31).unwrap();
        let row = Row::new(date, "005930")
            .with_field(FIELD_SYM_OBJ, true)
            .with_field(FIELD_BASE_MT, "2024-02")
            .with_field("mkt_cap", 1_000_000.0);

        assert_eq!(row.key(), (date, "005930"));
        assert_eq!(row.field_bool(FIELD_SYM_OBJ), Some(true));
        assert_eq!(row.field_str(FIELD_BASE_MT), Some("2024-02"));
        assert_eq!(row.field_f64("mkt_cap"), Some(1_000_000.0));
        assert!(row.field("missing").is_none());
    }
}

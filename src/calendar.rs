//! Business-day calendar derived from an exchange holiday set
//!
//! The calendar covers a fixed horizon (January 1 of the start year through
//! December 31 of the horizon year). It is an explicit value rebuilt from the
//! stored holidays table at the start of every run, never cached across
//! holiday updates.

use crate::error::{Result, WarehouseError};
use crate::types::{Granularity, Row};
use chrono::{Datelike, Duration, NaiveDate, Weekday};
use std::collections::BTreeSet;

/// Set of non-trading dates sourced from the holidays table
#[derive(Debug, Clone, Default)]
pub struct HolidaySet {
    dates: BTreeSet<NaiveDate>,
}

impl HolidaySet {
    pub fn from_dates(dates: impl IntoIterator<Item = NaiveDate>) -> Self {
        Self {
            dates: dates.into_iter().collect(),
        }
    }

    /// Collect holiday dates from stored holidays-table rows
    pub fn from_rows(rows: &[Row]) -> Self {
        Self::from_dates(rows.iter().map(|r| r.base_dt))
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.dates.contains(&date)
    }

    /// Holidays falling in the given calendar year
    pub fn year(&self, year: i32) -> Vec<NaiveDate> {
        self.dates
            .iter()
            .filter(|d| d.year() == year)
            .copied()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.dates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dates.is_empty()
    }
}

/// Ordered business-day sequence with month, quarter and year-end indices
///
/// Each period index holds the last business day of every period inside the
/// horizon that has at least one business day. The quarter index is a strict
/// subsequence of the month index, and the year index of the quarter index.
#[derive(Debug, Clone)]
pub struct Calendar {
    days: Vec<NaiveDate>,
    month_ends: Vec<NaiveDate>,
    quarter_ends: Vec<NaiveDate>,
    year_ends: Vec<NaiveDate>,
    horizon_end: NaiveDate,
}

fn is_weekend(date: NaiveDate) -> bool {
    matches!(date.weekday(), Weekday::Sat | Weekday::Sun)
}

impl Calendar {
    /// Build the calendar from a holiday set over `[Jan 1 start_year, Dec 31 horizon_year]`
    ///
    /// Deterministic and idempotent for a given holiday set and horizon.
    pub fn build(holidays: &HolidaySet, start_year: i32, horizon_year: i32) -> Result<Self> {
        if holidays.is_empty() {
            return Err(WarehouseError::Configuration(
                "holiday set is empty; load the holidays table first".to_string(),
            ));
        }
        if horizon_year < start_year {
            return Err(WarehouseError::Configuration(format!(
                "horizon year {} precedes start year {}",
                horizon_year, start_year
            )));
        }

        let first = NaiveDate::from_ymd_opt(start_year, 1, 1)
            .ok_or_else(|| WarehouseError::Configuration(format!("bad start year {}", start_year)))?;
        let horizon_end = NaiveDate::from_ymd_opt(horizon_year, 12, 31)
            .ok_or_else(|| WarehouseError::Configuration(format!("bad horizon year {}", horizon_year)))?;

        let mut days = Vec::new();
        let mut month_ends = Vec::new();
        let mut quarter_ends = Vec::new();
        let mut year_ends = Vec::new();

        let mut current = first;
        let mut prev: Option<NaiveDate> = None;
        while current <= horizon_end {
            if !is_weekend(current) && !holidays.contains(current) {
                if let Some(p) = prev {
                    if p.month() != current.month() {
                        month_ends.push(p);
                    }
                    if quarter_of(p) != quarter_of(current) {
                        quarter_ends.push(p);
                    }
                    if p.year() != current.year() {
                        year_ends.push(p);
                    }
                }
                days.push(current);
                prev = Some(current);
            }
            current += Duration::days(1);
        }
        if let Some(p) = prev {
            month_ends.push(p);
            quarter_ends.push(p);
            year_ends.push(p);
        }

        if days.is_empty() {
            return Err(WarehouseError::Configuration(
                "holiday set leaves no business days in the horizon".to_string(),
            ));
        }

        Ok(Self {
            days,
            month_ends,
            quarter_ends,
            year_ends,
            horizon_end,
        })
    }

    /// All business days in the horizon
    pub fn days(&self) -> &[NaiveDate] {
        &self.days
    }

    pub fn horizon_end(&self) -> NaiveDate {
        self.horizon_end
    }

    /// The period-end index for a granularity (`Day` is the full day sequence)
    pub fn period_index(&self, granularity: Granularity) -> &[NaiveDate] {
        match granularity {
            Granularity::Day => &self.days,
            Granularity::Month => &self.month_ends,
            Granularity::Quarter => &self.quarter_ends,
            Granularity::Year => &self.year_ends,
        }
    }

    pub fn is_business_day(&self, date: NaiveDate) -> bool {
        self.days.binary_search(&date).is_ok()
    }

    /// Business days within `[from, to]`
    pub fn days_between(&self, from: NaiveDate, to: NaiveDate) -> &[NaiveDate] {
        self.index_slice(Granularity::Day, from, to)
    }

    /// Entries of a period index within `[from, to]`
    pub fn index_slice(&self, granularity: Granularity, from: NaiveDate, to: NaiveDate) -> &[NaiveDate] {
        let index = self.period_index(granularity);
        let lo = index.partition_point(|d| *d < from);
        let hi = index.partition_point(|d| *d <= to);
        if lo >= hi {
            return &[];
        }
        &index[lo..hi]
    }

    /// Position of a date within a period index
    pub fn position(&self, granularity: Granularity, date: NaiveDate) -> Option<usize> {
        self.period_index(granularity).binary_search(&date).ok()
    }

    /// Nearest business day at or before `date`
    ///
    /// Fails with `DataGap` when the lookup falls outside the built horizon,
    /// signalling the calendar must be rebuilt with a larger horizon.
    pub fn last_day_on_or_before(&self, date: NaiveDate) -> Result<NaiveDate> {
        if date > self.horizon_end {
            return Err(self.horizon_gap(date));
        }
        let pos = self.days.partition_point(|d| *d <= date);
        pos.checked_sub(1)
            .map(|p| self.days[p])
            .ok_or_else(|| self.horizon_gap(date))
    }

    /// First business day strictly after `date`
    pub fn next_day_after(&self, date: NaiveDate) -> Result<NaiveDate> {
        let pos = self.days.partition_point(|d| *d <= date);
        self.days.get(pos).copied().ok_or_else(|| self.horizon_gap(date))
    }

    /// Last business day strictly before `date`
    pub fn prev_day_before(&self, date: NaiveDate) -> Result<NaiveDate> {
        if date > self.horizon_end {
            return Err(self.horizon_gap(date));
        }
        let pos = self.days.partition_point(|d| *d < date);
        pos.checked_sub(1)
            .map(|p| self.days[p])
            .ok_or_else(|| self.horizon_gap(date))
    }

    fn horizon_gap(&self, date: NaiveDate) -> WarehouseError {
        WarehouseError::DataGap(format!(
            "{} is outside the calendar horizon ending {}",
            date, self.horizon_end
        ))
    }
}

fn quarter_of(date: NaiveDate) -> (i32, u32) {
    (date.year(), (date.month() - 1) / 3)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feb_2024_holidays() -> HolidaySet {
        HolidaySet::from_dates(
            [(1, 1), (2, 9), (2, 10), (2, 12)]
                .into_iter()
                .map(|(m, d)| NaiveDate::from_ymd_opt(2024, m, d).unwrap()),
        )
    }

    #[test]
    fn test_build_rejects_empty_holidays() {
        let result = Calendar::build(&HolidaySet::default(), 2024, 2024);
        assert!(matches!(result, Err(WarehouseError::Configuration(_))));
    }

    #[test]
    fn test_build_rejects_inverted_horizon() {
        let result = Calendar::build(&feb_2024_holidays(), 2024, 2023);
        assert!(matches!(result, Err(WarehouseError::Configuration(_))));
    }

    #[test]
    fn test_calendar_excludes_holidays_and_weekends() {
        let holidays = feb_2024_holidays();
        let cal = Calendar::build(&holidays, 2024, 2024).unwrap();

        for day in cal.days() {
            assert!(!is_weekend(*day));
            assert!(!holidays.contains(*day));
        }
        // New Year's Day 2024 falls on a Monday
        assert!(!cal.is_business_day(NaiveDate::from_ymd_opt(2024, 1, 1).unwrap()));
        assert!(cal.is_business_day(NaiveDate::from_ymd_opt(2024, 1, 2).unwrap()));
    }

    #[test]
    fn test_days_strictly_increasing() {
        let cal = Calendar::build(&feb_2024_holidays(), 2024, 2024).unwrap();
        assert!(cal.days().windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_period_indices_are_subsequences() {
        let cal = Calendar::build(&feb_2024_holidays(), 2023, 2024).unwrap();
        let months = cal.period_index(Granularity::Month);
        let quarters = cal.period_index(Granularity::Quarter);
        let years = cal.period_index(Granularity::Year);

        assert_eq!(months.len(), 24);
        assert_eq!(quarters.len(), 8);
        assert_eq!(years.len(), 2);
        assert!(quarters.iter().all(|q| months.contains(q)));
        assert!(years.iter().all(|y| quarters.contains(y)));
    }

    #[test]
    fn test_month_end_is_last_business_day() {
        let cal = Calendar::build(&feb_2024_holidays(), 2024, 2024).unwrap();
        let months = cal.period_index(Granularity::Month);
        // January 31 2024 is a Wednesday, February 29 a Thursday
        assert_eq!(months[0], NaiveDate::from_ymd_opt(2024, 1, 31).unwrap());
        assert_eq!(months[1], NaiveDate::from_ymd_opt(2024, 2, 29).unwrap());
    }

    #[test]
    fn test_day_lookups() {
        let cal = Calendar::build(&feb_2024_holidays(), 2024, 2024).unwrap();
        // February 10 2024 is a Saturday and a listed holiday; 9 is a holiday Friday
        let sat = NaiveDate::from_ymd_opt(2024, 2, 10).unwrap();
        assert_eq!(
            cal.last_day_on_or_before(sat).unwrap(),
            NaiveDate::from_ymd_opt(2024, 2, 8).unwrap()
        );
        assert_eq!(
            cal.next_day_after(sat).unwrap(),
            NaiveDate::from_ymd_opt(2024, 2, 13).unwrap()
        );
        assert_eq!(
            cal.prev_day_before(NaiveDate::from_ymd_opt(2024, 2, 13).unwrap()).unwrap(),
            NaiveDate::from_ymd_opt(2024, 2, 8).unwrap()
        );
    }

    #[test]
    fn test_lookup_outside_horizon_is_a_gap() {
        let cal = Calendar::build(&feb_2024_holidays(), 2024, 2024).unwrap();
        let beyond = NaiveDate::from_ymd_opt(2025, 1, 15).unwrap();
        let before = NaiveDate::from_ymd_opt(1999, 6, 1).unwrap();
        assert!(matches!(
            cal.last_day_on_or_before(beyond),
            Err(WarehouseError::DataGap(_))
        ));
        assert!(matches!(
            cal.last_day_on_or_before(before),
            Err(WarehouseError::DataGap(_))
        ));
    }

    #[test]
    fn test_index_slice_bounds() {
        let cal = Calendar::build(&feb_2024_holidays(), 2024, 2024).unwrap();
        let feb = cal.index_slice(
            Granularity::Day,
            NaiveDate::from_ymd_opt(2024, 2, 1).unwrap(),
            NaiveDate::from_ymd_opt(2024, 2, 29).unwrap(),
        );
        assert_eq!(feb.first().copied(), NaiveDate::from_ymd_opt(2024, 2, 1));
        assert_eq!(feb.last().copied(), NaiveDate::from_ymd_opt(2024, 2, 29));
        // 21 weekdays in February 2024, minus holidays on the 9th and 12th
        assert_eq!(feb.len(), 19);
    }
}

//! Window resolution over the business-day calendar
//!
//! Converts heterogeneous date inputs (a month token, a single date, a range)
//! into calendar-aligned windows at a requested granularity, optionally
//! shifted to the last completed period.

use crate::calendar::Calendar;
use crate::error::{Result, WarehouseError};
use crate::types::{DateSpec, DateWindow, Granularity, YearMonth};
use chrono::{Datelike, NaiveDate};

/// How far to pull a window's start back from its end period
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOffset {
    /// A plain number of steps back on the granularity's period index
    Periods(usize),
    /// The March quarter-end one or two calendar years before the window's
    /// year; the fixed fiscal-year start used by annual-report lookbacks.
    /// Quarter granularity only.
    FiscalYearsBack(u8),
}

fn year_span(year: i32) -> (NaiveDate, NaiveDate) {
    (
        YearMonth::new(year, 1).expect("static month").first_day(),
        YearMonth::new(year, 12).expect("static month").last_day(),
    )
}

/// Span of calendar dates covered by the quarter whose end month is `end_month`
fn quarter_span(end_month: YearMonth) -> (NaiveDate, NaiveDate) {
    (end_month.add_months(-2).first_day(), end_month.last_day())
}

/// Snap a date spec to its raw `[start, end]` business-day bounds
fn normalize(calendar: &Calendar, spec: &DateSpec) -> Result<(NaiveDate, NaiveDate)> {
    let bounds = match spec {
        DateSpec::Month(ym) => {
            let days = calendar.days_between(ym.first_day(), ym.last_day());
            days.first().copied().zip(days.last().copied())
        }
        DateSpec::Day(date) => {
            let snapped = calendar
                .last_day_on_or_before(*date)
                .map_err(|_| out_of_horizon(calendar, spec))?;
            Some((snapped, snapped))
        }
        DateSpec::Range(start, end) => {
            let days = calendar.days_between(*start, *end);
            days.first().copied().zip(days.last().copied())
        }
    };
    bounds.ok_or_else(|| out_of_horizon(calendar, spec))
}

fn out_of_horizon(calendar: &Calendar, spec: &DateSpec) -> WarehouseError {
    WarehouseError::OutOfHorizon(format!(
        "{:?} has no business days inside the horizon ending {}",
        spec,
        calendar.horizon_end()
    ))
}

/// Resolve a date spec into a window aligned to the requested granularity
///
/// With `shift_to_last_period` the window first moves back one month (the
/// "as of last completed month" rule) before projecting onto the requested
/// period index; quarter and year windows then step back one further period.
/// Month granularity is the documented exception: the result lands two
/// months back, the month preceding the most recently closed one.
pub fn resolve_window(
    calendar: &Calendar,
    spec: &DateSpec,
    shift_to_last_period: bool,
    granularity: Granularity,
) -> Result<DateWindow> {
    let (raw_start, raw_end) = normalize(calendar, spec)?;
    let start_month = YearMonth::of(raw_start);
    let end_month = YearMonth::of(raw_end);

    let projected: &[NaiveDate] = if shift_to_last_period {
        match granularity {
            Granularity::Day => {
                let from = start_month.prev().first_day();
                let to = end_month.prev().last_day();
                calendar.days_between(from, to)
            }
            Granularity::Month => {
                // Two months back, not one: callers that shift at month
                // granularity want the month preceding the last closed one.
                let from = start_month.add_months(-2).first_day();
                let to = end_month.add_months(-2).last_day();
                calendar.index_slice(Granularity::Month, from, to)
            }
            Granularity::Quarter => {
                let (from, _) =
                    quarter_span(start_month.prev().quarter_end_month().add_months(-3));
                let (_, to) = quarter_span(end_month.prev().quarter_end_month().add_months(-3));
                calendar.index_slice(Granularity::Quarter, from, to)
            }
            Granularity::Year => {
                let (from, _) = year_span(start_month.prev().year() - 1);
                let (_, to) = year_span(end_month.prev().year() - 1);
                calendar.index_slice(Granularity::Year, from, to)
            }
        }
    } else {
        match granularity {
            Granularity::Day => calendar.days_between(raw_start, raw_end),
            Granularity::Month => calendar.index_slice(
                Granularity::Month,
                start_month.first_day(),
                end_month.last_day(),
            ),
            Granularity::Quarter => {
                let (from, _) = quarter_span(start_month.quarter_end_month());
                let (_, to) = quarter_span(end_month.quarter_end_month());
                calendar.index_slice(Granularity::Quarter, from, to)
            }
            Granularity::Year => {
                let (from, _) = year_span(start_month.year());
                let (_, to) = year_span(end_month.year());
                calendar.index_slice(Granularity::Year, from, to)
            }
        }
    };

    match (projected.first(), projected.last()) {
        (Some(start), Some(end)) => DateWindow::new(*start, *end),
        _ => Err(WarehouseError::OutOfHorizon(format!(
            "no {} entries for {:?} (shift: {}) inside the horizon ending {}",
            granularity,
            spec,
            shift_to_last_period,
            calendar.horizon_end()
        ))),
    }
}

/// Resolve a window whose end is the period containing `spec` and whose
/// start is pulled back by `offset` on the same period index
pub fn offset_window_start(
    calendar: &Calendar,
    spec: &DateSpec,
    shift_to_last_period: bool,
    granularity: Granularity,
    offset: StartOffset,
) -> Result<DateWindow> {
    let base = resolve_window(calendar, spec, shift_to_last_period, granularity)?;

    let start = match offset {
        StartOffset::Periods(n) => {
            let index = calendar.period_index(granularity);
            let pos = calendar
                .position(granularity, base.start)
                .ok_or_else(|| {
                    WarehouseError::OutOfHorizon(format!(
                        "{} is not a {} index entry",
                        base.start, granularity
                    ))
                })?;
            let stepped = pos.checked_sub(n).ok_or_else(|| {
                WarehouseError::IndexUnderflow(format!(
                    "cannot step {} {} periods back from {}",
                    n, granularity, base.start
                ))
            })?;
            index[stepped]
        }
        StartOffset::FiscalYearsBack(years) => {
            if granularity != Granularity::Quarter {
                return Err(WarehouseError::Configuration(format!(
                    "fiscal-year start offsets apply to quarter windows, not {}",
                    granularity
                )));
            }
            let year = base.start.year() - i32::from(years);
            calendar
                .period_index(Granularity::Quarter)
                .iter()
                .find(|d| d.year() == year && d.month() == 3)
                .copied()
                .ok_or_else(|| {
                    WarehouseError::IndexUnderflow(format!(
                        "no March quarter-end for {} inside the horizon",
                        year
                    ))
                })?
        }
    };

    DateWindow::new(start, base.end)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calendar::HolidaySet;

    fn calendar() -> Calendar {
        let holidays = HolidaySet::from_dates(
            [
                (2023, 1, 1),
                (2024, 1, 1),
                (2024, 2, 9),
                (2024, 2, 10),
                (2024, 2, 12),
            ]
            .into_iter()
            .map(|(y, m, d)| NaiveDate::from_ymd_opt(y, m, d).unwrap()),
        );
        Calendar::build(&holidays, 2023, 2024).unwrap()
    }

    fn ymd(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn ym(s: &str) -> DateSpec {
        s.parse().unwrap()
    }

    #[test]
    fn test_month_token_expands_to_business_days() {
        let cal = calendar();
        let window = resolve_window(&cal, &ym("2024-02"), false, Granularity::Day).unwrap();
        assert_eq!(window.start, ymd(2024, 2, 1));
        assert_eq!(window.end, ymd(2024, 2, 29));
    }

    #[test]
    fn test_single_date_snaps_to_prior_business_day() {
        let cal = calendar();
        // Saturday the 10th, with Friday the 9th also a holiday
        let window =
            resolve_window(&cal, &DateSpec::Day(ymd(2024, 2, 10)), false, Granularity::Day)
                .unwrap();
        assert_eq!(window, DateWindow::single(ymd(2024, 2, 8)));
    }

    #[test]
    fn test_range_snaps_inward() {
        let cal = calendar();
        // Feb 10 2024 is a Saturday, Feb 18 a Sunday
        let spec = DateSpec::Range(ymd(2024, 2, 10), ymd(2024, 2, 18));
        let window = resolve_window(&cal, &spec, false, Granularity::Day).unwrap();
        assert_eq!(window.start, ymd(2024, 2, 13));
        assert_eq!(window.end, ymd(2024, 2, 16));
    }

    #[test]
    fn test_shift_day_moves_one_month_back() {
        let cal = calendar();
        let window = resolve_window(&cal, &ym("2024-03"), true, Granularity::Day).unwrap();
        assert_eq!(window.start, ymd(2024, 2, 1));
        assert_eq!(window.end, ymd(2024, 2, 29));
    }

    // The month granularity intentionally shifts two months back, not one.
    #[test]
    fn test_shift_month_moves_two_months_back() {
        let cal = calendar();
        let window = resolve_window(&cal, &ym("2024-05"), true, Granularity::Month).unwrap();
        // Last business day of March 2024 (the 30th/31st fall on a weekend)
        assert_eq!(window, DateWindow::single(ymd(2024, 3, 29)));
    }

    #[test]
    fn test_shift_quarter_moves_one_quarter_back() {
        let cal = calendar();
        let window = resolve_window(&cal, &ym("2024-05"), true, Granularity::Quarter).unwrap();
        // May -> April -> Q2 2024 -> Q1 2024
        assert_eq!(window, DateWindow::single(ymd(2024, 3, 29)));

        let window = resolve_window(&cal, &ym("2024-04"), true, Granularity::Quarter).unwrap();
        // April -> March -> Q1 2024 -> Q4 2023
        assert_eq!(window, DateWindow::single(ymd(2023, 12, 29)));
    }

    #[test]
    fn test_shift_year_moves_one_year_back() {
        let cal = calendar();
        let window = resolve_window(&cal, &ym("2024-05"), true, Granularity::Year).unwrap();
        assert_eq!(window, DateWindow::single(ymd(2023, 12, 29)));
    }

    #[test]
    fn test_unshifted_quarter_covers_containing_quarter() {
        let cal = calendar();
        let window = resolve_window(&cal, &ym("2024-01"), false, Granularity::Quarter).unwrap();
        // The quarter containing January ends on the last March business day
        assert_eq!(window, DateWindow::single(ymd(2024, 3, 29)));
    }

    #[test]
    fn test_shift_before_horizon_fails() {
        let cal = calendar();
        let result = resolve_window(&cal, &ym("2023-02"), true, Granularity::Quarter);
        assert!(matches!(result, Err(WarehouseError::OutOfHorizon(_))));
    }

    #[test]
    fn test_offset_start_by_periods() {
        let cal = calendar();
        let window = offset_window_start(
            &cal,
            &ym("2024-05"),
            false,
            Granularity::Quarter,
            StartOffset::Periods(2),
        )
        .unwrap();
        // End stays on Q2 2024; start steps back to Q4 2023
        assert_eq!(window.end, ymd(2024, 6, 28));
        assert_eq!(window.start, ymd(2023, 12, 29));
    }

    #[test]
    fn test_offset_start_fiscal_year_back() {
        let cal = calendar();
        let window = offset_window_start(
            &cal,
            &ym("2024-05"),
            false,
            Granularity::Quarter,
            StartOffset::FiscalYearsBack(1),
        )
        .unwrap();
        // Start lands on the March quarter-end of the previous calendar year
        assert_eq!(window.start, ymd(2023, 3, 31));
        assert_eq!(window.end, ymd(2024, 6, 28));
    }

    #[test]
    fn test_offset_underflow() {
        let cal = calendar();
        let result = offset_window_start(
            &cal,
            &ym("2023-05"),
            false,
            Granularity::Quarter,
            StartOffset::Periods(10),
        );
        assert!(matches!(result, Err(WarehouseError::IndexUnderflow(_))));

        let result = offset_window_start(
            &cal,
            &ym("2023-05"),
            false,
            Granularity::Quarter,
            StartOffset::FiscalYearsBack(2),
        );
        assert!(matches!(result, Err(WarehouseError::IndexUnderflow(_))));
    }

    #[test]
    fn test_fiscal_offset_requires_quarter_granularity() {
        let cal = calendar();
        let result = offset_window_start(
            &cal,
            &ym("2024-05"),
            false,
            Granularity::Month,
            StartOffset::FiscalYearsBack(1),
        );
        assert!(matches!(result, Err(WarehouseError::Configuration(_))));
    }
}

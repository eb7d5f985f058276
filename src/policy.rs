//! Fiscal reporting policy for the monthly update pass
//!
//! Which update kinds apply in a given calendar month is a property of the
//! local reporting calendar, kept here as a lookup so the orchestrator stays
//! free of month-number branching.
//!
//! Confirmed quarterly figures land in January, May, July and October; the
//! May window substitutes April because May filings cover the fourth
//! fundamental month. Preliminary figures appear every month except the three
//! confirmed-only ones, and annual reports only in May. Annual derived tables
//! are refreshed while a prior fiscal year is still being finalized
//! (February through May).

/// Update kinds applicable to one calendar month
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonthPolicy {
    /// Month whose window the quarterly-confirmed fetch uses, when the
    /// target month is a confirmed reporting month
    pub quarterly_confirmed: Option<u32>,
    /// Whether preliminary quarterly figures are fetched this month
    pub quarterly_preliminary: bool,
    /// Whether annual reports are fetched this month
    pub annual: bool,
    /// Whether the annual derived table (and the point-in-time universe
    /// screen) are refreshed this month
    pub annual_prep: bool,
    /// Quarters back to the last confirmed quarter, used to anchor the
    /// quarterly derived-table lookback
    pub confirmed_prep_offset: usize,
}

impl MonthPolicy {
    /// Policy for a calendar month in `1..=12`
    pub fn for_month(month: u32) -> Self {
        debug_assert!((1..=12).contains(&month));
        Self {
            quarterly_confirmed: match month {
                1 | 7 | 10 => Some(month),
                // May filings cover the fourth fundamental month
                5 => Some(4),
                _ => None,
            },
            quarterly_preliminary: !matches!(month, 1 | 7 | 10),
            annual: month == 5,
            annual_prep: (2..=5).contains(&month),
            confirmed_prep_offset: if month == 4 { 3 } else { 2 },
        }
    }

    /// Whether the target month is a confirmed quarterly reporting month
    pub fn is_confirmed_month(&self) -> bool {
        self.quarterly_confirmed.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_confirmed_months() {
        assert_eq!(MonthPolicy::for_month(1).quarterly_confirmed, Some(1));
        assert_eq!(MonthPolicy::for_month(7).quarterly_confirmed, Some(7));
        assert_eq!(MonthPolicy::for_month(10).quarterly_confirmed, Some(10));
        for month in [2, 3, 4, 6, 8, 9, 11, 12] {
            assert_eq!(MonthPolicy::for_month(month).quarterly_confirmed, None);
        }
    }

    #[test]
    fn test_may_substitutes_april() {
        assert_eq!(MonthPolicy::for_month(5).quarterly_confirmed, Some(4));
    }

    #[test]
    fn test_preliminary_skips_confirmed_only_months() {
        for month in 1..=12 {
            let policy = MonthPolicy::for_month(month);
            assert_eq!(
                policy.quarterly_preliminary,
                !matches!(month, 1 | 7 | 10),
                "month {}",
                month
            );
        }
        // May carries both confirmed and preliminary fetches
        let may = MonthPolicy::for_month(5);
        assert!(may.is_confirmed_month());
        assert!(may.quarterly_preliminary);
    }

    #[test]
    fn test_annual_only_in_may() {
        for month in 1..=12 {
            assert_eq!(MonthPolicy::for_month(month).annual, month == 5);
        }
    }

    #[test]
    fn test_annual_prep_window() {
        for month in 1..=12 {
            assert_eq!(
                MonthPolicy::for_month(month).annual_prep,
                (2..=5).contains(&month)
            );
        }
    }

    #[test]
    fn test_confirmed_prep_offset() {
        assert_eq!(MonthPolicy::for_month(4).confirmed_prep_offset, 3);
        for month in [1, 2, 3, 5, 6, 7, 8, 9, 10, 11, 12] {
            assert_eq!(MonthPolicy::for_month(month).confirmed_prep_offset, 2);
        }
    }
}

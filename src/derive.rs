//! Derivation collaborators for preprocessed factor tables
//!
//! The factor math itself lives outside the warehouse core; the orchestrator
//! depends only on these signatures and on the period keys the derived rows
//! carry.

use crate::error::Result;
use crate::types::{Row, YearMonth};

/// Computes derived factor tables from raw fundamentals
///
/// Derived rows reuse the warehouse [`Row`] shape: `base_dt` holds the
/// period-end business day and the period key lives in the fields,
/// [`FIELD_QUARTER`](crate::types::FIELD_QUARTER) (`YYYY-MM` of the quarter
/// end) on quarterly rows and [`FIELD_YEAR`](crate::types::FIELD_YEAR) on
/// annual rows. A derived row for a period is fully determined by the raw
/// rows passed in; the orchestrator handles windowing and replacement.
pub trait FactorDeriver {
    /// Preprocess quarterly fundamentals, combining confirmed and
    /// preliminary figures
    fn derive_quarterly_prep(&self, quarterly: &[Row], quarterly_prv: &[Row]) -> Result<Vec<Row>>;

    /// Preprocess annual fundamentals, patching late fiscal years from
    /// quarterly figures
    fn derive_annual_prep(
        &self,
        annual: &[Row],
        quarterly: &[Row],
        quarterly_prv: &[Row],
    ) -> Result<Vec<Row>>;

    /// Point-in-time universe/eligibility screen as of the given month
    /// (`None` means the full stored history)
    fn derive_filter_factors(&self, as_of: Option<YearMonth>) -> Result<Vec<Row>>;
}

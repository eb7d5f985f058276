//! Incremental update orchestrator
//!
//! Walks the raw and derived tables in dependency order, decides per table
//! what window of data is missing, fetches only that window and applies it
//! with replace-window writes so an interrupted run can simply be rerun.

use crate::calendar::{Calendar, HolidaySet};
use crate::derive::FactorDeriver;
use crate::error::{Result, WarehouseError};
use crate::policy::MonthPolicy;
use crate::source::MarketDataSource;
use crate::store::{first_date, last_date, last_field_str, Position, Predicate, TableStore};
use crate::types::{
    DateSpec, DateWindow, Granularity, Row, Symbol, YearMonth, FIELD_BASE_MT, FIELD_QUARTER,
    FIELD_SYM_OBJ, FIELD_YEAR,
};
use crate::window::{offset_window_start, resolve_window, StartOffset};
use chrono::{Datelike, NaiveDate};
use hashbrown::{HashMap, HashSet};
use log::{debug, info, warn};
use std::fmt;

/// Raw table holding exchange holidays
pub const HOLIDAYS: &str = "holidays";
/// Raw table of month-end snapshots keyed by apply month
pub const MONTH_END: &str = "month_end";
/// Raw table of daily market data
pub const DAILY: &str = "daily";
/// Raw table of confirmed quarterly fundamentals
pub const QUARTERLY: &str = "quarterly";
/// Raw table of preliminary quarterly fundamentals
pub const QUARTERLY_PRV: &str = "quarterly_prv";
/// Raw table of annual fundamentals
pub const ANNUAL: &str = "annual";
/// Raw table of daily returns
pub const RETURNS: &str = "returns";
/// Derived quarterly factor table
pub const QUARTERLY_PREP: &str = "quarterly_prep";
/// Derived annual factor table
pub const ANNUAL_PREP: &str = "annual_prep";
/// Derived point-in-time universe screen
pub const FILTER_FACTORS: &str = "filter_factors";

/// Warehouse-wide settings
#[derive(Debug, Clone)]
pub struct WarehouseConfig {
    /// First year of the calendar horizon
    pub horizon_start_year: i32,
    /// First year the holiday source provides reliable data for
    pub holiday_source_start_year: i32,
}

impl Default for WarehouseConfig {
    fn default() -> Self {
        Self {
            horizon_start_year: 2000,
            holiday_source_start_year: 2009,
        }
    }
}

/// One logical unit of the update pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Holidays,
    MonthEnd,
    Daily,
    Quarterly,
    QuarterlyPrv,
    Annual,
    NewSymbolBackfill,
    QuarterlyPrep,
    AnnualPrep,
    FilterFactors,
    Returns,
}

impl Step {
    pub fn name(&self) -> &'static str {
        match self {
            Step::Holidays => HOLIDAYS,
            Step::MonthEnd => MONTH_END,
            Step::Daily => DAILY,
            Step::Quarterly => QUARTERLY,
            Step::QuarterlyPrv => QUARTERLY_PRV,
            Step::Annual => ANNUAL,
            Step::NewSymbolBackfill => "new_symbol_backfill",
            Step::QuarterlyPrep => QUARTERLY_PREP,
            Step::AnnualPrep => ANNUAL_PREP,
            Step::FilterFactors => FILTER_FACTORS,
            Step::Returns => RETURNS,
        }
    }

    fn for_table(table: &str) -> Option<Step> {
        match table {
            MONTH_END => Some(Step::MonthEnd),
            DAILY => Some(Step::Daily),
            QUARTERLY => Some(Step::Quarterly),
            QUARTERLY_PRV => Some(Step::QuarterlyPrv),
            ANNUAL => Some(Step::Annual),
            _ => None,
        }
    }
}

/// Outcome of one step; skipped and failed steps stay distinguishable
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepStatus {
    Updated { rows: usize },
    Skipped { reason: String },
    Failed { error: String },
}

impl StepStatus {
    fn skipped(reason: impl Into<String>) -> Self {
        StepStatus::Skipped {
            reason: reason.into(),
        }
    }

    fn failed(error: &WarehouseError) -> Self {
        StepStatus::Failed {
            error: error.to_string(),
        }
    }
}

/// Ordered per-step outcomes of one orchestrator run
#[derive(Debug, Default)]
pub struct RunReport {
    steps: Vec<(Step, StepStatus)>,
}

impl RunReport {
    fn push(&mut self, step: Step, status: StepStatus) {
        match &status {
            StepStatus::Updated { rows } => info!("{}: {} rows written", step.name(), rows),
            StepStatus::Skipped { reason } => info!("{}: skipped, {}", step.name(), reason),
            StepStatus::Failed { error } => warn!("{}: failed, {}", step.name(), error),
        }
        self.steps.push((step, status));
    }

    pub fn steps(&self) -> &[(Step, StepStatus)] {
        &self.steps
    }

    pub fn status(&self, step: Step) -> Option<&StepStatus> {
        self.steps.iter().find(|(s, _)| *s == step).map(|(_, st)| st)
    }

    /// Total rows written across all steps
    pub fn rows_written(&self) -> usize {
        self.steps
            .iter()
            .map(|(_, status)| match status {
                StepStatus::Updated { rows } => *rows,
                _ => 0,
            })
            .sum()
    }

    /// Whether every step was a no-op
    pub fn is_noop(&self) -> bool {
        self.steps
            .iter()
            .all(|(_, status)| matches!(status, StepStatus::Skipped { .. }))
    }

    pub fn has_failures(&self) -> bool {
        self.steps
            .iter()
            .any(|(_, status)| matches!(status, StepStatus::Failed { .. }))
    }
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (step, status) in &self.steps {
            match status {
                StepStatus::Updated { rows } => {
                    writeln!(f, "{}: +{} rows", step.name(), rows)?
                }
                StepStatus::Skipped { reason } => {
                    writeln!(f, "{}: skipped ({})", step.name(), reason)?
                }
                StepStatus::Failed { error } => {
                    writeln!(f, "{}: FAILED ({})", step.name(), error)?
                }
            }
        }
        Ok(())
    }
}

/// Tradable symbols observed in a month-end snapshot, first appearance order
fn tradable_symbols(rows: &[Row]) -> Vec<Symbol> {
    let mut seen = HashSet::new();
    rows.iter()
        .filter(|r| r.field_bool(FIELD_SYM_OBJ).unwrap_or(false))
        .filter(|r| seen.insert(r.symbol.clone()))
        .map(|r| r.symbol.clone())
        .collect()
}

/// Left-merge fields of `fresh` into `saved` by `(base_dt, symbol)` key,
/// never overwriting an existing field
fn merge_new_fields(mut saved: Vec<Row>, fresh: &[Row]) -> Vec<Row> {
    let index: HashMap<(NaiveDate, &str), &Row> = fresh
        .iter()
        .map(|r| ((r.base_dt, r.symbol.as_str()), r))
        .collect();
    for row in &mut saved {
        if let Some(new) = index.get(&(row.base_dt, row.symbol.as_str())) {
            for (name, value) in &new.fields {
                row.fields.entry(name.clone()).or_insert_with(|| value.clone());
            }
        }
    }
    saved
}

/// Same merge keyed by `(symbol, period-field)` for derived tables
fn merge_new_fields_by_period(mut saved: Vec<Row>, fresh: &[Row], period_field: &str) -> Vec<Row> {
    let index: HashMap<(&str, &str), &Row> = fresh
        .iter()
        .filter_map(|r| r.field_str(period_field).map(|p| ((r.symbol.as_str(), p), r)))
        .collect();
    for row in &mut saved {
        let Some(period) = row.field_str(period_field).map(str::to_string) else {
            continue;
        };
        if let Some(new) = index.get(&(row.symbol.as_str(), period.as_str())) {
            for (name, value) in &new.fields {
                row.fields.entry(name.clone()).or_insert_with(|| value.clone());
            }
        }
    }
    saved
}

/// The warehouse: storage, external collaborators and the update pass
///
/// Built from explicit values; the calendar is rebuilt from the stored
/// holidays table at the start of every run rather than cached across runs.
pub struct Warehouse<S, M, F> {
    store: S,
    source: M,
    deriver: F,
    today: NaiveDate,
    config: WarehouseConfig,
}

impl<S, M, F> Warehouse<S, M, F>
where
    S: TableStore,
    M: MarketDataSource,
    F: FactorDeriver,
{
    pub fn new(store: S, source: M, deriver: F, today: NaiveDate) -> Self {
        Self::with_config(store, source, deriver, today, WarehouseConfig::default())
    }

    pub fn with_config(
        store: S,
        source: M,
        deriver: F,
        today: NaiveDate,
        config: WarehouseConfig,
    ) -> Self {
        Self {
            store,
            source,
            deriver,
            today,
            config,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn source(&self) -> &M {
        &self.source
    }

    pub fn into_store(self) -> S {
        self.store
    }

    /// Rebuild the calendar from the stored holidays table
    fn build_calendar(&self) -> Result<Calendar> {
        let rows = self.store.read(HOLIDAYS, &Predicate::all(), Position::All)?;
        let holidays = HolidaySet::from_rows(&rows);
        Calendar::build(
            &holidays,
            self.config.horizon_start_year,
            self.today.year(),
        )
    }

    /// Month-end snapshot window for a range of apply months: the month-end
    /// business days of the months preceding them
    fn month_end_window(
        &self,
        calendar: &Calendar,
        from: YearMonth,
        to: YearMonth,
    ) -> Result<DateWindow> {
        let spec = DateSpec::Range(from.prev().first_day(), to.prev().last_day());
        resolve_window(calendar, &spec, false, Granularity::Month)
    }

    /// Create every raw and derived table over a historical range of apply
    /// months. All-or-nothing: any failure aborts before later tables are
    /// touched.
    pub fn initial_load(&mut self, start: YearMonth, end: YearMonth) -> Result<RunReport> {
        info!("initial load for apply months {}..{}", start, end);
        let mut report = RunReport::default();

        let mut holiday_rows = Vec::new();
        for year in self.config.holiday_source_start_year..=self.today.year() {
            for day in self.source.fetch_holidays(year)? {
                holiday_rows.push(Row::new(day, ""));
            }
        }
        let count = holiday_rows.len();
        self.store.put(HOLIDAYS, holiday_rows)?;
        report.push(Step::Holidays, StepStatus::Updated { rows: count });

        let calendar = self.build_calendar()?;
        let spec = DateSpec::Range(start.first_day(), end.last_day());

        let me_window = self.month_end_window(&calendar, start, end)?;
        let snapshot = self.source.fetch_month_end(&me_window)?;
        let symbols = tradable_symbols(&snapshot);
        let count = snapshot.len();
        self.store.put(MONTH_END, snapshot)?;
        report.push(Step::MonthEnd, StepStatus::Updated { rows: count });

        let day_window = resolve_window(&calendar, &spec, true, Granularity::Day)?;
        let daily = self.source.fetch_daily(&day_window, &symbols, 0, false)?;
        let count = daily.len();
        self.store.put(DAILY, daily)?;
        report.push(Step::Daily, StepStatus::Updated { rows: count });

        let quarter_window = resolve_window(&calendar, &spec, true, Granularity::Quarter)?;
        let quarterly = self
            .source
            .fetch_quarterly(&quarter_window, &symbols, 0, false)?;
        let quarterly_prv = self
            .source
            .fetch_quarterly_prv(&quarter_window, &symbols, 0, false)?;

        let year_window = resolve_window(&calendar, &spec, true, Granularity::Year)?;
        let annual = self.source.fetch_annual(&year_window, &symbols, 0, false)?;

        let returns = self.source.fetch_returns(&day_window, &symbols, 0, true)?;

        // Derive before the raw rows move into the store
        let quarterly_prep = self
            .deriver
            .derive_quarterly_prep(&quarterly, &quarterly_prv)?;
        let annual_prep = self
            .deriver
            .derive_annual_prep(&annual, &quarterly, &quarterly_prv)?;
        let filter_factors = self.deriver.derive_filter_factors(None)?;

        for (step, table, rows) in [
            (Step::Quarterly, QUARTERLY, quarterly),
            (Step::QuarterlyPrv, QUARTERLY_PRV, quarterly_prv),
            (Step::Annual, ANNUAL, annual),
            (Step::Returns, RETURNS, returns),
            (Step::QuarterlyPrep, QUARTERLY_PREP, quarterly_prep),
            (Step::AnnualPrep, ANNUAL_PREP, annual_prep),
            (Step::FilterFactors, FILTER_FACTORS, filter_factors),
        ] {
            let count = rows.len();
            self.store.put(table, rows)?;
            report.push(step, StepStatus::Updated { rows: count });
        }

        Ok(report)
    }

    /// Bring every table up to date with the target month (default: the
    /// month containing `today`), fetching only missing windows. Safe to
    /// rerun: staleness checks turn applied steps into no-ops.
    pub fn update(&mut self, target: Option<YearMonth>) -> Result<RunReport> {
        let target = target.unwrap_or_else(|| YearMonth::of(self.today));
        let mut report = RunReport::default();

        // Holidays first: every window below depends on the calendar, and
        // the calendar on fresh holidays. A failure here aborts the run.
        let year = self.today.year();
        let fresh = self.source.fetch_holidays(year)?;
        let rows: Vec<Row> = fresh.into_iter().map(|d| Row::new(d, "")).collect();
        let count = rows.len();
        let predicate = Predicate::all().date_from(YearMonth::new(year, 1)?.first_day());
        self.store.replace_window(HOLIDAYS, &predicate, rows)?;
        report.push(Step::Holidays, StepStatus::Updated { rows: count });

        let calendar = self.build_calendar()?;

        // Monthly staleness check gates the raw and derived refreshes
        let last_mt: YearMonth = last_field_str(&self.store, MONTH_END, FIELD_BASE_MT)?.parse()?;
        if last_mt >= target {
            debug!("month-end watermark {} at or past target {}", last_mt, target);
            let reason = format!("raw tables already updated through {}", last_mt);
            for step in [
                Step::MonthEnd,
                Step::Daily,
                Step::Quarterly,
                Step::QuarterlyPrv,
                Step::Annual,
                Step::NewSymbolBackfill,
                Step::QuarterlyPrep,
                Step::AnnualPrep,
                Step::FilterFactors,
            ] {
                report.push(step, StepStatus::skipped(reason.clone()));
            }
        } else {
            self.monthly_update(&calendar, target, &mut report)?;
        }

        // Returns run on every call, independent of the monthly branch
        self.returns_update(&calendar, &mut report)?;

        Ok(report)
    }

    fn monthly_update(
        &mut self,
        calendar: &Calendar,
        target: YearMonth,
        report: &mut RunReport,
    ) -> Result<()> {
        let policy = MonthPolicy::for_month(target.month());

        // Month-end snapshot of the last completed month
        let me_window = self.month_end_window(calendar, target, target)?;
        let snapshot = match self.source.fetch_month_end(&me_window) {
            Ok(rows) => rows,
            Err(err) => {
                report.push(Step::MonthEnd, StepStatus::failed(&err));
                let reason = "month-end snapshot unavailable";
                for step in [
                    Step::Daily,
                    Step::Quarterly,
                    Step::QuarterlyPrv,
                    Step::Annual,
                    Step::NewSymbolBackfill,
                    Step::QuarterlyPrep,
                    Step::AnnualPrep,
                    Step::FilterFactors,
                ] {
                    report.push(step, StepStatus::skipped(reason));
                }
                return Ok(());
            }
        };

        let observed = tradable_symbols(&snapshot);
        let known: HashSet<Symbol> = self
            .store
            .read(
                MONTH_END,
                &Predicate::all().field_eq(FIELD_SYM_OBJ, true),
                Position::All,
            )?
            .into_iter()
            .map(|r| r.symbol)
            .collect();
        let count = snapshot.len();
        self.store.append(MONTH_END, snapshot)?;
        report.push(Step::MonthEnd, StepStatus::Updated { rows: count });

        let (continuing, new_symbols): (Vec<Symbol>, Vec<Symbol>) = observed
            .into_iter()
            .partition(|symbol| known.contains(symbol.as_str()));
        info!(
            "{} continuing symbols, {} new symbols",
            continuing.len(),
            new_symbols.len()
        );

        // Daily: the last completed month, always
        let day_window = resolve_window(calendar, &DateSpec::Month(target), true, Granularity::Day)?;
        match self.source.fetch_daily(&day_window, &continuing, 0, false) {
            Ok(rows) => {
                let count = rows.len();
                self.store.append(DAILY, rows)?;
                report.push(Step::Daily, StepStatus::Updated { rows: count });
            }
            Err(err) => report.push(Step::Daily, StepStatus::failed(&err)),
        }

        // Confirmed quarterly figures, in reporting months only
        let mut quarterly_ok = true;
        if let Some(fetch_month) = policy.quarterly_confirmed {
            let fetch_ym = YearMonth::new(target.year(), fetch_month)?;
            let window =
                resolve_window(calendar, &DateSpec::Month(fetch_ym), true, Granularity::Quarter)?;
            match self.source.fetch_quarterly(&window, &continuing, 0, false) {
                Ok(rows) => {
                    let count = rows.len();
                    self.store.append(QUARTERLY, rows)?;
                    report.push(Step::Quarterly, StepStatus::Updated { rows: count });
                }
                Err(err) => {
                    quarterly_ok = false;
                    report.push(Step::Quarterly, StepStatus::failed(&err));
                }
            }
        } else {
            report.push(
                Step::Quarterly,
                StepStatus::skipped("not a confirmed reporting month"),
            );
        }

        // Preliminary quarterly figures supersede any stored preliminary
        // rows from the affected quarter onward
        let mut preliminary_ok = true;
        if policy.quarterly_preliminary {
            let window =
                resolve_window(calendar, &DateSpec::Month(target), true, Granularity::Quarter)?;
            match self
                .source
                .fetch_quarterly_prv(&window, &continuing, 0, false)
            {
                Ok(rows) => {
                    let predicate = Predicate::all()
                        .date_from(window.start)
                        .symbols_in(continuing.iter().cloned());
                    let count = self.store.replace_window(QUARTERLY_PRV, &predicate, rows)?;
                    report.push(Step::QuarterlyPrv, StepStatus::Updated { rows: count });
                }
                Err(err) => {
                    preliminary_ok = false;
                    report.push(Step::QuarterlyPrv, StepStatus::failed(&err));
                }
            }
        } else {
            report.push(
                Step::QuarterlyPrv,
                StepStatus::skipped("confirmed-only reporting month"),
            );
        }

        // Annual reports land once a year
        let mut annual_ok = true;
        if policy.annual {
            let window =
                resolve_window(calendar, &DateSpec::Month(target), true, Granularity::Year)?;
            match self.source.fetch_annual(&window, &continuing, 0, false) {
                Ok(rows) => {
                    let count = rows.len();
                    self.store.append(ANNUAL, rows)?;
                    report.push(Step::Annual, StepStatus::Updated { rows: count });
                }
                Err(err) => {
                    annual_ok = false;
                    report.push(Step::Annual, StepStatus::failed(&err));
                }
            }
        } else {
            report.push(
                Step::Annual,
                StepStatus::skipped("annual reports are fetched in May"),
            );
        }

        // Newly observed symbols get the full stored history of every
        // time-series table so they match continuing symbols in depth
        if new_symbols.is_empty() {
            report.push(
                Step::NewSymbolBackfill,
                StepStatus::skipped("no newly observed symbols"),
            );
        } else {
            match self.backfill_new_symbols(&new_symbols) {
                Ok(count) => {
                    report.push(Step::NewSymbolBackfill, StepStatus::Updated { rows: count })
                }
                Err(err @ WarehouseError::SourceUnavailable(_)) => {
                    report.push(Step::NewSymbolBackfill, StepStatus::failed(&err))
                }
                Err(err) => return Err(err),
            }
        }

        // Derived tables only follow raw tables that completed
        if quarterly_ok && preliminary_ok {
            self.refresh_quarterly_prep(calendar, target, &policy, report)?;
            if !policy.annual_prep {
                let reason = "outside the February-May finalization window";
                report.push(Step::AnnualPrep, StepStatus::skipped(reason));
                report.push(Step::FilterFactors, StepStatus::skipped(reason));
            } else if annual_ok {
                self.refresh_annual_prep(calendar, target, report)?;
                self.refresh_filter_factors(target, report)?;
            } else {
                let reason = "annual fetch did not complete";
                report.push(Step::AnnualPrep, StepStatus::skipped(reason));
                report.push(Step::FilterFactors, StepStatus::skipped(reason));
            }
        } else {
            let reason = "quarterly fetch did not complete";
            report.push(Step::QuarterlyPrep, StepStatus::skipped(reason));
            report.push(Step::AnnualPrep, StepStatus::skipped(reason));
            report.push(Step::FilterFactors, StepStatus::skipped(reason));
        }

        Ok(())
    }

    /// Full-history backfill for first-time symbols, bounded per table by
    /// its stored `[min(base_dt), max(base_dt)]`
    fn backfill_new_symbols(&mut self, symbols: &[Symbol]) -> Result<usize> {
        let jobs: [(&str, fn(&M, &DateWindow, &[Symbol]) -> Result<Vec<Row>>); 4] = [
            (DAILY, |source, window, symbols| {
                source.fetch_daily(window, symbols, 0, true)
            }),
            (QUARTERLY, |source, window, symbols| {
                source.fetch_quarterly(window, symbols, 0, true)
            }),
            (QUARTERLY_PRV, |source, window, symbols| {
                source.fetch_quarterly_prv(window, symbols, 0, true)
            }),
            (ANNUAL, |source, window, symbols| {
                source.fetch_annual(window, symbols, 0, true)
            }),
        ];

        let mut total = 0;
        for (table, fetch) in jobs {
            let window = DateWindow::new(
                first_date(&self.store, table)?,
                last_date(&self.store, table)?,
            )?;
            debug!("backfilling {} over {} for {} symbols", table, window, symbols.len());
            let rows = fetch(&self.source, &window, symbols)?;
            total += rows.len();
            self.store.append(table, rows)?;
        }
        Ok(total)
    }

    fn refresh_quarterly_prep(
        &mut self,
        calendar: &Calendar,
        target: YearMonth,
        policy: &MonthPolicy,
        report: &mut RunReport,
    ) -> Result<()> {
        let spec = DateSpec::Month(target);

        // Affected quarters: the last preliminary quarter, or the last
        // confirmed one in reporting months
        let prv_start = offset_window_start(
            calendar,
            &spec,
            true,
            Granularity::Quarter,
            StartOffset::Periods(0),
        )?
        .start;
        let det_start = offset_window_start(
            calendar,
            &spec,
            false,
            Granularity::Quarter,
            StartOffset::Periods(policy.confirmed_prep_offset),
        )?
        .start;

        // Derivation needs a fiscal year of context before the affected quarter
        let lookback = offset_window_start(
            calendar,
            &DateSpec::Day(det_start),
            false,
            Granularity::Quarter,
            StartOffset::FiscalYearsBack(1),
        )?
        .start;

        let quarterly = self.store.read(
            QUARTERLY,
            &Predicate::all().date_from(lookback),
            Position::All,
        )?;
        let quarterly_prv = self.store.read(
            QUARTERLY_PRV,
            &Predicate::all().date_from(lookback),
            Position::All,
        )?;

        let derived = match self
            .deriver
            .derive_quarterly_prep(&quarterly, &quarterly_prv)
        {
            Ok(rows) => rows,
            Err(err) => {
                report.push(Step::QuarterlyPrep, StepStatus::failed(&err));
                return Ok(());
            }
        };

        let first_affected = if policy.is_confirmed_month() {
            YearMonth::of(det_start)
        } else {
            YearMonth::of(prv_start)
        };
        let cutoff = first_affected.to_string();
        let replacement: Vec<Row> = derived
            .into_iter()
            .filter(|r| r.field_str(FIELD_QUARTER).is_some_and(|q| q >= cutoff.as_str()))
            .collect();
        let count = self.store.replace_window(
            QUARTERLY_PREP,
            &Predicate::all().str_field_ge(FIELD_QUARTER, cutoff.clone()),
            replacement,
        )?;
        debug!("quarterly_prep replaced from quarter {}", cutoff);
        report.push(Step::QuarterlyPrep, StepStatus::Updated { rows: count });
        Ok(())
    }

    /// Re-derive the fiscal year still being finalized from its annual
    /// report plus the surrounding quarterly figures
    fn refresh_annual_prep(
        &mut self,
        calendar: &Calendar,
        target: YearMonth,
        report: &mut RunReport,
    ) -> Result<()> {
        let spec = DateSpec::Month(target);
        let year_end = |periods_back| -> Result<NaiveDate> {
            Ok(offset_window_start(
                calendar,
                &spec,
                true,
                Granularity::Year,
                StartOffset::Periods(periods_back),
            )?
            .start)
        };
        let y1 = year_end(0)?;
        let y2 = year_end(1)?;
        let y3 = year_end(2)?;

        let quarterly = self.store.read(
            QUARTERLY,
            &Predicate::all().date_in([y1, y2]),
            Position::All,
        )?;
        let quarterly_prv = self.store.read(
            QUARTERLY_PRV,
            &Predicate::all().date_in([y1, y2]),
            Position::All,
        )?;
        let annual = self.store.read(
            ANNUAL,
            &Predicate::all().date_from(y3).date_to(y1),
            Position::All,
        )?;

        let derived = match self
            .deriver
            .derive_annual_prep(&annual, &quarterly, &quarterly_prv)
        {
            Ok(rows) => rows,
            Err(err) => {
                report.push(Step::AnnualPrep, StepStatus::failed(&err));
                return Ok(());
            }
        };

        let fiscal_year = y1.year().to_string();
        let replacement: Vec<Row> = derived
            .into_iter()
            .filter(|r| r.field_str(FIELD_YEAR) == Some(fiscal_year.as_str()))
            .collect();
        let count = self.store.replace_window(
            ANNUAL_PREP,
            &Predicate::all().str_field_ge(FIELD_YEAR, fiscal_year.clone()),
            replacement,
        )?;
        debug!("annual_prep replaced for fiscal year {}", fiscal_year);
        report.push(Step::AnnualPrep, StepStatus::Updated { rows: count });
        Ok(())
    }

    /// The universe screen is a point-in-time snapshot per run, appended
    fn refresh_filter_factors(&mut self, target: YearMonth, report: &mut RunReport) -> Result<()> {
        match self.deriver.derive_filter_factors(Some(target)) {
            Ok(rows) => {
                let count = rows.len();
                self.store.append(FILTER_FACTORS, rows)?;
                report.push(Step::FilterFactors, StepStatus::Updated { rows: count });
            }
            Err(err) => report.push(Step::FilterFactors, StepStatus::failed(&err)),
        }
        Ok(())
    }

    /// Returns refresh: incremental window for known symbols, full history
    /// for symbols never seen in the returns table
    fn returns_update(&mut self, calendar: &Calendar, report: &mut RunReport) -> Result<()> {
        let first_day = first_date(&self.store, RETURNS)?;
        let last_stored = last_date(&self.store, RETURNS)?;
        let last_complete = calendar.prev_day_before(self.today)?;

        let next_day = match calendar.next_day_after(last_stored) {
            Ok(day) => day,
            Err(_) => {
                report.push(
                    Step::Returns,
                    StepStatus::skipped(format!("returns current through {}", last_stored)),
                );
                return Ok(());
            }
        };
        if next_day > last_complete {
            report.push(
                Step::Returns,
                StepStatus::skipped(format!("returns current through {}", last_stored)),
            );
            return Ok(());
        }

        let stored: HashSet<Symbol> = self
            .store
            .read(RETURNS, &Predicate::all(), Position::All)?
            .into_iter()
            .map(|r| r.symbol)
            .collect();
        let snapshot = self.store.read(
            MONTH_END,
            &Predicate::all().field_eq(FIELD_SYM_OBJ, true),
            Position::All,
        )?;
        let tradables = tradable_symbols(&snapshot);
        let (continuing, new_symbols): (Vec<Symbol>, Vec<Symbol>) = tradables
            .into_iter()
            .partition(|symbol| stored.contains(symbol.as_str()));

        let window = DateWindow::new(next_day, last_complete)?;
        let rows = match self.source.fetch_returns(&window, &continuing, 0, true) {
            Ok(rows) => rows,
            Err(err) => {
                report.push(Step::Returns, StepStatus::failed(&err));
                return Ok(());
            }
        };
        let mut count = rows.len();
        self.store.append(RETURNS, rows)?;

        if !new_symbols.is_empty() {
            let full_window = DateWindow::new(first_day, last_complete)?;
            match self
                .source
                .fetch_returns(&full_window, &new_symbols, 0, false)
            {
                Ok(rows) => {
                    count += rows.len();
                    self.store.append(RETURNS, rows)?;
                }
                Err(err) => {
                    report.push(Step::Returns, StepStatus::failed(&err));
                    return Ok(());
                }
            }
        }

        report.push(Step::Returns, StepStatus::Updated { rows: count });
        Ok(())
    }

    /// Re-fetch named raw tables over their full stored window and merge any
    /// newly available columns into the existing rows
    pub fn extend_table_columns(&mut self, tables: &[&str]) -> Result<RunReport> {
        let mut report = RunReport::default();

        for &table in tables {
            let step = Step::for_table(table).ok_or_else(|| {
                WarehouseError::Configuration(format!(
                    "{} is not a column-extensible raw table",
                    table
                ))
            })?;

            let saved = self.store.read(table, &Predicate::all(), Position::All)?;
            let (Some(first), Some(last)) = (saved.first(), saved.last()) else {
                report.push(step, StepStatus::skipped("table holds no rows"));
                continue;
            };
            let window = DateWindow::new(first.base_dt, last.base_dt)?;

            if table == MONTH_END {
                let fresh = self.source.fetch_month_end(&window)?;
                let merged = merge_new_fields(saved, &fresh);
                let count = merged.len();
                self.store.put(MONTH_END, merged)?;
                report.push(step, StepStatus::Updated { rows: count });
                continue;
            }

            let mut seen = HashSet::new();
            let symbols: Vec<Symbol> = saved
                .iter()
                .filter(|r| seen.insert(r.symbol.clone()))
                .map(|r| r.symbol.clone())
                .collect();

            let fresh = match table {
                DAILY => self.source.fetch_daily(&window, &symbols, 0, true)?,
                QUARTERLY => self.source.fetch_quarterly(&window, &symbols, 0, true)?,
                QUARTERLY_PRV => self
                    .source
                    .fetch_quarterly_prv(&window, &symbols, 0, true)?,
                ANNUAL => self.source.fetch_annual(&window, &symbols, 0, true)?,
                _ => {
                    return Err(WarehouseError::Configuration(format!(
                        "{} is not a column-extensible raw table",
                        table
                    )))
                }
            };

            let merged = merge_new_fields(saved, &fresh);
            let count = merged.len();
            self.store.put(table, merged)?;
            report.push(step, StepStatus::Updated { rows: count });

            // New quarterly columns flow into the derived table as well
            if table == QUARTERLY {
                let prep_new = self.deriver.derive_quarterly_prep(&fresh, &[])?;
                let prep_saved =
                    self.store
                        .read(QUARTERLY_PREP, &Predicate::all(), Position::All)?;
                let merged = merge_new_fields_by_period(prep_saved, &prep_new, FIELD_QUARTER);
                let count = merged.len();
                self.store.put(QUARTERLY_PREP, merged)?;
                report.push(Step::QuarterlyPrep, StepStatus::Updated { rows: count });
            }
        }

        Ok(report)
    }
}

//! # factorstore
//!
//! An incremental warehouse for financial time-series tables: exchange
//! holidays, month-end snapshots, daily/quarterly/annual fundamentals,
//! returns and the factor tables derived from them.
//!
//! The core is a business-calendar engine (business-day, month-end,
//! quarter-end and year-end indices built from a holiday set, plus window
//! resolution against them) and an update orchestrator that walks the raw
//! and derived tables, decides per table what window is missing, fetches
//! only that window and applies it with idempotent replace-window writes.
//! Scraping, storage engines beyond the bundled backends and factor math
//! are external collaborators behind traits.
//!
//! ## Example
//!
//! ```rust,no_run
//! use factorstore::prelude::*;
//! use chrono::NaiveDate;
//!
//! # fn run(source: impl MarketDataSource, deriver: impl FactorDeriver)
//! #     -> factorstore::error::Result<()> {
//! let store = MemoryStore::new();
//! let today = NaiveDate::from_ymd_opt(2024, 5, 2).unwrap();
//! let mut warehouse = Warehouse::new(store, source, deriver, today);
//!
//! let report = warehouse.update(None)?;
//! println!("{}", report);
//! # Ok(())
//! # }
//! ```

pub mod calendar;
pub mod derive;
pub mod error;
pub mod orchestrator;
pub mod policy;
pub mod source;
pub mod store;
pub mod types;
pub mod window;

pub mod prelude {
    //! Commonly used types and traits
    pub use crate::calendar::{Calendar, HolidaySet};
    pub use crate::derive::FactorDeriver;
    pub use crate::error::{Result, WarehouseError};
    pub use crate::orchestrator::{RunReport, Step, StepStatus, Warehouse, WarehouseConfig};
    pub use crate::policy::MonthPolicy;
    pub use crate::source::{CsvDataSource, MarketDataSource};
    pub use crate::store::{MemoryStore, Position, Predicate, TableStore};
    #[cfg(feature = "rusqlite-support")]
    pub use crate::store::SqliteStore;
    pub use crate::types::{DateSpec, DateWindow, Granularity, Row, Symbol, YearMonth};
    pub use crate::window::{offset_window_start, resolve_window, StartOffset};
}

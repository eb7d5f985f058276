//! Error types for the warehouse

use thiserror::Error;

/// Main error type for warehouse operations
#[derive(Error, Debug)]
pub enum WarehouseError {
    /// Bad or missing holiday data, or an otherwise unusable configuration
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Calendar math requested outside the built horizon
    #[error("Out of horizon: {0}")]
    OutOfHorizon(String),

    /// Stepping back through a period index would precede the horizon
    #[error("Index underflow: {0}")]
    IndexUnderflow(String),

    /// External fetch failed; retry the run later, no partial state persists
    #[error("Source unavailable: {0}")]
    SourceUnavailable(String),

    /// A watermark read found no rows; the table needs an initial full load
    #[error("Data gap: {0}")]
    DataGap(String),

    /// Table store backend failure
    #[error("Store error: {0}")]
    Store(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Result type alias for warehouse operations
pub type Result<T> = std::result::Result<T, WarehouseError>;

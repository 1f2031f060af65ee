//! Error types for the rebalancing engine.
//!
//! Solver outcomes that are not optimal are *not* errors: they are reported
//! through [`SolveStatus`](crate::types::SolveStatus) on the result structs so
//! callers can branch on partial failure. Only malformed inputs surface here.

use thiserror::Error;

/// Main error type for the rebalancing engine.
#[derive(Error, Debug)]
pub enum BalancerError {
    #[error("Insufficient data: {0}")]
    InsufficientData(String),

    #[error("Dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("No price available for {ticker}")]
    MissingPrice { ticker: String },

    #[error("Optimization error: {0}")]
    Optimization(String),

    #[error("Invalid configuration: {0}")]
    ConfigError(String),

    #[error("CSV parsing error: {0}")]
    CsvError(#[from] csv::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Date parsing error: {0}")]
    DateParseError(#[from] chrono::ParseError),

    #[error("JSON serialization error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("TOML parsing error: {0}")]
    TomlError(#[from] toml::de::Error),
}

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, BalancerError>;

use thiserror::Error;

/// Validation and contract errors exposed by `tickpipe-core`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("symbol cannot be empty")]
    EmptySymbol,
    #[error("symbol length {len} exceeds max {max}")]
    SymbolTooLong { len: usize, max: usize },
    #[error("symbol must start with an ASCII letter or digit: '{ch}'")]
    SymbolInvalidStart { ch: char },
    #[error("symbol contains invalid character '{ch}' at index {index}")]
    SymbolInvalidChar { ch: char, index: usize },

    #[error("exchange code cannot be empty")]
    EmptyExchange,
    #[error("invalid source id '{value}', expected lowercase [a-z0-9_-]")]
    InvalidSourceId { value: String },
    #[error("invalid asset class '{value}', expected one of equity, etf, future, crypto, forex, index")]
    InvalidAssetClass { value: String },
    #[error("invalid granularity '{value}', expected one of tick, 1m, 5m, 15m, 30m, 1h, 4h, 1d")]
    InvalidGranularity { value: String },

    #[error("timestamp must be RFC3339 UTC (suffix Z): '{value}'")]
    TimestampNotUtc { value: String },
    #[error("timestamp out of range: {value}")]
    TimestampOutOfRange { value: i128 },
    #[error("window start {start} must be before end {end}")]
    EmptyWindow { start: String, end: String },

    #[error("field '{field}' must be finite")]
    NonFiniteValue { field: &'static str },
    #[error("field '{field}' must be non-negative")]
    NegativeValue { field: &'static str },
    #[error("bar high must be >= low")]
    InvalidBarRange,
    #[error("bar open/close must be within high/low range")]
    InvalidBarBounds,
}

/// Top-level error type for core operations that are not job outcomes.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Config(#[from] crate::config::ConfigError),

    #[error(transparent)]
    Storage(#[from] crate::storage::StorageError),

    #[error(transparent)]
    Scheduler(#[from] crate::scheduler::SchedulerError),

    #[error(transparent)]
    Registry(#[from] crate::registry::RegistryError),

    #[error(transparent)]
    Warehouse(#[from] tickpipe_warehouse::WarehouseError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl CoreError {
    /// Stable identifier for logs and exit reporting.
    pub const fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "core.validation",
            Self::Config(error) => error.code(),
            Self::Storage(error) => error.code(),
            Self::Scheduler(error) => error.code(),
            Self::Registry(_) => "core.registry",
            Self::Warehouse(_) => "storage.warehouse",
            Self::Serialization(_) => "core.serialization",
        }
    }
}

use thiserror::Error;
use tickpipe_core::CoreError;

/// CLI-level error categories mapped to exit codes.
#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Config(#[from] tickpipe_core::config::ConfigError),

    #[error(transparent)]
    Validation(#[from] tickpipe_core::ValidationError),

    #[error("{0}")]
    Usage(String),

    #[error("{0} [{code}]", code = .0.code())]
    Core(#[from] CoreError),

    #[error(transparent)]
    Warehouse(#[from] tickpipe_warehouse::WarehouseError),

    #[error(transparent)]
    Storage(#[from] tickpipe_core::storage::StorageError),

    #[error("{failed} job(s) failed")]
    JobsFailed { failed: usize },

    #[error("failed to initialize logging: {0}")]
    Logging(String),

    #[error(transparent)]
    Join(#[from] tokio::task::JoinError),

    #[error(transparent)]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl CliError {
    pub const fn exit_code(&self) -> u8 {
        match self {
            Self::Config(_) => 2,
            Self::Validation(_) => 2,
            Self::Usage(_) => 2,
            Self::Core(CoreError::Config(_) | CoreError::Validation(_)) => 2,
            Self::Core(_) => 1,
            Self::Warehouse(_) => 1,
            Self::Storage(_) => 1,
            Self::JobsFailed { .. } => 3,
            Self::Logging(_) => 1,
            Self::Join(_) => 1,
            Self::Serialization(_) => 4,
            Self::Io(_) => 10,
        }
    }
}

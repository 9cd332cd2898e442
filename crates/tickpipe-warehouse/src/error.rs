use thiserror::Error;

#[derive(Debug, Error)]
pub enum WarehouseError {
    #[error(transparent)]
    DuckDb(#[from] ::duckdb::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("invalid stored data: {0}")]
    InvalidData(String),
}

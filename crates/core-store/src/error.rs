use thiserror::Error;

/// Narrow, store-local error enum — mirrors `deadcat_store::StoreError`'s
/// split from the crate-wide `CoreError`.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] diesel::result::Error),

    #[error("connection error: {0}")]
    Connection(#[from] diesel::ConnectionError),

    #[error("migration error: {0}")]
    Migration(String),

    #[error("invalid data: {0}")]
    InvalidData(String),

    #[error("not found: {0}")]
    NotFound(String),
}

impl From<StoreError> for core_sdk::CoreError {
    fn from(e: StoreError) -> Self {
        core_sdk::CoreError::StoreFailure(e.to_string())
    }
}

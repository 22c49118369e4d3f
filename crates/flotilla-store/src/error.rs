//! Error types for the cluster store.

use thiserror::Error;

/// Result type alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur inside the store harness.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to open database: {0}")]
    Open(String),

    #[error("transaction error: {0}")]
    Transaction(String),

    #[error("table error: {0}")]
    Table(String),

    #[error("read error: {0}")]
    Read(String),

    #[error("write error: {0}")]
    Write(String),

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("deserialization error: {0}")]
    Deserialize(String),
}

impl From<StoreError> for flotilla_api::BackendError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Serialize(msg) | StoreError::Deserialize(msg) => {
                flotilla_api::BackendError::Serialize(msg)
            }
            other => flotilla_api::BackendError::Unavailable(other.to_string()),
        }
    }
}

//! Error types for state-backend interactions.

use thiserror::Error;

/// Result type alias for backend operations.
pub type BackendResult<T> = Result<T, BackendError>;

/// Errors the state backend can surface to the placement core.
///
/// Only `CompactedHistory` changes consumer control flow (full relist);
/// the rest are transient and answered with backoff-and-retry.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("watch history compacted; oldest retained version is {oldest}")]
    CompactedHistory { oldest: u64 },

    #[error("operation timed out after {0}ms")]
    Timeout(u64),

    #[error("object not found: {0}")]
    NotFound(String),

    #[error("serialization error: {0}")]
    Serialize(String),
}

impl BackendError {
    /// True for failures that should be retried with backoff rather
    /// than surfaced as a unit-level outcome.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            BackendError::Unavailable(_) | BackendError::Timeout(_)
        )
    }
}

//! Scheduler error taxonomy.
//!
//! Transient errors are retried with backoff and never fail a unit.
//! Conflicts drop the cycle (a fresh watch event re-drives it).
//! Rejections follow the admission gate's retryable flag; a
//! non-retryable rejection fails the unit once the retry budget is
//! spent.

use thiserror::Error;

use flotilla_api::BackendError;

/// Errors surfaced by scheduling operations.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// State backend failure; transient unless the backend says not.
    #[error("backend error: {0}")]
    Backend(#[from] BackendError),

    /// Conditional write lost the race; drop the cycle.
    #[error("bind conflict for unit {0}")]
    Conflict(String),

    /// The bind write did not complete within the deadline.
    #[error("bind deadline exceeded for unit {0}")]
    BindTimeout(String),

    /// Admission gate refused the bind.
    #[error("bind rejected for unit {unit}: {reason}")]
    Rejected {
        unit: String,
        reason: String,
        retryable: bool,
    },

    /// Configuration file could not be read.
    #[error("config read error: {0}")]
    ConfigRead(#[from] std::io::Error),

    /// Configuration file could not be parsed.
    #[error("config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),
}

impl SchedulerError {
    /// Whether retrying with backoff can help.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Backend(e) => e.is_transient(),
            Self::BindTimeout(_) => true,
            Self::Rejected { retryable, .. } => *retryable,
            Self::Conflict(_) | Self::ConfigRead(_) | Self::ConfigParse(_) => false,
        }
    }
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;

//! Error types for the GPU scheduler

use thiserror::Error;

/// Main error type for scheduler and webhook operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration error (TLS material, invalid flags)
    #[error("configuration error: {0}")]
    Config(String),

    /// Watch retry budget exhausted; the process owner must restart us
    #[error("watch failed {attempts} consecutive times, giving up: {last}")]
    RetriesExhausted {
        /// Number of consecutive failed watch attempts
        attempts: u32,
        /// Message of the error that exhausted the budget
        last: String,
    },
}

impl Error {
    /// Create a configuration error with the given message
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Whether this error is a watch cursor invalidation (HTTP 410 Gone).
    ///
    /// Cursor expiry means our watch position is too stale to resume from;
    /// the stream must be reopened from a fresh list, but it is not a
    /// failure and never counts toward the retry budget.
    pub fn is_cursor_expired(&self) -> bool {
        matches!(self, Error::Kube(kube::Error::Api(resp)) if resp.code == 410)
    }
}

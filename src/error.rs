//! Error types for the analysis core and the issue store boundary.

use std::time::Duration;
use thiserror::Error;

/// Failures raised by an [`crate::store::IssueStore`] implementation.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("network error: {0}")]
    Network(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("GitLab API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("failed to decode response: {0}")]
    Decode(String),

    /// Carries the limit that was hit, when known.
    #[error("request timed out{}", timeout_suffix(.0))]
    Timeout(Option<Duration>),
}

fn timeout_suffix(limit: &Option<Duration>) -> String {
    limit.map(|d| format!(" after {:?}", d)).unwrap_or_default()
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }
}

impl From<reqwest::Error> for StoreError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            StoreError::Timeout(None)
        } else if err.is_decode() {
            StoreError::Decode(err.to_string())
        } else {
            StoreError::Network(err.to_string())
        }
    }
}

/// Errors surfaced by the analysis pipeline.
#[derive(Debug, Error)]
pub enum AnalyzeError {
    /// Required input was missing; no I/O was attempted.
    #[error("invalid request: {0}")]
    Validation(String),

    /// Every search strategy failed, so there is nothing to rank.
    #[error("all {attempted} search queries failed; last error: {last_error}")]
    SearchFailure { attempted: usize, last_error: String },
}

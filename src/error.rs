//! Error types for the Quotaguard service.

use std::time::Duration;

use thiserror::Error;

/// Main error type for Quotaguard operations outside the request path.
#[derive(Error, Debug)]
pub enum QuotaGuardError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Counter store errors surfaced at startup
    #[error("Counter store error: {0}")]
    Store(#[from] StoreError),

    /// HTTP server errors
    #[error("Server error: {0}")]
    Server(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors returned by a counter store backend.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The store could not be reached or refused the transaction.
    #[error("{store} unavailable: {reason}")]
    Unavailable { store: &'static str, reason: String },

    /// The store did not answer within the configured timeout.
    #[error("{store} did not respond within {after:?}")]
    Timeout { store: &'static str, after: Duration },

    /// The store answered with something other than the expected counts.
    #[error("malformed counter reply: {0}")]
    MalformedReply(String),

    /// The local counter map is full and cannot track another subject.
    #[error("local counter is tracking the maximum of {max_subjects} subjects")]
    CapacityExhausted { max_subjects: usize },
}

impl StoreError {
    /// Whether this failure means the store itself could not complete the
    /// transaction (as opposed to a local resource limit).
    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            StoreError::Unavailable { .. }
                | StoreError::Timeout { .. }
                | StoreError::MalformedReply(_)
        )
    }
}

/// Errors from the admission decision path.
///
/// Quota exhaustion is not an error: it is a `Decision` with `allowed == false`.
#[derive(Error, Debug)]
pub enum LimiterError {
    /// Neither the shared store nor the local counter produced counts.
    #[error("Internal rate limiter error: {0}")]
    Internal(String),
}

/// Result type alias for Quotaguard operations.
pub type Result<T> = std::result::Result<T, QuotaGuardError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unavailable_classification() {
        let unavailable = StoreError::Unavailable {
            store: "redis",
            reason: "connection refused".to_string(),
        };
        let timeout = StoreError::Timeout {
            store: "redis",
            after: Duration::from_millis(250),
        };
        let malformed = StoreError::MalformedReply("expected 4 integers".to_string());
        let full = StoreError::CapacityExhausted { max_subjects: 10 };

        assert!(unavailable.is_unavailable());
        assert!(timeout.is_unavailable());
        assert!(malformed.is_unavailable());
        assert!(!full.is_unavailable());
    }

    #[test]
    fn test_store_error_messages() {
        let err = StoreError::Timeout {
            store: "redis",
            after: Duration::from_millis(250),
        };
        assert_eq!(err.to_string(), "redis did not respond within 250ms");

        let err: QuotaGuardError = StoreError::CapacityExhausted { max_subjects: 3 }.into();
        assert!(err.to_string().starts_with("Counter store error:"));
    }
}

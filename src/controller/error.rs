//! Error types for the controller.
//!
//! Errors are classified for retry behavior: transient failures requeue
//! quickly, invariant violations fall back to the slow requeue.

use std::time::Duration;
use thiserror::Error;

use crate::client::EsClientError;
use crate::shutdown::ShutdownError;

/// Error type for controller operations
#[derive(Error, Debug)]
pub enum Error {
    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    /// Elasticsearch API error
    #[error("Elasticsearch API error: {0}")]
    Elasticsearch(#[from] EsClientError),

    /// Node shutdown coordination error
    #[error("Node shutdown error: {0}")]
    Shutdown(#[from] ShutdownError),

    /// Missing required field in resource
    #[error("Missing required field: {0}")]
    MissingField(String),

    /// Validation error in resource spec
    #[error("Validation error: {0}")]
    Validation(String),

    /// Transient error that should be retried
    #[error("Transient error: {0}")]
    Transient(String),

    /// Permanent error that should not be retried
    #[error("Permanent error: {0}")]
    Permanent(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Check if this error indicates a not-found condition
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::Kube(kube::Error::Api(e)) if e.code == 404)
    }

    /// Check if this error indicates a conflict (stale resourceVersion, precondition failure)
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Kube(kube::Error::Api(e)) if e.code == 409)
    }

    /// Check if this error should be retried
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube(e) => {
                // Retry on network errors, rate limiting, conflicts and server errors
                matches!(
                    e,
                    kube::Error::Api(api_err) if api_err.code >= 500 || api_err.code == 429 || api_err.code == 409
                ) || matches!(e, kube::Error::Service(_))
            }
            Error::Elasticsearch(e) => es_error_is_retryable(e),
            Error::Shutdown(ShutdownError::Client(e)) => es_error_is_retryable(e),
            // A shutdown cancelled concurrently shows up on the next pass.
            Error::Shutdown(ShutdownError::NotFound(_)) => true,
            Error::Shutdown(ShutdownError::UnknownNode(_)) => false,
            Error::Transient(_) => true,
            Error::Validation(_) | Error::Permanent(_) | Error::MissingField(_) => false,
            Error::Serialization(_) => false,
        }
    }

    /// Get the recommended requeue duration for this error
    pub fn requeue_after(&self) -> Duration {
        if self.is_retryable() {
            Duration::from_secs(30)
        } else {
            Duration::from_secs(3600)
        }
    }
}

/// Every transport or status failure from Elasticsearch is transient; only a
/// response we cannot decode points at a bug.
fn es_error_is_retryable(e: &EsClientError) -> bool {
    !matches!(e, EsClientError::Decode(_))
}

/// Result type alias for controller operations
pub type Result<T> = std::result::Result<T, Error>;

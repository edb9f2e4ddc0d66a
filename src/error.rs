//! Service error taxonomy.
//!
//! Every fallible boundary (store adapters, remote-model clients, pipeline
//! stages) returns [`ServiceError`]. The HTTP layer maps variants onto
//! status codes; the worker maps any stage error onto a `failed` document
//! with the error's display text as the human-readable message.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServiceError {
    /// Invalid or missing credentials.
    #[error("unauthorized: {0}")]
    Auth(String),

    /// A request parameter or form field failed validation.
    #[error("{0}")]
    Validation(String),

    /// The referenced document or entity does not exist (or is out of scope).
    #[error("not found: {0}")]
    NotFound(String),

    /// A dependency is reachable but temporarily failing; retried with
    /// backoff before surfacing.
    #[error("{dependency} unavailable: {message}")]
    DependencyTransient {
        dependency: &'static str,
        message: String,
    },

    /// A dependency kept failing past the retry budget.
    #[error("{dependency} failed: {message}")]
    DependencyFatal {
        dependency: &'static str,
        message: String,
    },

    /// The LLM returned output that does not decode into the expected shape.
    #[error("malformed model output: {0}")]
    MalformedUpstream(String),

    /// An internal invariant was violated.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ServiceError {
    pub fn transient(dependency: &'static str, message: impl Into<String>) -> Self {
        ServiceError::DependencyTransient {
            dependency,
            message: message.into(),
        }
    }

    pub fn fatal(dependency: &'static str, message: impl Into<String>) -> Self {
        ServiceError::DependencyFatal {
            dependency,
            message: message.into(),
        }
    }

    /// Whether a retry with backoff is worthwhile.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ServiceError::DependencyTransient { .. } | ServiceError::MalformedUpstream(_)
        )
    }
}

//! Error types for the renewal services.
//!
//! Errors are classified by who can fix them:
//! - Validation / NotFound: the caller, by correcting the request
//! - UpstreamStore: nobody right now; safe to retry later
//! - PartialSync: the run finished, some rows need another pass

use thiserror::Error;

use crate::db::DbError;

/// Error types surfaced by the query, mutation, history, and sync services.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("{0}")]
    Validation(String),

    #[error("Renewal not found: {0}")]
    NotFound(String),

    /// Display text names the operation only. The wrapped store error stays
    /// in logs and is never shown to callers.
    #[error("Backing store failed during {operation}")]
    UpstreamStore {
        operation: &'static str,
        #[source]
        source: DbError,
    },

    #[error("Sync completed with {failed} of {attempted} row writes failing")]
    PartialSync { failed: usize, attempted: usize },
}

impl ServiceError {
    pub fn validation(message: impl Into<String>) -> Self {
        ServiceError::Validation(message.into())
    }

    /// Wrap a store failure, logging the internal detail once.
    pub fn store(operation: &'static str, source: DbError) -> Self {
        log::error!("Store failure during {operation}: {source}");
        ServiceError::UpstreamStore { operation, source }
    }

    /// Returns true if retrying the same request may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ServiceError::UpstreamStore { .. } | ServiceError::PartialSync { .. }
        )
    }

    pub fn error_type(&self) -> ErrorType {
        match self {
            ServiceError::Validation(_) => ErrorType::Validation,
            ServiceError::NotFound(_) => ErrorType::NotFound,
            ServiceError::UpstreamStore { .. } => ErrorType::UpstreamStore,
            ServiceError::PartialSync { .. } => ErrorType::PartialSync,
        }
    }
}

/// Serializable error representation for HTTP responses.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiError {
    pub error: String,
    pub error_type: ErrorType,
    pub can_retry: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    Validation,
    NotFound,
    UpstreamStore,
    PartialSync,
    Conflict,
}

impl From<&ServiceError> for ApiError {
    fn from(err: &ServiceError) -> Self {
        ApiError {
            error: err.to_string(),
            error_type: err.error_type(),
            can_retry: err.is_retryable(),
        }
    }
}

//! Error taxonomy for cloud endpoints.

use thiserror::Error;

/// Result type for cloud operations.
pub type ApiResult<T> = Result<T, ApiError>;

/// Errors surfaced by the gateway and sync handlers.
///
/// Authentication/authorization and request-level validation failures abort a
/// request before any side effect. `Referential` never aborts a request: it
/// only ever appears as a per-row outcome inside a push report.
#[derive(Error, Debug)]
pub enum ApiError {
    /// Missing or invalid token (401).
    #[error("unauthorized: {0}")]
    Authentication(String),

    /// Tenant or hwid mismatch (403).
    #[error("forbidden: {0}")]
    Authorization(String),

    /// License or tenant absent (404).
    #[error("not found: {0}")]
    NotFound(String),

    /// Missing required field (400).
    #[error("invalid request: {0}")]
    Validation(String),

    /// Duplicate license for a tenant (409).
    #[error("conflict: {0}")]
    Conflict(String),

    /// Unresolved parent LocalId during push (409, per-row only).
    #[error("unresolved reference: {0}")]
    Referential(String),

    /// Unexpected failure (500).
    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    /// HTTP status for this failure class.
    pub fn status_code(&self) -> u16 {
        match self {
            ApiError::Validation(_) => 400,
            ApiError::Authentication(_) => 401,
            ApiError::Authorization(_) => 403,
            ApiError::NotFound(_) => 404,
            ApiError::Conflict(_) | ApiError::Referential(_) => 409,
            ApiError::Internal(_) => 500,
        }
    }

    /// Returns true if this is a client error (4xx).
    pub fn is_client_error(&self) -> bool {
        self.status_code() < 500
    }
}

impl From<rusqlite::Error> for ApiError {
    fn from(err: rusqlite::Error) -> Self {
        ApiError::Internal(err.to_string())
    }
}

/// Unified error types for accountd
use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Account field guarded by a uniqueness constraint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UniqueField {
    Username,
    Email,
}

impl UniqueField {
    pub fn as_str(&self) -> &'static str {
        match self {
            UniqueField::Username => "username",
            UniqueField::Email => "email",
        }
    }
}

impl fmt::Display for UniqueField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Main error type for the account service
#[derive(Error, Debug)]
pub enum ServiceError {
    /// No account matches the request (also covers inactive/deleted on authentication)
    #[error("Not found: {0}")]
    NotFound(String),

    /// Another account already holds this username or email
    #[error("Account with this {0} already exists")]
    AlreadyExists(UniqueField),

    /// Storage rejected a change that passed every service-level check
    #[error("Inconsistent state: {0}")]
    InconsistentState(String),

    /// Unknown username or wrong password
    #[error("Incorrect username or password")]
    InvalidCredentials,

    /// Token signature, expiry or payload is invalid
    #[error("Invalid token: {0}")]
    InvalidToken(String),

    /// Token was revoked by logout
    #[error("Token has been revoked, please log in again")]
    TokenBlacklisted,

    /// Rate limiting errors
    #[error("Rate limit exceeded")]
    RateLimitExceeded { retry_after: std::time::Duration },

    /// Malformed request input
    #[error("Validation error: {0}")]
    Validation(String),

    /// Unique constraint violation raised by the storage layer.
    /// The account service translates this before it reaches a caller.
    #[error("Uniqueness violation: {0}")]
    UniquenessViolation(String),

    /// Database errors
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Cache store errors
    #[error("Cache error: {0}")]
    Cache(#[from] redis::RedisError),

    /// Internal server errors
    #[error("Internal error: {0}")]
    Internal(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ServiceError {
    /// Stable machine-readable error code
    pub fn code(&self) -> &'static str {
        match self {
            ServiceError::NotFound(_) => "NotFound",
            ServiceError::AlreadyExists(_) => "AlreadyExists",
            ServiceError::InconsistentState(_) => "InconsistentState",
            ServiceError::InvalidCredentials => "InvalidCredentials",
            ServiceError::InvalidToken(_) => "InvalidToken",
            ServiceError::TokenBlacklisted => "TokenBlacklisted",
            ServiceError::RateLimitExceeded { .. } => "TooManyRequests",
            ServiceError::Validation(_) => "ValidationError",
            _ => "InternalServerError",
        }
    }

    /// HTTP status the transport layer reports for this error
    pub fn status(&self) -> StatusCode {
        match self {
            ServiceError::NotFound(_) => StatusCode::NOT_FOUND,
            ServiceError::AlreadyExists(_) | ServiceError::InconsistentState(_) => {
                StatusCode::BAD_REQUEST
            }
            ServiceError::InvalidCredentials
            | ServiceError::InvalidToken(_)
            | ServiceError::TokenBlacklisted => StatusCode::UNAUTHORIZED,
            ServiceError::RateLimitExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            ServiceError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Message safe to show to the caller
    fn public_message(&self) -> String {
        match self {
            ServiceError::NotFound(msg) => msg.clone(),
            ServiceError::InconsistentState(msg) => msg.clone(),
            ServiceError::Validation(msg) => msg.clone(),
            ServiceError::InvalidToken(_) => "Could not validate credentials".to_string(),
            ServiceError::UniquenessViolation(_)
            | ServiceError::Database(_)
            | ServiceError::Cache(_)
            | ServiceError::Internal(_)
            | ServiceError::Io(_) => "Internal server error".to_string(), // Don't leak details
            other => other.to_string(),
        }
    }
}

/// JSON error body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

/// Convert ServiceError to HTTP response
impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status();

        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = %self, "request failed");
        }

        let body = ErrorResponse {
            error: self.code().to_string(),
            message: self.public_message(),
            path: None,
        };

        let mut response = (status, Json(body.clone())).into_response();

        match &self {
            ServiceError::RateLimitExceeded { retry_after } => {
                if let Ok(value) = HeaderValue::from_str(&retry_after.as_secs().max(1).to_string()) {
                    response.headers_mut().insert(header::RETRY_AFTER, value);
                }
            }
            _ if status == StatusCode::UNAUTHORIZED => {
                response
                    .headers_mut()
                    .insert(header::WWW_AUTHENTICATE, HeaderValue::from_static("Bearer"));
            }
            _ => {}
        }

        // Picked up by the error-path middleware to annotate the body
        response.extensions_mut().insert(body);
        response
    }
}

/// Result type alias for service operations
pub type ServiceResult<T> = Result<T, ServiceError>;

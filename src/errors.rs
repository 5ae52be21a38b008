//! Application error model with HTTP error mapping
//!
//! Defines a typed error hierarchy using `thiserror` for internal error handling,
//! and maps each variant to an HTTP status and a stable `code` string for the
//! JSON surface.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use thiserror::Error;

/// Application error type
///
/// Covers every failure the mirror can surface. MIME decoding problems are not
/// represented here: the decoder absorbs them and degrades to escaped text.
#[derive(Debug, Error)]
pub enum AppError {
    /// Invalid user input (validation failed, malformed request)
    #[error("invalid input: {0}")]
    InvalidInput(String),
    /// Resource not found (account, cached message, remote message)
    #[error("not found: {0}")]
    NotFound(String),
    /// Transport or TLS failure while reaching the mail server
    #[error("connection failed: {0}")]
    Connection(String),
    /// Mail server rejected the credentials
    #[error("authentication failed: {0}")]
    Auth(String),
    /// Unexpected response from the mail server
    #[error("protocol error: {0}")]
    Protocol(String),
    /// Stored secret could not be decrypted with the configured key
    #[error("decrypt failed: {0}")]
    Decrypt(String),
    /// Operation timeout (TCP connect, TLS handshake, IMAP response)
    #[error("operation timed out: {0}")]
    Timeout(String),
    /// Local database failure
    #[error("storage error: {0}")]
    Storage(String),
    /// Internal error (unexpected failure, external crate error)
    #[error("internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Convenience constructor for `InvalidInput`
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    /// Whether this failure means the remote mailbox was never usable
    ///
    /// A secret that cannot be decrypted leaves nothing to authenticate with,
    /// so it is grouped with transport failures.
    pub fn is_connection_tier(&self) -> bool {
        matches!(self, Self::Connection(_) | Self::Timeout(_) | Self::Decrypt(_))
    }

    /// Stable machine-readable code
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidInput(_) => "invalid_input",
            Self::NotFound(_) => "not_found",
            Self::Connection(_) => "connection",
            Self::Auth(_) => "auth_failed",
            Self::Protocol(_) => "protocol",
            Self::Decrypt(_) => "decrypt",
            Self::Timeout(_) => "timeout",
            Self::Storage(_) => "storage",
            Self::Internal(_) => "internal",
        }
    }

    /// HTTP status for the JSON surface
    ///
    /// # Mappings
    ///
    /// - `InvalidInput` → 400
    /// - `NotFound` → 404
    /// - `Auth` → 401
    /// - `Connection`, `Protocol`, `Decrypt`, `Timeout` → 502
    /// - `Storage`, `Internal` → 500
    pub fn status(&self) -> StatusCode {
        match self {
            Self::InvalidInput(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Auth(_) => StatusCode::UNAUTHORIZED,
            Self::Connection(_) | Self::Protocol(_) | Self::Decrypt(_) | Self::Timeout(_) => {
                StatusCode::BAD_GATEWAY
            }
            Self::Storage(_) | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = json!({ "error": self.to_string(), "code": self.code() });
        (self.status(), Json(body)).into_response()
    }
}

impl From<rusqlite::Error> for AppError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Storage(e.to_string())
    }
}

/// Type alias for fallible return values
///
/// Use this for all internal functions that can fail. Provides a consistent
/// error type throughout the codebase.
pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use axum::http::StatusCode;

    use super::AppError;

    #[test]
    fn decrypt_failures_are_connection_tier() {
        assert!(AppError::Decrypt("bad tag".to_owned()).is_connection_tier());
        assert!(AppError::Timeout("tcp".to_owned()).is_connection_tier());
        assert!(!AppError::Auth("nope".to_owned()).is_connection_tier());
    }

    #[test]
    fn maps_remote_failures_to_bad_gateway() {
        assert_eq!(
            AppError::Protocol("BAD".to_owned()).status(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            AppError::NotFound("uid 3".to_owned()).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(AppError::invalid("x").code(), "invalid_input");
    }
}

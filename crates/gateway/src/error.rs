//! Relay error taxonomy and its HTTP status mapping.

use axum::http::StatusCode;
use thiserror::Error;

/// Relay error type.
#[derive(Debug, Error)]
pub enum RelayError {
    /// API key rejected, or key does not own the target client.
    #[error("Unauthorized")]
    AuthDenied,

    /// Target client id unknown locally and in the directory.
    #[error("Invalid client ID")]
    NotFound,

    /// Malformed request shape, or the peer returned an error field.
    #[error("{0}")]
    BadRequest(String),

    /// Waiter deadline expired before the peer answered.
    #[error("Request timed out")]
    Timeout,

    /// Peer send failed, broker publish failed, or the socket closed.
    #[error("Upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Directory store error.
    #[error("Directory error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Broker error.
    #[error("Broker error: {0}")]
    Broker(String),

    /// Anything else.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl RelayError {
    /// HTTP status for this error kind.
    pub fn status(&self) -> StatusCode {
        match self {
            RelayError::AuthDenied => StatusCode::UNAUTHORIZED,
            RelayError::NotFound => StatusCode::NOT_FOUND,
            RelayError::BadRequest(_) => StatusCode::BAD_REQUEST,
            RelayError::Timeout => StatusCode::REQUEST_TIMEOUT,
            RelayError::UpstreamUnavailable(_) | RelayError::Broker(_) => StatusCode::BAD_GATEWAY,
            RelayError::Json(_) | RelayError::Redis(_) | RelayError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

/// Result type for relay operations.
pub type Result<T> = std::result::Result<T, RelayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(RelayError::AuthDenied.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(RelayError::NotFound.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            RelayError::BadRequest("x".into()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(RelayError::Timeout.status(), StatusCode::REQUEST_TIMEOUT);
        assert_eq!(
            RelayError::UpstreamUnavailable("send failed".into()).status(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            RelayError::Internal("boom".into()).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_wire_messages() {
        // These two strings are part of the HTTP surface.
        assert_eq!(RelayError::NotFound.to_string(), "Invalid client ID");
        assert_eq!(RelayError::Timeout.to_string(), "Request timed out");
    }
}

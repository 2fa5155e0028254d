//! Error handling for IS22 Frame Gateway

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Error types
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Missing/invalid transcoding utility, locator or camera config
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Vendor system unreachable or locator resolution failed
    #[error("Source unavailable: {0}")]
    SourceUnavailable(String),

    /// Malformed frame boundary, transport handshake failure
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Too many concurrent sessions/processes
    #[error("Resource exhaustion: {0}")]
    ResourceExhaustion(String),

    /// No frame within the start or inactivity window
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Client disconnected or send failed
    #[error("Channel closed: {0}")]
    ChannelClosed(String),

    /// Session ID already registered
    #[error("Duplicate session: {0}")]
    DuplicateSession(String),

    /// Session ID not registered
    #[error("Unknown session: {0}")]
    UnknownSession(String),

    /// Operation not allowed in the session's current state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Validation error
    #[error("Validation error: {0}")]
    Validation(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// HTTP client error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Stable machine-readable code, shared by HTTP bodies and logs
    pub fn code(&self) -> &'static str {
        match self {
            Error::Configuration(_) => "CONFIGURATION_ERROR",
            Error::SourceUnavailable(_) => "SOURCE_UNAVAILABLE",
            Error::Protocol(_) => "PROTOCOL_ERROR",
            Error::ResourceExhaustion(_) => "RESOURCE_EXHAUSTION",
            Error::Timeout(_) => "TIMEOUT",
            Error::ChannelClosed(_) => "CHANNEL_CLOSED",
            Error::DuplicateSession(_) => "DUPLICATE_SESSION",
            Error::UnknownSession(_) => "UNKNOWN_SESSION",
            Error::InvalidState(_) => "INVALID_STATE",
            Error::Validation(_) => "VALIDATION_ERROR",
            Error::Serialization(_) => "SERIALIZATION_ERROR",
            Error::Http(_) => "HTTP_ERROR",
            Error::Io(_) => "IO_ERROR",
            Error::Internal(_) => "INTERNAL_ERROR",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            Error::Configuration(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Error::SourceUnavailable(_) => StatusCode::BAD_GATEWAY,
            Error::Protocol(_) => StatusCode::BAD_GATEWAY,
            Error::ResourceExhaustion(_) => StatusCode::SERVICE_UNAVAILABLE,
            Error::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Error::ChannelClosed(_) => StatusCode::GONE,
            Error::DuplicateSession(_) => StatusCode::CONFLICT,
            Error::UnknownSession(_) => StatusCode::NOT_FOUND,
            Error::InvalidState(_) => StatusCode::CONFLICT,
            Error::Validation(_) => StatusCode::BAD_REQUEST,
            Error::Serialization(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Error::Http(_) => StatusCode::BAD_GATEWAY,
            Error::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Error::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status();
        let error_code = self.code();
        let message = self.to_string();

        tracing::error!(
            status = %status,
            error_code = %error_code,
            message = %message,
            "Request error"
        );

        let body = Json(json!({
            "error_code": error_code,
            "message": message
        }));

        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_taxonomy_status_mapping() {
        assert_eq!(
            Error::SourceUnavailable("x".into()).status(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            Error::ResourceExhaustion("x".into()).status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(Error::UnknownSession("x".into()).status(), StatusCode::NOT_FOUND);
        assert_eq!(Error::Timeout("x".into()).code(), "TIMEOUT");
    }

    #[test]
    fn test_io_error_converts() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "ffmpeg");
        let err: Error = io.into();
        assert_eq!(err.code(), "IO_ERROR");
    }
}

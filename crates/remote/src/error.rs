//! Error types for the remote crate.

use clinicsync_core::errors::{Error, RemoteError, RemoteErrorKind};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ApiError>;

/// Retry policy class for API failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiRetryClass {
    Retryable,
    Permanent,
    ReauthRequired,
}

#[derive(Debug, Error)]
pub enum ApiError {
    /// HTTP client error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Non-success response from the resource service
    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    /// Invalid request (bad base URL, unusable header value, ...)
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Missing or rejected access token
    #[error("Authentication error: {0}")]
    Auth(String),
}

impl ApiError {
    pub fn api(status: u16, message: impl Into<String>) -> Self {
        Self::Api {
            status,
            message: message.into(),
        }
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest(message.into())
    }

    pub fn auth(message: impl Into<String>) -> Self {
        Self::Auth(message.into())
    }

    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::Api { status, .. } => Some(*status),
            Self::Http(err) => err.status().map(|s| s.as_u16()),
            _ => None,
        }
    }

    /// Classify error for retry policy.
    pub fn retry_class(&self) -> ApiRetryClass {
        match self {
            Self::Api { status, .. } => match *status {
                401 | 403 => ApiRetryClass::ReauthRequired,
                408 | 409 | 423 | 425 | 429 => ApiRetryClass::Retryable,
                500..=599 => ApiRetryClass::Retryable,
                _ => ApiRetryClass::Permanent,
            },
            Self::Http(_) => ApiRetryClass::Retryable,
            Self::Json(_) => ApiRetryClass::Permanent,
            Self::InvalidRequest(_) => ApiRetryClass::Permanent,
            Self::Auth(_) => ApiRetryClass::ReauthRequired,
        }
    }
}

impl From<ApiError> for Error {
    fn from(err: ApiError) -> Self {
        let message = err.to_string();
        let kind = match &err {
            ApiError::Http(e) if e.is_timeout() => RemoteErrorKind::Timeout,
            ApiError::Http(e) if e.is_decode() => RemoteErrorKind::Decode,
            ApiError::Http(_) => RemoteErrorKind::Network,
            ApiError::Json(_) => RemoteErrorKind::Decode,
            ApiError::Api { status, .. } if matches!(*status, 401 | 403) => RemoteErrorKind::Auth,
            ApiError::Api { status, .. } => RemoteErrorKind::Status(*status),
            ApiError::Auth(_) => RemoteErrorKind::Auth,
            ApiError::InvalidRequest(_) => return Error::Validation(message),
        };
        Error::Remote(RemoteError::new(kind, message))
    }
}

//! Error types shared by every clinicsync crate.

use thiserror::Error;

use crate::drafts::DraftStatus;

/// Result type alias for clinicsync operations.
pub type Result<T> = std::result::Result<T, Error>;

/// How a remote call failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteErrorKind {
    /// Connection refused, DNS failure, reset, ...
    Network,
    Timeout,
    /// The server answered with a non-success status.
    Status(u16),
    /// The server answered but the body could not be decoded.
    Decode,
    /// Missing or rejected credentials.
    Auth,
}

/// Failure of a call against the remote resource service.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct RemoteError {
    pub kind: RemoteErrorKind,
    pub message: String,
}

impl RemoteError {
    pub fn new(kind: RemoteErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(RemoteErrorKind::Network, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(RemoteErrorKind::Timeout, message)
    }

    pub fn status(status: u16, message: impl Into<String>) -> Self {
        Self::new(RemoteErrorKind::Status(status), message)
    }

    /// HTTP status if the server answered.
    pub fn status_code(&self) -> Option<u16> {
        match self.kind {
            RemoteErrorKind::Status(status) => Some(status),
            _ => None,
        }
    }

    /// Network failures, timeouts and 5xx responses may succeed on a later attempt.
    pub fn is_recoverable(&self) -> bool {
        match self.kind {
            RemoteErrorKind::Network | RemoteErrorKind::Timeout => true,
            RemoteErrorKind::Status(status) => matches!(status, 408 | 429 | 500..=599),
            RemoteErrorKind::Decode | RemoteErrorKind::Auth => false,
        }
    }
}

/// Local persistence failures.
#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error("Database connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Database query failed: {0}")]
    QueryFailed(String),

    #[error("Database error: {0}")]
    Internal(String),
}

#[derive(Debug, Error)]
pub enum Error {
    /// Remote failure (network, timeout, non-2xx). Reads recover through the local cache.
    #[error("Remote request failed: {0}")]
    Remote(#[from] RemoteError),

    /// Rejected before any network call was attempted.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Admission control refused the remote attempt.
    #[error("Remote service unavailable: {0}")]
    Unavailable(String),

    /// Push channel failure.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Commit, cancel or update on a draft that already reached a terminal status.
    #[error("Draft {draft_id} is {status} and can no longer change")]
    DraftState {
        draft_id: String,
        status: DraftStatus,
    },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Database(#[from] DatabaseError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport(message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }

    pub fn database(message: impl Into<String>) -> Self {
        Self::Database(DatabaseError::Internal(message.into()))
    }

    /// True for failures that should trigger the local-cache fallback on reads.
    pub fn is_remote_failure(&self) -> bool {
        matches!(self, Self::Remote(_) | Self::Unavailable(_))
    }
}

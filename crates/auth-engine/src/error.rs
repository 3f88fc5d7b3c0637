//! Authentication error types.

use extension_auth_protocol::ProtocolError;
use extension_storage::StorageError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Authentication error type.
#[derive(Error, Debug)]
pub enum AuthError {
    /// Transport failure talking to the backend (connect, timeout, decode)
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The backend answered with a status the caller did not expect
    #[error("Backend returned {status} ({body_summary})")]
    Backend { status: u16, body_summary: String },

    /// The cookie jar refused a write
    #[error("Cookie write rejected: {0}")]
    CookieWrite(String),

    /// The refresh token itself is invalid or expired
    #[error("Refresh token rejected: {0}")]
    RefreshRejected(String),

    /// The backend cookie or a positive status never showed up
    #[error("Verification timed out after {attempts} attempts")]
    VerificationTimeout { attempts: u32 },

    /// An authenticated request kept failing after a refresh
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    /// Invalid state transition in the coordinator FSM
    #[error("Invalid coordinator state transition: {0}")]
    InvalidStateTransition(String),

    /// The request body cannot be replayed after a refresh
    #[error("Request cannot be retried: {0}")]
    UnreplayableRequest(String),

    /// The coordinator task is gone
    #[error("Coordinator stopped")]
    CoordinatorStopped,

    /// Storage error
    #[error("Storage error: {0}")]
    Storage(StorageError),

    /// Cross-context protocol error
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// URL parse error
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<StorageError> for AuthError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::CookieWrite(msg) => AuthError::CookieWrite(msg),
            other => AuthError::Storage(other),
        }
    }
}

impl From<extension_config_and_utils::CoreError> for AuthError {
    fn from(err: extension_config_and_utils::CoreError) -> Self {
        AuthError::Config(err.to_string())
    }
}

/// Coarse error classification kept in `SessionState`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Network,
    CookieWrite,
    Refresh,
    VerificationTimeout,
    AuthenticationFailed,
    Internal,
}

impl AuthError {
    /// Returns true if this error is transient and the operation can be retried.
    ///
    /// Transient errors include:
    /// - Connection failures and timeouts
    /// - 5xx responses
    /// - Rejected cookie writes
    pub fn is_transient(&self) -> bool {
        match self {
            AuthError::Http(e) => {
                if e.is_connect() || e.is_timeout() || e.is_request() {
                    return true;
                }
                if let Some(status) = e.status() {
                    return status.is_server_error();
                }
                false
            }
            AuthError::Backend { status, .. } => *status >= 500,
            AuthError::CookieWrite(_) => true,
            _ => false,
        }
    }

    /// Returns true if the error ends the session or the current cycle.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AuthError::RefreshRejected(_)
                | AuthError::VerificationTimeout { .. }
                | AuthError::AuthenticationFailed(_)
        )
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            AuthError::Http(_) | AuthError::Backend { .. } => ErrorKind::Network,
            AuthError::CookieWrite(_) => ErrorKind::CookieWrite,
            AuthError::RefreshRejected(_) => ErrorKind::Refresh,
            AuthError::VerificationTimeout { .. } => ErrorKind::VerificationTimeout,
            AuthError::AuthenticationFailed(_) => ErrorKind::AuthenticationFailed,
            _ => ErrorKind::Internal,
        }
    }
}

/// Result type alias using AuthError.
pub type AuthResult<T> = Result<T, AuthError>;

//! Token, user and session types shared by every component.

use crate::ErrorKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// An access/refresh token pair as obtained from some context.
///
/// Holding a pair proves nothing; only a positive `status()` in the current
/// cycle does.
#[derive(Clone, PartialEq, Eq)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub issued_at: DateTime<Utc>,
}

impl TokenPair {
    pub fn new(access_token: impl Into<String>, refresh_token: Option<String>) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token: refresh_token.filter(|t| !t.is_empty()),
            issued_at: Utc::now(),
        }
    }
}

impl fmt::Debug for TokenPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenPair")
            .field("access_token", &"<redacted>")
            .field(
                "refresh_token",
                &self.refresh_token.as_ref().map(|_| "<redacted>"),
            )
            .field("issued_at", &self.issued_at)
            .finish()
    }
}

/// A user as reported by the backend. Never built client-side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub full_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub picture: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_sign_in_at: Option<String>,
}

/// Result of `GET /auth/status`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendStatus {
    pub is_authenticated: bool,
    pub user: Option<User>,
}

impl BackendStatus {
    pub fn unauthenticated() -> Self {
        Self {
            is_authenticated: false,
            user: None,
        }
    }
}

/// What the foreground renders from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionState {
    pub user: Option<User>,
    pub is_authenticated: bool,
    pub is_loading: bool,
    pub error: Option<ErrorKind>,
}

impl SessionState {
    /// The state a freshly mounted UI starts from: assume the session is
    /// good until a check says otherwise, so protected pages do not flash.
    pub fn optimistic() -> Self {
        Self {
            user: None,
            is_authenticated: true,
            is_loading: true,
            error: None,
        }
    }

    pub fn loading() -> Self {
        Self {
            user: None,
            is_authenticated: false,
            is_loading: true,
            error: None,
        }
    }

    pub fn authenticated(user: Option<User>) -> Self {
        Self {
            user,
            is_authenticated: true,
            is_loading: false,
            error: None,
        }
    }

    pub fn unauthenticated(error: Option<ErrorKind>) -> Self {
        Self {
            user: None,
            is_authenticated: false,
            is_loading: false,
            error,
        }
    }
}

impl Default for SessionState {
    fn default() -> Self {
        Self::optimistic()
    }
}

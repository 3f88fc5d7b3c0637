//! Cookie records and the asynchronous cookie store contract.

use crate::StorageResult;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// SameSite attribute as reported by the browser cookie API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SameSite {
    /// `SameSite=None`; only accepted together with `secure`.
    NoRestriction,
    Lax,
    Strict,
    #[default]
    Unspecified,
}

/// A single browser cookie.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CookieRecord {
    pub name: String,
    /// Domain the cookie belongs to (a leading dot is accepted and ignored).
    pub domain: String,
    pub path: String,
    pub value: String,
    pub secure: bool,
    pub http_only: bool,
    pub same_site: SameSite,
    /// Expiration as Unix seconds, [`None`] for session cookies.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expiration_date: Option<i64>,
}

impl CookieRecord {
    /// A session cookie on `/` with default attributes.
    pub fn new(domain: impl Into<String>, name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            domain: domain.into(),
            path: "/".to_string(),
            value: value.into(),
            secure: false,
            http_only: false,
            same_site: SameSite::Unspecified,
            expiration_date: None,
        }
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    pub fn with_secure(mut self, secure: bool) -> Self {
        self.secure = secure;
        self
    }

    pub fn with_http_only(mut self, http_only: bool) -> Self {
        self.http_only = http_only;
        self
    }

    pub fn with_same_site(mut self, same_site: SameSite) -> Self {
        self.same_site = same_site;
        self
    }

    pub fn expires_at(mut self, expires: DateTime<Utc>) -> Self {
        self.expiration_date = Some(expires.timestamp());
        self
    }

    /// Whether the cookie has expired at `now`. Session cookies never expire here.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        matches!(self.expiration_date, Some(exp) if exp <= now.timestamp())
    }

    /// Whether a lookup for `domain` should see this cookie.
    ///
    /// A cookie set on `example.com` is visible to `api.example.com`, not the
    /// other way round.
    pub fn matches_domain(&self, domain: &str) -> bool {
        let own = normalize_domain(&self.domain);
        let query = normalize_domain(domain);
        query == own || query.ends_with(&format!(".{own}"))
    }

    /// Identity used by the jar: the same name, domain and path replace each other.
    pub(crate) fn same_slot(&self, other: &CookieRecord) -> bool {
        self.name == other.name
            && self.path == other.path
            && normalize_domain(&self.domain) == normalize_domain(&other.domain)
    }
}

/// Lowercase the domain and drop a leading dot and any port.
pub fn normalize_domain(domain: &str) -> String {
    let trimmed = domain.trim().trim_start_matches('.');
    let host = trimmed.split(':').next().unwrap_or(trimmed);
    host.to_ascii_lowercase()
}

/// Why a cookie changed, mirroring the browser's change causes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CookieChangeCause {
    /// Set or removed by an explicit call.
    Explicit,
    /// Replaced by a later write to the same slot.
    Overwrite,
    /// Dropped because its expiration passed.
    Expired,
}

/// A cookie change notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CookieChange {
    pub cookie: CookieRecord,
    pub removed: bool,
    pub cause: CookieChangeCause,
}

/// Per-domain cookie API. All calls are asynchronous; there is no
/// multi-cookie transaction.
#[async_trait]
pub trait CookieStore: Send + Sync {
    /// The most specific live cookie named `name` visible to `domain`.
    async fn get(&self, domain: &str, name: &str) -> StorageResult<Option<CookieRecord>>;

    /// Every live cookie visible to `domain`.
    async fn get_all(&self, domain: &str) -> StorageResult<Vec<CookieRecord>>;

    /// Write a cookie. Fails with `StorageError::CookieWrite` when the
    /// domain/secure combination is rejected. A cookie whose expiration is
    /// already in the past removes the slot instead.
    async fn set(&self, record: CookieRecord) -> StorageResult<CookieRecord>;

    /// Remove every cookie named `name` on exactly `domain`. Removing an
    /// absent cookie is not an error.
    async fn remove(&self, domain: &str, name: &str) -> StorageResult<()>;

    /// Subscribe to cookie changes.
    fn subscribe(&self) -> broadcast::Receiver<CookieChange>;
}

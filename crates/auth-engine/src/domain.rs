//! Cookie domains and attributes used by every auth cookie write.

use crate::{AuthError, AuthResult};
use chrono::{DateTime, Duration, Utc};
use extension_config_and_utils::Config;
use extension_storage::{normalize_domain, CookieRecord, SameSite};
use url::Url;

/// Cookie names shared by the backend and the auth website.
pub struct CookieNames;

impl CookieNames {
    pub const ACCESS_TOKEN: &'static str = "access_token";
    pub const REFRESH_TOKEN: &'static str = "refresh_token";
    pub const USER_ID: &'static str = "user_id";
    pub const USER_NAME: &'static str = "user_name";
    pub const USER_PICTURE: &'static str = "user_picture";

    /// Informational cookies the backend sets after verification.
    pub const INFORMATIONAL: [&'static str; 3] =
        [Self::USER_ID, Self::USER_NAME, Self::USER_PICTURE];
}

/// Which domains hold auth cookies and how those cookies are written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainConfig {
    /// Domain of the backend API; its cookies carry the session.
    pub backend_domain: String,
    /// Domain of the external auth website.
    pub external_domain: String,
    pub path: String,
    pub secure: bool,
    pub same_site: SameSite,
    pub access_token_ttl: Duration,
    pub refresh_token_ttl: Duration,
}

impl DomainConfig {
    /// Cross-site cookie attributes with server-matching lifetimes
    /// (1 hour access, 7 days refresh).
    pub fn new(backend_domain: &str, external_domain: &str) -> Self {
        Self {
            backend_domain: normalize_domain(backend_domain),
            external_domain: normalize_domain(external_domain),
            path: "/".to_string(),
            secure: true,
            same_site: SameSite::NoRestriction,
            access_token_ttl: Duration::hours(1),
            refresh_token_ttl: Duration::days(7),
        }
    }

    pub fn from_urls(backend: &Url, auth_site: &Url) -> AuthResult<Self> {
        let backend_host = backend
            .host_str()
            .ok_or_else(|| AuthError::Config(format!("backend URL has no host: {backend}")))?;
        let auth_host = auth_site
            .host_str()
            .ok_or_else(|| AuthError::Config(format!("auth site URL has no host: {auth_site}")))?;
        Ok(Self::new(backend_host, auth_host))
    }

    pub fn from_config(config: &Config) -> AuthResult<Self> {
        Self::from_urls(&config.backend_url()?, &config.auth_site_url()?)
    }

    /// Every domain sign-out must clear.
    pub fn known_domains(&self) -> [&str; 2] {
        [&self.backend_domain, &self.external_domain]
    }

    pub fn access_cookie(&self, domain: &str, value: &str, now: DateTime<Utc>) -> CookieRecord {
        self.cookie(domain, CookieNames::ACCESS_TOKEN, value, now + self.access_token_ttl)
    }

    pub fn refresh_cookie(&self, domain: &str, value: &str, now: DateTime<Utc>) -> CookieRecord {
        self.cookie(domain, CookieNames::REFRESH_TOKEN, value, now + self.refresh_token_ttl)
    }

    fn cookie(
        &self,
        domain: &str,
        name: &str,
        value: &str,
        expires: DateTime<Utc>,
    ) -> CookieRecord {
        CookieRecord::new(domain, name, value)
            .with_path(self.path.clone())
            .with_secure(self.secure)
            .with_same_site(self.same_site)
            .expires_at(expires)
    }
}

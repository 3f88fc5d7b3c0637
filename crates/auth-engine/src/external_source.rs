//! Finding tokens the user obtained on the external auth website.

use crate::domain::{CookieNames, DomainConfig};
use crate::{AuthResult, TokenPair};
use async_trait::async_trait;
use extension_auth_protocol::LocalStorageTokens;
use extension_storage::CookieStore;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Access to open tabs of the auth website.
#[async_trait]
pub trait AuthSiteTabs: Send + Sync {
    /// Send `getTokensFromLocalStorage` to a content script in an open
    /// auth-site tab. `None` when no tab answered.
    async fn request_tokens(&self) -> AuthResult<Option<LocalStorageTokens>>;

    /// Inject a script into an open auth-site tab and read its local storage
    /// directly. `None` when there is no such tab.
    async fn inject_and_read(&self) -> AuthResult<Option<LocalStorageTokens>>;
}

/// For contexts with no browser tabs at all.
pub struct NoAuthSiteTabs;

#[async_trait]
impl AuthSiteTabs for NoAuthSiteTabs {
    async fn request_tokens(&self) -> AuthResult<Option<LocalStorageTokens>> {
        Ok(None)
    }

    async fn inject_and_read(&self) -> AuthResult<Option<LocalStorageTokens>> {
        Ok(None)
    }
}

/// Where a token pair came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenOrigin {
    ExternalCookies,
    PageMessage,
    ScriptInjection,
    /// Passed to `sign_in`/`sign_up`.
    Credentials,
    /// Minted from the backend refresh cookie.
    BackendRefresh,
}

/// Looks for tokens on the auth website: its cookies first, then its page
/// local storage through a content script, then through script injection.
pub struct ExternalTokenSource {
    cookies: Arc<dyn CookieStore>,
    domains: DomainConfig,
    tabs: Arc<dyn AuthSiteTabs>,
}

impl ExternalTokenSource {
    pub fn new(cookies: Arc<dyn CookieStore>, domains: DomainConfig, tabs: Arc<dyn AuthSiteTabs>) -> Self {
        Self {
            cookies,
            domains,
            tabs,
        }
    }

    pub fn tabs(&self) -> &Arc<dyn AuthSiteTabs> {
        &self.tabs
    }

    /// First token pair found, in source order. Individual source failures
    /// are logged and skipped.
    pub async fn discover(&self) -> Option<(TokenPair, TokenOrigin)> {
        match self.from_cookies().await {
            Ok(Some(pair)) => return Some((pair, TokenOrigin::ExternalCookies)),
            Ok(None) => {}
            Err(e) => warn!(error = %e, "failed to read external auth cookies"),
        }

        match self.tabs.request_tokens().await {
            Ok(Some(tokens)) if !tokens.is_empty() => {
                return Some((to_pair(&tokens)?, TokenOrigin::PageMessage));
            }
            Ok(Some(_)) => {
                // A content script answered with the empty triple; the page
                // is reachable, so injection would read the same storage.
                debug!("auth site reports no tokens");
                return None;
            }
            Ok(None) => debug!("no content script answered"),
            Err(e) => warn!(error = %e, "token request to auth site failed"),
        }

        match self.tabs.inject_and_read().await {
            Ok(Some(tokens)) if !tokens.is_empty() => {
                Some((to_pair(&tokens)?, TokenOrigin::ScriptInjection))
            }
            Ok(_) => None,
            Err(e) => {
                warn!(error = %e, "script injection into auth site failed");
                None
            }
        }
    }

    async fn from_cookies(&self) -> AuthResult<Option<TokenPair>> {
        let domain = &self.domains.external_domain;
        let Some(access) = self.cookies.get(domain, CookieNames::ACCESS_TOKEN).await? else {
            return Ok(None);
        };
        if access.value.is_empty() {
            return Ok(None);
        }
        let refresh = self.cookies.get(domain, CookieNames::REFRESH_TOKEN).await?;
        Ok(Some(TokenPair::new(access.value, refresh.map(|c| c.value))))
    }

    /// Delete the token cookies on the auth website's domain once they have
    /// been carried over.
    pub async fn clear_external_cookies(&self) {
        let domain = &self.domains.external_domain;
        for name in [CookieNames::ACCESS_TOKEN, CookieNames::REFRESH_TOKEN] {
            if let Err(e) = self.cookies.remove(domain, name).await {
                warn!(domain = %domain, cookie = name, error = %e, "failed to clear external cookie");
            }
        }
        info!(domain = %domain, "cleared external auth cookies");
    }
}

fn to_pair(tokens: &LocalStorageTokens) -> Option<TokenPair> {
    let access = tokens.access_token()?;
    Some(TokenPair::new(access, tokens.refresh_token().map(str::to_string)))
}

//! Authenticated fetch with a single refresh-and-retry on 401.

use crate::context::AuthContext;
use crate::domain::CookieNames;
use crate::transfer::TransferOutcome;
use crate::{AuthError, AuthResult};
use chrono::{DateTime, TimeZone, Utc};
use extension_auth_protocol::ExtensionMessage;
use extension_storage::CookieRecord;
use reqwest::header::{HeaderValue, AUTHORIZATION};
use reqwest::StatusCode;
use tracing::{debug, info, warn};

/// Wraps requests to the backend so that an expired access token is
/// refreshed once, transparently.
///
/// At most one refresh and one retry happen per call. A refreshed pair goes
/// to the token cache and, through the shared transfer routine, to the
/// backend cookies, so a rotated refresh token is never lost. If the retry is still
/// unauthorized, or the refresh token is rejected, every token is cleared and
/// `authenticationFailed` goes out on the message bus.
pub struct TokenRefreshProxy {
    ctx: AuthContext,
}

impl TokenRefreshProxy {
    pub fn new(ctx: AuthContext) -> Self {
        Self { ctx }
    }

    /// Client to build requests with.
    pub fn http_client(&self) -> &reqwest::Client {
        self.ctx.backend.http_client()
    }

    /// Send `request` with the current access token as a bearer token.
    ///
    /// Non-401 responses, errors included, are returned untouched. A
    /// transient refresh failure is returned as is and keeps the tokens.
    pub async fn fetch_with_auth(&self, request: reqwest::Request) -> AuthResult<reqwest::Response> {
        let retry = request
            .try_clone()
            .ok_or_else(|| AuthError::UnreplayableRequest(request.url().to_string()))?;

        let access_token = self.current_access_token().await;
        let response = self.send(request, access_token.as_deref()).await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        debug!(url = %response.url(), "request unauthorized, refreshing token");
        let Some(refresh_token) = self.current_refresh_token().await else {
            return Err(self.fail("no refresh token available").await);
        };

        let pair = match self.ctx.backend.refresh(&refresh_token).await {
            Ok(pair) => pair,
            Err(e) if e.is_transient() => {
                warn!(error = %e, "token refresh failed, keeping tokens");
                return Err(e);
            }
            Err(e) => return Err(self.fail(&e.to_string()).await),
        };

        if let Err(e) = self
            .ctx
            .cache
            .store(&pair.access_token, pair.refresh_token.as_deref())
        {
            warn!(error = %e, "failed to cache refreshed tokens");
        }
        match self.ctx.transfer.transfer(&pair).await {
            Ok(TransferOutcome::Written) => debug!("refreshed tokens written to backend cookies"),
            Ok(TransferOutcome::AlreadyInProgress) => {
                debug!("transfer in progress, refreshed tokens kept in the cache")
            }
            Ok(TransferOutcome::Superseded) => {
                return Err(AuthError::AuthenticationFailed(
                    "session ended during token refresh".to_string(),
                ));
            }
            Err(e) => warn!(error = %e, "failed to write refreshed tokens to cookies"),
        }

        let response = self.send(retry, Some(&pair.access_token)).await?;
        if response.status() == StatusCode::UNAUTHORIZED {
            return Err(self.fail("request still unauthorized after refresh").await);
        }

        info!(url = %response.url(), "request succeeded after token refresh");
        Ok(response)
    }

    async fn send(
        &self,
        mut request: reqwest::Request,
        access_token: Option<&str>,
    ) -> AuthResult<reqwest::Response> {
        if let Some(token) = access_token {
            let value = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|_| AuthError::AuthenticationFailed("malformed access token".into()))?;
            request.headers_mut().insert(AUTHORIZATION, value);
        }

        let credentials = self.ctx.backend.credentials();
        credentials.attach(&mut request).await;
        let url = request.url().clone();
        let response = self.ctx.backend.http_client().execute(request).await?;
        credentials.absorb(&url, response.headers()).await;
        Ok(response)
    }

    /// Cached token while fresh, otherwise the backend cookie.
    async fn current_access_token(&self) -> Option<String> {
        let max_age = self.ctx.domains.access_token_ttl.to_std().unwrap_or_default();
        match self.ctx.cache.fresh_access_token(max_age) {
            Ok(Some(token)) => return Some(token),
            Ok(None) => {}
            Err(e) => warn!(error = %e, "failed to read token cache"),
        }
        self.backend_cookie(CookieNames::ACCESS_TOKEN).await
    }

    /// The newer of the backend refresh cookie and the cached refresh token.
    async fn current_refresh_token(&self) -> Option<String> {
        let cookie = self.backend_cookie_record(CookieNames::REFRESH_TOKEN).await;
        let cached = match self.ctx.cache.load() {
            Ok(cached) => cached.and_then(|c| Some((c.refresh_token?, c.token_timestamp))),
            Err(e) => {
                warn!(error = %e, "failed to read token cache");
                None
            }
        };

        match (cookie, cached) {
            (Some(cookie), Some((token, cached_at))) => {
                if self.refresh_cookie_written_at(&cookie) > Some(cached_at) {
                    Some(cookie.value)
                } else {
                    Some(token)
                }
            }
            (Some(cookie), None) => Some(cookie.value),
            (None, cached) => cached.map(|(token, _)| token),
        }
    }

    /// Refresh cookies are written with a fixed lifetime, so their write
    /// time follows from the expiry.
    fn refresh_cookie_written_at(&self, cookie: &CookieRecord) -> Option<DateTime<Utc>> {
        let expires = Utc.timestamp_opt(cookie.expiration_date?, 0).single()?;
        Some(expires - self.ctx.domains.refresh_token_ttl)
    }

    async fn backend_cookie(&self, name: &str) -> Option<String> {
        self.backend_cookie_record(name).await.map(|c| c.value)
    }

    async fn backend_cookie_record(&self, name: &str) -> Option<CookieRecord> {
        match self.ctx.cookies.get(&self.ctx.domains.backend_domain, name).await {
            Ok(cookie) => cookie.filter(|c| !c.value.is_empty()),
            Err(e) => {
                warn!(cookie = name, error = %e, "failed to read backend cookie");
                None
            }
        }
    }

    /// Clear every token and tell the other contexts.
    async fn fail(&self, reason: &str) -> AuthError {
        warn!(reason, "authentication failed, clearing tokens");
        if let Err(e) = self
            .ctx
            .transfer
            .clear_pair(&self.ctx.domains.backend_domain)
            .await
        {
            warn!(error = %e, "failed to clear backend cookies");
        }
        if let Err(e) = self.ctx.cache.clear() {
            warn!(error = %e, "failed to clear token cache");
        }
        self.ctx.bus.publish(ExtensionMessage::AuthenticationFailed);
        AuthError::AuthenticationFailed(reason.to_string())
    }
}

//! Client for the backend's four auth endpoints.
//!
//! Every call carries the backend-domain cookies and stores any cookies the
//! backend sets, like a browser `fetch` with `credentials: "include"`.

use crate::credentials::CookieCredentials;
use crate::{AuthError, AuthResult, BackendStatus, TokenPair, User};
use extension_storage::CookieStore;
use reqwest::{Method, StatusCode};
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use tracing::{debug, info, warn};
use url::Url;

/// Bodies may echo tokens; log only their size and a digest.
fn summarize_response_body(body: &str) -> String {
    let mut hasher = DefaultHasher::new();
    body.hash(&mut hasher);
    format!("len={},digest={:016x}", body.len(), hasher.finish())
}

/// Keep a base path like `/api` when joining endpoint paths onto it.
fn with_trailing_slash(mut url: Url) -> Url {
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    url
}

#[derive(Debug, Serialize)]
struct LoginRequest<'a> {
    access_token: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    refresh_token: Option<&'a str>,
}

#[derive(Debug, Serialize)]
struct RefreshRequest<'a> {
    refresh_token: &'a str,
}

#[derive(Debug, Deserialize)]
struct RefreshResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
}

/// `GET /auth/status` body.
#[derive(Debug, Deserialize)]
struct StatusResponse {
    is_authenticated: bool,
    #[serde(default)]
    user_id: Option<String>,
    #[serde(default)]
    user_name: Option<String>,
    #[serde(default)]
    user_picture: Option<String>,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    role: Option<String>,
}

impl From<StatusResponse> for BackendStatus {
    fn from(body: StatusResponse) -> Self {
        if !body.is_authenticated {
            return BackendStatus::unauthenticated();
        }
        let user = body.user_id.map(|id| User {
            id,
            email: body.email,
            full_name: body.user_name,
            picture: body.user_picture,
            role: body.role,
            created_at: None,
            last_sign_in_at: None,
        });
        BackendStatus {
            is_authenticated: true,
            user,
        }
    }
}

/// HTTP client for `/auth/login`, `/auth/logout`, `/auth/status` and `/auth/refresh`.
#[derive(Clone)]
pub struct BackendAuthClient {
    http_client: reqwest::Client,
    base_url: Url,
    credentials: CookieCredentials,
}

impl BackendAuthClient {
    pub fn new(base_url: Url, cookies: Arc<dyn CookieStore>) -> Self {
        Self::with_http_client(reqwest::Client::new(), base_url, cookies)
    }

    pub fn with_http_client(
        http_client: reqwest::Client,
        base_url: Url,
        cookies: Arc<dyn CookieStore>,
    ) -> Self {
        Self {
            http_client,
            base_url: with_trailing_slash(base_url),
            credentials: CookieCredentials::new(cookies),
        }
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub fn http_client(&self) -> &reqwest::Client {
        &self.http_client
    }

    pub fn credentials(&self) -> &CookieCredentials {
        &self.credentials
    }

    fn endpoint(&self, path: &str) -> AuthResult<Url> {
        Ok(self.base_url.join(path.trim_start_matches('/'))?)
    }

    /// Send with cookies attached; keep whatever cookies come back.
    async fn send(
        &self,
        method: Method,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> AuthResult<reqwest::Response> {
        let url = self.endpoint(path)?;
        let mut builder = self.http_client.request(method, url.clone());
        if let Some(body) = body {
            builder = builder.json(&body);
        }
        let mut request = builder.build()?;
        self.credentials.attach(&mut request).await;

        let response = self.http_client.execute(request).await?;
        self.credentials.absorb(&url, response.headers()).await;
        Ok(response)
    }

    async fn unexpected(path: &str, response: reqwest::Response) -> AuthError {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        let body_summary = summarize_response_body(&body);
        warn!(path, status = %status, body_summary = %body_summary, "unexpected backend response");
        AuthError::Backend {
            status: status.as_u16(),
            body_summary,
        }
    }

    /// Exchange bearer tokens for a server-managed session.
    pub async fn login(&self, tokens: &TokenPair) -> AuthResult<User> {
        let body = serde_json::to_value(LoginRequest {
            access_token: &tokens.access_token,
            refresh_token: tokens.refresh_token.as_deref(),
        })?;
        let response = self.send(Method::POST, "/auth/login", Some(body)).await?;

        match response.status() {
            status if status.is_success() => {
                let user: User = response.json().await?;
                info!(user_id = %user.id, "backend login succeeded");
                Ok(user)
            }
            StatusCode::UNAUTHORIZED => Err(AuthError::AuthenticationFailed(
                "backend rejected login tokens".to_string(),
            )),
            _ => Err(Self::unexpected("/auth/login", response).await),
        }
    }

    /// Best-effort logout. Never fails; local cleanup proceeds regardless.
    pub async fn logout(&self) {
        match self.send(Method::POST, "/auth/logout", None).await {
            Ok(response) if response.status().is_success() => {
                debug!("backend logout succeeded");
            }
            Ok(response) => {
                warn!(status = %response.status(), "backend logout returned an error status");
            }
            Err(e) => {
                warn!(error = %e, "backend logout failed");
            }
        }
    }

    /// The single source of truth for session validity. A 401 is a normal
    /// negative answer, not an error.
    pub async fn status(&self) -> AuthResult<BackendStatus> {
        let response = self.send(Method::GET, "/auth/status", None).await?;

        match response.status() {
            status if status.is_success() => {
                let body: StatusResponse = response.json().await?;
                let status = BackendStatus::from(body);
                debug!(is_authenticated = status.is_authenticated, "backend status");
                Ok(status)
            }
            StatusCode::UNAUTHORIZED => {
                debug!("backend status: 401");
                Ok(BackendStatus::unauthenticated())
            }
            _ => Err(Self::unexpected("/auth/status", response).await),
        }
    }

    /// Trade a refresh token for a new pair. A rejected refresh token is
    /// terminal; transport and 5xx failures are retryable.
    pub async fn refresh(&self, refresh_token: &str) -> AuthResult<TokenPair> {
        let body = serde_json::to_value(RefreshRequest { refresh_token })?;
        let response = self.send(Method::POST, "/auth/refresh", Some(body)).await?;

        match response.status() {
            status if status.is_success() => {
                let body: RefreshResponse = response.json().await?;
                info!("access token refreshed");
                Ok(TokenPair::new(body.access_token, body.refresh_token))
            }
            StatusCode::BAD_REQUEST | StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                let status = response.status();
                warn!(status = %status, "refresh token rejected");
                Err(AuthError::RefreshRejected(format!("backend returned {status}")))
            }
            _ => Err(Self::unexpected("/auth/refresh", response).await),
        }
    }
}

//! Shared fixtures for the engine's integration tests.

#![allow(dead_code)]

use auth_engine::coordinator::{self, CoordinatorHandle, CoordinatorOptions};
use auth_engine::{AuthContext, AuthSiteTabs, CoordinatorEvent, CoordinatorSnapshot, DomainConfig, NoAuthSiteTabs};
use chrono::Utc;
use extension_config_and_utils::{BackoffConfig, TimingConfig};
use extension_storage::{CookieStore, MemoryCookieStore, MemoryStorage, TokenCache};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use url::Url;
use wiremock::{MockServer, ResponseTemplate};

pub const AUTH_SITE: &str = "auth.example.test";
pub const LANDING: &str = "/";
pub const PROTECTED: &str = "/dashboard";

/// A backend mock, a cookie jar and a context wired to both.
pub struct Harness {
    pub server: MockServer,
    pub cookies: Arc<dyn CookieStore>,
    pub storage: Arc<MemoryStorage>,
    pub ctx: AuthContext,
}

impl Harness {
    pub async fn start() -> Self {
        Self::with(Arc::new(MemoryCookieStore::new()), Arc::new(NoAuthSiteTabs)).await
    }

    pub async fn with_tabs(tabs: Arc<dyn AuthSiteTabs>) -> Self {
        Self::with(Arc::new(MemoryCookieStore::new()), tabs).await
    }

    pub async fn with(cookies: Arc<dyn CookieStore>, tabs: Arc<dyn AuthSiteTabs>) -> Self {
        let server = MockServer::start().await;
        let backend_url = Url::parse(&server.uri()).unwrap();
        let domains = DomainConfig::new(backend_url.host_str().unwrap(), AUTH_SITE);
        let storage = Arc::new(MemoryStorage::new());
        let ctx = AuthContext::new(
            backend_url,
            domains,
            cookies.clone(),
            Box::new(storage.clone()),
            tabs,
        );
        Self {
            server,
            cookies,
            storage,
            ctx,
        }
    }

    pub fn backend_domain(&self) -> String {
        self.ctx.domains.backend_domain.clone()
    }

    pub fn spawn(&self) -> CoordinatorHandle {
        coordinator::spawn(self.ctx.clone(), fast_options())
    }

    /// Reads the same storage the context's cache writes.
    pub fn cache(&self) -> TokenCache {
        TokenCache::new(Box::new(self.storage.clone()))
    }

    pub async fn set_tokens(&self, domain: &str, access: Option<&str>, refresh: Option<&str>) {
        let now = Utc::now();
        if let Some(access) = access {
            self.cookies
                .set(self.ctx.domains.access_cookie(domain, access, now))
                .await
                .unwrap();
        }
        if let Some(refresh) = refresh {
            self.cookies
                .set(self.ctx.domains.refresh_cookie(domain, refresh, now))
                .await
                .unwrap();
        }
    }

    pub async fn set_backend_tokens(&self, access: Option<&str>, refresh: Option<&str>) {
        self.set_tokens(&self.backend_domain(), access, refresh).await;
    }

    pub async fn set_external_tokens(&self, access: Option<&str>, refresh: Option<&str>) {
        self.set_tokens(AUTH_SITE, access, refresh).await;
    }

    pub async fn cookie(&self, domain: &str, name: &str) -> Option<String> {
        self.cookies.get(domain, name).await.unwrap().map(|c| c.value)
    }

    pub async fn requests_to(&self, path: &str) -> usize {
        self.server
            .received_requests()
            .await
            .unwrap_or_default()
            .iter()
            .filter(|r| r.url.path() == path)
            .count()
    }
}

/// Millisecond timers so retries and polls finish quickly.
pub fn fast_options() -> CoordinatorOptions {
    CoordinatorOptions {
        landing_route: LANDING.to_string(),
        timing: TimingConfig {
            external_poll_interval_ms: 20,
            max_external_polls: 3,
            cookie_poll: BackoffConfig::new(3, 5, 20),
            status_retry: BackoffConfig::new(2, 5, 20),
            cycle_retry: BackoffConfig::new(2, 5, 20),
            bridge_poll_interval_ms: 10,
            session_check_interval_ms: 50,
        },
    }
}

pub fn status_ok(user_id: &str) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({
        "is_authenticated": true,
        "user_id": user_id,
        "user_name": "Ada Lovelace",
        "user_picture": null
    }))
}

pub fn status_negative() -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({ "is_authenticated": false }))
}

/// Wait for the next redirect request, skipping state changes.
pub async fn expect_redirect(events: &mut broadcast::Receiver<CoordinatorEvent>) {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match events.recv().await {
                Ok(CoordinatorEvent::RedirectToLanding) => return,
                Ok(_) => continue,
                Err(e) => panic!("event stream ended: {e}"),
            }
        }
    })
    .await
    .expect("no redirect to the landing route");
}

pub async fn wait_for(
    handle: &CoordinatorHandle,
    predicate: impl FnMut(&CoordinatorSnapshot) -> bool,
) -> CoordinatorSnapshot {
    let mut snapshots = handle.subscribe();
    let snapshot = tokio::time::timeout(Duration::from_secs(5), snapshots.wait_for(predicate))
        .await
        .expect("coordinator never reached the expected state")
        .expect("coordinator stopped")
        .clone();
    snapshot
}

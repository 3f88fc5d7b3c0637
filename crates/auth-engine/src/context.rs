//! Shared dependencies of the coordinator, the refresh proxy and the
//! background router.

use crate::backend_client::BackendAuthClient;
use crate::domain::DomainConfig;
use crate::external_source::{AuthSiteTabs, ExternalTokenSource};
use crate::refresh_proxy::TokenRefreshProxy;
use crate::transfer::{CookieTransfer, TransferLock};
use crate::AuthResult;
use extension_auth_protocol::MessageBus;
use extension_config_and_utils::Config;
use extension_storage::{CookieStore, KeyValueStorage, TokenCache};
use std::sync::Arc;
use url::Url;

/// Everything one extension instance shares between its contexts.
///
/// Cloning is cheap and keeps the same cookie jar, transfer lock and message
/// bus, so coordinators spawned from clones contend on one lock.
#[derive(Clone)]
pub struct AuthContext {
    pub cookies: Arc<dyn CookieStore>,
    pub domains: DomainConfig,
    pub backend: Arc<BackendAuthClient>,
    pub transfer: Arc<CookieTransfer>,
    pub external: Arc<ExternalTokenSource>,
    pub cache: Arc<TokenCache>,
    pub bus: MessageBus,
}

impl AuthContext {
    pub fn new(
        backend_url: Url,
        domains: DomainConfig,
        cookies: Arc<dyn CookieStore>,
        storage: Box<dyn KeyValueStorage>,
        tabs: Arc<dyn AuthSiteTabs>,
    ) -> Self {
        let backend = Arc::new(BackendAuthClient::new(backend_url, cookies.clone()));
        let transfer = Arc::new(CookieTransfer::new(
            cookies.clone(),
            domains.clone(),
            TransferLock::new(),
        ));
        let external = Arc::new(ExternalTokenSource::new(
            cookies.clone(),
            domains.clone(),
            tabs,
        ));

        Self {
            cookies,
            domains,
            backend,
            transfer,
            external,
            cache: Arc::new(TokenCache::new(storage)),
            bus: MessageBus::new(),
        }
    }

    pub fn from_config(
        config: &Config,
        cookies: Arc<dyn CookieStore>,
        storage: Box<dyn KeyValueStorage>,
        tabs: Arc<dyn AuthSiteTabs>,
    ) -> AuthResult<Self> {
        let domains = DomainConfig::from_config(config)?;
        Ok(Self::new(config.backend_url()?, domains, cookies, storage, tabs))
    }

    pub fn refresh_proxy(&self) -> TokenRefreshProxy {
        TokenRefreshProxy::new(self.clone())
    }
}

//! Subcommand implementations.

use crate::output::{self, OutputFormat};
use anyhow::{Context, Result};
use auth_engine::coordinator::{self, CoordinatorHandle, CoordinatorOptions};
use auth_engine::{
    AuthContext, AuthSiteTabs, BackgroundRouter, CookieNames, CoordinatorEvent, NoAuthSiteTabs,
    TokenPair, User,
};
use extension_config_and_utils::{Config, Paths};
use extension_storage::{
    FileCookieStore, JsonFileStorage, KeyValueStorage, StorageError, StorageResult,
};
use local_storage_bridge::{BridgeTabs, LocalStorageBridge};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info};
use url::Url;

/// Wire the engine to the cookie jar and extension storage under `paths`.
fn build_context(config: &Config, paths: &Paths, tabs: Arc<dyn AuthSiteTabs>) -> Result<AuthContext> {
    paths.ensure_dirs()?;
    let cookies = Arc::new(
        FileCookieStore::open(paths.cookies_file()).context("failed to open the cookie jar")?,
    );
    let storage = Box::new(
        JsonFileStorage::open(paths.storage_file()).context("failed to open extension storage")?,
    );
    Ok(AuthContext::from_config(config, cookies, storage, tabs)?)
}

fn spawn_coordinator(config: &Config, ctx: AuthContext) -> CoordinatorHandle {
    coordinator::spawn(ctx, CoordinatorOptions::from_config(config))
}

#[derive(Serialize)]
struct StatusReport {
    is_authenticated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    user: Option<User>,
    access_cookie: bool,
    refresh_cookie: bool,
}

/// Ask the backend about the stored session without changing anything.
pub async fn status(config: &Config, paths: &Paths, format: &OutputFormat) -> Result<()> {
    let ctx = build_context(config, paths, Arc::new(NoAuthSiteTabs))?;
    let backend = &ctx.domains.backend_domain;
    let access_cookie = ctx.cookies.get(backend, CookieNames::ACCESS_TOKEN).await?.is_some();
    let refresh_cookie = ctx.cookies.get(backend, CookieNames::REFRESH_TOKEN).await?.is_some();

    let status = ctx.backend.status().await?;
    let report = StatusReport {
        is_authenticated: status.is_authenticated,
        user: status.user,
        access_cookie,
        refresh_cookie,
    };

    output::print(&report, format, |report| {
        output::print_row("Backend", ctx.backend.base_url().as_str());
        output::print_row(
            "Session",
            if report.is_authenticated { "valid" } else { "none" },
        );
        if let Some(user) = &report.user {
            output::print_row("User", &user.id);
        }
        output::print_row("Access cookie", yes_no(report.access_cookie));
        output::print_row("Refresh cookie", yes_no(report.refresh_cookie));
    });
    Ok(())
}

fn yes_no(value: bool) -> &'static str {
    if value {
        "present"
    } else {
        "missing"
    }
}

/// Carry tokens into the backend session and wait for verification.
pub async fn sign_in(
    config: &Config,
    paths: &Paths,
    access_token: String,
    refresh_token: Option<String>,
    format: &OutputFormat,
) -> Result<()> {
    let ctx = build_context(config, paths, Arc::new(NoAuthSiteTabs))?;
    let handle = spawn_coordinator(config, ctx);

    let result = handle
        .sign_in(TokenPair::new(access_token, refresh_token))
        .await;
    handle.shutdown().await;

    let session = result?;
    output::print_session(&session, format);
    if !session.is_authenticated {
        anyhow::bail!("sign-in could not be verified");
    }
    Ok(())
}

/// Clear tokens everywhere and end the backend session.
pub async fn sign_out(config: &Config, paths: &Paths, format: &OutputFormat) -> Result<()> {
    let ctx = build_context(config, paths, Arc::new(NoAuthSiteTabs))?;
    let handle = spawn_coordinator(config, ctx);

    handle.sign_out().await;
    handle.shutdown().await;

    output::print_success("Signed out", format);
    Ok(())
}

/// Mount the coordinator and print every session change until Ctrl-C.
///
/// With `page_storage`, the file plays the local storage of one open
/// auth-site tab: its tokens are offered to discovery and edits to it wake
/// the coordinator.
pub async fn watch(
    config: &Config,
    paths: &Paths,
    route: Option<String>,
    page_storage: Option<PathBuf>,
    format: &OutputFormat,
) -> Result<()> {
    let tabs = Arc::new(BridgeTabs::default());
    let ctx = build_context(config, paths, tabs.clone())?;

    let (outbox, inbox) = mpsc::channel(16);
    let router = BackgroundRouter::new(tabs.clone(), ctx.bus.clone()).run(inbox);
    let page_watch = page_storage.map(|path| {
        info!(path = %path.display(), "attaching page storage");
        let page = LocalStorageBridge::new(Arc::new(PageFile::new(path)));
        tabs.open_tab(page.clone());
        page.watch(config.timing.bridge_poll_interval(), outbox.clone())
    });

    let handle = spawn_coordinator(config, ctx);
    let mut events = handle.events();
    let route = route.unwrap_or_else(|| config.landing_route.clone());
    let session = handle.mount(&route).await?;
    output::print_session(&session, format);

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(CoordinatorEvent::StateChanged(session)) => output::print_session(&session, format),
                Ok(CoordinatorEvent::RedirectToLanding) => {
                    output::print_success("Redirect to the landing route", format);
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(skipped, "session events lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted, shutting down");
                break;
            }
        }
    }

    if let Some(page_watch) = page_watch {
        page_watch.abort();
    }
    drop(outbox);
    router.abort();
    handle.shutdown().await;
    Ok(())
}

/// GET `target` with the current access token.
pub async fn fetch(config: &Config, paths: &Paths, target: &str, format: &OutputFormat) -> Result<()> {
    let ctx = build_context(config, paths, Arc::new(NoAuthSiteTabs))?;
    let url = match Url::parse(target) {
        Ok(url) => url,
        Err(_) => ctx.backend.base_url().join(target)?,
    };

    let proxy = ctx.refresh_proxy();
    let request = proxy.http_client().get(url.clone()).build()?;
    let response = proxy.fetch_with_auth(request).await?;
    let status = response.status().as_u16();
    let body = response.text().await?;

    #[derive(Serialize)]
    struct FetchReport {
        url: String,
        status: u16,
        body: String,
    }

    let report = FetchReport {
        url: url.to_string(),
        status,
        body,
    };
    output::print(&report, format, |report| {
        output::print_row("Status", &report.status.to_string());
        println!("{}", report.body);
    });
    Ok(())
}

/// A JSON object on disk read afresh on every access, so edits made by
/// another process show up on the next poll.
struct PageFile {
    path: PathBuf,
}

impl PageFile {
    fn new(path: PathBuf) -> Self {
        Self { path }
    }

    fn read(&self) -> StorageResult<BTreeMap<String, String>> {
        match std::fs::read_to_string(&self.path) {
            Ok(content) if content.trim().is_empty() => Ok(BTreeMap::new()),
            Ok(content) => Ok(serde_json::from_str(&content)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(StorageError::Io(e)),
        }
    }

    fn write(&self, data: &BTreeMap<String, String>) -> StorageResult<()> {
        std::fs::write(&self.path, serde_json::to_string_pretty(data)?)?;
        Ok(())
    }
}

impl KeyValueStorage for PageFile {
    fn set(&self, key: &str, value: &str) -> StorageResult<()> {
        let mut data = self.read()?;
        data.insert(key.to_string(), value.to_string());
        self.write(&data)
    }

    fn get(&self, key: &str) -> StorageResult<Option<String>> {
        Ok(self.read()?.remove(key))
    }

    fn delete(&self, key: &str) -> StorageResult<bool> {
        let mut data = self.read()?;
        let existed = data.remove(key).is_some();
        if existed {
            self.write(&data)?;
        }
        Ok(existed)
    }
}

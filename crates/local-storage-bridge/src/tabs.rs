//! Open auth-site tabs as seen from the background process.

use crate::page::LocalStorageBridge;
use async_trait::async_trait;
use auth_engine::{AuthResult, AuthSiteTabs};
use extension_auth_protocol::{ExtensionMessage, LocalStorageTokens, MessageReply};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tracing::{debug, warn};

/// How long a content script gets to answer before the tab is skipped.
pub const DEFAULT_REPLY_TIMEOUT: Duration = Duration::from_secs(2);

const REQUEST_QUEUE_CAPACITY: usize = 8;

/// One message to a content script, with the channel its reply goes back on.
#[derive(Debug)]
pub struct BridgeRequest {
    pub message: ExtensionMessage,
    pub reply: oneshot::Sender<Option<MessageReply>>,
}

struct OpenTab {
    page: LocalStorageBridge,
    /// `None` until a content script loads in the tab.
    content_script: Option<mpsc::Sender<BridgeRequest>>,
}

/// The auth-site tabs currently open, in the order they were opened.
///
/// Token requests go to content scripts first; when none answers, the page
/// storage of the first open tab is read directly, the way an injected
/// script would.
pub struct BridgeTabs {
    tabs: Mutex<Vec<OpenTab>>,
    reply_timeout: Duration,
}

impl BridgeTabs {
    pub fn new(reply_timeout: Duration) -> Self {
        Self {
            tabs: Mutex::new(Vec::new()),
            reply_timeout,
        }
    }

    /// Open a tab whose content script is loaded and serving requests.
    pub fn open_tab(&self, page: LocalStorageBridge) {
        let (sender, receiver) = mpsc::channel(REQUEST_QUEUE_CAPACITY);
        page.serve(receiver);
        self.push(OpenTab {
            page,
            content_script: Some(sender),
        });
    }

    /// Open a tab without a content script; only injection can read it.
    pub fn open_tab_without_script(&self, page: LocalStorageBridge) {
        self.push(OpenTab {
            page,
            content_script: None,
        });
    }

    /// Close every tab. Their content scripts stop once idle.
    pub fn close_all(&self) {
        self.lock().clear();
        debug!("closed all auth-site tabs");
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn push(&self, tab: OpenTab) {
        let scripted = tab.content_script.is_some();
        let mut tabs = self.lock();
        tabs.push(tab);
        debug!(open = tabs.len(), scripted, "auth-site tab opened");
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<OpenTab>> {
        self.tabs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn ask(&self, script: mpsc::Sender<BridgeRequest>) -> Option<MessageReply> {
        let (reply, answer) = oneshot::channel();
        let request = BridgeRequest {
            message: ExtensionMessage::GetTokensFromLocalStorage,
            reply,
        };
        if script.send(request).await.is_err() {
            debug!("content script is gone");
            return None;
        }
        match timeout(self.reply_timeout, answer).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => {
                debug!("content script dropped the request");
                None
            }
            Err(_) => {
                warn!(
                    timeout_ms = self.reply_timeout.as_millis() as u64,
                    "content script did not answer"
                );
                None
            }
        }
    }
}

impl Default for BridgeTabs {
    fn default() -> Self {
        Self::new(DEFAULT_REPLY_TIMEOUT)
    }
}

#[async_trait]
impl AuthSiteTabs for BridgeTabs {
    async fn request_tokens(&self) -> AuthResult<Option<LocalStorageTokens>> {
        let scripts: Vec<_> = self
            .lock()
            .iter()
            .filter_map(|tab| tab.content_script.clone())
            .collect();

        for script in scripts {
            if let Some(reply) = self.ask(script).await {
                return Ok(Some(reply.into_tokens()?));
            }
        }
        Ok(None)
    }

    async fn inject_and_read(&self) -> AuthResult<Option<LocalStorageTokens>> {
        let page = self.lock().first().map(|tab| tab.page.clone());
        Ok(page.map(|page| {
            debug!("reading auth-site storage through injection");
            page.read_tokens()
        }))
    }
}

//! The content script living in an auth-site page.

use crate::tabs::BridgeRequest;
use extension_auth_protocol::{ExtensionMessage, LocalStorageTokens, MessageReply};
use extension_storage::KeyValueStorage;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Local-storage keys the auth website writes after a login.
pub struct PageStorageKeys;

impl PageStorageKeys {
    pub const ACCESS_TOKEN: &'static str = "access_token";
    pub const REFRESH_TOKEN: &'static str = "refresh_token";
    pub const SESSION: &'static str = "session";
}

/// Exposes the page's local-storage tokens to the extension.
///
/// Read-only: the page's storage is never written, and tokens are not
/// mirrored into the page's cookies. The background coordinator owns every
/// cookie write.
#[derive(Clone)]
pub struct LocalStorageBridge {
    storage: Arc<dyn KeyValueStorage>,
}

impl LocalStorageBridge {
    pub fn new(storage: Arc<dyn KeyValueStorage>) -> Self {
        Self { storage }
    }

    /// Current token triple. Unreadable keys count as absent so a request
    /// is always answered.
    pub fn read_tokens(&self) -> LocalStorageTokens {
        LocalStorageTokens {
            access_token: self.item(PageStorageKeys::ACCESS_TOKEN),
            refresh_token: self.item(PageStorageKeys::REFRESH_TOKEN),
            session: self.item(PageStorageKeys::SESSION),
        }
    }

    fn item(&self, key: &str) -> Option<String> {
        match self.storage.get(key) {
            Ok(value) => value,
            Err(e) => {
                warn!(key, error = %e, "failed to read page storage");
                None
            }
        }
    }

    /// Answer a message from the extension. Only `getTokensFromLocalStorage`
    /// has a reply; the other actions are not addressed to the page.
    pub fn handle(&self, message: &ExtensionMessage) -> Option<MessageReply> {
        match message {
            ExtensionMessage::GetTokensFromLocalStorage => {
                let tokens = self.read_tokens();
                debug!(found = !tokens.is_empty(), "answering token request");
                Some(MessageReply::Tokens(tokens))
            }
            ExtensionMessage::AuthCompleted
            | ExtensionMessage::CheckAuthStatus
            | ExtensionMessage::AuthStateChanged
            | ExtensionMessage::AuthenticationFailed => None,
        }
    }

    /// Poll the access token every `interval` and send `authCompleted` to
    /// `outbox` whenever it changes to a non-empty value.
    ///
    /// A token already present on the first poll counts as a change, since
    /// it may have been written before the page script started. The task
    /// ends when `outbox` closes.
    pub fn watch(&self, interval: Duration, outbox: mpsc::Sender<ExtensionMessage>) -> JoinHandle<()> {
        let bridge = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut last_seen: Option<String> = None;

            loop {
                ticker.tick().await;
                if outbox.is_closed() {
                    break;
                }

                let current = bridge
                    .item(PageStorageKeys::ACCESS_TOKEN)
                    .filter(|token| !token.is_empty());
                if current == last_seen {
                    continue;
                }
                let changed_to_token = current.is_some();
                last_seen = current;

                if changed_to_token {
                    info!("new access token in page storage");
                    if outbox.send(ExtensionMessage::AuthCompleted).await.is_err() {
                        break;
                    }
                }
            }
            debug!("page storage watch stopped");
        })
    }

    /// Answer requests arriving on `requests` until every sender is gone.
    pub fn serve(&self, mut requests: mpsc::Receiver<BridgeRequest>) -> JoinHandle<()> {
        let bridge = self.clone();
        tokio::spawn(async move {
            while let Some(request) = requests.recv().await {
                let reply = bridge.handle(&request.message);
                if request.reply.send(reply).is_err() {
                    debug!(action = request.message.action(), "requester went away before the reply");
                }
            }
        })
    }
}

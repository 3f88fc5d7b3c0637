//! Background-process message dispatch.

use crate::external_source::AuthSiteTabs;
use crate::AuthResult;
use extension_auth_protocol::{ExtensionMessage, LocalStorageTokens, MessageBus, MessageReply};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Routes incoming cross-context messages. One arm per action, no
/// fallthrough: a new action does not compile until it is routed here.
#[derive(Clone)]
pub struct BackgroundRouter {
    tabs: Arc<dyn AuthSiteTabs>,
    bus: MessageBus,
}

impl BackgroundRouter {
    pub fn new(tabs: Arc<dyn AuthSiteTabs>, bus: MessageBus) -> Self {
        Self { tabs, bus }
    }

    /// Handle one message; `Some` is the reply the sender is waiting for.
    pub async fn handle(&self, message: ExtensionMessage) -> AuthResult<Option<MessageReply>> {
        debug!(action = message.action(), "background received message");
        match message {
            ExtensionMessage::GetTokensFromLocalStorage => {
                let tokens = self.tokens_from_auth_site().await;
                Ok(Some(MessageReply::Tokens(tokens)))
            }
            ExtensionMessage::AuthCompleted
            | ExtensionMessage::CheckAuthStatus
            | ExtensionMessage::AuthStateChanged => {
                self.bus.publish(message);
                Ok(None)
            }
            ExtensionMessage::AuthenticationFailed => {
                self.bus.publish(message);
                Ok(Some(MessageReply::received()))
            }
        }
    }

    /// JSON in, JSON out, as messages arrive from other contexts.
    pub async fn handle_json(&self, json: &str) -> AuthResult<Option<String>> {
        let message = ExtensionMessage::from_json(json)?;
        match self.handle(message).await? {
            Some(reply) => Ok(Some(reply.to_json()?)),
            None => Ok(None),
        }
    }

    /// Handle fire-and-forget messages until the sender side closes.
    pub fn run(self, mut inbox: mpsc::Receiver<ExtensionMessage>) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(message) = inbox.recv().await {
                if let Err(e) = self.handle(message).await {
                    warn!(action = message.action(), error = %e, "failed to handle message");
                }
            }
            debug!("background inbox closed");
        })
    }

    /// Ask an open tab; fall back to injection; answer with the empty
    /// triple when neither works. Tab failures are logged, never returned,
    /// so the requester always gets an answer.
    async fn tokens_from_auth_site(&self) -> LocalStorageTokens {
        match self.tabs.request_tokens().await {
            Ok(Some(tokens)) => return tokens,
            Ok(None) => {}
            Err(e) => warn!(error = %e, "auth site tab did not answer, injecting reader"),
        }
        match self.tabs.inject_and_read().await {
            Ok(tokens) => tokens.unwrap_or_else(LocalStorageTokens::empty),
            Err(e) => {
                warn!(error = %e, "injected reader failed, answering with no tokens");
                LocalStorageTokens::empty()
            }
        }
    }
}

//! Message and reply types.

use crate::{ProtocolError, ProtocolResult};
use serde::{Deserialize, Serialize};

/// Every message that crosses a context boundary. Dispatch on this is an
/// exhaustive `match`; adding an action breaks every handler until it is
/// taught the new case.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "camelCase")]
pub enum ExtensionMessage {
    /// Ask the auth site's page for its local-storage tokens.
    GetTokensFromLocalStorage,
    /// The page saw a new access token. Fire-and-forget, may repeat.
    AuthCompleted,
    /// Re-run the coordinator's check. No reply.
    CheckAuthStatus,
    /// Something about the session changed elsewhere. No reply.
    AuthStateChanged,
    /// The session is dead; the foreground must leave protected routes.
    AuthenticationFailed,
}

impl ExtensionMessage {
    pub const ALL: [ExtensionMessage; 5] = [
        ExtensionMessage::GetTokensFromLocalStorage,
        ExtensionMessage::AuthCompleted,
        ExtensionMessage::CheckAuthStatus,
        ExtensionMessage::AuthStateChanged,
        ExtensionMessage::AuthenticationFailed,
    ];

    /// Wire name of the action.
    pub fn action(&self) -> &'static str {
        match self {
            ExtensionMessage::GetTokensFromLocalStorage => "getTokensFromLocalStorage",
            ExtensionMessage::AuthCompleted => "authCompleted",
            ExtensionMessage::CheckAuthStatus => "checkAuthStatus",
            ExtensionMessage::AuthStateChanged => "authStateChanged",
            ExtensionMessage::AuthenticationFailed => "authenticationFailed",
        }
    }

    /// Whether the sender waits for a [`MessageReply`].
    pub fn expects_reply(&self) -> bool {
        match self {
            ExtensionMessage::GetTokensFromLocalStorage => true,
            ExtensionMessage::AuthenticationFailed => true,
            ExtensionMessage::AuthCompleted
            | ExtensionMessage::CheckAuthStatus
            | ExtensionMessage::AuthStateChanged => false,
        }
    }

    pub fn to_json(&self) -> ProtocolResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> ProtocolResult<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

/// The three well-known local-storage values on the auth site. All absent is
/// a valid answer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalStorageTokens {
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub session: Option<String>,
}

impl LocalStorageTokens {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Access token, ignoring empty strings.
    pub fn access_token(&self) -> Option<&str> {
        self.access_token.as_deref().filter(|t| !t.is_empty())
    }

    /// Refresh token, ignoring empty strings.
    pub fn refresh_token(&self) -> Option<&str> {
        self.refresh_token.as_deref().filter(|t| !t.is_empty())
    }

    pub fn is_empty(&self) -> bool {
        self.access_token().is_none()
    }
}

/// Reply to a message that expects one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageReply {
    /// Acknowledgement, `{"received": true}`.
    Received { received: bool },
    /// Answer to `getTokensFromLocalStorage`.
    Tokens(LocalStorageTokens),
}

impl MessageReply {
    pub fn received() -> Self {
        MessageReply::Received { received: true }
    }

    /// Unwrap a token answer, rejecting acknowledgements.
    pub fn into_tokens(self) -> ProtocolResult<LocalStorageTokens> {
        match self {
            MessageReply::Tokens(tokens) => Ok(tokens),
            MessageReply::Received { .. } => Err(ProtocolError::UnexpectedReply {
                action: ExtensionMessage::GetTokensFromLocalStorage.action(),
                detail: "got an acknowledgement instead of tokens".to_string(),
            }),
        }
    }

    pub fn to_json(&self) -> ProtocolResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> ProtocolResult<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

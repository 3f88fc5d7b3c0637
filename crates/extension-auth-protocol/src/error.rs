//! Protocol error types.

use thiserror::Error;

/// Protocol error type.
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A reply arrived that does not fit the request
    #[error("Unexpected reply to {action}: {detail}")]
    UnexpectedReply { action: &'static str, detail: String },

    /// The other side went away before answering
    #[error("Channel closed")]
    ChannelClosed,
}

/// Result type alias using ProtocolError.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

//! Cross-context message protocol for the auth sync extension.
//!
//! The page bridge, the background process and the foreground UI share no
//! memory; they talk only through JSON messages tagged by `action`.

mod bus;
mod error;
mod message;

pub use bus::MessageBus;
pub use error::{ProtocolError, ProtocolResult};
pub use message::{ExtensionMessage, LocalStorageTokens, MessageReply};

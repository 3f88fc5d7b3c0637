//! In-process fan-out of one-way messages.

use crate::ExtensionMessage;
use tokio::sync::broadcast;
use tracing::debug;

const BUS_CAPACITY: usize = 32;

/// Broadcast channel carrying fire-and-forget [`ExtensionMessage`]s between
/// contexts. Cloning yields another handle to the same bus.
#[derive(Debug, Clone)]
pub struct MessageBus {
    sender: broadcast::Sender<ExtensionMessage>,
}

impl MessageBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(BUS_CAPACITY);
        Self { sender }
    }

    /// Publish a message; returns how many listeners saw it.
    pub fn publish(&self, message: ExtensionMessage) -> usize {
        let delivered = self.sender.send(message).unwrap_or(0);
        debug!(action = message.action(), delivered, "published extension message");
        delivered
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ExtensionMessage> {
        self.sender.subscribe()
    }
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new()
    }
}

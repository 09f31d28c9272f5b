//! Event adapter for streaming protocol events to a consumer task
//!
//! Bridges the engine's synchronous [`EventSink`] to a tokio channel, so a
//! UI or notification task can follow instances as they run.

use cat_engine::{EventError, EventSink, ProtocolEvent};
use tokio::sync::mpsc;

/// Sink that forwards every event into an unbounded channel
#[derive(Debug, Clone)]
pub struct ChannelEventSink {
    sender: mpsc::UnboundedSender<ProtocolEvent>,
}

impl ChannelEventSink {
    /// Create a sink and the receiver that drains it
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ProtocolEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }

    /// Wrap an existing sender
    pub fn from_sender(sender: mpsc::UnboundedSender<ProtocolEvent>) -> Self {
        Self { sender }
    }
}

impl EventSink for ChannelEventSink {
    fn send(&self, event: ProtocolEvent) -> Result<(), EventError> {
        self.sender
            .send(event)
            .map_err(|_| EventError::channel_closed())
    }
}

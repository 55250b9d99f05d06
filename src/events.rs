//! Typed event bus between the connection manager and the UI layer.
//!
//! Emission never blocks: events go through a `tokio::sync::broadcast`
//! channel, a receiver that falls behind loses the oldest events and a bus
//! without receivers drops them.

use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::mqtt::message_manager::Message;

pub const EVENT_BUS_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq)]
pub enum AppEvent {
    /// User readable alert text
    Alert { text: String },
    ConnectionStatus { connected: bool },
    Message { message: Message },
}

#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<AppEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(EVENT_BUS_CAPACITY)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        EventBus { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AppEvent> {
        self.tx.subscribe()
    }

    pub fn alert(&self, text: impl Into<String>) {
        let text = text.into();
        info!("Alert: {}", text);
        self.emit(AppEvent::Alert { text });
    }

    pub fn connection_status(&self, connected: bool) {
        info!("Broker connection status: {}", connected);
        self.emit(AppEvent::ConnectionStatus { connected });
    }

    pub fn message(&self, message: Message) {
        info!("Message: {}", message);
        self.emit(AppEvent::Message { message });
    }

    fn emit(&self, event: AppEvent) {
        if self.tx.send(event).is_err() {
            debug!("No UI listener attached, event dropped");
        }
    }
}

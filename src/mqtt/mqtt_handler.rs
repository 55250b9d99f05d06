use chrono::{DateTime, Local};
use rumqttc::QoS;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::config::{BufferOptions, ConnectionConfig};
use super::error::MqttError;
use super::message_manager::{Message, OfflineBuffer, PendingPublish};
use super::transport::{Transport, TransportEvent};
use crate::events::EventBus;
use crate::notification::{NotificationPolicy, Notifier};

#[derive(Clone, Copy, Default, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Subscribed,
}

impl ConnectionState {
    pub fn is_connected(self) -> bool {
        matches!(self, ConnectionState::Connected | ConnectionState::Subscribed)
    }
}

/// Owns the broker session identity and turns transport events into UI
/// events.
///
/// All methods take `&mut self`; the owning actor is the single writer of the
/// connection state, readers get a [`watch::Receiver`] via
/// [`ConnectionManager::status`].
pub struct ConnectionManager {
    config: ConnectionConfig,
    transport: Box<dyn Transport>,
    bus: EventBus,
    policy: NotificationPolicy,
    notifier: Arc<dyn Notifier>,
    state: watch::Sender<ConnectionState>,
    offline_buffer: OfflineBuffer,
    subscription_acked: bool,
}

impl ConnectionManager {
    pub fn new(
        config: ConnectionConfig,
        transport: Box<dyn Transport>,
        bus: EventBus,
        policy: NotificationPolicy,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        ConnectionManager {
            config,
            transport,
            bus,
            policy,
            notifier,
            state,
            offline_buffer: OfflineBuffer::new(BufferOptions::disabled()),
            subscription_acked: false,
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn status(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    fn set_state(&self, next: ConnectionState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            debug!("Connection state {:?} -> {:?}", previous, next);
        }
    }

    /// Opens the broker session. Failures are alerted and returned; there is
    /// no local retry.
    pub fn start(&mut self) -> Result<(), MqttError> {
        info!("Connecting to {}", self.config.server_uri);
        self.set_state(ConnectionState::Connecting);
        if let Err(e) = self.transport.connect(&self.config) {
            error!("Exception while connecting: {}", e);
            self.set_state(ConnectionState::Disconnected);
            self.bus
                .alert(format!("Failed to connect to: {}", self.config.server_uri));
            return Err(e);
        }
        Ok(())
    }

    pub fn handle_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::ConnectComplete {
                reconnect,
                server_uri,
            } => self.on_connect_complete(reconnect, &server_uri),
            TransportEvent::ConnectFailed { cause } => self.on_connect_failed(&cause),
            TransportEvent::ConnectionLost { cause } => self.on_connection_lost(&cause),
            TransportEvent::SubscribeResult { topic, success } => {
                self.on_subscribe_result(&topic, success)
            }
            TransportEvent::Message { topic, payload } => {
                self.on_message(&topic, &payload, Local::now())
            }
        }
    }

    pub fn on_connect_complete(&mut self, reconnect: bool, server_uri: &str) {
        if reconnect {
            self.on_reconnected(server_uri);
        } else {
            self.on_connected(server_uri);
        }
    }

    pub fn on_connected(&mut self, server_uri: &str) {
        self.set_state(ConnectionState::Connected);
        self.bus.connection_status(true);
        self.bus.alert(format!("Connected to: {}", server_uri));

        self.offline_buffer.configure(self.config.buffer);
        self.flush_offline_buffer();

        let (topic, qos) = (self.config.topic.clone(), self.config.qos);
        self.subscribe(&topic, qos);
    }

    pub fn on_connect_failed(&mut self, cause: &str) {
        error!("Failed to connect: {}", cause);
        self.set_state(ConnectionState::Disconnected);
        self.bus
            .alert(format!("Failed to connect to: {}", self.config.server_uri));
    }

    pub fn on_reconnected(&mut self, server_uri: &str) {
        let next = if !self.config.clean_session && self.subscription_acked {
            ConnectionState::Subscribed
        } else {
            ConnectionState::Connected
        };
        self.set_state(next);
        self.bus.connection_status(true);
        self.bus.alert(format!("Reconnected to : {}", server_uri));

        self.flush_offline_buffer();

        if self.config.clean_session {
            // the broker dropped the subscription together with the session
            self.subscription_acked = false;
            let (topic, qos) = (self.config.topic.clone(), self.config.qos);
            self.subscribe(&topic, qos);
        }
    }

    pub fn on_connection_lost(&mut self, cause: &str) {
        warn!("Connection lost: {}", cause);
        self.bus.alert("The Connection was lost.");
        self.set_state(ConnectionState::Disconnected);
        self.bus.connection_status(false);
    }

    /// Requests delivery of `topic`. Inbound publishes end up in
    /// [`ConnectionManager::on_message`].
    pub fn subscribe(&mut self, topic: &str, qos: QoS) {
        info!("Subscribing to {} with {:?}", topic, qos);
        if let Err(e) = self.transport.subscribe(topic, qos) {
            error!("Exception while subscribing: {}", e);
            self.bus.alert(format!("Failed to subscribe to: {}", topic));
        }
    }

    pub fn on_subscribe_result(&mut self, topic: &str, success: bool) {
        if success {
            self.subscription_acked = true;
            if self.state().is_connected() {
                self.set_state(ConnectionState::Subscribed);
            }
            self.bus.alert(format!("Subscribed to: {}", topic));
        } else {
            self.bus.alert(format!("Failed to subscribe to: {}", topic));
        }
    }

    pub fn on_message(&mut self, topic: &str, payload: &[u8], timestamp: DateTime<Local>) {
        let message = Message::from_payload(payload, timestamp);
        info!("Received an MQTT message: {}", message.content);

        if let Some(notification) = self.policy.evaluate(&message, topic) {
            debug!("Created a system notification for {}", topic);
            self.notifier.notify(notification.id, notification);
        }

        self.bus.message(message);
    }

    /// Current connection status, re-broadcast for listeners that attached
    /// late.
    pub fn poll_status(&self) -> bool {
        info!("Checking status of service receiving MQTT messages");
        let connected = self.state().is_connected();
        self.bus.connection_status(connected);
        connected
    }

    /// Publishes right away while connected, otherwise parks the message in
    /// the offline buffer.
    pub fn publish(&mut self, topic: &str, payload: Vec<u8>) -> Result<(), MqttError> {
        let qos = self.config.qos;
        if self.state().is_connected() {
            return self.transport.publish(topic, qos, payload);
        }

        let evicted = self.offline_buffer.push(PendingPublish {
            topic: topic.to_string(),
            qos,
            payload,
        })?;
        if let Some(evicted) = evicted {
            warn!("Offline buffer full, dropped oldest message for {}", evicted.topic);
        }
        debug!(
            "Buffered message for {} ({} pending)",
            topic,
            self.offline_buffer.len()
        );
        Ok(())
    }

    fn flush_offline_buffer(&mut self) {
        if self.offline_buffer.is_empty() {
            return;
        }
        info!(
            "Sending {} buffered messages",
            self.offline_buffer.len()
        );
        let pending: Vec<PendingPublish> = self.offline_buffer.drain().collect();
        for publish in pending {
            if let Err(e) = self
                .transport
                .publish(&publish.topic, publish.qos, publish.payload)
            {
                error!("Failed to send buffered message to {}: {}", publish.topic, e);
            }
        }
    }

    /// Returns the task that finishes closing the broker session, if any.
    pub fn shutdown(&mut self) -> Option<JoinHandle<()>> {
        info!("Shutting down connection to {}", self.config.server_uri);
        let closing = self.transport.disconnect().unwrap_or_else(|e| {
            warn!("Disconnect failed: {}", e);
            None
        });
        self.set_state(ConnectionState::Disconnected);
        closing
    }
}

//! Broker transport seam.
//!
//! The manager issues commands through [`Transport`]; everything the broker
//! reports back (connect, loss, suback, publishes) arrives as a
//! [`TransportEvent`] on an mpsc channel. [`RumqttTransport`] implements the
//! seam on top of `rumqttc`, whose event loop runs in its own task.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS,
    SubscribeReasonCode,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::config::ConnectionConfig;
use super::error::MqttError;

/// Capacity of the rumqttc request queue.
const REQUEST_CAPACITY: usize = 100;
const INITIAL_RECONNECT_DELAY: Duration = Duration::from_secs(1);
const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(128);
const MIN_KEEP_ALIVE: Duration = Duration::from_secs(5);
/// How long the driver gets to send DISCONNECT before it is cancelled.
const DISCONNECT_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    ConnectComplete { reconnect: bool, server_uri: String },
    ConnectFailed { cause: String },
    ConnectionLost { cause: String },
    SubscribeResult { topic: String, success: bool },
    Message { topic: String, payload: Vec<u8> },
}

/// Commands understood by a broker transport.
///
/// Calls never wait on the network; outcomes come back as
/// [`TransportEvent`]s.
pub trait Transport: Send {
    fn connect(&mut self, config: &ConnectionConfig) -> Result<(), MqttError>;
    fn subscribe(&mut self, topic: &str, qos: QoS) -> Result<(), MqttError>;
    fn publish(&mut self, topic: &str, qos: QoS, payload: Vec<u8>) -> Result<(), MqttError>;
    /// Starts closing the session. The returned task, if any, finishes once
    /// the session is closed.
    fn disconnect(&mut self) -> Result<Option<JoinHandle<()>>, MqttError>;
}

pub struct RumqttTransport {
    events: mpsc::Sender<TransportEvent>,
    cancel: CancellationToken,
    client: Option<AsyncClient>,
    pending_subscriptions: Arc<Mutex<VecDeque<String>>>,
    driver: Option<JoinHandle<()>>,
}

impl RumqttTransport {
    pub fn new(events: mpsc::Sender<TransportEvent>, cancel: CancellationToken) -> Self {
        RumqttTransport {
            events,
            cancel,
            client: None,
            pending_subscriptions: Arc::new(Mutex::new(VecDeque::new())),
            driver: None,
        }
    }

    fn client(&self) -> Result<&AsyncClient, MqttError> {
        self.client.as_ref().ok_or(MqttError::NotConnected)
    }
}

pub fn build_options(config: &ConnectionConfig) -> Result<MqttOptions, MqttError> {
    let address = config.server_address()?;
    if config.client_id.trim().is_empty() {
        return Err(MqttError::InvalidClientId);
    }
    let mut options = MqttOptions::new(config.client_id.clone(), address.host, address.port);
    options
        .set_keep_alive(config.keep_alive.max(MIN_KEEP_ALIVE))
        .set_clean_session(config.clean_session);
    if address.tls {
        options.set_transport(rumqttc::Transport::tls_with_default_config());
    }
    Ok(options)
}

impl Transport for RumqttTransport {
    fn connect(&mut self, config: &ConnectionConfig) -> Result<(), MqttError> {
        if self.driver.is_some() {
            warn!("Transport already connected, ignoring connect");
            return Ok(());
        }

        let options = build_options(config)?;
        info!("Connecting to {}", config.server_uri);
        let (client, eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);

        let translator = EventTranslator::new(
            config.server_uri.clone(),
            config.automatic_reconnect,
            self.pending_subscriptions.clone(),
        );
        let events = self.events.clone();
        let cancel = self.cancel.child_token();
        self.driver = Some(tokio::spawn(async move {
            drive_event_loop(eventloop, translator, events, cancel).await;
        }));
        self.client = Some(client);
        Ok(())
    }

    fn subscribe(&mut self, topic: &str, qos: QoS) -> Result<(), MqttError> {
        let client = self.client()?.clone();
        push_pending(&self.pending_subscriptions, topic);
        if let Err(e) = client.try_subscribe(topic, qos) {
            pop_pending_back(&self.pending_subscriptions);
            return Err(e.into());
        }
        debug!("Subscribe request queued for {}", topic);
        Ok(())
    }

    fn publish(&mut self, topic: &str, qos: QoS, payload: Vec<u8>) -> Result<(), MqttError> {
        self.client()?.try_publish(topic, qos, false, payload)?;
        Ok(())
    }

    fn disconnect(&mut self) -> Result<Option<JoinHandle<()>>, MqttError> {
        let queued = match self.client.take() {
            Some(client) => client.try_disconnect().map_err(MqttError::from),
            None => Ok(()),
        };
        match (queued, self.driver.take()) {
            (Ok(()), Some(driver)) => {
                let cancel = self.cancel.clone();
                Ok(Some(tokio::spawn(close_session(driver, cancel))))
            }
            (queued, _) => {
                self.cancel.cancel();
                queued.map(|_| None)
            }
        }
    }
}

/// Waits for the driver to send DISCONNECT, then stops it.
async fn close_session(driver: JoinHandle<()>, cancel: CancellationToken) {
    match tokio::time::timeout(DISCONNECT_GRACE, driver).await {
        Ok(Ok(())) => debug!("Broker session closed"),
        Ok(Err(e)) => error!("Event loop task failed: {}", e),
        Err(_) => warn!(
            "DISCONNECT not sent within {:?}, dropping the connection",
            DISCONNECT_GRACE
        ),
    }
    cancel.cancel();
}

fn push_pending(pending: &Mutex<VecDeque<String>>, topic: &str) {
    match pending.lock() {
        Ok(mut queue) => queue.push_back(topic.to_string()),
        Err(e) => error!("Pending subscription queue poisoned: {}", e),
    }
}

fn pop_pending_back(pending: &Mutex<VecDeque<String>>) {
    if let Ok(mut queue) = pending.lock() {
        queue.pop_back();
    }
}

async fn drive_event_loop(
    mut eventloop: EventLoop,
    mut translator: EventTranslator,
    events: mpsc::Sender<TransportEvent>,
    cancel: CancellationToken,
) {
    let mut backoff = ReconnectBackoff::new();
    loop {
        let polled = tokio::select! {
            _ = cancel.cancelled() => break,
            polled = eventloop.poll() => polled,
        };

        let event = match polled {
            Ok(event) => {
                let translated = translator.on_event(event);
                if matches!(translated, Some(TransportEvent::ConnectComplete { .. })) {
                    backoff.reset();
                }
                translated
            }
            Err(e) => translator.on_error(e.to_string()),
        };

        if let Some(event) = event {
            if events.send(event).await.is_err() {
                debug!("Transport event receiver dropped, stopping event loop");
                break;
            }
        }

        if translator.is_closed() {
            debug!("DISCONNECT sent, stopping event loop");
            break;
        }

        if translator.is_down() {
            if !translator.should_retry() {
                info!("Event loop stopped, no automatic reconnect");
                break;
            }
            let delay = backoff.next_delay();
            debug!("Reconnecting in {:?}", delay);
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

/// Pause before the next reconnect attempt: doubles per failed attempt up to
/// a cap and starts over after every ConnAck.
#[derive(Debug)]
struct ReconnectBackoff {
    next: Duration,
}

impl ReconnectBackoff {
    fn new() -> Self {
        ReconnectBackoff {
            next: INITIAL_RECONNECT_DELAY,
        }
    }

    fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = (self.next * 2).min(MAX_RECONNECT_DELAY);
        delay
    }

    fn reset(&mut self) {
        self.next = INITIAL_RECONNECT_DELAY;
    }
}

/// Turns raw rumqttc events into [`TransportEvent`]s and tracks what is
/// needed for that: whether the session was ever up and which packet id
/// belongs to which subscribed topic.
struct EventTranslator {
    server_uri: String,
    automatic_reconnect: bool,
    ever_connected: bool,
    connected: bool,
    down: bool,
    closed: bool,
    pending_subscriptions: Arc<Mutex<VecDeque<String>>>,
    subscriptions_in_flight: HashMap<u16, String>,
}

impl EventTranslator {
    fn new(
        server_uri: String,
        automatic_reconnect: bool,
        pending_subscriptions: Arc<Mutex<VecDeque<String>>>,
    ) -> Self {
        EventTranslator {
            server_uri,
            automatic_reconnect,
            ever_connected: false,
            connected: false,
            down: false,
            closed: false,
            pending_subscriptions,
            subscriptions_in_flight: HashMap::new(),
        }
    }

    fn on_event(&mut self, event: Event) -> Option<TransportEvent> {
        self.down = false;
        match event {
            Event::Incoming(Packet::ConnAck(ack)) => {
                if ack.code != ConnectReturnCode::Success {
                    return self.on_error(format!("connection refused: {:?}", ack.code));
                }
                let reconnect = self.ever_connected;
                self.ever_connected = true;
                self.connected = true;
                Some(TransportEvent::ConnectComplete {
                    reconnect,
                    server_uri: self.server_uri.clone(),
                })
            }
            Event::Outgoing(Outgoing::Subscribe(pkid)) => {
                let topic = self
                    .pending_subscriptions
                    .lock()
                    .ok()
                    .and_then(|mut queue| queue.pop_front());
                match topic {
                    Some(topic) => {
                        self.subscriptions_in_flight.insert(pkid, topic);
                    }
                    None => warn!("Subscribe packet {} without a pending topic", pkid),
                }
                None
            }
            Event::Incoming(Packet::SubAck(ack)) => {
                let topic = self.subscriptions_in_flight.remove(&ack.pkid)?;
                let success = !ack.return_codes.is_empty()
                    && ack
                        .return_codes
                        .iter()
                        .all(|code| matches!(code, SubscribeReasonCode::Success(_)));
                Some(TransportEvent::SubscribeResult { topic, success })
            }
            Event::Incoming(Packet::Publish(publish)) => Some(TransportEvent::Message {
                topic: publish.topic,
                payload: publish.payload.to_vec(),
            }),
            Event::Outgoing(Outgoing::Disconnect) => {
                self.closed = true;
                self.connected = false;
                None
            }
            _ => None,
        }
    }

    fn on_error(&mut self, cause: String) -> Option<TransportEvent> {
        self.down = true;
        if self.connected {
            self.connected = false;
            self.subscriptions_in_flight.clear();
            warn!("Connection lost: {}", cause);
            Some(TransportEvent::ConnectionLost { cause })
        } else if !self.ever_connected {
            error!("Failed to connect: {}", cause);
            Some(TransportEvent::ConnectFailed { cause })
        } else {
            debug!("Reconnect attempt failed: {}", cause);
            None
        }
    }

    fn is_down(&self) -> bool {
        self.down
    }

    fn is_closed(&self) -> bool {
        self.closed
    }

    /// A session that never came up is not retried.
    fn should_retry(&self) -> bool {
        self.automatic_reconnect && self.ever_connected
    }
}

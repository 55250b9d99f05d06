//! Message service with statum lifecycle
//!
//! Runs a [`ConnectionManager`] as a single actor task. The actor owns the
//! manager, so every state change happens on that task; the rest of the
//! application talks to it through a cloneable [`ServiceHandle`].
//!
//! # State Machine
//!
//! ```text
//! Created ──► Running ──► Stopped
//! ```

use statum::{machine, state};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::error::MqttError;
use super::mqtt_handler::{ConnectionManager, ConnectionState};
use super::transport::TransportEvent;
use crate::events::{AppEvent, EventBus};

const COMMAND_CAPACITY: usize = 32;

#[state]
#[derive(Debug, Clone)]
pub enum ServiceState {
    Created,
    Running,
    Stopped,
}

#[derive(Debug)]
pub enum ServiceCommand {
    PollStatus {
        response_tx: oneshot::Sender<bool>,
    },
    Publish {
        topic: String,
        payload: Vec<u8>,
        response_tx: oneshot::Sender<Result<(), MqttError>>,
    },
}

/// Cheap handle for the UI layer.
#[derive(Clone)]
pub struct ServiceHandle {
    commands: mpsc::Sender<ServiceCommand>,
    status: watch::Receiver<ConnectionState>,
    bus: EventBus,
}

impl ServiceHandle {
    pub fn events(&self) -> broadcast::Receiver<AppEvent> {
        self.bus.subscribe()
    }

    /// Last known status without going through the actor.
    pub fn is_connected(&self) -> bool {
        self.status.borrow().is_connected()
    }

    pub fn state(&self) -> ConnectionState {
        *self.status.borrow()
    }

    /// Asks the actor for the status; it is also re-broadcast as a
    /// `ConnectionStatus` event.
    pub async fn poll_status(&self) -> Result<bool, MqttError> {
        let (response_tx, response_rx) = oneshot::channel();
        self.send(ServiceCommand::PollStatus { response_tx }).await?;
        response_rx.await.map_err(|_| MqttError::ServiceStopped)
    }

    pub async fn publish(
        &self,
        topic: impl Into<String>,
        payload: Vec<u8>,
    ) -> Result<(), MqttError> {
        let (response_tx, response_rx) = oneshot::channel();
        self.send(ServiceCommand::Publish {
            topic: topic.into(),
            payload,
            response_tx,
        })
        .await?;
        response_rx.await.map_err(|_| MqttError::ServiceStopped)?
    }

    async fn send(&self, command: ServiceCommand) -> Result<(), MqttError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| MqttError::ServiceStopped)
    }
}

#[machine]
pub struct MessageService<S: ServiceState> {
    name: String,
    manager: Option<ConnectionManager>,
    transport_events: Option<mpsc::Receiver<TransportEvent>>,
    commands: Option<mpsc::Receiver<ServiceCommand>>,
    handle: ServiceHandle,
    cancel: CancellationToken,
    worker: Option<JoinHandle<()>>,
}

impl<S: ServiceState> MessageService<S> {
    pub fn get_name(&self) -> &str {
        &self.name
    }

    pub fn handle(&self) -> ServiceHandle {
        self.handle.clone()
    }
}

impl MessageService<Created> {
    pub fn create(
        name: impl Into<String>,
        manager: ConnectionManager,
        transport_events: mpsc::Receiver<TransportEvent>,
        cancel: CancellationToken,
    ) -> Self {
        let name = name.into();
        info!("Creating service to retrieve MQTT messages: {}", name);
        let (command_tx, command_rx) = mpsc::channel(COMMAND_CAPACITY);
        let handle = ServiceHandle {
            commands: command_tx,
            status: manager.status(),
            bus: manager.bus().clone(),
        };

        Self::new(
            name,
            Some(manager),
            Some(transport_events),
            Some(command_rx),
            handle,
            cancel,
            None, // worker
        )
    }

    /// Spawns the actor. The manager connects from inside the actor task.
    pub fn start(mut self) -> Result<MessageService<Running>, MqttError> {
        let manager = self
            .manager
            .take()
            .ok_or_else(|| MqttError::ChannelError("manager already taken".to_string()))?;
        let transport_events = self
            .transport_events
            .take()
            .ok_or_else(|| MqttError::ChannelError("transport channel already taken".to_string()))?;
        let commands = self
            .commands
            .take()
            .ok_or_else(|| MqttError::ChannelError("command channel already taken".to_string()))?;

        let cancel = self.cancel.clone();
        self.worker = Some(tokio::spawn(async move {
            run_actor(manager, transport_events, commands, cancel).await;
        }));

        info!("Finished creating service to retrieve MQTT messages");
        Ok(self.transition())
    }
}

impl MessageService<Running> {
    pub fn is_finished(&self) -> bool {
        self.worker.as_ref().map_or(true, |w| w.is_finished())
    }

    /// Cancels the actor, which disconnects from the broker before exiting.
    pub async fn stop(mut self) -> MessageService<Stopped> {
        info!("Stopping message service: {}", self.name);
        self.cancel.cancel();
        if let Some(worker) = self.worker.take() {
            if let Err(e) = worker.await {
                error!("Message service task failed: {}", e);
            }
        }
        self.transition()
    }
}

impl MessageService<Stopped> {
    pub fn is_finished(&self) -> bool {
        true
    }
}

async fn run_actor(
    mut manager: ConnectionManager,
    mut transport_events: mpsc::Receiver<TransportEvent>,
    mut commands: mpsc::Receiver<ServiceCommand>,
    cancel: CancellationToken,
) {
    if let Err(e) = manager.start() {
        // no retry: the service stays up so status polls keep working
        warn!("Running without broker session: {}", e);
    }

    loop {
        tokio::select! {
            // broker events are handled before commands queued after them
            biased;
            _ = cancel.cancelled() => {
                debug!("Message service cancelled");
                break;
            }
            Some(event) = transport_events.recv() => manager.handle_event(event),
            Some(command) = commands.recv() => match command {
                ServiceCommand::PollStatus { response_tx } => {
                    if response_tx.send(manager.poll_status()).is_err() {
                        warn!("Status requester went away");
                    }
                }
                ServiceCommand::Publish { topic, payload, response_tx } => {
                    if response_tx.send(manager.publish(&topic, payload)).is_err() {
                        warn!("Publish requester went away");
                    }
                }
            },
        }
    }

    if let Some(closing) = manager.shutdown() {
        if let Err(e) = closing.await {
            error!("Closing the broker session failed: {}", e);
        }
    }
    info!("Message service stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mqtt::config::ConnectionConfig;
    use crate::mqtt::transport::testing::{Call, RecordingTransport};
    use crate::notification::{
        AppVisibility, NotificationPolicy, NotificationSettings, NotificationSlot,
    };
    use std::sync::Arc;
    use std::time::Duration;

    const URI: &str = "tcp://broker.local:1883";

    fn service(
        transport: RecordingTransport,
    ) -> (MessageService<Created>, mpsc::Sender<TransportEvent>) {
        let (_settings_tx, settings_rx) = watch::channel(NotificationSettings::default());
        let manager = ConnectionManager::new(
            ConnectionConfig::new(URI, "client-1", "rad/alerts"),
            Box::new(transport),
            EventBus::new(64),
            NotificationPolicy::new(settings_rx, AppVisibility::default()),
            Arc::new(NotificationSlot::default()),
        );
        let (transport_tx, transport_rx) = mpsc::channel(16);
        let service =
            MessageService::create("test", manager, transport_rx, CancellationToken::new());
        (service, transport_tx)
    }

    async fn next_event(events: &mut broadcast::Receiver<AppEvent>) -> AppEvent {
        tokio::time::timeout(Duration::from_secs(1), events.recv())
            .await
            .expect("event timeout")
            .expect("bus closed")
    }

    #[tokio::test]
    async fn drives_connect_flow_through_channels() {
        let transport = RecordingTransport::default();
        let (service, transport_tx) = service(transport.clone());
        let handle = service.handle();
        let mut events = handle.events();
        let service = service.start().unwrap();

        transport_tx
            .send(TransportEvent::ConnectComplete {
                reconnect: false,
                server_uri: URI.to_string(),
            })
            .await
            .unwrap();

        assert_eq!(
            next_event(&mut events).await,
            AppEvent::ConnectionStatus { connected: true }
        );
        assert_eq!(
            next_event(&mut events).await,
            AppEvent::Alert {
                text: "Connected to: tcp://broker.local:1883".to_string()
            }
        );
        assert!(handle.poll_status().await.unwrap());
        assert!(handle.is_connected());

        transport_tx
            .send(TransportEvent::Message {
                topic: "rad/alerts".to_string(),
                payload: b"hello".to_vec(),
            })
            .await
            .unwrap();
        // the poll above re-broadcast the status first
        assert_eq!(
            next_event(&mut events).await,
            AppEvent::ConnectionStatus { connected: true }
        );
        assert!(matches!(
            next_event(&mut events).await,
            AppEvent::Message { message } if message.content == "hello"
        ));

        let stopped = service.stop().await;
        assert!(stopped.is_finished());
        assert_eq!(transport.calls().first(), Some(&Call::Connect(URI.to_string())));
        assert_eq!(transport.calls().last(), Some(&Call::Disconnect));
        assert!(matches!(
            handle.poll_status().await,
            Err(MqttError::ServiceStopped)
        ));
    }

    #[tokio::test]
    async fn publish_goes_through_actor() {
        let transport = RecordingTransport::default();
        let (service, transport_tx) = service(transport.clone());
        let handle = service.handle();
        let service = service.start().unwrap();

        assert!(matches!(
            handle.publish("out", b"early".to_vec()).await,
            Err(MqttError::NotConnected)
        ));

        transport_tx
            .send(TransportEvent::ConnectComplete {
                reconnect: false,
                server_uri: URI.to_string(),
            })
            .await
            .unwrap();
        // poll_status is processed after the queued connect event
        assert!(handle.poll_status().await.unwrap());
        handle.publish("out", b"now".to_vec()).await.unwrap();

        assert!(transport
            .calls()
            .contains(&Call::Publish("out".to_string(), b"now".to_vec())));
        service.stop().await;
    }

    #[tokio::test]
    async fn failed_start_keeps_service_alive() {
        let transport = RecordingTransport {
            fail_connect: true,
            ..Default::default()
        };
        let (service, _transport_tx) = service(transport);
        let handle = service.handle();
        let mut events = handle.events();
        let service = service.start().unwrap();

        assert_eq!(
            next_event(&mut events).await,
            AppEvent::Alert {
                text: "Failed to connect to: tcp://broker.local:1883".to_string()
            }
        );
        assert!(!handle.poll_status().await.unwrap());
        assert!(!service.is_finished());
        service.stop().await;
    }
}

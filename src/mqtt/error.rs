//! Error definitions for the MQTT module

use thiserror::Error;

/// Errors raised by the connection manager and its transport
#[derive(Debug, Error)]
pub enum MqttError {
    /// Server URI could not be split into scheme, host and port
    #[error("Invalid server URI: {0}")]
    InvalidServerUri(String),

    /// Broker sessions need a non-empty client id
    #[error("Client id must not be empty")]
    InvalidClientId,

    /// QoS outside of 0..=2
    #[error("Invalid QoS level: {0}")]
    InvalidQos(u8),

    /// The rumqttc request queue refused the request
    #[error("Client error: {0}")]
    Client(#[from] rumqttc::ClientError),

    /// Operation needs a live broker connection and the buffer is not available
    #[error("Not connected to broker")]
    NotConnected,

    /// Offline buffer reached its capacity and rejects new messages
    #[error("Offline buffer full ({0} messages)")]
    BufferFull(usize),

    /// Error while talking over an internal channel
    #[error("Channel error: {0}")]
    ChannelError(String),

    /// The service actor is no longer running
    #[error("Message service stopped")]
    ServiceStopped,
}

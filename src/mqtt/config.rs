use std::time::Duration;

use rumqttc::QoS;

use super::error::MqttError;

pub const DEFAULT_QOS: u8 = 1;
pub const DEFAULT_CLEAN_SESSION: bool = false;
pub const DEFAULT_AUTOMATIC_RECONNECT: bool = true;
pub const DEFAULT_KEEP_ALIVE_SECS: u64 = 60;
pub const OFFLINE_BUFFER_SIZE: usize = 100;

const DEFAULT_TCP_PORT: u16 = 1883;
const DEFAULT_TLS_PORT: u16 = 8883;

/// Everything needed to open one broker session.
///
/// Built once by the settings store and handed to the manager; it does not
/// change while the session lives.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionConfig {
    pub server_uri: String,
    pub client_id: String,
    pub topic: String,
    pub qos: QoS,
    pub clean_session: bool,
    pub automatic_reconnect: bool,
    pub keep_alive: Duration,
    pub buffer: BufferOptions,
}

impl ConnectionConfig {
    pub fn new(
        server_uri: impl Into<String>,
        client_id: impl Into<String>,
        topic: impl Into<String>,
    ) -> Self {
        ConnectionConfig {
            server_uri: server_uri.into(),
            client_id: client_id.into(),
            topic: topic.into(),
            qos: QoS::AtLeastOnce,
            clean_session: DEFAULT_CLEAN_SESSION,
            automatic_reconnect: DEFAULT_AUTOMATIC_RECONNECT,
            keep_alive: Duration::from_secs(DEFAULT_KEEP_ALIVE_SECS),
            buffer: BufferOptions::after_connect(),
        }
    }

    pub fn server_address(&self) -> Result<ServerAddress, MqttError> {
        ServerAddress::parse(&self.server_uri)
    }
}

/// Offline buffer settings applied once the first connect succeeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferOptions {
    pub enabled: bool,
    pub size: usize,
    /// Buffered messages are memory only when false
    pub persist: bool,
    /// Evict the oldest message on overflow instead of rejecting the new one
    pub delete_oldest: bool,
}

impl BufferOptions {
    pub fn after_connect() -> Self {
        BufferOptions {
            enabled: true,
            size: OFFLINE_BUFFER_SIZE,
            persist: false,
            delete_oldest: false,
        }
    }

    pub fn disabled() -> Self {
        BufferOptions {
            enabled: false,
            ..Self::after_connect()
        }
    }
}

/// Broker endpoint extracted from a `scheme://host:port` URI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerAddress {
    pub host: String,
    pub port: u16,
    pub tls: bool,
}

impl ServerAddress {
    /// Accepts `tcp://`, `mqtt://`, `ssl://`, `mqtts://` or a bare `host[:port]`.
    pub fn parse(uri: &str) -> Result<Self, MqttError> {
        let uri = uri.trim();
        let (tls, rest) = match uri.split_once("://") {
            Some((scheme, rest)) => match scheme.to_ascii_lowercase().as_str() {
                "tcp" | "mqtt" => (false, rest),
                "ssl" | "tls" | "mqtts" => (true, rest),
                _ => return Err(MqttError::InvalidServerUri(uri.to_string())),
            },
            None => (false, uri),
        };

        let rest = rest.trim_end_matches('/');
        let (host, port) = match rest.rsplit_once(':') {
            Some((host, port)) => {
                let port = port
                    .parse::<u16>()
                    .map_err(|_| MqttError::InvalidServerUri(uri.to_string()))?;
                (host, port)
            }
            None if tls => (rest, DEFAULT_TLS_PORT),
            None => (rest, DEFAULT_TCP_PORT),
        };

        if host.is_empty() || host.contains('/') {
            return Err(MqttError::InvalidServerUri(uri.to_string()));
        }

        Ok(ServerAddress {
            host: host.to_string(),
            port,
            tls,
        })
    }
}

pub fn qos_from_level(level: u8) -> Result<QoS, MqttError> {
    match level {
        0 => Ok(QoS::AtMostOnce),
        1 => Ok(QoS::AtLeastOnce),
        2 => Ok(QoS::ExactlyOnce),
        other => Err(MqttError::InvalidQos(other)),
    }
}

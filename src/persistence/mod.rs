//! # Persistence Module
//!
//! Settings that survive restarts: the broker connection identity and the
//! notification preferences. Everything is stored in one TOML file and every
//! field falls back to a default, so a missing or partial file still yields a
//! usable configuration.
//!
//! The client id is the one value written back by the service itself: it is
//! generated on first start and reused from then on, so the broker sees the
//! same client across restarts.

pub mod settings_store;

use crate::mqtt::config::{
    qos_from_level, ConnectionConfig, DEFAULT_AUTOMATIC_RECONNECT, DEFAULT_CLEAN_SESSION,
    DEFAULT_KEEP_ALIVE_SECS, DEFAULT_QOS,
};
use crate::notification::NotificationSettings;
use color_eyre::eyre::{eyre, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const DEFAULT_SERVER_URI: &str = "tcp://localhost:1883";
pub const DEFAULT_TOPIC: &str = "mqttdemo/messages";

/// Persisted connection settings.
///
/// `client_id` stays `None` until the store generates one.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct ConnectionSettings {
    pub server_uri: String,
    pub client_id: Option<String>,
    pub topic: String,
    pub qos: u8,
    pub clean_session: bool,
    pub automatic_reconnect: bool,
    pub keep_alive_secs: u64,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        ConnectionSettings {
            server_uri: DEFAULT_SERVER_URI.to_string(),
            client_id: None,
            topic: DEFAULT_TOPIC.to_string(),
            qos: DEFAULT_QOS,
            clean_session: DEFAULT_CLEAN_SESSION,
            automatic_reconnect: DEFAULT_AUTOMATIC_RECONNECT,
            keep_alive_secs: DEFAULT_KEEP_ALIVE_SECS,
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(default)]
pub struct Settings {
    pub connection: ConnectionSettings,
    pub notifications: NotificationSettings,
}

impl Settings {
    /// Builds the session config; fails while no client id has been assigned.
    pub fn connection_config(&self) -> Result<ConnectionConfig> {
        let connection = &self.connection;
        let client_id = connection
            .client_id
            .clone()
            .ok_or_else(|| eyre!("No client id assigned yet"))?;
        let qos = qos_from_level(connection.qos)
            .map_err(|e| eyre!("Invalid connection settings: {}", e))?;

        let mut config =
            ConnectionConfig::new(connection.server_uri.clone(), client_id, connection.topic.clone());
        config.qos = qos;
        config.clean_session = connection.clean_session;
        config.automatic_reconnect = connection.automatic_reconnect;
        config.keep_alive = Duration::from_secs(connection.keep_alive_secs);
        Ok(config)
    }
}

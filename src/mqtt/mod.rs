//! # MQTT Integration Module
//!
//! Subscribes to one broker topic and forwards what happens on the session
//! to the UI layer: connection status changes, user readable alerts, and the
//! inbound messages themselves.
//!
//! ## Module Architecture
//!
//! ```text
//! mqtt/
//! ├── config.rs           - Connection settings, buffer options, URI parsing
//! ├── error.rs            - Error type shared by the module
//! ├── message_manager.rs  - Inbound message model and offline publish buffer
//! ├── mqtt_handler.rs     - ConnectionManager state machine
//! ├── service.rs          - Actor task and handle around the manager
//! └── transport.rs        - Transport seam and the rumqttc adapter
//! ```
//!
//! ## Data Flow
//!
//! ```text
//! rumqttc EventLoop ──► TransportEvent ──► ConnectionManager ──► EventBus ──► UI
//!                                                 │
//!                                                 └──► NotificationPolicy ──► Notifier
//! ```
//!
//! Session management proper (keep-alive, QoS handshakes, reconnecting the
//! socket) stays inside `rumqttc`. The manager adds no retry of its own: a
//! failed connect or subscribe is reported as an alert and left as is.

pub mod config;
pub mod error;
pub mod message_manager;
pub mod mqtt_handler;
pub mod service;
pub mod transport;

//! MQTT message service for a mobile client.
//!
//! The binary in `main.rs` wires these modules into a headless console
//! client; a UI layer uses the same API: it reads [`events::AppEvent`]s,
//! flips [`notification::AppVisibility`] on focus changes and talks to the
//! running service through [`mqtt::service::ServiceHandle`].

pub mod events;
pub mod mqtt;
pub mod notification;
pub mod persistence;

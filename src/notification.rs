//! # Notification Policy
//!
//! Decides whether an inbound message also surfaces a system notification on
//! top of the in-app message event. A notification is only built while the app
//! is in the background and notifications are enabled in the settings. The
//! settings are read from a `watch` channel on every message so changes made
//! in the UI apply to the next message without restarting the service.
//!
//! All notifications share one id, so the notifier keeps at most one of them
//! and a new message replaces an unread one.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::mqtt::message_manager::Message;

pub const ALERT_NOTIFICATION_ID: u32 = 1;
pub const VIBRATE_PATTERN: [u64; 4] = [0, 200, 200, 300];

const NOTIFICATION_TITLE: &str = "New message";
const NOTIFICATION_TICKER: &str = "New MQTT message received";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationSettings {
    pub enabled: bool,
    pub vibrate: bool,
    /// Sound URI, platform default sound when unset
    pub ringtone: Option<String>,
}

impl Default for NotificationSettings {
    fn default() -> Self {
        NotificationSettings {
            enabled: true,
            vibrate: true,
            ringtone: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TapAction {
    /// Bring the message list to the front
    OpenMessages,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub id: u32,
    pub title: String,
    pub subtitle: String,
    pub ticker: String,
    pub body: String,
    pub number: u32,
    pub auto_cancel: bool,
    pub tap_action: TapAction,
    pub sound: Option<String>,
    pub vibration: Option<Vec<u64>>,
}

/// Foreground flag shared between the UI layer and the manager.
#[derive(Debug, Clone, Default)]
pub struct AppVisibility {
    foreground: Arc<AtomicBool>,
}

impl AppVisibility {
    pub fn set_foreground(&self, foreground: bool) {
        self.foreground.store(foreground, Ordering::Release);
    }

    pub fn is_foreground(&self) -> bool {
        self.foreground.load(Ordering::Acquire)
    }
}

/// Sink for system notifications.
pub trait Notifier: Send + Sync {
    fn notify(&self, id: u32, notification: Notification);
}

/// Keeps the latest notification; a new one replaces the previous.
#[derive(Debug, Default)]
pub struct NotificationSlot {
    current: Mutex<Option<Notification>>,
}

impl NotificationSlot {
    pub fn current(&self) -> Option<Notification> {
        match self.current.lock() {
            Ok(guard) => guard.clone(),
            Err(e) => {
                warn!("Notification slot poisoned: {}", e);
                None
            }
        }
    }
}

impl Notifier for NotificationSlot {
    fn notify(&self, id: u32, notification: Notification) {
        info!(
            "Notification {}: {} ({}) - {}",
            id, notification.title, notification.subtitle, notification.body
        );
        match self.current.lock() {
            Ok(mut guard) => {
                if guard.is_some() {
                    debug!("Replacing unread notification {}", id);
                }
                *guard = Some(notification);
            }
            Err(e) => warn!("Notification slot poisoned: {}", e),
        }
    }
}

pub struct NotificationPolicy {
    settings: watch::Receiver<NotificationSettings>,
    visibility: AppVisibility,
}

impl NotificationPolicy {
    pub fn new(settings: watch::Receiver<NotificationSettings>, visibility: AppVisibility) -> Self {
        NotificationPolicy {
            settings,
            visibility,
        }
    }

    /// Returns the notification to show for `message`, if any.
    pub fn evaluate(&self, message: &Message, topic: &str) -> Option<Notification> {
        if self.visibility.is_foreground() {
            debug!("App in foreground, skipping system notification");
            return None;
        }

        let settings = self.settings.borrow().clone();
        if !settings.enabled {
            debug!("Notifications disabled");
            return None;
        }

        Some(Notification {
            id: ALERT_NOTIFICATION_ID,
            title: NOTIFICATION_TITLE.to_string(),
            subtitle: format!("Topic: {}", topic),
            ticker: NOTIFICATION_TICKER.to_string(),
            body: message.content.clone(),
            number: 1,
            auto_cancel: true,
            tap_action: TapAction::OpenMessages,
            sound: settings.ringtone,
            vibration: settings.vibrate.then(|| VIBRATE_PATTERN.to_vec()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Local;

    fn policy(settings: NotificationSettings, foreground: bool) -> NotificationPolicy {
        let (_tx, rx) = watch::channel(settings);
        let visibility = AppVisibility::default();
        visibility.set_foreground(foreground);
        NotificationPolicy::new(rx, visibility)
    }

    fn message() -> Message {
        Message::new("door opened", Local::now())
    }

    #[test]
    fn foreground_suppresses_notification() {
        let policy = policy(NotificationSettings::default(), true);
        assert!(policy.evaluate(&message(), "home/door").is_none());
    }

    #[test]
    fn disabled_setting_suppresses_notification() {
        let settings = NotificationSettings {
            enabled: false,
            ..Default::default()
        };
        assert!(policy(settings, false).evaluate(&message(), "home/door").is_none());
    }

    #[test]
    fn vibrate_without_ringtone() {
        let notification = policy(NotificationSettings::default(), false)
            .evaluate(&message(), "home/door")
            .unwrap();
        assert_eq!(notification.id, ALERT_NOTIFICATION_ID);
        assert_eq!(notification.body, "door opened");
        assert_eq!(notification.subtitle, "Topic: home/door");
        assert_eq!(notification.vibration, Some(vec![0, 200, 200, 300]));
        assert_eq!(notification.sound, None);
        assert!(notification.auto_cancel);
    }

    #[test]
    fn ringtone_without_vibration() {
        let settings = NotificationSettings {
            enabled: true,
            vibrate: false,
            ringtone: Some("file:///sounds/chime.ogg".to_string()),
        };
        let notification = policy(settings, false)
            .evaluate(&message(), "home/door")
            .unwrap();
        assert_eq!(notification.sound.as_deref(), Some("file:///sounds/chime.ogg"));
        assert!(notification.vibration.is_none());
    }

    #[test]
    fn settings_changes_apply_to_next_message() {
        let (tx, rx) = watch::channel(NotificationSettings::default());
        let policy = NotificationPolicy::new(rx, AppVisibility::default());
        assert!(policy.evaluate(&message(), "t").is_some());

        tx.send_modify(|s| s.enabled = false);
        assert!(policy.evaluate(&message(), "t").is_none());
    }

    #[test]
    fn slot_keeps_only_latest() {
        let slot = NotificationSlot::default();
        let policy = policy(NotificationSettings::default(), false);
        for body in ["first", "second"] {
            let msg = Message::new(body, Local::now());
            slot.notify(ALERT_NOTIFICATION_ID, policy.evaluate(&msg, "t").unwrap());
        }
        assert_eq!(slot.current().unwrap().body, "second");
    }

    #[test]
    fn slot_ignores_notification_id() {
        let slot = NotificationSlot::default();
        let policy = policy(NotificationSettings::default(), false);
        let first = policy.evaluate(&Message::new("first", Local::now()), "t").unwrap();
        let second = policy.evaluate(&Message::new("second", Local::now()), "t").unwrap();

        slot.notify(ALERT_NOTIFICATION_ID, first);
        slot.notify(ALERT_NOTIFICATION_ID + 1, second);
        assert_eq!(slot.current().unwrap().body, "second");
    }
}

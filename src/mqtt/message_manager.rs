use std::collections::VecDeque;
use std::fmt;

use chrono::{DateTime, Local};
use rumqttc::QoS;
use serde::{Deserialize, Serialize};

use super::config::BufferOptions;
use super::error::MqttError;

const PREVIEW_CHARS: usize = 10;

/// Inbound message handed to the UI layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub timestamp: DateTime<Local>,
    pub content: String,
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let preview: String = self.content.chars().take(PREVIEW_CHARS).collect();
        write!(f, "{} - {}", self.timestamp.format("%Y-%m-%d %H:%M:%S"), preview)
    }
}

impl Message {
    pub fn new(content: impl Into<String>, timestamp: DateTime<Local>) -> Self {
        Message {
            timestamp,
            content: content.into(),
        }
    }

    /// Payloads are decoded as UTF-8; invalid sequences become U+FFFD.
    pub fn from_payload(payload: &[u8], timestamp: DateTime<Local>) -> Self {
        Message::new(String::from_utf8_lossy(payload), timestamp)
    }
}

/// Outbound publish waiting for a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingPublish {
    pub topic: String,
    pub qos: QoS,
    pub payload: Vec<u8>,
}

/// Memory-only queue for publishes issued while the broker is unreachable.
#[derive(Debug)]
pub struct OfflineBuffer {
    options: BufferOptions,
    queue: VecDeque<PendingPublish>,
}

impl OfflineBuffer {
    pub fn new(options: BufferOptions) -> Self {
        OfflineBuffer {
            options,
            queue: VecDeque::new(),
        }
    }

    pub fn configure(&mut self, options: BufferOptions) {
        self.options = options;
        if !options.enabled {
            self.queue.clear();
        }
        while self.queue.len() > options.size {
            self.queue.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Returns the evicted entry when the buffer drops its oldest message to
    /// make room.
    pub fn push(&mut self, publish: PendingPublish) -> Result<Option<PendingPublish>, MqttError> {
        if !self.options.enabled {
            return Err(MqttError::NotConnected);
        }

        if self.queue.len() < self.options.size {
            self.queue.push_back(publish);
            return Ok(None);
        }

        if !self.options.delete_oldest || self.options.size == 0 {
            return Err(MqttError::BufferFull(self.options.size));
        }

        let evicted = self.queue.pop_front();
        self.queue.push_back(publish);
        Ok(evicted)
    }

    pub fn drain(&mut self) -> impl Iterator<Item = PendingPublish> + '_ {
        self.queue.drain(..)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn publish(n: usize) -> PendingPublish {
        PendingPublish {
            topic: "out".to_string(),
            qos: QoS::AtLeastOnce,
            payload: n.to_string().into_bytes(),
        }
    }

    #[test]
    fn display_shows_short_preview_without_panicking() {
        let msg = Message::new("hi", Local::now());
        assert!(msg.to_string().ends_with(" - hi"));

        let long = Message::new("0123456789abcdef", Local::now());
        assert!(long.to_string().ends_with(" - 0123456789"));
    }

    #[test]
    fn payload_is_decoded_lossily() {
        let msg = Message::from_payload(&[b'o', b'k', 0xff], Local::now());
        assert_eq!(msg.content, "ok\u{fffd}");
    }

    #[test]
    fn disabled_buffer_refuses_messages() {
        let mut buffer = OfflineBuffer::new(BufferOptions::disabled());
        assert!(matches!(buffer.push(publish(0)), Err(MqttError::NotConnected)));
        assert!(buffer.is_empty());
    }

    #[test]
    fn full_buffer_rejects_newest() {
        let mut buffer = OfflineBuffer::new(BufferOptions::after_connect());
        for n in 0..100 {
            buffer.push(publish(n)).unwrap();
        }
        assert!(matches!(buffer.push(publish(100)), Err(MqttError::BufferFull(100))));
        assert_eq!(buffer.len(), 100);

        let first = buffer.drain().next().unwrap();
        assert_eq!(first.payload, b"0".to_vec());
    }

    #[test]
    fn delete_oldest_evicts_head() {
        let mut buffer = OfflineBuffer::new(BufferOptions {
            size: 2,
            delete_oldest: true,
            ..BufferOptions::after_connect()
        });
        buffer.push(publish(1)).unwrap();
        buffer.push(publish(2)).unwrap();
        let evicted = buffer.push(publish(3)).unwrap();
        assert_eq!(evicted, Some(publish(1)));

        let remaining: Vec<_> = buffer.drain().map(|p| p.payload).collect();
        assert_eq!(remaining, vec![b"2".to_vec(), b"3".to_vec()]);
        assert!(buffer.is_empty());
    }
}

//! Wire-level message types shared by the transport, the broker and the consumers.

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;

/// Header carrying the explicit retry counter of a dead-lettered message.
pub const RETRY_COUNT_HEADER: &str = "x-retry-count";

pub type Headers = BTreeMap<String, Value>;

/// Metadata travelling with every payload.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageProperties {
    pub message_id: String,
    pub timestamp: DateTime<Utc>,
    pub persistent: bool,
    pub headers: Headers,
}

impl MessageProperties {
    /// Reads [`RETRY_COUNT_HEADER`], defaulting to 0 when absent or not a number.
    pub fn retry_count(&self) -> u32 {
        self.headers
            .get(RETRY_COUNT_HEADER)
            .and_then(Value::as_u64)
            .map(|n| n.min(u32::MAX as u64) as u32)
            .unwrap_or(0)
    }
}

/// Options accepted by [`QueueTransport::publish`](super::QueueTransport::publish).
#[derive(Debug, Clone, PartialEq)]
pub struct PublishOptions {
    pub persistent: bool,
    pub message_id: Option<String>,
    pub timestamp: Option<DateTime<Utc>>,
    pub headers: Headers,
}

impl Default for PublishOptions {
    fn default() -> Self {
        Self {
            persistent: true,
            message_id: None,
            timestamp: None,
            headers: Headers::new(),
        }
    }
}

impl PublishOptions {
    pub fn message_id(mut self, id: impl Into<String>) -> Self {
        self.message_id = Some(id.into());
        self
    }

    pub fn timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn retry_count(mut self, count: u32) -> Self {
        self.headers
            .insert(RETRY_COUNT_HEADER.to_string(), Value::from(count));
        self
    }

    /// Resolves defaults: an empty message id and the current time.
    pub fn into_properties(self) -> MessageProperties {
        MessageProperties {
            message_id: self.message_id.unwrap_or_default(),
            timestamp: self.timestamp.unwrap_or_else(Utc::now),
            persistent: self.persistent,
            headers: self.headers,
        }
    }
}

/// Options accepted by [`QueueTransport::consume`](super::QueueTransport::consume).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsumeOptions {
    /// Maximum unacknowledged deliveries held by this consumer. `0` means unbounded.
    pub prefetch: usize,
    /// Deliveries are settled by the broker on dispatch.
    pub no_ack: bool,
}

impl Default for ConsumeOptions {
    fn default() -> Self {
        Self {
            prefetch: 0,
            no_ack: false,
        }
    }
}

impl ConsumeOptions {
    pub fn prefetch(prefetch: usize) -> Self {
        Self {
            prefetch,
            no_ack: false,
        }
    }
}

/// Declaration arguments for a queue.
///
/// Only the default exchange exists, so a dead-letter routing key names the target
/// queue directly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueOptions {
    /// Recorded only; the in-process broker keeps every queue in memory.
    pub durable: bool,
    pub dead_letter_exchange: Option<String>,
    pub dead_letter_routing_key: Option<String>,
    pub message_ttl: Option<Duration>,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            durable: true,
            dead_letter_exchange: None,
            dead_letter_routing_key: None,
            message_ttl: None,
        }
    }
}

impl QueueOptions {
    pub fn durable() -> Self {
        Self::default()
    }

    /// Rejected or expired messages are routed to `queue` through the default exchange.
    pub fn dead_letter_to(mut self, queue: impl Into<String>) -> Self {
        self.dead_letter_exchange = Some(String::new());
        self.dead_letter_routing_key = Some(queue.into());
        self
    }

    pub fn message_ttl(mut self, ttl: Duration) -> Self {
        self.message_ttl = Some(ttl);
        self
    }

    /// Queue that rejected or expired messages should be routed to, if any.
    pub fn dead_letter_target(&self) -> Option<&str> {
        self.dead_letter_exchange.as_ref()?;
        self.dead_letter_routing_key.as_deref()
    }
}

/// A message handed to a consumer.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub queue: String,
    pub payload: Vec<u8>,
    pub properties: MessageProperties,
    /// Set when the message was requeued after an earlier delivery.
    pub redelivered: bool,
}

impl Delivery {
    /// Builds a delivery outside of a broker, mostly for handler tests.
    pub fn new(queue: impl Into<String>, payload: Vec<u8>, properties: MessageProperties) -> Self {
        Self {
            delivery_tag: 0,
            queue: queue.into(),
            payload,
            properties,
            redelivered: false,
        }
    }

    pub fn message_id(&self) -> &str {
        &self.properties.message_id
    }

    pub fn retry_count(&self) -> u32 {
        self.properties.retry_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_count_defaults_to_zero() {
        let props = PublishOptions::default().into_properties();
        assert_eq!(props.retry_count(), 0);
        assert!(props.persistent);

        let props = PublishOptions::default().retry_count(2).into_properties();
        assert_eq!(props.retry_count(), 2);
    }

    #[test]
    fn test_dead_letter_target_requires_exchange() {
        let options = QueueOptions::durable().dead_letter_to("orders.dlq");
        assert_eq!(options.dead_letter_target(), Some("orders.dlq"));

        let options = QueueOptions {
            dead_letter_routing_key: Some("orders.dlq".into()),
            ..QueueOptions::default()
        };
        assert_eq!(options.dead_letter_target(), None);
    }
}

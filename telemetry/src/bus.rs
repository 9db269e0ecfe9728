//! Topic bus abstractions shared by the gateway (publisher side) and the
//! rule engine (consumer side).
//!
//! Names follow topic-exchange conventions: events are published to the
//! [`EXCHANGE`] under a per-device routing key (`device.<id>`), and consumers
//! bind a durable queue with a wildcard pattern such as [`DEVICE_BINDING`].

use crate::errors::Result;
use async_trait::async_trait;

/// Exchange every telemetry event is published to.
pub const EXCHANGE: &str = "iot.msg";

/// Durable queue the rule engine consumes from.
pub const RULES_QUEUE: &str = "iot.rules";

/// Binding pattern covering every device routing key.
pub const DEVICE_BINDING: &str = "device.*";

/// Routing key for a device's events.
pub fn routing_key(device_id: &str) -> String {
    format!("device.{}", device_id)
}

/// Topic-exchange pattern matching on dot-separated words.
///
/// `*` matches exactly one word and `#` matches zero or more words.
pub fn topic_matches(pattern: &str, key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = key.split('.').collect();
    match_words(&pattern, &key)
}

fn match_words(pattern: &[&str], key: &[&str]) -> bool {
    match (pattern.first(), key.first()) {
        (None, None) => true,
        (Some(&"#"), _) => {
            match_words(&pattern[1..], key) || (!key.is_empty() && match_words(pattern, &key[1..]))
        }
        (Some(&"*"), Some(_)) => match_words(&pattern[1..], &key[1..]),
        (Some(p), Some(k)) if p == k => match_words(&pattern[1..], &key[1..]),
        _ => false,
    }
}

/// Publishing side of the bus.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish `body` to the exchange with durable delivery.
    async fn publish(&self, routing_key: &str, body: Vec<u8>) -> Result<()>;
}

/// Consuming side of the bus: a stream of deliveries from a durable queue.
#[async_trait]
pub trait Subscription: Send {
    /// Wait for the next delivery. `None` once the subscription is closed.
    async fn next(&mut self) -> Option<Delivery>;
}

/// Settles a single delivery with the transport.
#[async_trait]
pub trait Acknowledge: Send {
    async fn ack(self: Box<Self>) -> Result<()>;
}

/// A message handed to a consumer that must be acknowledged.
///
/// Until [`Delivery::ack`] succeeds the transport is free to redeliver it.
pub struct Delivery {
    pub routing_key: String,
    pub body: Vec<u8>,
    pub redelivered: bool,
    acker: Box<dyn Acknowledge>,
}

impl Delivery {
    pub fn new(
        routing_key: String,
        body: Vec<u8>,
        redelivered: bool,
        acker: Box<dyn Acknowledge>,
    ) -> Self {
        Self {
            routing_key,
            body,
            redelivered,
            acker,
        }
    }

    /// Confirm processing so the transport drops the message.
    pub async fn ack(self) -> Result<()> {
        self.acker.ack().await
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("routing_key", &self.routing_key)
            .field("body_len", &self.body.len())
            .field("redelivered", &self.redelivered)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_routing_key() {
        assert_eq!(routing_key("42"), "device.42");
    }

    #[test]
    fn test_star_matches_one_word() {
        assert!(topic_matches(DEVICE_BINDING, "device.42"));
        assert!(!topic_matches(DEVICE_BINDING, "device"));
        assert!(!topic_matches(DEVICE_BINDING, "device.a.b"));
        assert!(!topic_matches(DEVICE_BINDING, "sensor.42"));
    }

    #[test]
    fn test_hash_matches_any_suffix() {
        assert!(topic_matches("device.#", "device"));
        assert!(topic_matches("device.#", "device.42"));
        assert!(topic_matches("device.#", "device.a.b"));
        assert!(topic_matches("#", "anything.at.all"));
        assert!(topic_matches("#.42", "device.42"));
        assert!(!topic_matches("#.42", "device.43"));
    }

    #[test]
    fn test_exact_key() {
        assert!(topic_matches("device.42", "device.42"));
        assert!(!topic_matches("device.42", "device.420"));
    }
}

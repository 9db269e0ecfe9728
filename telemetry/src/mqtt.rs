//! Bus transport over an MQTT broker.
//!
//! The exchange becomes the first topic level and each routing-key word a
//! further level, so `device.42` on `iot.msg` is published to
//! `iot.msg/device/42` and the `device.*` binding subscribes to
//! `iot.msg/device/+`. Characters MQTT reserves (`/`, `+`, `#`) are
//! percent-escaped inside each word, as is `%` itself, so a device id such as
//! `site/7` stays a single level. The consumer's persistent session (fixed
//! client id, `clean_session = false`) plays the role of the durable queue.

use crate::bus::{Acknowledge, Delivery, EventPublisher, Subscription};
use crate::errors::{Error, Result};
use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, Publish, QoS};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

const KEEP_ALIVE_SECS: u64 = 30;
const REQUEST_CAPACITY: usize = 10000;
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Publishes allowed to wait for a broker PUBACK before `publish` blocks.
/// Matches rumqttc's default inflight window.
pub const MAX_UNCONFIRMED: usize = 100;

const ESCAPES: [(char, &str); 4] = [('%', "%25"), ('/', "%2F"), ('+', "%2B"), ('#', "%23")];

fn escape_word(word: &str) -> String {
    let mut out = String::with_capacity(word.len());
    for c in word.chars() {
        match ESCAPES.iter().find(|(reserved, _)| *reserved == c) {
            Some((_, escaped)) => out.push_str(escaped),
            None => out.push(c),
        }
    }
    out
}

fn unescape_word(level: &str) -> String {
    let mut out = String::with_capacity(level.len());
    let mut rest = level;
    while let Some(pos) = rest.find('%') {
        out.push_str(&rest[..pos]);
        rest = &rest[pos..];
        match ESCAPES.iter().find(|(_, escaped)| rest.starts_with(escaped)) {
            Some((reserved, escaped)) => {
                out.push(*reserved);
                rest = &rest[escaped.len()..];
            }
            None => {
                out.push('%');
                rest = &rest[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

/// Topic a routing key is published to.
pub fn topic_for(exchange: &str, routing_key: &str) -> String {
    let levels: Vec<String> = routing_key.split('.').map(escape_word).collect();
    format!("{}/{}", exchange, levels.join("/"))
}

/// Subscription filter equivalent to a topic-exchange binding pattern.
pub fn filter_for(exchange: &str, binding: &str) -> String {
    let levels: Vec<String> = binding
        .split('.')
        .map(|word| match word {
            "*" => "+".to_string(),
            "#" => "#".to_string(),
            word => escape_word(word),
        })
        .collect();
    format!("{}/{}", exchange, levels.join("/"))
}

/// Routing key carried by a topic, if the topic belongs to `exchange`.
pub fn routing_key_of(exchange: &str, topic: &str) -> Option<String> {
    let rest = topic.strip_prefix(exchange)?.strip_prefix('/')?;
    let words: Vec<String> = rest.split('/').map(unescape_word).collect();
    Some(words.join("."))
}

pub struct MqttPublisher {
    client: AsyncClient,
    exchange: String,
    unconfirmed: Arc<Semaphore>,
}

impl MqttPublisher {
    /// Create a publisher and spawn the task driving its connection.
    pub fn connect(
        broker: &str,
        port: u16,
        client_id: &str,
        exchange: &str,
    ) -> (Self, JoinHandle<()>) {
        info!("Connecting publisher to MQTT broker at {}:{}", broker, port);

        let mut mqtt_options = MqttOptions::new(client_id, broker, port);
        mqtt_options.set_keep_alive(Duration::from_secs(KEEP_ALIVE_SECS));
        mqtt_options.set_clean_session(true);

        let (client, eventloop) = AsyncClient::new(mqtt_options, REQUEST_CAPACITY);
        let unconfirmed = Arc::new(Semaphore::new(MAX_UNCONFIRMED));
        let handle = tokio::spawn(drive(eventloop, unconfirmed.clone()));

        (
            Self {
                client,
                exchange: exchange.to_string(),
                unconfirmed,
            },
            handle,
        )
    }
}

#[async_trait]
impl EventPublisher for MqttPublisher {
    /// Waits while [`MAX_UNCONFIRMED`] publishes lack a PUBACK, so a broker
    /// outage surfaces as a blocked call rather than an unbounded backlog.
    async fn publish(&self, routing_key: &str, body: Vec<u8>) -> Result<()> {
        let topic = topic_for(&self.exchange, routing_key);
        let permit = self
            .unconfirmed
            .acquire()
            .await
            .map_err(|_| Error::Bus("publisher closed".to_string()))?;
        self.client
            .publish(topic, QoS::AtLeastOnce, false, body)
            .await
            .map_err(Error::Mqtt)?;
        // released by the event loop on PUBACK
        permit.forget();
        Ok(())
    }
}

async fn drive(mut eventloop: EventLoop, unconfirmed: Arc<Semaphore>) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::PubAck(_))) => {
                if unconfirmed.available_permits() < MAX_UNCONFIRMED {
                    unconfirmed.add_permits(1);
                }
            }
            Ok(_) => {}
            Err(e) => {
                error!("MQTT eventloop error: {}", e);
                // rumqttc reconnects on the next poll
                tokio::time::sleep(RECONNECT_DELAY).await;
            }
        }
    }
}

pub struct MqttSubscription {
    rx: mpsc::Receiver<Delivery>,
    poller: JoinHandle<()>,
}

impl MqttSubscription {
    /// Join the durable session named `queue` and subscribe it to `binding`.
    ///
    /// At most `prefetch` deliveries are buffered ahead of the consumer; once
    /// the buffer is full the event loop stops reading from the broker.
    pub async fn connect(
        broker: &str,
        port: u16,
        queue: &str,
        exchange: &str,
        binding: &str,
        prefetch: usize,
    ) -> Result<Self> {
        info!("Connecting consumer {} to MQTT broker at {}:{}", queue, broker, port);

        let mut mqtt_options = MqttOptions::new(queue, broker, port);
        mqtt_options.set_keep_alive(Duration::from_secs(KEEP_ALIVE_SECS));
        mqtt_options.set_clean_session(false);
        mqtt_options.set_manual_acks(true);

        let (client, mut eventloop) = AsyncClient::new(mqtt_options, REQUEST_CAPACITY);

        let filter = filter_for(exchange, binding);
        client
            .subscribe(&filter, QoS::AtLeastOnce)
            .await
            .map_err(Error::Mqtt)?;
        info!("Subscribed to {} with QoS 1", filter);

        let (tx, rx) = mpsc::channel(prefetch.max(1));
        let exchange = exchange.to_string();
        let poller = tokio::spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        debug!(
                            "Received message on topic {}, size: {} bytes",
                            publish.topic,
                            publish.payload.len()
                        );
                        let routing_key = routing_key_of(&exchange, &publish.topic)
                            .unwrap_or_else(|| publish.topic.clone());
                        let delivery = Delivery::new(
                            routing_key,
                            publish.payload.to_vec(),
                            publish.dup,
                            Box::new(MqttAck {
                                client: client.clone(),
                                publish,
                            }),
                        );
                        if tx.send(delivery).await.is_err() {
                            info!("Consumer dropped, stopping MQTT event loop");
                            break;
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        error!("MQTT error: {}", e);
                        tokio::time::sleep(RECONNECT_DELAY).await;
                    }
                }
            }
        });

        Ok(Self { rx, poller })
    }
}

#[async_trait]
impl Subscription for MqttSubscription {
    async fn next(&mut self) -> Option<Delivery> {
        self.rx.recv().await
    }
}

impl Drop for MqttSubscription {
    fn drop(&mut self) {
        self.poller.abort();
    }
}

struct MqttAck {
    client: AsyncClient,
    publish: Publish,
}

#[async_trait]
impl Acknowledge for MqttAck {
    async fn ack(self: Box<Self>) -> Result<()> {
        self.client.ack(&self.publish).await.map_err(Error::Mqtt)
    }
}

//! In-process bus with topic-exchange routing, durable queues, bounded
//! prefetch and redelivery of unacknowledged messages.
//!
//! Used by tests and single-process setups in place of the broker.

use crate::bus::{topic_matches, Acknowledge, Delivery, EventPublisher, Subscription};
use crate::errors::{Error, Result};
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender, WeakUnboundedSender};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

struct Message {
    routing_key: String,
    body: Vec<u8>,
    redelivered: bool,
}

struct Queue {
    name: String,
    binding: String,
    tx: Option<UnboundedSender<Message>>,
    rx: Option<UnboundedReceiver<Message>>,
}

#[derive(Default)]
struct Inner {
    queues: Vec<Queue>,
    published: Vec<(String, Vec<u8>)>,
    fail_publish: bool,
    closed: bool,
}

#[derive(Clone, Default)]
pub struct MemoryBus {
    inner: Arc<Mutex<Inner>>,
    acks: Arc<AtomicUsize>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Declare a durable queue bound with `binding`. Messages published
    /// afterwards are buffered there until consumed. Re-declaring is a no-op.
    pub fn bind(&self, queue: &str, binding: &str) {
        let mut inner = self.lock();
        if inner.queues.iter().any(|q| q.name == queue) {
            return;
        }
        let (tx, rx) = mpsc::unbounded_channel();
        inner.queues.push(Queue {
            name: queue.to_string(),
            binding: binding.to_string(),
            tx: Some(tx),
            rx: Some(rx),
        });
    }

    /// Attach the single consumer of `queue`, allowing at most `prefetch`
    /// unacknowledged deliveries at a time.
    pub fn subscribe(&self, queue: &str, prefetch: usize) -> Result<MemorySubscription> {
        let mut inner = self.lock();
        let q = inner
            .queues
            .iter_mut()
            .find(|q| q.name == queue)
            .ok_or_else(|| Error::Bus(format!("queue {} is not declared", queue)))?;
        let rx = q
            .rx
            .take()
            .ok_or_else(|| Error::Bus(format!("queue {} already has a consumer", queue)))?;
        let requeue = q.tx.as_ref().map(UnboundedSender::downgrade);

        Ok(MemorySubscription {
            rx,
            requeue,
            permits: Arc::new(Semaphore::new(prefetch.max(1))),
            acks: self.acks.clone(),
        })
    }

    /// Make every following publish fail until reset.
    pub fn set_fail_publish(&self, fail: bool) {
        self.lock().fail_publish = fail;
    }

    /// Every accepted publish, in order.
    pub fn published(&self) -> Vec<(String, Vec<u8>)> {
        self.lock().published.clone()
    }

    /// Number of deliveries acknowledged by consumers.
    pub fn acked(&self) -> usize {
        self.acks.load(Ordering::SeqCst)
    }

    /// Stop accepting publishes. Consumers drain what is queued and then
    /// see the end of their subscription.
    pub fn close(&self) {
        let mut inner = self.lock();
        inner.closed = true;
        for q in inner.queues.iter_mut() {
            q.tx = None;
        }
    }
}

#[async_trait]
impl EventPublisher for MemoryBus {
    async fn publish(&self, routing_key: &str, body: Vec<u8>) -> Result<()> {
        let mut inner = self.lock();
        if inner.fail_publish {
            return Err(Error::Bus("publish rejected by broker".to_string()));
        }
        if inner.closed {
            return Err(Error::Bus("bus closed".to_string()));
        }

        for q in inner.queues.iter().filter(|q| topic_matches(&q.binding, routing_key)) {
            if let Some(tx) = &q.tx {
                debug!("Routing {} to queue {}", routing_key, q.name);
                let _ = tx.send(Message {
                    routing_key: routing_key.to_string(),
                    body: body.clone(),
                    redelivered: false,
                });
            }
        }
        inner.published.push((routing_key.to_string(), body));
        Ok(())
    }
}

pub struct MemorySubscription {
    rx: UnboundedReceiver<Message>,
    requeue: Option<WeakUnboundedSender<Message>>,
    permits: Arc<Semaphore>,
    acks: Arc<AtomicUsize>,
}

#[async_trait]
impl Subscription for MemorySubscription {
    async fn next(&mut self) -> Option<Delivery> {
        let permit = self.permits.clone().acquire_owned().await.ok()?;
        let message = self.rx.recv().await?;
        let routing_key = message.routing_key.clone();
        let body = message.body.clone();
        let redelivered = message.redelivered;
        let acker = MemoryAck {
            message: Some(message),
            requeue: self.requeue.clone(),
            acks: self.acks.clone(),
            _permit: permit,
        };
        Some(Delivery::new(routing_key, body, redelivered, Box::new(acker)))
    }
}

/// Holds a prefetch slot until settled; dropping it unacked requeues the
/// message flagged as redelivered.
struct MemoryAck {
    message: Option<Message>,
    requeue: Option<WeakUnboundedSender<Message>>,
    acks: Arc<AtomicUsize>,
    _permit: OwnedSemaphorePermit,
}

#[async_trait]
impl Acknowledge for MemoryAck {
    async fn ack(self: Box<Self>) -> Result<()> {
        let mut this = self;
        this.message = None;
        this.acks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

impl Drop for MemoryAck {
    fn drop(&mut self) {
        if let Some(mut message) = self.message.take() {
            message.redelivered = true;
            if let Some(tx) = self.requeue.as_ref().and_then(WeakUnboundedSender::upgrade) {
                let _ = tx.send(message);
            }
        }
    }
}

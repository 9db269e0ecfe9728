use crate::directory::{default_ownership, resolve_owner, DeviceDirectory, Owner};
use crate::errors::IngestError;
use crate::metrics::GatewayMetrics;
use crate::store::EventStore;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use telemetry::{validate, EventPublisher, TelemetryEvent};
use tokio::time::{timeout, Instant};
use tracing::{debug, error, warn};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Write boundary of the pipeline: validates one event, persists it and
/// republishes it for the rule engine.
///
/// Persistence always precedes publication, and nothing is published for a
/// call whose insert failed. An event whose publish fails stays stored.
pub struct Gateway {
    store: Arc<dyn EventStore>,
    bus: Arc<dyn EventPublisher>,
    directory: Arc<dyn DeviceDirectory>,
    metrics: Arc<GatewayMetrics>,
    default_owner: Option<Owner>,
    store_timeout: Duration,
    publish_timeout: Duration,
}

impl Gateway {
    pub fn new(
        store: Arc<dyn EventStore>,
        bus: Arc<dyn EventPublisher>,
        directory: Arc<dyn DeviceDirectory>,
        metrics: Arc<GatewayMetrics>,
    ) -> Self {
        Self {
            store,
            bus,
            directory,
            metrics,
            default_owner: None,
            store_timeout: DEFAULT_TIMEOUT,
            publish_timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_default_owner(mut self, owner: Option<Owner>) -> Self {
        self.default_owner = owner;
        self
    }

    pub fn with_timeouts(mut self, store_timeout: Duration, publish_timeout: Duration) -> Self {
        self.store_timeout = store_timeout;
        self.publish_timeout = publish_timeout;
        self
    }

    pub fn metrics(&self) -> &GatewayMetrics {
        &self.metrics
    }

    /// Ingest a raw JSON request body.
    pub async fn ingest_json(&self, body: &[u8]) -> Result<TelemetryEvent, IngestError> {
        match serde_json::from_slice::<Value>(body) {
            Ok(payload) => self.ingest(&payload).await,
            Err(e) => {
                debug!("Rejecting unparseable body: {}", e);
                self.metrics.requests.inc();
                self.metrics.requests_failed.inc();
                Err(IngestError::Validation("invalid json".to_string()))
            }
        }
    }

    /// Validate, annotate, persist and publish one event.
    ///
    /// Returns the event as it was persisted and published.
    pub async fn ingest(&self, payload: &Value) -> Result<TelemetryEvent, IngestError> {
        let start = Instant::now();
        self.metrics.requests.inc();

        let result = self.ingest_inner(payload).await;

        self.metrics
            .request_seconds
            .observe(start.elapsed().as_secs_f64());
        if let Err(e) = &result {
            self.record_failure(e);
        }
        result
    }

    async fn ingest_inner(&self, payload: &Value) -> Result<TelemetryEvent, IngestError> {
        let mut event = validate(payload).map_err(|e| match e {
            telemetry::Error::Validation(msg) => IngestError::Validation(msg),
            other => IngestError::Validation(other.to_string()),
        })?;

        let lookup = resolve_owner(
            self.directory.as_ref(),
            self.default_owner.as_ref(),
            &event.device_id,
        );
        let ownership = match timeout(self.store_timeout, lookup).await {
            Ok(ownership) => ownership,
            Err(_) => {
                warn!(
                    "Device lookup for {} timed out after {:?}, using default owner",
                    event.device_id, self.store_timeout
                );
                default_ownership(self.default_owner.as_ref())
            }
        };
        event.owner_id = ownership.owner_id;
        event.owner_email = ownership.owner_email;
        event.device_ref = ownership.device_ref;

        match timeout(self.store_timeout, self.store.insert(&event)).await {
            Ok(Ok(id)) => debug!("Stored event {} for device {}", id, event.device_id),
            Ok(Err(e)) => {
                error!("Failed to store event for device {}: {}", event.device_id, e);
                return Err(IngestError::Store(e.to_string()));
            }
            Err(_) => {
                error!(
                    "Storing event for device {} timed out after {:?}",
                    event.device_id, self.store_timeout
                );
                return Err(IngestError::Store("timed out".to_string()));
            }
        }

        let body = serde_json::to_vec(&event).map_err(|e| IngestError::Bus(e.to_string()))?;
        let routing_key = event.routing_key();

        match timeout(self.publish_timeout, self.bus.publish(&routing_key, body)).await {
            Ok(Ok(())) => {
                debug!("Published event on {}", routing_key);
                Ok(event)
            }
            Ok(Err(e)) => {
                warn!("Event for {} stored but not published: {}", event.device_id, e);
                Err(IngestError::Bus(e.to_string()))
            }
            Err(_) => {
                warn!(
                    "Event for {} stored but publish timed out after {:?}",
                    event.device_id, self.publish_timeout
                );
                Err(IngestError::Bus("timed out".to_string()))
            }
        }
    }

    fn record_failure(&self, error: &IngestError) {
        self.metrics.requests_failed.inc();
        match error {
            IngestError::Validation(_) => self.metrics.validation_failed.inc(),
            IngestError::Store(_) => self.metrics.store_failed.inc(),
            IngestError::Bus(_) => self.metrics.bus_failed.inc(),
        }
    }
}

//! Shared pieces of the telemetry pipeline: the event model, the typed
//! validation step applied at the ingestion boundary, and the topic bus
//! abstractions used by both the gateway and the rule engine.

pub mod bus;
pub mod db;
pub mod errors;
pub mod memory;
pub mod metrics;
pub mod model;
pub mod mqtt;
pub mod validate;

pub use bus::{routing_key, topic_matches, Delivery, EventPublisher, Subscription};
pub use errors::{Error, Result};
pub use model::TelemetryEvent;
pub use validate::validate;

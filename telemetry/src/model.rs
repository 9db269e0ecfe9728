use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One reading from one device, as persisted and republished.
///
/// The owner fields are a snapshot of device ownership taken by the gateway
/// at ingestion time; they are never rewritten afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryEvent {
    pub device_id: String,
    pub timestamp: String,
    pub field_a: f64,
    pub field_b: f64,
    pub battery: i64,
    pub seq: i64,
    #[serde(default)]
    pub meta: Map<String, Value>,
    #[serde(default)]
    pub owner_id: Option<String>,
    #[serde(default)]
    pub owner_email: Option<String>,
    #[serde(default)]
    pub device_ref: Option<String>,
}

impl TelemetryEvent {
    /// Bus routing key for this event's device.
    pub fn routing_key(&self) -> String {
        crate::bus::routing_key(&self.device_id)
    }
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use telemetry::TelemetryEvent;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleType {
    Instant,
    Persistent,
}

impl RuleType {
    pub fn as_str(self) -> &'static str {
        match self {
            RuleType::Instant => "instant",
            RuleType::Persistent => "persistent",
        }
    }

    pub fn severity(self) -> i32 {
        match self {
            RuleType::Instant => 1,
            RuleType::Persistent => 2,
        }
    }
}

/// A raised rule violation. Append-only once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub id: Uuid,
    pub device_id: String,
    pub rule_id: String,
    pub rule_type: RuleType,
    pub triggered_at: DateTime<Utc>,
    /// The triggering event, verbatim.
    pub payload: TelemetryEvent,
    pub count: i32,
    pub severity: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
}

impl Alert {
    pub fn new(rule_id: &str, rule_type: RuleType, payload: &TelemetryEvent, count: i32) -> Self {
        Self {
            id: Uuid::new_v4(),
            device_id: payload.device_id.clone(),
            rule_id: rule_id.to_string(),
            rule_type,
            triggered_at: Utc::now(),
            payload: payload.clone(),
            count,
            severity: rule_type.severity(),
            idempotency_key: None,
        }
    }

    /// Key identifying the triggering occurrence across redeliveries.
    pub fn occurrence_key(&self) -> String {
        format!("{}:{}:{}", self.device_id, self.rule_id, self.payload.seq)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rule_type_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&RuleType::Persistent).unwrap(), "\"persistent\"");
        assert_eq!(RuleType::Instant.as_str(), "instant");
    }
}

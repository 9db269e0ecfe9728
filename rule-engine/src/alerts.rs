//! Durable store of raised alerts.

use crate::errors::{Error, Result};
use crate::model::Alert;
use async_trait::async_trait;
use clap::ValueEnum;
use sqlx::types::Json;
use sqlx::PgPool;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::RwLock;

/// What to do when the same triggering occurrence is written twice, which
/// happens when a message is redelivered after its alert was written but
/// before it was acknowledged.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum AlertDedup {
    /// Store every write; redelivery can produce duplicate rows.
    #[default]
    Accept,
    /// Key each alert by device, rule and event `seq` and drop repeats.
    IdempotencyKey,
}

#[async_trait]
pub trait AlertStore: Send + Sync {
    /// Append an alert. Returns `false` when an alert with the same
    /// idempotency key already exists and nothing was written.
    async fn insert(&self, alert: &Alert) -> Result<bool>;
}

pub struct PgAlertStore {
    pool: PgPool,
}

impl PgAlertStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AlertStore for PgAlertStore {
    async fn insert(&self, alert: &Alert) -> Result<bool> {
        let query = r#"
            INSERT INTO alerts
                (id, device_id, rule_id, rule_type, triggered_at, payload, count, severity, idempotency_key)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (idempotency_key) DO NOTHING
            "#;

        let result = sqlx::query(query)
            .bind(alert.id)
            .bind(&alert.device_id)
            .bind(&alert.rule_id)
            .bind(alert.rule_type.as_str())
            .bind(alert.triggered_at)
            .bind(Json(&alert.payload))
            .bind(alert.count)
            .bind(alert.severity)
            .bind(&alert.idempotency_key)
            .execute(&self.pool)
            .await
            .map_err(|e| Error::AlertWrite(e.to_string()))?;

        Ok(result.rows_affected() == 1)
    }
}

/// In-memory store with failure injection, for tests and local runs.
#[derive(Default)]
pub struct MemoryAlertStore {
    alerts: RwLock<Vec<Alert>>,
    failing: AtomicBool,
}

impl MemoryAlertStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following write fail until reset.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub async fn alerts(&self) -> Vec<Alert> {
        self.alerts.read().await.clone()
    }

    /// Alerts written under `rule_id`, oldest first.
    pub async fn by_rule(&self, rule_id: &str) -> Vec<Alert> {
        self.alerts
            .read()
            .await
            .iter()
            .filter(|a| a.rule_id == rule_id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl AlertStore for MemoryAlertStore {
    async fn insert(&self, alert: &Alert) -> Result<bool> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::AlertWrite("alert store unavailable".to_string()));
        }
        let mut alerts = self.alerts.write().await;
        if let Some(key) = &alert.idempotency_key {
            if alerts
                .iter()
                .any(|a| a.idempotency_key.as_ref() == Some(key))
            {
                return Ok(false);
            }
        }
        alerts.push(alert.clone());
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::RuleType;
    use telemetry::validate;

    fn alert(key: Option<&str>) -> Alert {
        let event = validate(&serde_json::json!({
            "device_id": "42",
            "timestamp": "2024-05-01T10:00:00Z",
            "field_a": 6.0,
            "field_b": 0.0,
            "battery": 50,
            "seq": 1
        }))
        .unwrap();
        let mut alert = Alert::new("instant_42_a_gt_5", RuleType::Instant, &event, 1);
        alert.idempotency_key = key.map(str::to_string);
        alert
    }

    #[tokio::test]
    async fn test_accepts_duplicates_without_key() {
        let store = MemoryAlertStore::new();
        assert!(store.insert(&alert(None)).await.unwrap());
        assert!(store.insert(&alert(None)).await.unwrap());
        assert_eq!(store.alerts().await.len(), 2);
    }

    #[tokio::test]
    async fn test_drops_repeated_key() {
        let store = MemoryAlertStore::new();
        assert!(store.insert(&alert(Some("42:r:1"))).await.unwrap());
        assert!(!store.insert(&alert(Some("42:r:1"))).await.unwrap());
        assert!(store.insert(&alert(Some("42:r:2"))).await.unwrap());
        assert_eq!(store.by_rule("instant_42_a_gt_5").await.len(), 2);
    }

    #[tokio::test]
    async fn test_failing_store() {
        let store = MemoryAlertStore::new();
        store.set_failing(true);
        assert!(matches!(
            store.insert(&alert(None)).await,
            Err(Error::AlertWrite(_))
        ));
    }
}

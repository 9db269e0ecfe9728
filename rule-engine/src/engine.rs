//! Streak rule evaluation over the consumed event stream.

use crate::alerts::{AlertDedup, AlertStore};
use crate::errors::Result;
use crate::metrics::{EngineMetrics, ERROR_ALERT_WRITE, ERROR_DECODE};
use crate::model::{Alert, RuleType};
use crate::rules::Rule;
use crate::state::StateTable;
use std::sync::Arc;
use std::time::Duration;
use telemetry::{Delivery, TelemetryEvent};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

const INITIAL_BACKOFF_MS: u64 = 100;
const MAX_BACKOFF_MS: u64 = 2000;

/// Outcome of evaluating one event.
#[derive(Debug, Default)]
pub struct Evaluation {
    /// Alerts that reached the store, in emission order.
    pub written: Vec<Alert>,
    /// Alerts that could not be written and were dropped.
    pub failed_writes: usize,
}

/// Single-threaded evaluator. Deliveries are processed one at a time and in
/// order, so the streak table needs no locking.
pub struct RuleEngine {
    rules: Vec<Rule>,
    state: StateTable,
    alerts: Arc<dyn AlertStore>,
    metrics: Arc<EngineMetrics>,
    dedup: AlertDedup,
    instant_alerts: bool,
    write_attempts: u32,
}

impl RuleEngine {
    pub fn new(rules: Vec<Rule>, alerts: Arc<dyn AlertStore>, metrics: Arc<EngineMetrics>) -> Self {
        Self {
            rules,
            state: StateTable::new(),
            alerts,
            metrics,
            dedup: AlertDedup::default(),
            instant_alerts: true,
            write_attempts: 1,
        }
    }

    pub fn with_dedup(mut self, dedup: AlertDedup) -> Self {
        self.dedup = dedup;
        self
    }

    /// Disable per-event alerts. Streaks are still tracked.
    pub fn with_instant_alerts(mut self, enabled: bool) -> Self {
        self.instant_alerts = enabled;
        self
    }

    /// Retry failed alert writes with backoff. The default of one attempt
    /// drops the alert on the first failure so the queue never stalls.
    pub fn with_write_attempts(mut self, attempts: u32) -> Self {
        self.write_attempts = attempts.max(1);
        self
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    pub fn state(&self) -> &StateTable {
        &self.state
    }

    pub fn metrics(&self) -> &EngineMetrics {
        &self.metrics
    }

    /// Apply every rule configured for the event's device.
    ///
    /// The streak counter advances whether or not alert writes succeed, and
    /// is reset once a persistent alert has been emitted for it.
    pub async fn evaluate(&mut self, event: &TelemetryEvent) -> Evaluation {
        let mut evaluation = Evaluation::default();

        for i in 0..self.rules.len() {
            let rule = self.rules[i].clone();
            if !rule.config.applies_to(event) {
                continue;
            }

            let violated = rule.config.violated_by(event);
            if violated && self.instant_alerts {
                let alert = Alert::new(&rule.instant_id, RuleType::Instant, event, 1);
                self.emit(alert, &mut evaluation).await;
            }

            let streak = self
                .state
                .record(&event.device_id, &rule.persistent_id, violated);
            if streak >= rule.config.streak {
                info!(
                    "Device {} violated {} for {} consecutive events",
                    event.device_id, rule.persistent_id, streak
                );
                let count = i32::try_from(streak).unwrap_or(i32::MAX);
                let alert = Alert::new(&rule.persistent_id, RuleType::Persistent, event, count);
                self.emit(alert, &mut evaluation).await;
                self.state.reset(&event.device_id, &rule.persistent_id);
            }
        }

        evaluation
    }

    /// Decode one message body and evaluate it.
    pub async fn handle(&mut self, body: &[u8]) -> Result<Evaluation> {
        let event: TelemetryEvent = serde_json::from_slice(body)?;
        let evaluation = self.evaluate(&event).await;
        self.metrics.processed.inc();
        Ok(evaluation)
    }

    /// Process a delivery and acknowledge it.
    ///
    /// Every delivery is acknowledged once processing finishes, including
    /// undecodable ones, which are dropped.
    pub async fn process(&mut self, delivery: Delivery) {
        let start = Instant::now();

        if delivery.redelivered {
            debug!("Processing redelivered message on {}", delivery.routing_key);
        }

        match self.handle(&delivery.body).await {
            Ok(evaluation) => debug!(
                "Processed message on {}: {} alerts written, {} failed",
                delivery.routing_key,
                evaluation.written.len(),
                evaluation.failed_writes
            ),
            Err(e) => {
                warn!("Dropping message on {}: {}", delivery.routing_key, e);
                self.metrics.errors.with_label_values(&[ERROR_DECODE]).inc();
            }
        }

        self.metrics
            .process_seconds
            .observe(start.elapsed().as_secs_f64());

        if let Err(e) = delivery.ack().await {
            error!("Failed to acknowledge message: {}", e);
        }
    }

    async fn emit(&self, mut alert: Alert, evaluation: &mut Evaluation) {
        if self.dedup == AlertDedup::IdempotencyKey {
            alert.idempotency_key = Some(alert.occurrence_key());
        }

        match self.write_with_retry(&alert).await {
            Ok(true) => {
                self.metrics.hits.with_label_values(&[alert.rule_id.as_str()]).inc();
                evaluation.written.push(alert);
            }
            Ok(false) => debug!("Alert {} already recorded", alert.occurrence_key()),
            Err(e) => {
                error!("Failed to write {} alert: {}", alert.rule_id, e);
                self.metrics
                    .errors
                    .with_label_values(&[ERROR_ALERT_WRITE])
                    .inc();
                evaluation.failed_writes += 1;
            }
        }
    }

    /// Write with exponential backoff between attempts.
    async fn write_with_retry(&self, alert: &Alert) -> Result<bool> {
        let mut attempt = 0;
        let mut backoff_ms = INITIAL_BACKOFF_MS;

        loop {
            attempt += 1;

            match self.alerts.insert(alert).await {
                Ok(written) => {
                    if attempt > 1 {
                        info!("Alert written on attempt {}", attempt);
                    }
                    return Ok(written);
                }
                Err(e) if attempt < self.write_attempts => {
                    warn!(
                        "Alert write attempt {} failed: {}. Retrying in {}ms",
                        attempt, e, backoff_ms
                    );
                    tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                    backoff_ms = (backoff_ms * 2).min(MAX_BACKOFF_MS);
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::MemoryAlertStore;
    use crate::errors::Error;
    use crate::rules::RuleConfig;
    use async_trait::async_trait;
    use prometheus::Registry;
    use std::sync::atomic::{AtomicU32, Ordering};
    use telemetry::validate;

    const INSTANT: &str = "instant_42_a_gt_5";
    const PERSISTENT: &str = "persistent_42_a_gt_5";

    fn engine(store: Arc<dyn AlertStore>) -> RuleEngine {
        let config: RuleConfig = "42:field_a:5:10".parse().unwrap();
        let metrics = Arc::new(EngineMetrics::new(&Registry::new()).unwrap());
        RuleEngine::new(vec![Rule::from(config)], store, metrics)
    }

    fn event(device: &str, field_a: f64, seq: i64) -> TelemetryEvent {
        validate(&serde_json::json!({
            "device_id": device,
            "timestamp": "2024-05-01T10:00:00Z",
            "field_a": field_a,
            "field_b": 0.0,
            "battery": 80,
            "seq": seq
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_tenth_consecutive_violation_raises_persistent_alert() {
        let store = Arc::new(MemoryAlertStore::new());
        let mut engine = engine(store.clone());

        for seq in 0..9 {
            engine.evaluate(&event("42", 6.0, seq)).await;
        }
        assert!(store.by_rule(PERSISTENT).await.is_empty());
        assert_eq!(engine.state().violations("42", PERSISTENT), 9);

        engine.evaluate(&event("42", 10.0, 9)).await;

        assert_eq!(store.by_rule(INSTANT).await.len(), 10);
        let persistent = store.by_rule(PERSISTENT).await;
        assert_eq!(persistent.len(), 1);
        assert_eq!(persistent[0].count, 10);
        assert_eq!(persistent[0].severity, 2);
        assert_eq!(persistent[0].payload.seq, 9);
        assert_eq!(engine.state().violations("42", PERSISTENT), 0);
    }

    #[tokio::test]
    async fn test_interrupted_streak_raises_no_persistent_alert() {
        let store = Arc::new(MemoryAlertStore::new());
        let mut engine = engine(store.clone());

        for seq in 0..5 {
            engine.evaluate(&event("42", 6.0, seq)).await;
        }
        engine.evaluate(&event("42", 3.0, 5)).await;
        for seq in 6..10 {
            engine.evaluate(&event("42", 6.0, seq)).await;
        }

        assert_eq!(store.by_rule(INSTANT).await.len(), 9);
        assert!(store.by_rule(PERSISTENT).await.is_empty());
        assert_eq!(engine.state().violations("42", PERSISTENT), 4);
    }

    #[tokio::test]
    async fn test_threshold_is_exclusive() {
        let store = Arc::new(MemoryAlertStore::new());
        let mut engine = engine(store.clone());

        let evaluation = engine.evaluate(&event("42", 5.0, 1)).await;

        assert!(evaluation.written.is_empty());
        assert_eq!(engine.state().violations("42", PERSISTENT), 0);
    }

    #[tokio::test]
    async fn test_instant_alert_per_violation() {
        let store = Arc::new(MemoryAlertStore::new());
        let mut engine = engine(store.clone());

        let evaluation = engine.evaluate(&event("42", 5.5, 7)).await;

        assert_eq!(evaluation.written.len(), 1);
        let alert = &evaluation.written[0];
        assert_eq!(alert.rule_id, INSTANT);
        assert_eq!(alert.rule_type, RuleType::Instant);
        assert_eq!(alert.count, 1);
        assert_eq!(alert.severity, 1);
        assert_eq!(alert.payload, event("42", 5.5, 7));
        assert_eq!(engine.metrics().hits.with_label_values(&[INSTANT]).get(), 1);
    }

    #[tokio::test]
    async fn test_other_devices_are_ignored() {
        let store = Arc::new(MemoryAlertStore::new());
        let mut engine = engine(store.clone());

        for seq in 0..20 {
            engine.evaluate(&event("43", 100.0, seq)).await;
        }

        assert!(store.alerts().await.is_empty());
        assert!(engine.state().is_empty());
    }

    #[tokio::test]
    async fn test_failed_writes_still_advance_streak() {
        let store = Arc::new(MemoryAlertStore::new());
        let mut engine = engine(store.clone());
        store.set_failing(true);

        for seq in 0..10 {
            let evaluation = engine.evaluate(&event("42", 6.0, seq)).await;
            assert!(evaluation.failed_writes >= 1);
        }

        assert!(store.alerts().await.is_empty());
        assert_eq!(engine.state().violations("42", PERSISTENT), 0);
        assert_eq!(
            engine
                .metrics()
                .errors
                .with_label_values(&[ERROR_ALERT_WRITE])
                .get(),
            11
        );

        store.set_failing(false);
        engine.evaluate(&event("42", 6.0, 10)).await;
        assert_eq!(engine.state().violations("42", PERSISTENT), 1);
    }

    /// Fails the first `failures` writes, then delegates.
    struct Flaky {
        failures: AtomicU32,
        inner: MemoryAlertStore,
    }

    #[async_trait]
    impl AlertStore for Flaky {
        async fn insert(&self, alert: &Alert) -> Result<bool> {
            if self.failures.load(Ordering::SeqCst) > 0 {
                self.failures.fetch_sub(1, Ordering::SeqCst);
                return Err(Error::AlertWrite("connection reset".to_string()));
            }
            self.inner.insert(alert).await
        }
    }

    #[tokio::test]
    async fn test_failed_write_is_dropped_without_waiting() {
        let store = Arc::new(Flaky {
            failures: AtomicU32::new(1),
            inner: MemoryAlertStore::new(),
        });
        let config: RuleConfig = "42:field_a:5:1".parse().unwrap();
        let metrics = Arc::new(EngineMetrics::new(&Registry::new()).unwrap());
        let mut engine = RuleEngine::new(vec![Rule::from(config)], store.clone(), metrics);

        let start = Instant::now();
        let evaluation = engine.evaluate(&event("42", 6.0, 1)).await;

        assert!(start.elapsed() < Duration::from_millis(INITIAL_BACKOFF_MS));
        assert_eq!(evaluation.failed_writes, 1);
        // the persistent alert behind it is a separate write and goes through
        assert_eq!(evaluation.written.len(), 1);
        assert_eq!(evaluation.written[0].rule_type, RuleType::Persistent);
        assert_eq!(store.failures.load(Ordering::SeqCst), 0);
        assert!(store.inner.by_rule(INSTANT).await.is_empty());
    }

    #[tokio::test]
    async fn test_opt_in_write_retries() {
        let store = Arc::new(Flaky {
            failures: AtomicU32::new(2),
            inner: MemoryAlertStore::new(),
        });
        let mut engine = engine(store.clone()).with_write_attempts(3);

        let evaluation = engine.evaluate(&event("42", 6.0, 1)).await;

        assert_eq!(evaluation.written.len(), 1);
        assert_eq!(evaluation.failed_writes, 0);
        assert_eq!(store.inner.alerts().await.len(), 1);
    }

    #[tokio::test]
    async fn test_idempotency_key_drops_repeated_occurrence() {
        let store = Arc::new(MemoryAlertStore::new());
        let mut engine = engine(store.clone()).with_dedup(AlertDedup::IdempotencyKey);

        let first = engine.evaluate(&event("42", 6.0, 3)).await;
        let again = engine.evaluate(&event("42", 6.0, 3)).await;

        assert_eq!(first.written.len(), 1);
        assert_eq!(
            first.written[0].idempotency_key.as_deref(),
            Some("42:instant_42_a_gt_5:3")
        );
        assert!(again.written.is_empty());
        assert_eq!(again.failed_writes, 0);
        assert_eq!(store.alerts().await.len(), 1);
    }

    #[tokio::test]
    async fn test_instant_alerts_disabled_still_tracks_streak() {
        let store = Arc::new(MemoryAlertStore::new());
        let mut engine = engine(store.clone()).with_instant_alerts(false);

        for seq in 0..10 {
            engine.evaluate(&event("42", 6.0, seq)).await;
        }

        let alerts = store.alerts().await;
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].rule_type, RuleType::Persistent);
    }

    #[tokio::test]
    async fn test_undecodable_body() {
        let store = Arc::new(MemoryAlertStore::new());
        let mut engine = engine(store.clone());

        assert!(matches!(
            engine.handle(b"not json").await,
            Err(Error::Decode(_))
        ));
        assert!(engine.state().is_empty());
        assert_eq!(engine.metrics().processed.get(), 0);
    }
}

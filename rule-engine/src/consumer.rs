use crate::engine::RuleEngine;
use telemetry::Subscription;
use tokio::sync::watch;
use tracing::info;

/// Drive `engine` from `subscription` until the subscription ends or
/// shutdown is signalled. A delivery already being processed finishes and
/// is acknowledged before the loop exits.
pub async fn consume<S>(engine: &mut RuleEngine, subscription: &mut S, mut shutdown: watch::Receiver<bool>)
where
    S: Subscription + ?Sized,
{
    info!("Consuming events for {} rules", engine.rules().len());

    loop {
        if *shutdown.borrow() {
            break;
        }

        let delivery = tokio::select! {
            biased;
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
                continue;
            }
            delivery = subscription.next() => delivery,
        };

        match delivery {
            Some(delivery) => engine.process(delivery).await,
            None => {
                info!("Subscription closed");
                break;
            }
        }
    }

    info!("Consumer stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::MemoryAlertStore;
    use crate::metrics::{EngineMetrics, ERROR_DECODE};
    use crate::rules::{Rule, RuleConfig};
    use prometheus::Registry;
    use std::sync::Arc;
    use std::time::Duration;
    use telemetry::bus::{DEVICE_BINDING, RULES_QUEUE};
    use telemetry::memory::MemoryBus;
    use telemetry::EventPublisher;

    fn engine(store: Arc<MemoryAlertStore>) -> RuleEngine {
        let config: RuleConfig = "42:field_a:5:10".parse().unwrap();
        let metrics = Arc::new(EngineMetrics::new(&Registry::new()).unwrap());
        RuleEngine::new(vec![Rule::from(config)], store, metrics)
    }

    fn body(field_a: f64, seq: i64) -> Vec<u8> {
        serde_json::to_vec(&serde_json::json!({
            "device_id": "42",
            "timestamp": "2024-05-01T10:00:00Z",
            "field_a": field_a,
            "field_b": 0.0,
            "battery": 80,
            "seq": seq
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_malformed_message_is_acked_and_skipped() {
        let bus = MemoryBus::new();
        bus.bind(RULES_QUEUE, DEVICE_BINDING);
        bus.publish("device.42", b"{\"device_id\":".to_vec()).await.unwrap();
        bus.publish("device.42", body(6.0, 1)).await.unwrap();
        bus.close();

        let store = Arc::new(MemoryAlertStore::new());
        let mut engine = engine(store.clone());
        let mut sub = bus.subscribe(RULES_QUEUE, 10).unwrap();
        let (_tx, rx) = watch::channel(false);

        consume(&mut engine, &mut sub, rx).await;

        assert_eq!(bus.acked(), 2);
        assert_eq!(engine.metrics().errors.with_label_values(&[ERROR_DECODE]).get(), 1);
        assert_eq!(engine.metrics().processed.get(), 1);
        assert_eq!(engine.state().violations("42", "persistent_42_a_gt_5"), 1);
        assert_eq!(store.alerts().await.len(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_stops_idle_consumer() {
        let bus = MemoryBus::new();
        bus.bind(RULES_QUEUE, DEVICE_BINDING);
        let mut sub = bus.subscribe(RULES_QUEUE, 10).unwrap();
        let mut engine = engine(Arc::new(MemoryAlertStore::new()));
        let (tx, rx) = watch::channel(false);

        let stop = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            tx.send(true).unwrap();
            tx
        });

        tokio::time::timeout(Duration::from_secs(5), consume(&mut engine, &mut sub, rx))
            .await
            .expect("consumer did not stop");
        stop.await.unwrap();
        assert_eq!(engine.metrics().processed.get(), 0);
    }
}

use anyhow::Context;
use clap::Parser;
use prometheus::Registry;
use rule_engine::alerts::PgAlertStore;
use rule_engine::config::Config;
use rule_engine::metrics::EngineMetrics;
use rule_engine::{consumer, db, rest, RuleEngine};
use std::sync::Arc;
use telemetry::bus::{DEVICE_BINDING, EXCHANGE, RULES_QUEUE};
use telemetry::mqtt::MqttSubscription;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::parse();
    let rules = config.rules().context("invalid RULES")?;

    info!("Starting rule engine");
    info!("MQTT broker: {}:{}", config.mqtt_broker, config.mqtt_port);
    info!("Metrics server: {}", config.metrics_addr);
    info!("Database: {}", config.redacted_database_url());
    for rule in &rules {
        info!("Rule {} (streak {})", rule.config, rule.config.streak);
    }

    let pool = db::make_pool(&config.database_url)
        .await
        .context("failed to connect to database")?;

    let registry = Registry::new();
    let metrics = Arc::new(EngineMetrics::new(&registry).context("failed to register metrics")?);

    let mut engine = RuleEngine::new(rules, Arc::new(PgAlertStore::new(pool)), metrics)
        .with_dedup(config.alert_dedup)
        .with_instant_alerts(config.instant_alerts)
        .with_write_attempts(config.alert_write_attempts);

    let listener = tokio::net::TcpListener::bind(&config.metrics_addr)
        .await
        .with_context(|| format!("failed to bind to {}", config.metrics_addr))?;
    let app = rest::create_router(registry);
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!("Metrics server error: {}", e);
        }
    });

    let mut subscription = MqttSubscription::connect(
        &config.mqtt_broker,
        config.mqtt_port,
        RULES_QUEUE,
        EXCHANGE,
        DEVICE_BINDING,
        usize::from(config.prefetch),
    )
    .await
    .context("failed to subscribe to event bus")?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("Received shutdown signal");
        let _ = shutdown_tx.send(true);
    });

    consumer::consume(&mut engine, &mut subscription, shutdown_rx).await;

    info!("Shutting down");
    Ok(())
}

use anyhow::Context;
use clap::Parser;
use gateway::config::Config;
use gateway::directory::PgDeviceDirectory;
use gateway::metrics::GatewayMetrics;
use gateway::store::PgEventStore;
use gateway::{db, rest, Gateway};
use prometheus::Registry;
use std::sync::Arc;
use telemetry::bus::EXCHANGE;
use telemetry::mqtt::MqttPublisher;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::parse();

    info!("Starting ingestion gateway");
    info!("MQTT broker: {}:{}", config.mqtt_broker, config.mqtt_port);
    info!("HTTP server: {}", config.http_addr);
    info!("Database: {}", config.redacted_database_url());

    let pool = db::make_pool(&config.database_url)
        .await
        .context("failed to connect to database")?;

    let registry = Registry::new();
    let metrics = Arc::new(GatewayMetrics::new(&registry).context("failed to register metrics")?);

    let client_id = format!("gateway-{}", uuid::Uuid::new_v4());
    let (publisher, bus_handle) =
        MqttPublisher::connect(&config.mqtt_broker, config.mqtt_port, &client_id, EXCHANGE);

    let store = Arc::new(PgEventStore::new(pool.clone()));
    let gateway = Gateway::new(
        store.clone(),
        Arc::new(publisher),
        Arc::new(PgDeviceDirectory::new(pool)),
        metrics,
    )
    .with_default_owner(config.default_owner())
    .with_timeouts(config.store_timeout(), config.publish_timeout());

    let app = rest::create_router(Arc::new(gateway), store, registry);

    let listener = tokio::net::TcpListener::bind(&config.http_addr)
        .await
        .with_context(|| format!("failed to bind to {}", config.http_addr))?;

    info!("HTTP server listening on {}", config.http_addr);

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = tokio::signal::ctrl_c().await;
                info!("Received shutdown signal");
            })
            .await
            .unwrap_or_else(|e| {
                error!("HTTP server error: {}", e);
            });
    });

    tokio::select! {
        _ = bus_handle => {
            error!("MQTT event loop terminated");
        }
        _ = server_handle => {
            info!("HTTP server stopped");
        }
    }

    info!("Shutting down");
    Ok(())
}

use crate::metrics::gather_metrics;
use axum::{extract::State, routing::get, Json, Router};
use chrono::Utc;
use prometheus::Registry;
use serde_json::json;

pub fn create_router(registry: Registry) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .with_state(registry)
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({"status": "ok", "time": Utc::now().to_rfc3339()}))
}

async fn metrics(State(registry): State<Registry>) -> String {
    gather_metrics(&registry)
}

use crate::errors::IngestError;
use crate::ingest::Gateway;
use crate::metrics::gather_metrics;
use crate::store::EventStore;
use axum::{
    body::Bytes,
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use prometheus::Registry;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tracing::error;

const DEFAULT_LIMIT: i64 = 100;
const MAX_LIMIT: i64 = 500;

#[derive(Clone)]
struct AppState {
    gateway: Arc<Gateway>,
    store: Arc<dyn EventStore>,
    registry: Registry,
}

#[derive(Debug, Deserialize)]
pub struct MessagesQuery {
    device_id: Option<String>,
    limit: Option<String>,
}

pub fn create_router(gateway: Arc<Gateway>, store: Arc<dyn EventStore>, registry: Registry) -> Router {
    let state = AppState {
        gateway,
        store,
        registry,
    };

    Router::new()
        .route("/ingest", post(ingest))
        .route("/health", get(health))
        .route("/messages", get(list_messages))
        .route("/stats", get(stats))
        .route("/metrics", get(metrics))
        .with_state(state)
}

async fn ingest(State(state): State<AppState>, body: Bytes) -> Response {
    match state.gateway.ingest_json(&body).await {
        Ok(_) => (StatusCode::OK, Json(json!({"status": "ok"}))).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({"status": "ok", "time": Utc::now().to_rfc3339()}))
}

async fn list_messages(
    State(state): State<AppState>,
    Query(params): Query<MessagesQuery>,
) -> Result<Response, AppError> {
    let limit = match params.limit.as_deref().map(str::parse::<i64>) {
        None => DEFAULT_LIMIT,
        Some(Ok(limit)) => limit.clamp(1, MAX_LIMIT),
        Some(Err(_)) => {
            return Ok((
                StatusCode::BAD_REQUEST,
                Json(json!({"error": "limit must be int"})),
            )
                .into_response())
        }
    };

    let events = state
        .store
        .recent(params.device_id.as_deref(), limit as usize)
        .await?;
    Ok(Json(events).into_response())
}

async fn stats(State(state): State<AppState>) -> Result<Json<serde_json::Value>, AppError> {
    let total = state.store.count().await?;
    let latest = state.store.recent(None, 1).await?.into_iter().next();
    Ok(Json(json!({"messages_total": total, "latest": latest})))
}

async fn metrics(State(state): State<AppState>) -> String {
    gather_metrics(&state.registry)
}

impl IntoResponse for IngestError {
    fn into_response(self) -> Response {
        let (status, body) = match &self {
            IngestError::Validation(msg) => (StatusCode::BAD_REQUEST, json!({"error": msg})),
            IngestError::Store(details) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                json!({"error": "db_error", "details": details}),
            ),
            IngestError::Bus(details) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                json!({"error": "bus_error", "details": details}),
            ),
        };
        (status, Json(body)).into_response()
    }
}

struct AppError(anyhow::Error);

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        error!("API error: {}", self.0);
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Internal server error: {}", self.0),
        )
            .into_response()
    }
}

impl<E> From<E> for AppError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

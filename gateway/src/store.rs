//! Durable append-only record of ingested events.

use crate::errors::{Error, Result};
use async_trait::async_trait;
use serde_json::{Map, Value};
use sqlx::types::Json;
use sqlx::PgPool;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use telemetry::TelemetryEvent;
use tokio::sync::RwLock;

#[async_trait]
pub trait EventStore: Send + Sync {
    /// Append one event, returning its store-internal identifier.
    async fn insert(&self, event: &TelemetryEvent) -> Result<i64>;

    /// Most recent events first, optionally for one device.
    async fn recent(&self, device_id: Option<&str>, limit: usize) -> Result<Vec<TelemetryEvent>>;

    /// Number of stored events.
    async fn count(&self) -> Result<i64>;
}

pub struct PgEventStore {
    pool: PgPool,
}

impl PgEventStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(sqlx::FromRow)]
struct EventRow {
    device_id: String,
    ts: String,
    field_a: f64,
    field_b: f64,
    battery: i64,
    seq: i64,
    meta: Json<Map<String, Value>>,
    owner_id: Option<String>,
    owner_email: Option<String>,
    device_ref: Option<String>,
}

impl From<EventRow> for TelemetryEvent {
    fn from(row: EventRow) -> Self {
        TelemetryEvent {
            device_id: row.device_id,
            timestamp: row.ts,
            field_a: row.field_a,
            field_b: row.field_b,
            battery: row.battery,
            seq: row.seq,
            meta: row.meta.0,
            owner_id: row.owner_id,
            owner_email: row.owner_email,
            device_ref: row.device_ref,
        }
    }
}

#[async_trait]
impl EventStore for PgEventStore {
    async fn insert(&self, event: &TelemetryEvent) -> Result<i64> {
        let query = r#"
            INSERT INTO messages
                (device_id, ts, field_a, field_b, battery, seq, meta, owner_id, owner_email, device_ref)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            RETURNING id
            "#;

        let id = sqlx::query_scalar::<_, i64>(query)
            .bind(&event.device_id)
            .bind(&event.timestamp)
            .bind(event.field_a)
            .bind(event.field_b)
            .bind(event.battery)
            .bind(event.seq)
            .bind(Json(&event.meta))
            .bind(&event.owner_id)
            .bind(&event.owner_email)
            .bind(&event.device_ref)
            .fetch_one(&self.pool)
            .await?;

        Ok(id)
    }

    async fn recent(&self, device_id: Option<&str>, limit: usize) -> Result<Vec<TelemetryEvent>> {
        let query = r#"
            SELECT device_id, ts, field_a, field_b, battery, seq, meta, owner_id, owner_email, device_ref
            FROM messages
            WHERE ($1::text IS NULL OR device_id = $1)
            ORDER BY ts DESC, id DESC
            LIMIT $2
            "#;

        let rows = sqlx::query_as::<_, EventRow>(query)
            .bind(device_id)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows.into_iter().map(TelemetryEvent::from).collect())
    }

    async fn count(&self) -> Result<i64> {
        let total = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM messages")
            .fetch_one(&self.pool)
            .await?;
        Ok(total)
    }
}

/// In-memory store with failure injection, for tests and local runs.
#[derive(Default)]
pub struct MemoryEventStore {
    events: RwLock<Vec<TelemetryEvent>>,
    insert_attempts: AtomicUsize,
    fail_inserts: AtomicBool,
}

impl MemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following insert fail until reset.
    pub fn set_fail_inserts(&self, fail: bool) {
        self.fail_inserts.store(fail, Ordering::SeqCst);
    }

    /// Inserts attempted, successful or not.
    pub fn insert_attempts(&self) -> usize {
        self.insert_attempts.load(Ordering::SeqCst)
    }

    pub async fn events(&self) -> Vec<TelemetryEvent> {
        self.events.read().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.events.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl EventStore for MemoryEventStore {
    async fn insert(&self, event: &TelemetryEvent) -> Result<i64> {
        self.insert_attempts.fetch_add(1, Ordering::SeqCst);
        if self.fail_inserts.load(Ordering::SeqCst) {
            return Err(Error::Unavailable("insert rejected".to_string()));
        }
        let mut events = self.events.write().await;
        events.push(event.clone());
        Ok(events.len() as i64)
    }

    async fn recent(&self, device_id: Option<&str>, limit: usize) -> Result<Vec<TelemetryEvent>> {
        let events = self.events.read().await;
        let mut matching: Vec<(usize, &TelemetryEvent)> = events
            .iter()
            .enumerate()
            .filter(|(_, e)| device_id.map_or(true, |id| e.device_id == id))
            .collect();
        // newest timestamp first, later insert wins ties
        matching.sort_by(|(ia, a), (ib, b)| b.timestamp.cmp(&a.timestamp).then(ib.cmp(ia)));
        Ok(matching
            .into_iter()
            .take(limit)
            .map(|(_, e)| e.clone())
            .collect())
    }

    async fn count(&self) -> Result<i64> {
        Ok(self.events.read().await.len() as i64)
    }
}

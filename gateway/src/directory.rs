//! Device ownership lookup used to annotate events at ingestion time.

use crate::errors::Result;
use async_trait::async_trait;
use serde::Deserialize;
use sqlx::PgPool;
use tracing::warn;

/// A provisioned device as known to account management.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, sqlx::FromRow)]
pub struct Device {
    pub id: String,
    pub external_id: Option<String>,
    pub owner_id: String,
    pub owner_email: Option<String>,
}

/// Owner that unknown devices are attributed to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Owner {
    pub id: String,
    pub email: Option<String>,
}

/// Ownership annotation stamped onto an event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Ownership {
    pub owner_id: Option<String>,
    pub owner_email: Option<String>,
    pub device_ref: Option<String>,
}

#[async_trait]
pub trait DeviceDirectory: Send + Sync {
    /// Find a device by exact id, or else by its external identifier.
    async fn find(&self, device_id: &str) -> Result<Option<Device>>;
}

/// Resolve who owns `device_id`. Never fails: lookup errors and unknown
/// devices fall back to `default_owner`, or to no owner at all.
pub async fn resolve_owner(
    directory: &dyn DeviceDirectory,
    default_owner: Option<&Owner>,
    device_id: &str,
) -> Ownership {
    match directory.find(device_id).await {
        Ok(Some(device)) => {
            return Ownership {
                owner_id: Some(device.owner_id),
                owner_email: device.owner_email,
                device_ref: Some(device.id),
            }
        }
        Ok(None) => {}
        Err(e) => warn!("Device lookup for {} failed, using default owner: {}", device_id, e),
    }

    default_ownership(default_owner)
}

/// Annotation for a device the directory could not place.
pub fn default_ownership(default_owner: Option<&Owner>) -> Ownership {
    default_owner
        .map(|owner| Ownership {
            owner_id: Some(owner.id.clone()),
            owner_email: owner.email.clone(),
            device_ref: None,
        })
        .unwrap_or_default()
}

pub struct PgDeviceDirectory {
    pool: PgPool,
}

impl PgDeviceDirectory {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DeviceDirectory for PgDeviceDirectory {
    async fn find(&self, device_id: &str) -> Result<Option<Device>> {
        let query = r#"
            SELECT id, external_id, owner_id, owner_email
            FROM devices
            WHERE id = $1 OR external_id = $1
            ORDER BY (id = $1) DESC
            LIMIT 1
            "#;

        let device = sqlx::query_as::<_, Device>(query)
            .bind(device_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(device)
    }
}

/// Fixed device list, for tests and deployments without account management.
#[derive(Debug, Clone, Default)]
pub struct StaticDirectory {
    devices: Vec<Device>,
}

impl StaticDirectory {
    pub fn new(devices: Vec<Device>) -> Self {
        Self { devices }
    }
}

#[async_trait]
impl DeviceDirectory for StaticDirectory {
    async fn find(&self, device_id: &str) -> Result<Option<Device>> {
        let exact = self.devices.iter().find(|d| d.id == device_id);
        let by_external = || {
            self.devices
                .iter()
                .find(|d| d.external_id.as_deref() == Some(device_id))
        };
        Ok(exact.or_else(by_external).cloned())
    }
}

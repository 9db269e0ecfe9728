//! Ingestion gateway: validates inbound telemetry, records it in the event
//! store and republishes it on the event bus.

pub mod config;
pub mod db;
pub mod directory;
pub mod errors;
pub mod ingest;
pub mod metrics;
pub mod rest;
pub mod store;

pub use errors::{Error, IngestError, Result};
pub use ingest::Gateway;

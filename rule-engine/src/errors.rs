use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// A consumed message that is not a telemetry event.
    #[error("Decode error: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("Alert write error: {0}")]
    AlertWrite(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Database migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Bus error: {0}")]
    Bus(#[from] telemetry::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

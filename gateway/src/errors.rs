use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Database migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Failure of a single ingest call, naming the step that failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IngestError {
    /// Malformed or incomplete payload. Neither store nor bus was touched.
    #[error("validation error: {0}")]
    Validation(String),

    /// The event could not be persisted and was not published.
    #[error("store error: {0}")]
    Store(String),

    /// The event is persisted but was not published.
    #[error("bus error: {0}")]
    Bus(String),
}

impl IngestError {
    /// Whether the caller is at fault.
    pub fn is_client_error(&self) -> bool {
        matches!(self, IngestError::Validation(_))
    }
}

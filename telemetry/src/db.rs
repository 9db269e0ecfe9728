use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;
use tracing::info;

/// Connection pool shared by the services. Each service applies its own
/// migrations on top.
pub async fn connect_pool(database_url: &str) -> sqlx::Result<PgPool> {
    info!("Connecting to database...");
    let pool = PgPoolOptions::new()
        .max_connections(20)
        .acquire_timeout(Duration::from_secs(10))
        .connect(database_url)
        .await?;
    info!("Database connection established");
    Ok(pool)
}

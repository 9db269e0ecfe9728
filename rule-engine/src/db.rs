use crate::errors::Result;
use sqlx::postgres::PgPool;
use tracing::info;

pub async fn make_pool(database_url: &str) -> Result<PgPool> {
    let pool = telemetry::db::connect_pool(database_url).await?;

    info!("Running database migrations...");
    // the database is shared with the other service's migrations
    let mut migrator = sqlx::migrate!("./migrations");
    migrator.set_ignore_missing(true);
    migrator.run(&pool).await?;
    info!("Migrations completed");

    Ok(pool)
}

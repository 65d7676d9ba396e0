use sqlx::{postgres::PgPoolOptions, PgPool};
use std::time::Duration;

pub mod degradation;
pub mod idempotency;
pub mod jobs;

/// Initialize PostgreSQL connection pool
pub async fn init_pool(database_url: &str) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(20)
        .min_connections(5)
        .acquire_timeout(Duration::from_secs(10))
        .idle_timeout(Duration::from_secs(600))
        .max_lifetime(Duration::from_secs(1800))
        .connect(database_url)
        .await
}

/// Run database migrations
pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::Error> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(|e| sqlx::Error::Migrate(Box::new(e)))
}

/// Delete records past their `expires_at`. The document-store analogue of a
/// TTL index; runs periodically from the server process.
pub async fn reap_expired(pool: &PgPool) -> Result<u64, sqlx::Error> {
    let idempotency = sqlx::query("DELETE FROM idempotency_records WHERE expires_at <= NOW()")
        .execute(pool)
        .await?
        .rows_affected();
    let degradation = sqlx::query("DELETE FROM degradation_records WHERE expires_at <= NOW()")
        .execute(pool)
        .await?
        .rows_affected();

    let total = idempotency + degradation;
    if total > 0 {
        tracing::info!(idempotency, degradation, "reaped expired records");
    }
    Ok(total)
}

/// Spawn the background reaper loop.
pub fn spawn_reaper(pool: PgPool, interval: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            if let Err(e) = reap_expired(&pool).await {
                tracing::error!(error = %e, "expired-record reaper failed");
            }
        }
    })
}

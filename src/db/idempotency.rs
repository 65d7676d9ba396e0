//! Idempotency store: completed results keyed by idempotency key.
//!
//! Records are upserts with a TTL; reads never return expired rows. Last
//! writer wins on concurrent stores to the same key.

use async_trait::async_trait;
use chrono::{Duration, Utc};
use serde::Serialize;
use sqlx::{PgPool, Row};

use crate::models::analysis::AnalysisResponse;
use crate::pipeline::CompletionCache;
use crate::services::errors::AnalysisError;

/// Short key prefix for logs. Keys may be client-supplied, so this cuts on
/// character boundaries.
fn key_prefix(key: &str) -> String {
    key.chars().take(16).collect()
}

#[derive(Debug, Clone, Serialize)]
pub struct IdempotencyStats {
    pub total_keys: u64,
    pub active_keys: u64,
    pub expired_keys: u64,
}

#[derive(Clone)]
pub struct IdempotencyStore {
    pool: PgPool,
    ttl_secs: u64,
}

impl IdempotencyStore {
    pub fn new(pool: PgPool, ttl_secs: u64) -> Self {
        Self { pool, ttl_secs }
    }

    /// Upsert a result under `key` with this store's TTL.
    pub async fn store(&self, key: &str, value: &serde_json::Value) -> Result<(), sqlx::Error> {
        let expires_at = Utc::now() + Duration::seconds(self.ttl_secs as i64);
        sqlx::query(
            r#"
            INSERT INTO idempotency_records (key, value, expires_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (key) DO UPDATE
            SET value = EXCLUDED.value,
                expires_at = EXCLUDED.expires_at,
                created_at = NOW()
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(expires_at)
        .execute(&self.pool)
        .await?;

        tracing::debug!(key = %key_prefix(key), ttl_secs = self.ttl_secs, "result cached");
        Ok(())
    }

    /// Fetch a live record; expired rows are treated as absent.
    pub async fn get(&self, key: &str) -> Result<Option<serde_json::Value>, sqlx::Error> {
        let row = sqlx::query(
            "SELECT value FROM idempotency_records WHERE key = $1 AND expires_at > NOW()",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| r.try_get("value")).transpose()
    }

    pub async fn has(&self, key: &str) -> Result<bool, sqlx::Error> {
        Ok(self.get(key).await?.is_some())
    }

    pub async fn delete(&self, key: &str) -> Result<bool, sqlx::Error> {
        let result = sqlx::query("DELETE FROM idempotency_records WHERE key = $1")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn stats(&self) -> Result<IdempotencyStats, sqlx::Error> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS total,
                   COUNT(*) FILTER (WHERE expires_at > NOW()) AS active
            FROM idempotency_records
            "#,
        )
        .fetch_one(&self.pool)
        .await?;
        let total: i64 = row.try_get("total")?;
        let active: i64 = row.try_get("active")?;
        Ok(IdempotencyStats {
            total_keys: total as u64,
            active_keys: active as u64,
            expired_keys: (total - active) as u64,
        })
    }
}

#[async_trait]
impl CompletionCache for IdempotencyStore {
    async fn store_completed(
        &self,
        key: &str,
        result: &AnalysisResponse,
    ) -> Result<(), AnalysisError> {
        let value = serde_json::to_value(result)?;
        IdempotencyStore::store(self, key, &value).await?;
        Ok(())
    }
}

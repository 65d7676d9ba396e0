//! Graceful-degradation cache: successful analyses keyed by
//! `(policy_type, content_hash)`.
//!
//! Consulted only when the primary pipeline cannot produce a fresh result.
//! The longer TTL reflects that a stale-but-valid report beats no report
//! when every provider is down.

use async_trait::async_trait;
use chrono::{Duration, Utc};
use sqlx::{PgPool, Row};

use crate::models::analysis::{AnalysisResponse, PolicyType};
use crate::pipeline::FallbackCache;
use crate::services::errors::AnalysisError;

#[derive(Clone)]
pub struct DegradationStore {
    pool: PgPool,
    ttl_secs: u64,
}

impl DegradationStore {
    pub fn new(pool: PgPool, ttl_secs: u64) -> Self {
        Self { pool, ttl_secs }
    }

    /// Upsert a successful analysis for future fallback use.
    pub async fn store(
        &self,
        policy_type: PolicyType,
        content_hash: &str,
        result: &serde_json::Value,
    ) -> Result<(), sqlx::Error> {
        let expires_at = Utc::now() + Duration::seconds(self.ttl_secs as i64);
        sqlx::query(
            r#"
            INSERT INTO degradation_records (policy_type, content_hash, result, expires_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (policy_type, content_hash) DO UPDATE
            SET result = EXCLUDED.result,
                expires_at = EXCLUDED.expires_at,
                created_at = NOW()
            "#,
        )
        .bind(policy_type.to_string())
        .bind(content_hash)
        .bind(result)
        .bind(expires_at)
        .execute(&self.pool)
        .await?;

        tracing::debug!(
            policy_type = %policy_type,
            content_hash = %&content_hash[..content_hash.len().min(12)],
            "fallback result cached"
        );
        Ok(())
    }

    /// Strict-equality lookup on `(policy_type, content_hash)`.
    pub async fn find(
        &self,
        policy_type: PolicyType,
        content_hash: &str,
    ) -> Result<Option<serde_json::Value>, sqlx::Error> {
        let row = sqlx::query(
            r#"
            SELECT result FROM degradation_records
            WHERE policy_type = $1 AND content_hash = $2 AND expires_at > NOW()
            "#,
        )
        .bind(policy_type.to_string())
        .bind(content_hash)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| r.try_get("result")).transpose()
    }

    /// Drop every cached result for a policy type.
    pub async fn clear(&self, policy_type: PolicyType) -> Result<u64, sqlx::Error> {
        let result = sqlx::query("DELETE FROM degradation_records WHERE policy_type = $1")
            .bind(policy_type.to_string())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl FallbackCache for DegradationStore {
    async fn find_fallback(
        &self,
        policy_type: PolicyType,
        content_hash: &str,
    ) -> Result<Option<AnalysisResponse>, AnalysisError> {
        let value = DegradationStore::find(self, policy_type, content_hash).await?;
        match value {
            Some(v) => Ok(serde_json::from_value(v).ok()),
            None => Ok(None),
        }
    }

    async fn store_fallback(
        &self,
        policy_type: PolicyType,
        content_hash: &str,
        result: &AnalysisResponse,
    ) -> Result<(), AnalysisError> {
        let value = serde_json::to_value(result)?;
        DegradationStore::store(self, policy_type, content_hash, &value).await?;
        Ok(())
    }
}

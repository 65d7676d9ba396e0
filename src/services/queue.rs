use chrono::Utc;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::analysis::PolicyType;

const QUEUE_KEY: &str = "policy_audit:jobs";
const PROCESSING_KEY: &str = "policy_audit:processing";
const DELAYED_KEY: &str = "policy_audit:jobs:delayed";

/// Job payload serialized onto the broker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedJob {
    pub job_id: Uuid,
    pub shop_name: String,
    pub shop_specialization: String,
    pub policy_type: PolicyType,
    pub policy_text: String,
    pub idempotency_key: String,
    pub content_hash: String,
}

/// Redis-backed work broker with delayed re-delivery for retries.
pub struct JobQueue {
    client: redis::Client,
}

impl JobQueue {
    pub fn new(redis_url: &str) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url).map_err(QueueError::Redis)?;
        Ok(Self { client })
    }

    pub fn from_client(client: redis::Client) -> Self {
        Self { client }
    }

    /// Enqueue a job for immediate delivery.
    pub async fn enqueue(&self, job: &QueuedJob) -> Result<(), QueueError> {
        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(QueueError::Redis)?;
        let payload = serde_json::to_string(job).map_err(QueueError::Serialize)?;
        conn.lpush::<_, _, ()>(QUEUE_KEY, &payload)
            .await
            .map_err(QueueError::Redis)?;
        Ok(())
    }

    /// Schedule a job for delivery after `delay_secs` (retry backoff).
    pub async fn enqueue_delayed(&self, job: &QueuedJob, delay_secs: u64) -> Result<(), QueueError> {
        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(QueueError::Redis)?;
        let payload = serde_json::to_string(job).map_err(QueueError::Serialize)?;
        let due_at = Utc::now().timestamp() + delay_secs as i64;
        conn.zadd::<_, _, _, ()>(DELAYED_KEY, &payload, due_at)
            .await
            .map_err(QueueError::Redis)?;
        Ok(())
    }

    /// Move due delayed jobs onto the main queue. Called by the worker loop
    /// before each poll.
    pub async fn promote_due(&self) -> Result<usize, QueueError> {
        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(QueueError::Redis)?;
        let now = Utc::now().timestamp();

        let due: Vec<String> = conn
            .zrangebyscore(DELAYED_KEY, 0, now)
            .await
            .map_err(QueueError::Redis)?;

        let mut promoted = 0;
        for payload in due {
            // Only the member that we actually removed gets re-queued, so a
            // concurrent worker promoting the same set cannot duplicate it.
            let removed: u64 = conn
                .zrem(DELAYED_KEY, &payload)
                .await
                .map_err(QueueError::Redis)?;
            if removed > 0 {
                conn.lpush::<_, _, ()>(QUEUE_KEY, &payload)
                    .await
                    .map_err(QueueError::Redis)?;
                promoted += 1;
            }
        }
        Ok(promoted)
    }

    /// Dequeue a job for processing (pop with move to the processing list).
    pub async fn dequeue(&self) -> Result<Option<QueuedJob>, QueueError> {
        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(QueueError::Redis)?;
        let result: Option<String> = conn
            .rpoplpush(QUEUE_KEY, PROCESSING_KEY)
            .await
            .map_err(QueueError::Redis)?;

        match result {
            Some(payload) => {
                let job: QueuedJob =
                    serde_json::from_str(&payload).map_err(QueueError::Serialize)?;
                Ok(Some(job))
            }
            None => Ok(None),
        }
    }

    /// Acknowledge a job (remove from the processing list).
    pub async fn complete(&self, job: &QueuedJob) -> Result<(), QueueError> {
        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(QueueError::Redis)?;
        let payload = serde_json::to_string(job).map_err(QueueError::Serialize)?;
        conn.lrem::<_, _, ()>(PROCESSING_KEY, 1, &payload)
            .await
            .map_err(QueueError::Redis)?;
        Ok(())
    }

    /// Check Redis connectivity (for health checks).
    pub async fn health_check(&self) -> Result<(), QueueError> {
        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(QueueError::Redis)?;
        redis::cmd("PING")
            .query_async::<String>(&mut conn)
            .await
            .map_err(QueueError::Redis)?;
        Ok(())
    }

    /// Current queue depth (pending jobs, not counting delayed).
    pub async fn depth(&self) -> Result<u64, QueueError> {
        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(QueueError::Redis)?;
        let depth: u64 = conn.llen(QUEUE_KEY).await.map_err(QueueError::Redis)?;
        Ok(depth)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

use std::net::SocketAddr;

use axum::extract::{ConnectInfo, Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use garde::Validate;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::app_state::AppState;
use crate::db::jobs;
use crate::models::analysis::AnalysisRequest;
use crate::models::job::{JobError, JobProgress, JobStatus};
use crate::services::fingerprint;
use crate::services::queue::QueuedJob;

const IDEMPOTENCY_KEY_HEADER: &str = "x-idempotency-key";

#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum SubmitResponse {
    /// Idempotency hit: the completed result is returned immediately.
    Cached {
        status: &'static str,
        from_cache: bool,
        result: serde_json::Value,
        idempotency_key: String,
    },
    /// Work enqueued; poll or stream by `task_id`.
    Enqueued {
        status: &'static str,
        task_id: Uuid,
        idempotency_key: String,
    },
}

#[derive(Debug, Serialize)]
pub struct TaskSnapshotResponse {
    pub task_id: Uuid,
    pub status: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<JobProgress>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JobError>,
}

#[derive(Debug, Serialize)]
pub struct CancelResponse {
    pub task_id: Uuid,
    pub status: &'static str,
}

/// Force-new payload: the submission inputs plus an optional explicit key.
#[derive(Debug, Deserialize)]
pub struct ForceAnalysisRequest {
    #[serde(default)]
    pub idempotency_key: Option<String>,
    #[serde(flatten)]
    pub request: AnalysisRequest,
}

/// POST /api/v1/analyze — submit a policy for compliance analysis.
pub async fn submit_analysis(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<AnalysisRequest>,
) -> Result<Json<SubmitResponse>, (StatusCode, String)> {
    if let Err(e) = request.validate() {
        return Err((StatusCode::BAD_REQUEST, format!("Invalid request: {e}")));
    }

    // A client-supplied key is accepted as-is; otherwise derive one from the
    // normalized inputs.
    let idempotency_key = headers
        .get(IDEMPOTENCY_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
        .unwrap_or_else(|| {
            fingerprint::idempotency_key(
                &request.shop_name,
                &request.shop_specialization,
                request.policy_type,
                &request.policy_text,
            )
        });

    let cached = state
        .idempotency
        .get(&idempotency_key)
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, format!("Store error: {e}")))?;

    if let Some(result) = cached {
        tracing::info!(
            shop_name = %request.shop_name,
            key = %idempotency_key.chars().take(16).collect::<String>(),
            "idempotency hit, returning cached result"
        );
        return Ok(Json(SubmitResponse::Cached {
            status: "completed",
            from_cache: true,
            result,
            idempotency_key,
        }));
    }

    enqueue_job(&state, request, idempotency_key).await
}

/// POST /api/v1/analyze/force — re-run ignoring the idempotency cache.
/// Rate-limited per origin; the result still refreshes both caches.
pub async fn force_analysis(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(payload): Json<ForceAnalysisRequest>,
) -> Result<Json<SubmitResponse>, (StatusCode, String)> {
    if let Err(e) = payload.request.validate() {
        return Err((StatusCode::BAD_REQUEST, format!("Invalid request: {e}")));
    }

    let allowed = force_new_allowed(&state, &addr.ip().to_string())
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, format!("Rate limit error: {e}")))?;
    if !allowed {
        return Err((
            StatusCode::TOO_MANY_REQUESTS,
            format!(
                "quota_exceeded: at most {} forced analyses per hour",
                state.config.force_new_limit
            ),
        ));
    }

    let request = payload.request;
    let idempotency_key = payload.idempotency_key.unwrap_or_else(|| {
        fingerprint::idempotency_key(
            &request.shop_name,
            &request.shop_specialization,
            request.policy_type,
            &request.policy_text,
        )
    });

    tracing::info!(shop_name = %request.shop_name, "forced analysis, bypassing idempotency cache");
    enqueue_job(&state, request, idempotency_key).await
}

async fn enqueue_job(
    state: &AppState,
    request: AnalysisRequest,
    idempotency_key: String,
) -> Result<Json<SubmitResponse>, (StatusCode, String)> {
    let job_id = Uuid::new_v4();
    let content_hash = fingerprint::content_hash(&request.policy_text);

    jobs::create_job(
        &state.db,
        job_id,
        &request.shop_name,
        &request.shop_specialization,
        request.policy_type,
        &request.policy_text,
        &idempotency_key,
        &content_hash,
    )
    .await
    .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, format!("Database error: {e}")))?;

    let queued = QueuedJob {
        job_id,
        shop_name: request.shop_name.clone(),
        shop_specialization: request.shop_specialization.clone(),
        policy_type: request.policy_type,
        policy_text: request.policy_text.clone(),
        idempotency_key: idempotency_key.clone(),
        content_hash,
    };

    state
        .queue
        .enqueue(&queued)
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, format!("Queue error: {e}")))?;

    metrics::counter!("analysis_jobs_total").increment(1);
    tracing::info!(
        job_id = %job_id,
        shop_name = %request.shop_name,
        policy_type = %request.policy_type,
        "analysis job created and queued"
    );

    Ok(Json(SubmitResponse::Enqueued {
        status: "pending",
        task_id: job_id,
        idempotency_key,
    }))
}

/// GET /api/v1/tasks/{task_id} — current job snapshot.
pub async fn get_task_status(
    State(state): State<AppState>,
    Path(task_id): Path<Uuid>,
) -> Result<Json<TaskSnapshotResponse>, (StatusCode, String)> {
    let job = jobs::get_job(&state.db, task_id)
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, format!("Database error: {e}")))?
        .ok_or((StatusCode::NOT_FOUND, "Task not found".to_string()))?;

    Ok(Json(TaskSnapshotResponse {
        task_id: job.id,
        status: job.status,
        progress: job.progress,
        result: job.result,
        error: job.error,
    }))
}

/// DELETE /api/v1/tasks/{task_id} — best-effort cancellation.
pub async fn cancel_task(
    State(state): State<AppState>,
    Path(task_id): Path<Uuid>,
) -> Result<Json<CancelResponse>, (StatusCode, String)> {
    let accepted = jobs::request_cancel(&state.db, task_id)
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, format!("Database error: {e}")))?;

    if !accepted {
        return Err((
            StatusCode::CONFLICT,
            "Task not found or already finished".to_string(),
        ));
    }

    tracing::info!(job_id = %task_id, "cancellation requested");
    Ok(Json(CancelResponse {
        task_id,
        status: "cancelling",
    }))
}

/// Sliding per-origin counter for forced re-analysis. First request in a
/// window creates the key; the window expires as a whole.
async fn force_new_allowed(state: &AppState, origin: &str) -> Result<bool, redis::RedisError> {
    let mut conn = state.redis.get_multiplexed_async_connection().await?;
    let key = format!("force_new:{origin}");
    let count: u32 = conn.incr(&key, 1u32).await?;
    if count == 1 {
        let _: () = conn
            .expire(&key, state.config.force_new_window_secs as i64)
            .await?;
    }
    Ok(count <= state.config.force_new_limit)
}

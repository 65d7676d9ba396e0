//! Job store queries.
//!
//! A job row is the single source of truth for a job's lifecycle: the
//! snapshot endpoint reads it, the worker mutates it, and late stream
//! subscribers replay the terminal state from it.

use std::str::FromStr;

use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::models::analysis::PolicyType;
use crate::models::job::{AnalysisJob, JobError, JobProgress, JobStatus};

fn job_from_row(row: &PgRow) -> Result<AnalysisJob, sqlx::Error> {
    let policy_type_raw: String = row.try_get("policy_type")?;
    let policy_type = PolicyType::from_str(&policy_type_raw)
        .map_err(|e| sqlx::Error::Decode(Box::new(e)))?;

    let status_raw: String = row.try_get("status")?;

    let progress = match (
        row.try_get::<Option<i32>, _>("progress_current")?,
        row.try_get::<Option<i32>, _>("progress_total")?,
    ) {
        (Some(current), Some(total)) => Some(JobProgress {
            current: current as u32,
            total: total as u32,
            status: row
                .try_get::<Option<String>, _>("progress_message")?
                .unwrap_or_default(),
        }),
        _ => None,
    };

    let completed_stages: serde_json::Value = row.try_get("completed_stages")?;
    let completed_stages: Vec<String> =
        serde_json::from_value(completed_stages).unwrap_or_default();

    let error: Option<serde_json::Value> = row.try_get("error")?;
    let error: Option<JobError> = error.and_then(|v| serde_json::from_value(v).ok());

    Ok(AnalysisJob {
        id: row.try_get("id")?,
        status: JobStatus::parse(&status_raw),
        shop_name: row.try_get("shop_name")?,
        shop_specialization: row.try_get("shop_specialization")?,
        policy_type,
        policy_text: row.try_get("policy_text")?,
        idempotency_key: row.try_get("idempotency_key")?,
        content_hash: row.try_get("content_hash")?,
        progress,
        completed_stages,
        result: row.try_get("result")?,
        error,
        retry_count: row.try_get("retry_count")?,
        cancel_requested: row.try_get("cancel_requested")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

/// Insert a new pending job.
#[allow(clippy::too_many_arguments)]
pub async fn create_job(
    pool: &PgPool,
    id: Uuid,
    shop_name: &str,
    shop_specialization: &str,
    policy_type: PolicyType,
    policy_text: &str,
    idempotency_key: &str,
    content_hash: &str,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO analysis_jobs
            (id, status, shop_name, shop_specialization, policy_type, policy_text,
             idempotency_key, content_hash)
        VALUES ($1, 'pending', $2, $3, $4, $5, $6, $7)
        "#,
    )
    .bind(id)
    .bind(shop_name)
    .bind(shop_specialization)
    .bind(policy_type.to_string())
    .bind(policy_text)
    .bind(idempotency_key)
    .bind(content_hash)
    .execute(pool)
    .await?;
    Ok(())
}

/// Get a job by ID
pub async fn get_job(pool: &PgPool, job_id: Uuid) -> Result<Option<AnalysisJob>, sqlx::Error> {
    let row = sqlx::query("SELECT * FROM analysis_jobs WHERE id = $1")
        .bind(job_id)
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(job_from_row).transpose()
}

/// Transition to `running` (idempotent).
pub async fn mark_running(pool: &PgPool, job_id: Uuid) -> Result<(), sqlx::Error> {
    sqlx::query(
        "UPDATE analysis_jobs SET status = 'running', updated_at = NOW() WHERE id = $1",
    )
    .bind(job_id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Transition back to `pending` for a broker retry.
pub async fn mark_pending(pool: &PgPool, job_id: Uuid) -> Result<(), sqlx::Error> {
    sqlx::query(
        "UPDATE analysis_jobs SET status = 'pending', updated_at = NOW() WHERE id = $1",
    )
    .bind(job_id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Record the current stage position for the snapshot endpoint.
pub async fn update_progress(
    pool: &PgPool,
    job_id: Uuid,
    progress: &JobProgress,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        UPDATE analysis_jobs
        SET progress_current = $1,
            progress_total = $2,
            progress_message = $3,
            updated_at = NOW()
        WHERE id = $4
        "#,
    )
    .bind(progress.current as i32)
    .bind(progress.total as i32)
    .bind(&progress.status)
    .bind(job_id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Terminal success: store the result and the stage trail.
pub async fn complete_job(
    pool: &PgPool,
    job_id: Uuid,
    result: &serde_json::Value,
    completed_stages: &[String],
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        UPDATE analysis_jobs
        SET status = 'completed',
            result = $1,
            completed_stages = $2,
            updated_at = NOW()
        WHERE id = $3
        "#,
    )
    .bind(result)
    .bind(serde_json::json!(completed_stages))
    .bind(job_id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Terminal failure: store the classified error record.
pub async fn fail_job(pool: &PgPool, job_id: Uuid, error: &JobError) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        UPDATE analysis_jobs
        SET status = 'failed',
            error = $1,
            completed_stages = $2,
            updated_at = NOW()
        WHERE id = $3
        "#,
    )
    .bind(serde_json::to_value(error).unwrap_or(serde_json::Value::Null))
    .bind(serde_json::json!(error.completed_stages))
    .bind(job_id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Set the cancellation flag. Returns false when the job is unknown or
/// already terminal.
pub async fn request_cancel(pool: &PgPool, job_id: Uuid) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        r#"
        UPDATE analysis_jobs
        SET cancel_requested = TRUE, updated_at = NOW()
        WHERE id = $1 AND status IN ('pending', 'running')
        "#,
    )
    .bind(job_id)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

/// Read the cancellation flag (polled by the worker between stages).
pub async fn is_cancel_requested(pool: &PgPool, job_id: Uuid) -> Result<bool, sqlx::Error> {
    let row = sqlx::query("SELECT cancel_requested FROM analysis_jobs WHERE id = $1")
        .bind(job_id)
        .fetch_optional(pool)
        .await?;
    Ok(row
        .map(|r| r.try_get("cancel_requested"))
        .transpose()?
        .unwrap_or(false))
}

/// Increment retry count, returning the new value.
pub async fn increment_retry_count(pool: &PgPool, job_id: Uuid) -> Result<i32, sqlx::Error> {
    let row = sqlx::query(
        r#"
        UPDATE analysis_jobs
        SET retry_count = retry_count + 1, updated_at = NOW()
        WHERE id = $1
        RETURNING retry_count
        "#,
    )
    .bind(job_id)
    .fetch_one(pool)
    .await?;
    row.try_get("retry_count")
}

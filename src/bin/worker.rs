use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::PgPool;
use tokio::time::sleep;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use policy_audit::{
    config::AppConfig,
    db::{self, degradation::DegradationStore, idempotency::IdempotencyStore, jobs},
    models::analysis::AnalysisRequest,
    models::events::TaskEvent,
    models::job::{FailureKind, JobError, JobProgress},
    pipeline::{
        run_pipeline, CancelSignal, PipelineConfig, PipelineDeps, ProgressSink, StageContext,
    },
    services::analyzer::LlmAnalyzer,
    services::errors::AnalysisError,
    services::events::{EventHub, JobEventPublisher},
    services::queue::{JobQueue, QueuedJob},
    services::quota::QuotaTracker,
    services::validation,
    services::providers::{self, ProviderManager},
};

const POLL_INTERVAL_MS: u64 = 1000; // 1 second

/// Everything one worker process shares across jobs.
struct WorkerContext {
    db: PgPool,
    queue: JobQueue,
    idempotency: Arc<IdempotencyStore>,
    degradation: Arc<DegradationStore>,
    analyzer: Arc<LlmAnalyzer>,
    events: Arc<EventHub>,
    pipeline_config: PipelineConfig,
    max_retries: i32,
    retry_backoff_secs: u64,
}

#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    tracing::info!("Starting policy analysis worker");

    // Load configuration
    let config = AppConfig::from_env().expect("Failed to load configuration");

    // Initialize database
    tracing::info!("Connecting to PostgreSQL");
    let db_pool = db::init_pool(&config.database_url)
        .await
        .expect("Failed to connect to database");

    // Initialize services
    tracing::info!("Initializing services");
    let redis_client =
        redis::Client::open(config.redis_url.as_str()).expect("Failed to open Redis client");

    let queue = JobQueue::from_client(redis_client.clone());
    let quota = Arc::new(QuotaTracker::new(redis_client.clone(), &config));
    let events = Arc::new(EventHub::new(redis_client));

    let registry = Arc::new(providers::registry_from_config(&config));
    let manager = Arc::new(ProviderManager::new(
        registry,
        quota,
        providers::providers_from_config(&config),
        Duration::from_secs(config.llm_timeout_secs),
    ));
    let analyzer = Arc::new(LlmAnalyzer::new(manager));

    let ctx = WorkerContext {
        idempotency: Arc::new(IdempotencyStore::new(
            db_pool.clone(),
            config.idempotency_ttl_secs,
        )),
        degradation: Arc::new(DegradationStore::new(
            db_pool.clone(),
            config.degradation_ttl_secs,
        )),
        analyzer,
        events,
        pipeline_config: PipelineConfig::from(&config),
        max_retries: config.worker_max_retries,
        retry_backoff_secs: config.worker_retry_backoff_secs,
        db: db_pool,
        queue,
    };

    tracing::info!("Worker ready, starting job processing loop");

    // Main processing loop
    loop {
        match process_next_job(&ctx).await {
            Ok(true) => {
                tracing::debug!("Job processed, checking for next job");
            }
            Ok(false) => {
                tracing::trace!("No jobs available, sleeping");
                sleep(Duration::from_millis(POLL_INTERVAL_MS)).await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Error processing job, will retry");
                sleep(Duration::from_millis(POLL_INTERVAL_MS)).await;
            }
        }
    }
}

/// Process the next job from the queue.
/// Returns Ok(true) if a job was processed, Ok(false) if no job available.
async fn process_next_job(ctx: &WorkerContext) -> Result<bool, Box<dyn std::error::Error>> {
    // Move any due retries back onto the main queue first.
    ctx.queue.promote_due().await?;

    let job = match ctx.queue.dequeue().await? {
        Some(j) => j,
        None => return Ok(false),
    };

    tracing::info!(
        job_id = %job.job_id,
        shop_name = %job.shop_name,
        policy_type = %job.policy_type,
        "Processing analysis job"
    );

    let started = std::time::Instant::now();
    process_job(ctx, &job).await?;
    metrics::histogram!("analysis_processing_seconds").record(started.elapsed().as_secs_f64());

    Ok(true)
}

/// Drive one job to a terminal state (or back onto the delayed queue).
async fn process_job(ctx: &WorkerContext, job: &QueuedJob) -> Result<(), Box<dyn std::error::Error>> {
    let publisher = Arc::new(JobEventPublisher::new(ctx.events.clone(), job.job_id));

    // Cancellation may have arrived while the job sat in the queue.
    if jobs::is_cancel_requested(&ctx.db, job.job_id).await? {
        let error = JobError::new(FailureKind::Cancelled, "cancelled before processing started");
        finish_failed(ctx, job, &publisher, error).await?;
        return Ok(());
    }

    jobs::mark_running(&ctx.db, job.job_id).await?;

    // Pre-stage validation: reject malformed input before any stage runs.
    if let Err(validation_error) = validation::validate_submission(
        &job.shop_name,
        &job.shop_specialization,
        &job.policy_text,
    ) {
        tracing::warn!(
            job_id = %job.job_id,
            category = %validation_error.category,
            "input validation failed"
        );
        let error = JobError {
            kind: FailureKind::Validation,
            message: validation_error.message,
            details: Some(format!(
                "{}: {}",
                validation_error.category, validation_error.details
            )),
            user_action: Some(validation_error.user_action),
            completed_stages: Vec::new(),
            failed_stage: None,
        };
        finish_failed(ctx, job, &publisher, error).await?;
        return Ok(());
    }

    // Re-check the idempotency store: a concurrent worker may have finished
    // the same submission while this one waited in the queue.
    if let Some(result) = ctx.idempotency.get(&job.idempotency_key).await? {
        tracing::info!(job_id = %job.job_id, "idempotency hit on worker, skipping pipeline");
        jobs::complete_job(&ctx.db, job.job_id, &result, &[]).await?;
        publisher.publish(&TaskEvent::Completed { result }).await?;
        ctx.queue.complete(job).await?;
        metrics::counter!("analysis_jobs_completed").increment(1);
        return Ok(());
    }

    let request = AnalysisRequest {
        shop_name: job.shop_name.clone(),
        shop_specialization: job.shop_specialization.clone(),
        policy_type: job.policy_type,
        policy_text: job.policy_text.clone(),
    };

    let deps = PipelineDeps {
        analyzer: ctx.analyzer.clone(),
        completion_cache: ctx.idempotency.clone(),
        fallback_cache: ctx.degradation.clone(),
        progress: Arc::new(WorkerProgressSink {
            db: ctx.db.clone(),
            publisher: publisher.clone(),
            job_id: job.job_id,
            shop_name: job.shop_name.clone(),
        }),
        cancel: Arc::new(DbCancelSignal {
            db: ctx.db.clone(),
            job_id: job.job_id,
        }),
    };

    let mut stage_ctx = StageContext::new(
        job.job_id,
        request,
        job.idempotency_key.clone(),
        job.content_hash.clone(),
    );

    match run_pipeline(&mut stage_ctx, &deps, &ctx.pipeline_config).await {
        Ok(response) => {
            let result = serde_json::to_value(&response)?;
            jobs::complete_job(&ctx.db, job.job_id, &result, &stage_ctx.completed_stages).await?;
            publisher.publish(&TaskEvent::Completed { result }).await?;
            ctx.queue.complete(job).await?;
            metrics::counter!("analysis_jobs_completed").increment(1);

            tracing::info!(
                job_id = %job.job_id,
                success = response.success,
                from_fallback = response.served_from_fallback,
                "Job completed"
            );
        }
        Err(failure) => {
            let kind = failure.error.kind();

            // Transient failures go back to the broker with exponential
            // backoff; cancellation and non-retryable kinds fail now.
            if !matches!(failure.error, AnalysisError::Cancelled) && failure.error.retryable() {
                let retry_count = jobs::increment_retry_count(&ctx.db, job.job_id).await?;
                if retry_count <= ctx.max_retries {
                    let delay = ctx.retry_backoff_secs * 2u64.pow((retry_count - 1) as u32);
                    tracing::info!(
                        job_id = %job.job_id,
                        retry_count,
                        delay_secs = delay,
                        "Job re-queued for retry"
                    );
                    ctx.queue.enqueue_delayed(job, delay).await?;
                    ctx.queue.complete(job).await?;
                    jobs::mark_pending(&ctx.db, job.job_id).await?;
                    return Ok(());
                }
                tracing::warn!(
                    job_id = %job.job_id,
                    retry_count,
                    "Job failed after max retries"
                );
            }

            let error = JobError {
                kind,
                message: failure.error.to_string(),
                details: None,
                user_action: None,
                completed_stages: failure.completed_stages,
                failed_stage: failure.failed_stage,
            };
            finish_failed(ctx, job, &publisher, error).await?;
        }
    }

    Ok(())
}

/// Terminal failure path: persist, emit the single `failed` event, ack.
async fn finish_failed(
    ctx: &WorkerContext,
    job: &QueuedJob,
    publisher: &JobEventPublisher,
    error: JobError,
) -> Result<(), Box<dyn std::error::Error>> {
    tracing::error!(
        job_id = %job.job_id,
        kind = %error.kind,
        message = %error.message,
        "Job failed"
    );
    jobs::fail_job(&ctx.db, job.job_id, &error).await?;
    publisher.publish(&TaskEvent::failed_from(&error)).await?;
    ctx.queue.complete(job).await?;
    metrics::counter!("analysis_jobs_failed").increment(1);
    Ok(())
}

/// Progress sink: persist the stage position, then mirror it to the stream.
struct WorkerProgressSink {
    db: PgPool,
    publisher: Arc<JobEventPublisher>,
    job_id: Uuid,
    shop_name: String,
}

#[async_trait]
impl ProgressSink for WorkerProgressSink {
    async fn emit(&self, progress: &JobProgress) {
        if let Err(e) = jobs::update_progress(&self.db, self.job_id, progress).await {
            tracing::error!(job_id = %self.job_id, error = %e, "failed to persist progress");
        }
        let event = TaskEvent::Progress {
            current: progress.current,
            total: progress.total,
            status: progress.status.clone(),
            shop_name: Some(self.shop_name.clone()),
        };
        if let Err(e) = self.publisher.publish(&event).await {
            tracing::error!(job_id = %self.job_id, error = %e, "failed to publish progress event");
        }
    }
}

/// Cancellation flag backed by the job row.
struct DbCancelSignal {
    db: PgPool,
    job_id: Uuid,
}

#[async_trait]
impl CancelSignal for DbCancelSignal {
    async fn is_cancelled(&self) -> bool {
        jobs::is_cancel_requested(&self.db, self.job_id)
            .await
            .unwrap_or(false)
    }
}

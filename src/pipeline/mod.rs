//! The staged analysis pipeline.
//!
//! Five stages run in order on a shared context. Each stage is a plain
//! record with a guard predicate and an action dispatched by key; guards are
//! evaluated at dispatch time, so a stage sees every upstream result.
//! Skipped stages still advance progress by one step, and an early exit
//! emits the remaining skip-progress events so `current` always reaches
//! `total` before the terminal event.
//!
//! Pipeline dependencies are trait objects, which keeps the executor
//! testable against in-memory fakes.

pub mod stages;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use crate::config::AppConfig;
use crate::models::analysis::{
    AnalysisRequest, AnalysisResponse, ComplianceReport, ImprovedPolicy, PolicyMatch, PolicyType,
};
use crate::models::job::JobProgress;
use crate::services::analyzer::PolicyAnalyzer;
use crate::services::errors::AnalysisError;

use stages::{execute_stage, should_run, StageSpec, STAGES};

/// Write access to the idempotency store (C2) from the finalization stage.
#[async_trait]
pub trait CompletionCache: Send + Sync {
    async fn store_completed(
        &self,
        key: &str,
        result: &AnalysisResponse,
    ) -> Result<(), AnalysisError>;
}

/// The graceful-degradation cache (C3) as the pipeline sees it.
#[async_trait]
pub trait FallbackCache: Send + Sync {
    async fn find_fallback(
        &self,
        policy_type: PolicyType,
        content_hash: &str,
    ) -> Result<Option<AnalysisResponse>, AnalysisError>;

    async fn store_fallback(
        &self,
        policy_type: PolicyType,
        content_hash: &str,
        result: &AnalysisResponse,
    ) -> Result<(), AnalysisError>;
}

/// Receives one progress update per stage transition.
#[async_trait]
pub trait ProgressSink: Send + Sync {
    async fn emit(&self, progress: &JobProgress);
}

/// Cooperative cancellation flag, polled at stage boundaries.
#[async_trait]
pub trait CancelSignal: Send + Sync {
    async fn is_cancelled(&self) -> bool;
}

/// Everything a pipeline run needs besides the context.
pub struct PipelineDeps {
    pub analyzer: Arc<dyn PolicyAnalyzer>,
    pub completion_cache: Arc<dyn CompletionCache>,
    pub fallback_cache: Arc<dyn FallbackCache>,
    pub progress: Arc<dyn ProgressSink>,
    pub cancel: Arc<dyn CancelSignal>,
}

/// Pipeline tunables, extracted from the application config.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub regeneration_threshold: f64,
    pub uncertainty_low: f64,
    pub uncertainty_high: f64,
    pub soft_deadline: Duration,
    pub hard_deadline: Duration,
}

impl From<&AppConfig> for PipelineConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            regeneration_threshold: config.compliance_regeneration_threshold,
            uncertainty_low: config.stage1_uncertainty_low,
            uncertainty_high: config.stage1_uncertainty_high,
            soft_deadline: Duration::from_secs(config.worker_soft_time_limit_secs),
            hard_deadline: Duration::from_secs(config.worker_hard_time_limit_secs),
        }
    }
}

/// Shared mutable state passed through the stages.
pub struct StageContext {
    pub job_id: Uuid,
    pub request: AnalysisRequest,
    pub idempotency_key: String,
    pub content_hash: String,

    /// Stage 0 output, drives the stage-1 guard.
    pub rule_match: Option<PolicyMatch>,
    /// Final match verdict (rule-based, possibly refined by stage 1).
    pub match_verdict: Option<PolicyMatch>,
    pub compliance_report: Option<ComplianceReport>,
    pub improved_policy: Option<ImprovedPolicy>,

    pub completed_stages: Vec<String>,
    /// Optional stages that failed but were absorbed.
    pub failed_stages: Vec<String>,

    /// Early-exit request: a pre-built terminal result instead of exception
    /// control flow.
    pub should_exit: bool,
    pub exit_result: Option<AnalysisResponse>,

    /// Set by the finalization stage.
    pub final_response: Option<AnalysisResponse>,
}

impl StageContext {
    pub fn new(
        job_id: Uuid,
        request: AnalysisRequest,
        idempotency_key: String,
        content_hash: String,
    ) -> Self {
        Self {
            job_id,
            request,
            idempotency_key,
            content_hash,
            rule_match: None,
            match_verdict: None,
            compliance_report: None,
            improved_policy: None,
            completed_stages: Vec::new(),
            failed_stages: Vec::new(),
            should_exit: false,
            exit_result: None,
            final_response: None,
        }
    }
}

/// A pipeline failure, annotated for the terminal `failed` event.
#[derive(Debug)]
pub struct PipelineFailure {
    pub error: AnalysisError,
    pub failed_stage: Option<String>,
    pub completed_stages: Vec<String>,
}

impl PipelineFailure {
    fn at(error: AnalysisError, stage: Option<&StageSpec>, ctx: &StageContext) -> Self {
        Self {
            error,
            failed_stage: stage.map(|s| s.title.to_string()),
            completed_stages: ctx.completed_stages.clone(),
        }
    }
}

pub const TOTAL_STAGES: u32 = STAGES.len() as u32;

async fn emit_progress(deps: &PipelineDeps, current: u32, status: impl Into<String>) {
    deps.progress
        .emit(&JobProgress {
            current,
            total: TOTAL_STAGES,
            status: status.into(),
        })
        .await;
}

/// Emit skip-progress events for every stage after `current` so the stream
/// reaches `current == total` before a terminal event.
async fn drain_remaining(deps: &PipelineDeps, current: u32) {
    for position in (current + 1)..=TOTAL_STAGES {
        let spec = &STAGES[(position - 1) as usize];
        emit_progress(deps, position, format!("{} (skipped)", spec.status_message)).await;
    }
}

/// Run all stages on `ctx`.
///
/// A successful return is a terminal analysis result: the regular
/// finalization output, an early-exit result, or a fallback-served result.
pub async fn run_pipeline(
    ctx: &mut StageContext,
    deps: &PipelineDeps,
    config: &PipelineConfig,
) -> Result<AnalysisResponse, PipelineFailure> {
    let mut current: u32 = 0;

    for spec in STAGES.iter() {
        // Suspension point: cancellation is observed between stages.
        if deps.cancel.is_cancelled().await {
            tracing::info!(job_id = %ctx.job_id, "cancellation observed, aborting pipeline");
            return Err(PipelineFailure::at(AnalysisError::Cancelled, None, ctx));
        }

        current += 1;

        if !should_run(spec.key, ctx, config) {
            tracing::info!(
                job_id = %ctx.job_id,
                stage = spec.title,
                "stage skipped (guard not met)"
            );
            emit_progress(deps, current, format!("{} (skipped)", spec.status_message)).await;
            continue;
        }

        emit_progress(deps, current, spec.status_message).await;
        tracing::info!(job_id = %ctx.job_id, stage = spec.title, "stage starting");

        let started = std::time::Instant::now();
        let outcome = match tokio::time::timeout(
            config.hard_deadline,
            execute_stage(spec.key, ctx, deps, config),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(AnalysisError::classified(
                crate::models::job::FailureKind::Timeout,
                format!(
                    "stage {} exceeded the {}s hard deadline",
                    spec.title,
                    config.hard_deadline.as_secs()
                ),
            )),
        };
        let elapsed = started.elapsed();
        if elapsed > config.soft_deadline {
            tracing::warn!(
                job_id = %ctx.job_id,
                stage = spec.title,
                elapsed_secs = elapsed.as_secs(),
                "stage exceeded soft deadline"
            );
        }

        match outcome {
            Ok(()) => {
                ctx.completed_stages.push(spec.title.to_string());
                if ctx.should_exit {
                    let exit_result = ctx.exit_result.take().ok_or_else(|| {
                        PipelineFailure::at(
                            AnalysisError::MissingData(
                                "early exit requested without a result".to_string(),
                            ),
                            Some(spec),
                            ctx,
                        )
                    })?;
                    drain_remaining(deps, current).await;
                    return Ok(exit_result);
                }
            }
            Err(AnalysisError::Cancelled) => {
                return Err(PipelineFailure::at(AnalysisError::Cancelled, Some(spec), ctx));
            }
            Err(error) => {
                tracing::error!(
                    job_id = %ctx.job_id,
                    stage = spec.title,
                    kind = %error.kind(),
                    error = %error,
                    "stage failed"
                );

                if spec.required {
                    // Graceful degradation: a previously successful analysis
                    // for the same content beats failing the job.
                    let fallback = deps
                        .fallback_cache
                        .find_fallback(ctx.request.policy_type, &ctx.content_hash)
                        .await
                        .unwrap_or_else(|e| {
                            tracing::error!(job_id = %ctx.job_id, error = %e, "fallback lookup failed");
                            None
                        });

                    if let Some(mut cached) = fallback {
                        tracing::info!(
                            job_id = %ctx.job_id,
                            stage = spec.title,
                            "serving cached result after required-stage failure"
                        );
                        metrics::counter!("analysis_fallback_served_total").increment(1);
                        cached.served_from_fallback = true;
                        cached.from_cache = false;
                        drain_remaining(deps, current).await;
                        return Ok(cached);
                    }

                    return Err(PipelineFailure::at(error, Some(spec), ctx));
                }

                tracing::warn!(
                    job_id = %ctx.job_id,
                    stage = spec.title,
                    "optional stage failed, continuing"
                );
                ctx.failed_stages.push(spec.title.to_string());
            }
        }
    }

    // Final progress tick so every stream ends on current == total.
    emit_progress(deps, TOTAL_STAGES, "Analysis complete").await;

    ctx.final_response.take().ok_or_else(|| {
        PipelineFailure::at(
            AnalysisError::MissingData("finalization produced no result".to_string()),
            None,
            ctx,
        )
    })
}

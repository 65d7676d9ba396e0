//! The five pipeline stages: guard predicates and actions.

use chrono::Utc;

use crate::models::analysis::{AnalysisResponse, PolicyMatch};
use crate::models::job::FailureKind;
use crate::services::errors::AnalysisError;
use crate::services::policy_rules;

use super::{PipelineConfig, PipelineDeps, StageContext};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageKey {
    RuleMatch,
    LlmMatch,
    ComplianceAnalysis,
    PolicyRegeneration,
    Finalization,
}

/// A stage as a value: key, wire title, user-facing status, required flag.
/// Guards and actions are dispatched over the key.
pub struct StageSpec {
    pub key: StageKey,
    pub title: &'static str,
    pub status_message: &'static str,
    pub required: bool,
}

pub const STAGES: [StageSpec; 5] = [
    StageSpec {
        key: StageKey::RuleMatch,
        title: "rule_match",
        status_message: "Validating policy type...",
        required: true,
    },
    StageSpec {
        key: StageKey::LlmMatch,
        title: "llm_match",
        status_message: "Verifying policy match with AI...",
        required: false,
    },
    StageSpec {
        key: StageKey::ComplianceAnalysis,
        title: "compliance_analysis",
        status_message: "Analyzing legal compliance...",
        required: true,
    },
    StageSpec {
        key: StageKey::PolicyRegeneration,
        title: "policy_regeneration",
        status_message: "Rewriting improved policy...",
        required: false,
    },
    StageSpec {
        key: StageKey::Finalization,
        title: "finalization",
        status_message: "Finalizing analysis...",
        required: true,
    },
];

/// Guard predicate, evaluated at dispatch time against the live context.
pub fn should_run(key: StageKey, ctx: &StageContext, config: &PipelineConfig) -> bool {
    match key {
        StageKey::RuleMatch | StageKey::ComplianceAnalysis | StageKey::Finalization => true,
        // Only consult the LLM when the rule-based confidence is genuinely
        // uncertain (open interval).
        StageKey::LlmMatch => ctx.rule_match.as_ref().is_some_and(|m| {
            m.confidence > config.uncertainty_low && m.confidence < config.uncertainty_high
        }),
        StageKey::PolicyRegeneration => ctx
            .compliance_report
            .as_ref()
            .is_some_and(|r| r.overall_compliance_ratio < config.regeneration_threshold),
    }
}

/// Terminal result for a policy that does not match its declared type.
fn non_compliance_result(ctx: &StageContext, policy_match: PolicyMatch) -> AnalysisResponse {
    AnalysisResponse {
        success: false,
        message: format!(
            "The submitted text does not match the declared policy type: {}",
            policy_match.reason
        ),
        policy_match: Some(policy_match),
        compliance_report: None,
        improved_policy: None,
        shop_name: ctx.request.shop_name.clone(),
        shop_specialization: ctx.request.shop_specialization.clone(),
        policy_type: ctx.request.policy_type,
        analysis_timestamp: Utc::now(),
        from_cache: false,
        served_from_fallback: false,
        warnings: Vec::new(),
    }
}

/// On a confirmed mismatch, prefer a cached analysis of the same content
/// over rejecting outright; otherwise exit with the non-compliance result.
async fn exit_for_mismatch(
    ctx: &mut StageContext,
    deps: &PipelineDeps,
    policy_match: PolicyMatch,
) {
    let fallback = deps
        .fallback_cache
        .find_fallback(ctx.request.policy_type, &ctx.content_hash)
        .await
        .unwrap_or_else(|e| {
            tracing::error!(job_id = %ctx.job_id, error = %e, "fallback lookup failed");
            None
        });

    ctx.should_exit = true;
    ctx.exit_result = Some(match fallback {
        Some(mut cached) => {
            tracing::info!(job_id = %ctx.job_id, "mismatch resolved from fallback cache");
            cached.served_from_fallback = true;
            cached.from_cache = false;
            cached
        }
        None => non_compliance_result(ctx, policy_match),
    });
}

/// Execute one stage, mutating the context.
pub async fn execute_stage(
    key: StageKey,
    ctx: &mut StageContext,
    deps: &PipelineDeps,
    config: &PipelineConfig,
) -> Result<(), AnalysisError> {
    match key {
        StageKey::RuleMatch => rule_match(ctx, deps).await,
        StageKey::LlmMatch => llm_match(ctx, deps).await,
        StageKey::ComplianceAnalysis => compliance_analysis(ctx, deps).await,
        StageKey::PolicyRegeneration => policy_regeneration(ctx, deps).await,
        StageKey::Finalization => finalization(ctx, deps, config).await,
    }
}

/// Stage 0: rule-based policy match, no LLM involved.
async fn rule_match(ctx: &mut StageContext, deps: &PipelineDeps) -> Result<(), AnalysisError> {
    let verdict = policy_rules::match_policy(ctx.request.policy_type, &ctx.request.policy_text);
    tracing::info!(
        job_id = %ctx.job_id,
        verdict = %verdict.verdict,
        confidence = verdict.confidence,
        "rule-based match scored"
    );

    ctx.rule_match = Some(verdict.clone());

    if verdict.verdict == crate::models::analysis::MatchVerdict::Mismatch {
        exit_for_mismatch(ctx, deps, verdict).await;
        return Ok(());
    }

    ctx.match_verdict = Some(verdict);
    Ok(())
}

/// Stage 1: LLM-assisted match refinement for the uncertain band.
///
/// Failure here is absorbed by the executor (optional stage); the rule-based
/// verdict from stage 0 stands in that case.
async fn llm_match(ctx: &mut StageContext, deps: &PipelineDeps) -> Result<(), AnalysisError> {
    let refined = deps.analyzer.check_policy_match(&ctx.request).await?;
    tracing::info!(
        job_id = %ctx.job_id,
        verdict = %refined.verdict,
        confidence = refined.confidence,
        "LLM match verdict"
    );

    if refined.verdict == crate::models::analysis::MatchVerdict::Mismatch {
        exit_for_mismatch(ctx, deps, refined).await;
        return Ok(());
    }

    ctx.match_verdict = Some(refined);
    Ok(())
}

/// Stage 2: compliance analysis. Required; must populate the report.
async fn compliance_analysis(
    ctx: &mut StageContext,
    deps: &PipelineDeps,
) -> Result<(), AnalysisError> {
    let report = deps.analyzer.analyze_compliance(&ctx.request).await?;
    tracing::info!(
        job_id = %ctx.job_id,
        ratio = report.overall_compliance_ratio,
        grade = %report.compliance_grade,
        "compliance analysis complete"
    );
    ctx.compliance_report = Some(report);
    Ok(())
}

/// Stage 3: policy regeneration when compliance is below the threshold.
async fn policy_regeneration(
    ctx: &mut StageContext,
    deps: &PipelineDeps,
) -> Result<(), AnalysisError> {
    let report = ctx
        .compliance_report
        .as_ref()
        .ok_or_else(|| AnalysisError::MissingData("compliance report".to_string()))?;
    let improved = deps.analyzer.regenerate_policy(&ctx.request, report).await?;
    tracing::info!(
        job_id = %ctx.job_id,
        estimated_new_compliance = improved.estimated_new_compliance,
        "policy regenerated"
    );
    ctx.improved_policy = Some(improved);
    Ok(())
}

/// Stage 4: assemble the final result and write both caches.
async fn finalization(
    ctx: &mut StageContext,
    deps: &PipelineDeps,
    _config: &PipelineConfig,
) -> Result<(), AnalysisError> {
    let policy_match = ctx
        .match_verdict
        .clone()
        .ok_or_else(|| AnalysisError::MissingData("match verdict".to_string()))?;
    let report = ctx
        .compliance_report
        .clone()
        .ok_or_else(|| AnalysisError::MissingData("compliance report".to_string()))?;

    if !(0.0..=100.0).contains(&report.overall_compliance_ratio) {
        return Err(AnalysisError::classified(
            FailureKind::MissingData,
            format!(
                "compliance ratio {} outside [0, 100]",
                report.overall_compliance_ratio
            ),
        ));
    }

    let warnings = ctx
        .failed_stages
        .iter()
        .map(|stage| format!("optional stage {stage} did not complete"))
        .collect();

    let response = AnalysisResponse {
        success: true,
        message: "Analysis completed successfully".to_string(),
        policy_match: Some(policy_match),
        compliance_report: Some(report),
        improved_policy: ctx.improved_policy.clone(),
        shop_name: ctx.request.shop_name.clone(),
        shop_specialization: ctx.request.shop_specialization.clone(),
        policy_type: ctx.request.policy_type,
        analysis_timestamp: Utc::now(),
        from_cache: false,
        served_from_fallback: false,
        warnings,
    };

    // Cache writes are best-effort: a finished analysis is not discarded
    // because a store was briefly unreachable.
    if let Err(e) = deps
        .completion_cache
        .store_completed(&ctx.idempotency_key, &response)
        .await
    {
        tracing::error!(job_id = %ctx.job_id, error = %e, "idempotency store write failed");
    }
    if let Err(e) = deps
        .fallback_cache
        .store_fallback(ctx.request.policy_type, &ctx.content_hash, &response)
        .await
    {
        tracing::error!(job_id = %ctx.job_id, error = %e, "degradation store write failed");
    }

    ctx.final_response = Some(response);
    Ok(())
}

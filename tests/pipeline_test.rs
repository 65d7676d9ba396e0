//! Pipeline scenario tests against in-memory fakes.
//!
//! The pipeline's dependencies are traits, so these tests drive full runs
//! without Postgres, Redis, or live LLM providers, and assert the observable
//! contract: progress monotonicity, guard behavior, fallback serving, and
//! terminal semantics.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use policy_audit::models::analysis::{
    AnalysisRequest, AnalysisResponse, ComplianceReport, ImprovedPolicy, MatchMethod,
    MatchVerdict, PolicyMatch, PolicyType,
};
use policy_audit::models::job::{FailureKind, JobProgress};
use policy_audit::pipeline::stages::{should_run, StageKey};
use policy_audit::pipeline::{
    run_pipeline, CancelSignal, CompletionCache, FallbackCache, PipelineConfig, PipelineDeps,
    ProgressSink, StageContext, TOTAL_STAGES,
};
use policy_audit::services::analyzer::PolicyAnalyzer;
use policy_audit::services::errors::AnalysisError;
use policy_audit::services::fingerprint;

// A returns policy that the rule matcher scores confidently (stage 1 skipped).
const CLEAR_RETURNS_TEXT: &str = "Return and refund policy. Customers may return any item \
    within 14 days of delivery for a full refund or exchange. The item must be unused, \
    in its original packaging, and accompanied by proof of purchase. Exceptions: \
    clearance products. Refunds are issued to the original payment method within the \
    stated period, subject to inspection of the product condition.";

// Scores in the open uncertainty band (stage 1 runs).
const UNSURE_RETURNS_TEXT: &str = "Items may be returned for a refund. Bring your receipt \
    and the product to the service desk and a clerk will assist with the exchange or \
    refund of your purchase.";

// No returns vocabulary at all (stage 0 rejects outright).
const UNRELATED_TEXT: &str = "This document describes the history of our company and its \
    founders, going back to the early years of the workshop and its first employees.";

fn request(text: &str) -> AnalysisRequest {
    AnalysisRequest {
        shop_name: "Acme".to_string(),
        shop_specialization: "Electronics".to_string(),
        policy_type: PolicyType::Returns,
        policy_text: text.to_string(),
    }
}

fn context(text: &str) -> StageContext {
    let req = request(text);
    let key = fingerprint::idempotency_key(
        &req.shop_name,
        &req.shop_specialization,
        req.policy_type,
        &req.policy_text,
    );
    let hash = fingerprint::content_hash(&req.policy_text);
    StageContext::new(Uuid::new_v4(), req, key, hash)
}

fn config() -> PipelineConfig {
    PipelineConfig {
        regeneration_threshold: 95.0,
        uncertainty_low: 0.30,
        uncertainty_high: 0.70,
        soft_deadline: Duration::from_secs(540),
        hard_deadline: Duration::from_secs(600),
    }
}

fn report(ratio: f64) -> ComplianceReport {
    ComplianceReport {
        overall_compliance_ratio: ratio,
        compliance_grade: "B".to_string(),
        summary: "Mostly compliant".to_string(),
        critical_issues: Vec::new(),
        strengths: Vec::new(),
        weaknesses: Vec::new(),
        ambiguities: Vec::new(),
        recommendations: vec!["Clarify the refund window".to_string()],
    }
}

fn improved() -> ImprovedPolicy {
    ImprovedPolicy {
        improved_policy: "Rewritten policy text".to_string(),
        improvements_made: Vec::new(),
        estimated_new_compliance: 98.0,
    }
}

fn cached_response() -> AnalysisResponse {
    AnalysisResponse {
        success: true,
        message: "Analysis completed successfully".to_string(),
        policy_match: Some(PolicyMatch {
            verdict: MatchVerdict::Match,
            confidence: 0.9,
            reason: "cached".to_string(),
            method: MatchMethod::RuleBased,
        }),
        compliance_report: Some(report(88.0)),
        improved_policy: None,
        shop_name: "Other Shop".to_string(),
        shop_specialization: "Electronics".to_string(),
        policy_type: PolicyType::Returns,
        analysis_timestamp: Utc::now(),
        from_cache: false,
        served_from_fallback: false,
        warnings: Vec::new(),
    }
}

// ---- fakes ----

#[derive(Default)]
struct FakeAnalyzer {
    match_reply: Mutex<Option<Result<PolicyMatch, AnalysisError>>>,
    compliance_reply: Mutex<Option<Result<ComplianceReport, AnalysisError>>>,
    regen_reply: Mutex<Option<Result<ImprovedPolicy, AnalysisError>>>,
    match_calls: AtomicU32,
    compliance_calls: AtomicU32,
    regen_calls: AtomicU32,
}

#[async_trait]
impl PolicyAnalyzer for FakeAnalyzer {
    async fn check_policy_match(
        &self,
        _request: &AnalysisRequest,
    ) -> Result<PolicyMatch, AnalysisError> {
        self.match_calls.fetch_add(1, Ordering::SeqCst);
        self.match_reply
            .lock()
            .unwrap()
            .take()
            .expect("unexpected check_policy_match call")
    }

    async fn analyze_compliance(
        &self,
        _request: &AnalysisRequest,
    ) -> Result<ComplianceReport, AnalysisError> {
        self.compliance_calls.fetch_add(1, Ordering::SeqCst);
        self.compliance_reply
            .lock()
            .unwrap()
            .take()
            .expect("unexpected analyze_compliance call")
    }

    async fn regenerate_policy(
        &self,
        _request: &AnalysisRequest,
        _report: &ComplianceReport,
    ) -> Result<ImprovedPolicy, AnalysisError> {
        self.regen_calls.fetch_add(1, Ordering::SeqCst);
        self.regen_reply
            .lock()
            .unwrap()
            .take()
            .expect("unexpected regenerate_policy call")
    }
}

#[derive(Default)]
struct MemoryCompletionCache {
    entries: Mutex<HashMap<String, AnalysisResponse>>,
}

#[async_trait]
impl CompletionCache for MemoryCompletionCache {
    async fn store_completed(
        &self,
        key: &str,
        result: &AnalysisResponse,
    ) -> Result<(), AnalysisError> {
        self.entries
            .lock()
            .unwrap()
            .insert(key.to_string(), result.clone());
        Ok(())
    }
}

#[derive(Default)]
struct MemoryFallbackCache {
    entries: Mutex<HashMap<(PolicyType, String), AnalysisResponse>>,
}

#[async_trait]
impl FallbackCache for MemoryFallbackCache {
    async fn find_fallback(
        &self,
        policy_type: PolicyType,
        content_hash: &str,
    ) -> Result<Option<AnalysisResponse>, AnalysisError> {
        Ok(self
            .entries
            .lock()
            .unwrap()
            .get(&(policy_type, content_hash.to_string()))
            .cloned())
    }

    async fn store_fallback(
        &self,
        policy_type: PolicyType,
        content_hash: &str,
        result: &AnalysisResponse,
    ) -> Result<(), AnalysisError> {
        self.entries
            .lock()
            .unwrap()
            .insert((policy_type, content_hash.to_string()), result.clone());
        Ok(())
    }
}

#[derive(Default)]
struct CollectingSink {
    events: Mutex<Vec<JobProgress>>,
}

impl CollectingSink {
    fn snapshot(&self) -> Vec<JobProgress> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl ProgressSink for CollectingSink {
    async fn emit(&self, progress: &JobProgress) {
        self.events.lock().unwrap().push(progress.clone());
    }
}

#[derive(Default)]
struct FlagCancel {
    cancelled: AtomicBool,
}

#[async_trait]
impl CancelSignal for FlagCancel {
    async fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

struct Harness {
    analyzer: Arc<FakeAnalyzer>,
    completion: Arc<MemoryCompletionCache>,
    fallback: Arc<MemoryFallbackCache>,
    sink: Arc<CollectingSink>,
    cancel: Arc<FlagCancel>,
}

impl Harness {
    fn new() -> Self {
        Self {
            analyzer: Arc::new(FakeAnalyzer::default()),
            completion: Arc::new(MemoryCompletionCache::default()),
            fallback: Arc::new(MemoryFallbackCache::default()),
            sink: Arc::new(CollectingSink::default()),
            cancel: Arc::new(FlagCancel::default()),
        }
    }

    fn deps(&self) -> PipelineDeps {
        PipelineDeps {
            analyzer: self.analyzer.clone(),
            completion_cache: self.completion.clone(),
            fallback_cache: self.fallback.clone(),
            progress: self.sink.clone(),
            cancel: self.cancel.clone(),
        }
    }
}

fn assert_monotonic(events: &[JobProgress]) {
    let mut last = 0;
    for event in events {
        assert!(
            event.current >= last,
            "progress went backwards: {} after {}",
            event.current,
            last
        );
        assert_eq!(event.total, TOTAL_STAGES);
        last = event.current;
    }
}

// ---- scenarios ----

#[tokio::test]
async fn happy_path_runs_all_required_stages() {
    let harness = Harness::new();
    *harness.analyzer.compliance_reply.lock().unwrap() = Some(Ok(report(82.0)));
    *harness.analyzer.regen_reply.lock().unwrap() = Some(Ok(improved()));

    let mut ctx = context(CLEAR_RETURNS_TEXT);
    let response = run_pipeline(&mut ctx, &harness.deps(), &config())
        .await
        .expect("pipeline should succeed");

    assert!(response.success);
    let report = response.compliance_report.as_ref().expect("report present");
    assert!((0.0..=100.0).contains(&report.overall_compliance_ratio));
    assert!(response.improved_policy.is_some());
    assert!(!response.served_from_fallback);

    // Confident rule verdict: the LLM match stage was skipped entirely.
    assert_eq!(harness.analyzer.match_calls.load(Ordering::SeqCst), 0);
    assert_eq!(
        ctx.completed_stages,
        vec![
            "rule_match",
            "compliance_analysis",
            "policy_regeneration",
            "finalization"
        ]
    );

    // Progress covers every stage (skips included) and ends at total.
    let events = harness.sink.snapshot();
    assert_monotonic(&events);
    assert_eq!(events.first().map(|e| e.current), Some(1));
    assert_eq!(events.last().map(|e| e.current), Some(TOTAL_STAGES));
    assert_eq!(
        events.iter().map(|e| e.current).collect::<Vec<_>>(),
        vec![1, 2, 3, 4, 5, 5]
    );

    // Both caches were written by finalization.
    assert!(harness
        .completion
        .entries
        .lock()
        .unwrap()
        .contains_key(&ctx.idempotency_key));
    assert!(harness
        .fallback
        .entries
        .lock()
        .unwrap()
        .contains_key(&(PolicyType::Returns, ctx.content_hash.clone())));
}

#[tokio::test]
async fn regeneration_skipped_at_or_above_threshold() {
    let harness = Harness::new();
    *harness.analyzer.compliance_reply.lock().unwrap() = Some(Ok(report(95.0)));

    let mut ctx = context(CLEAR_RETURNS_TEXT);
    let response = run_pipeline(&mut ctx, &harness.deps(), &config())
        .await
        .expect("pipeline should succeed");

    assert!(response.success);
    assert!(response.improved_policy.is_none());
    // Threshold is strict less-than: exactly 95 does not regenerate.
    assert_eq!(harness.analyzer.regen_calls.load(Ordering::SeqCst), 0);
    assert!(!ctx.completed_stages.contains(&"policy_regeneration".to_string()));
}

#[tokio::test]
async fn regeneration_runs_below_threshold() {
    let harness = Harness::new();
    *harness.analyzer.compliance_reply.lock().unwrap() = Some(Ok(report(94.9)));
    *harness.analyzer.regen_reply.lock().unwrap() = Some(Ok(improved()));

    let mut ctx = context(CLEAR_RETURNS_TEXT);
    let response = run_pipeline(&mut ctx, &harness.deps(), &config())
        .await
        .expect("pipeline should succeed");

    assert_eq!(harness.analyzer.regen_calls.load(Ordering::SeqCst), 1);
    assert!(response.improved_policy.is_some());
}

#[tokio::test]
async fn uncertain_match_consults_llm_and_mismatch_short_circuits() {
    let harness = Harness::new();
    *harness.analyzer.match_reply.lock().unwrap() = Some(Ok(PolicyMatch {
        verdict: MatchVerdict::Mismatch,
        confidence: 0.85,
        reason: "text is a privacy policy".to_string(),
        method: MatchMethod::LlmAssisted,
    }));

    let mut ctx = context(UNSURE_RETURNS_TEXT);
    let response = run_pipeline(&mut ctx, &harness.deps(), &config())
        .await
        .expect("mismatch is a terminal result, not a failure");

    assert!(!response.success);
    assert!(response.compliance_report.is_none());
    let policy_match = response.policy_match.expect("verdict present");
    assert_eq!(policy_match.verdict, MatchVerdict::Mismatch);
    assert_eq!(policy_match.method, MatchMethod::LlmAssisted);

    assert_eq!(harness.analyzer.match_calls.load(Ordering::SeqCst), 1);
    // Stages 2-4 never executed.
    assert_eq!(harness.analyzer.compliance_calls.load(Ordering::SeqCst), 0);

    // Skip-progress events still bring current to total before the terminal.
    let events = harness.sink.snapshot();
    assert_monotonic(&events);
    assert_eq!(events.last().map(|e| e.current), Some(TOTAL_STAGES));
}

#[tokio::test]
async fn llm_confirmed_match_refines_verdict() {
    let harness = Harness::new();
    *harness.analyzer.match_reply.lock().unwrap() = Some(Ok(PolicyMatch {
        verdict: MatchVerdict::Match,
        confidence: 0.92,
        reason: "clearly a returns policy".to_string(),
        method: MatchMethod::LlmAssisted,
    }));
    *harness.analyzer.compliance_reply.lock().unwrap() = Some(Ok(report(97.0)));

    let mut ctx = context(UNSURE_RETURNS_TEXT);
    let response = run_pipeline(&mut ctx, &harness.deps(), &config())
        .await
        .expect("pipeline should succeed");

    let policy_match = response.policy_match.expect("verdict present");
    assert_eq!(policy_match.method, MatchMethod::LlmAssisted);
    assert!((policy_match.confidence - 0.92).abs() < f64::EPSILON);
}

#[tokio::test]
async fn llm_match_failure_is_absorbed_with_rule_verdict() {
    let harness = Harness::new();
    *harness.analyzer.match_reply.lock().unwrap() = Some(Err(AnalysisError::classified(
        FailureKind::ServerError,
        "503 from every provider",
    )));
    *harness.analyzer.compliance_reply.lock().unwrap() = Some(Ok(report(96.0)));

    let mut ctx = context(UNSURE_RETURNS_TEXT);
    let response = run_pipeline(&mut ctx, &harness.deps(), &config())
        .await
        .expect("optional stage failure must not fail the job");

    assert!(response.success);
    // The rule-based verdict stood in for the failed refinement.
    assert_eq!(
        response.policy_match.expect("verdict present").method,
        MatchMethod::RuleBased
    );
    assert!(ctx.failed_stages.contains(&"llm_match".to_string()));
    assert!(response.warnings.iter().any(|w| w.contains("llm_match")));
}

#[tokio::test]
async fn clear_mismatch_rejected_without_any_llm_call() {
    let harness = Harness::new();

    let mut ctx = context(UNRELATED_TEXT);
    let response = run_pipeline(&mut ctx, &harness.deps(), &config())
        .await
        .expect("terminal mismatch result");

    assert!(!response.success);
    assert_eq!(harness.analyzer.match_calls.load(Ordering::SeqCst), 0);
    assert_eq!(harness.analyzer.compliance_calls.load(Ordering::SeqCst), 0);
    assert_eq!(
        response.policy_match.expect("verdict present").verdict,
        MatchVerdict::Mismatch
    );
}

#[tokio::test]
async fn clear_mismatch_prefers_cached_fallback() {
    let harness = Harness::new();
    let ctx_probe = context(UNRELATED_TEXT);
    harness.fallback.entries.lock().unwrap().insert(
        (PolicyType::Returns, ctx_probe.content_hash.clone()),
        cached_response(),
    );

    let mut ctx = context(UNRELATED_TEXT);
    let response = run_pipeline(&mut ctx, &harness.deps(), &config())
        .await
        .expect("fallback-served result");

    assert!(response.success);
    assert!(response.served_from_fallback);
    assert!(response.compliance_report.is_some());
}

#[tokio::test]
async fn required_stage_failure_served_from_fallback() {
    // Scenario F: providers all time out on compliance analysis, but the
    // degradation cache has a matching entry.
    let harness = Harness::new();
    *harness.analyzer.compliance_reply.lock().unwrap() = Some(Err(
        AnalysisError::classified(FailureKind::Timeout, "deadline exceeded on all providers"),
    ));

    let probe = context(CLEAR_RETURNS_TEXT);
    harness.fallback.entries.lock().unwrap().insert(
        (PolicyType::Returns, probe.content_hash.clone()),
        cached_response(),
    );

    let mut ctx = context(CLEAR_RETURNS_TEXT);
    let response = run_pipeline(&mut ctx, &harness.deps(), &config())
        .await
        .expect("fallback must rescue the job");

    assert!(response.success);
    assert!(response.served_from_fallback);
    assert_eq!(
        response
            .compliance_report
            .expect("cached report")
            .overall_compliance_ratio,
        88.0
    );

    let events = harness.sink.snapshot();
    assert_monotonic(&events);
    assert_eq!(events.last().map(|e| e.current), Some(TOTAL_STAGES));
}

#[tokio::test]
async fn required_stage_failure_without_fallback_fails_job() {
    let harness = Harness::new();
    *harness.analyzer.compliance_reply.lock().unwrap() = Some(Err(
        AnalysisError::classified(FailureKind::Timeout, "deadline exceeded on all providers"),
    ));

    let mut ctx = context(CLEAR_RETURNS_TEXT);
    let failure = run_pipeline(&mut ctx, &harness.deps(), &config())
        .await
        .expect_err("no fallback available, job must fail");

    assert_eq!(failure.error.kind(), FailureKind::Timeout);
    assert_eq!(failure.failed_stage.as_deref(), Some("compliance_analysis"));
    assert!(failure
        .completed_stages
        .contains(&"rule_match".to_string()));
    // The job is never silently reported as succeeded.
    assert!(ctx.final_response.is_none());
}

#[tokio::test]
async fn optional_regeneration_failure_is_absorbed() {
    let harness = Harness::new();
    *harness.analyzer.compliance_reply.lock().unwrap() = Some(Ok(report(70.0)));
    *harness.analyzer.regen_reply.lock().unwrap() = Some(Err(AnalysisError::classified(
        FailureKind::ServerError,
        "regeneration backend down",
    )));

    let mut ctx = context(CLEAR_RETURNS_TEXT);
    let response = run_pipeline(&mut ctx, &harness.deps(), &config())
        .await
        .expect("optional failure must not fail the job");

    assert!(response.success);
    assert!(response.improved_policy.is_none());
    assert!(response
        .warnings
        .iter()
        .any(|w| w.contains("policy_regeneration")));
}

#[tokio::test]
async fn cancellation_observed_before_first_stage() {
    let harness = Harness::new();
    harness.cancel.cancelled.store(true, Ordering::SeqCst);

    let mut ctx = context(CLEAR_RETURNS_TEXT);
    let failure = run_pipeline(&mut ctx, &harness.deps(), &config())
        .await
        .expect_err("cancelled jobs fail");

    assert!(matches!(failure.error, AnalysisError::Cancelled));
    assert_eq!(failure.error.kind(), FailureKind::Cancelled);
    // Nothing ran, nothing was streamed.
    assert!(harness.sink.snapshot().is_empty());
    assert_eq!(harness.analyzer.compliance_calls.load(Ordering::SeqCst), 0);
}

// ---- guard-level checks ----

#[test]
fn stage1_band_is_exclusive_at_both_ends() {
    let cfg = config();
    let mut ctx = context(CLEAR_RETURNS_TEXT);

    for (confidence, expected) in [
        (0.30, false),
        (0.31, true),
        (0.50, true),
        (0.69, true),
        (0.70, false),
    ] {
        ctx.rule_match = Some(PolicyMatch {
            verdict: MatchVerdict::Unsure,
            confidence,
            reason: "test".to_string(),
            method: MatchMethod::RuleBased,
        });
        assert_eq!(
            should_run(StageKey::LlmMatch, &ctx, &cfg),
            expected,
            "confidence {confidence}"
        );
    }
}

#[test]
fn stage3_guard_follows_threshold() {
    let cfg = config();
    let mut ctx = context(CLEAR_RETURNS_TEXT);

    ctx.compliance_report = Some(report(94.99));
    assert!(should_run(StageKey::PolicyRegeneration, &ctx, &cfg));

    ctx.compliance_report = Some(report(95.0));
    assert!(!should_run(StageKey::PolicyRegeneration, &ctx, &cfg));

    ctx.compliance_report = None;
    assert!(!should_run(StageKey::PolicyRegeneration, &ctx, &cfg));
}

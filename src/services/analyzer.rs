//! LLM-backed analysis operations.
//!
//! [`PolicyAnalyzer`] is the seam between the stage pipeline and the provider
//! layer: the pipeline only knows these three operations. The live
//! implementation renders a prompt, routes it through the provider manager,
//! and parses the model's JSON reply.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;

use crate::models::analysis::{
    AnalysisRequest, ComplianceReport, ImprovedPolicy, MatchMethod, MatchVerdict, PolicyMatch,
};
use crate::models::job::FailureKind;
use crate::services::errors::AnalysisError;
use crate::services::prompts;
use crate::services::providers::{CompletionRequest, ModelTier, ProviderManager};

/// Token estimates per operation, used for quota checks before dispatch.
pub const MATCH_CHECK_TOKENS: u64 = 2_000;
pub const COMPLIANCE_TOKENS: u64 = 10_000;
pub const REGENERATION_TOKENS: u64 = 12_000;

/// The three LLM-backed operations the pipeline may invoke.
#[async_trait]
pub trait PolicyAnalyzer: Send + Sync {
    async fn check_policy_match(
        &self,
        request: &AnalysisRequest,
    ) -> Result<PolicyMatch, AnalysisError>;

    async fn analyze_compliance(
        &self,
        request: &AnalysisRequest,
    ) -> Result<ComplianceReport, AnalysisError>;

    async fn regenerate_policy(
        &self,
        request: &AnalysisRequest,
        report: &ComplianceReport,
    ) -> Result<ImprovedPolicy, AnalysisError>;
}

/// Live analyzer backed by the provider manager.
pub struct LlmAnalyzer {
    manager: Arc<ProviderManager>,
}

impl LlmAnalyzer {
    pub fn new(manager: Arc<ProviderManager>) -> Self {
        Self { manager }
    }
}

/// Shape the match-check prompt asks the model for.
#[derive(Debug, Deserialize)]
struct MatchReply {
    is_matched: bool,
    confidence: f64,
    reason: String,
}

/// Models wrap JSON in markdown fences often enough that stripping them
/// unconditionally is cheaper than re-prompting.
fn strip_code_fences(text: &str) -> &str {
    let trimmed = text.trim();
    let without_open = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .unwrap_or(trimmed);
    without_open
        .strip_suffix("```")
        .unwrap_or(without_open)
        .trim()
}

fn parse_reply<T: serde::de::DeserializeOwned>(text: &str, operation: &str) -> Result<T, AnalysisError> {
    serde_json::from_str(strip_code_fences(text)).map_err(|e| {
        AnalysisError::classified(
            FailureKind::Unknown,
            format!("unparseable {operation} reply: {e}"),
        )
    })
}

#[async_trait]
impl PolicyAnalyzer for LlmAnalyzer {
    async fn check_policy_match(
        &self,
        request: &AnalysisRequest,
    ) -> Result<PolicyMatch, AnalysisError> {
        let completion = self
            .manager
            .call(
                &CompletionRequest {
                    prompt: prompts::policy_match_prompt(request),
                    tier: ModelTier::Light,
                    max_tokens: 2_000,
                    temperature: 0.2,
                },
                MATCH_CHECK_TOKENS,
            )
            .await?;

        let reply: MatchReply = parse_reply(&completion.text, "policy match")?;
        let verdict = if reply.is_matched {
            MatchVerdict::Match
        } else {
            MatchVerdict::Mismatch
        };

        Ok(PolicyMatch {
            verdict,
            confidence: reply.confidence.clamp(0.0, 1.0),
            reason: reply.reason,
            method: MatchMethod::LlmAssisted,
        })
    }

    async fn analyze_compliance(
        &self,
        request: &AnalysisRequest,
    ) -> Result<ComplianceReport, AnalysisError> {
        let completion = self
            .manager
            .call(
                &CompletionRequest {
                    prompt: prompts::compliance_prompt(request),
                    tier: ModelTier::Heavy,
                    max_tokens: 16_000,
                    temperature: 0.3,
                },
                COMPLIANCE_TOKENS,
            )
            .await?;

        let mut report: ComplianceReport = parse_reply(&completion.text, "compliance")?;
        report.overall_compliance_ratio = report.overall_compliance_ratio.clamp(0.0, 100.0);
        Ok(report)
    }

    async fn regenerate_policy(
        &self,
        request: &AnalysisRequest,
        report: &ComplianceReport,
    ) -> Result<ImprovedPolicy, AnalysisError> {
        let completion = self
            .manager
            .call(
                &CompletionRequest {
                    prompt: prompts::regeneration_prompt(request, report),
                    tier: ModelTier::Heavy,
                    max_tokens: 16_000,
                    temperature: 0.3,
                },
                REGENERATION_TOKENS,
            )
            .await?;

        parse_reply(&completion.text, "regeneration")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_fenced_json() {
        assert_eq!(strip_code_fences("```json\n{\"a\": 1}\n```"), "{\"a\": 1}");
        assert_eq!(strip_code_fences("```\n{}\n```"), "{}");
        assert_eq!(strip_code_fences("  {\"a\": 1} "), "{\"a\": 1}");
    }

    #[test]
    fn parses_match_reply() {
        let reply: MatchReply = parse_reply(
            "```json\n{\"is_matched\": true, \"confidence\": 0.9, \"reason\": \"clear\"}\n```",
            "policy match",
        )
        .unwrap();
        assert!(reply.is_matched);
        assert!((reply.confidence - 0.9).abs() < f64::EPSILON);
    }

    #[test]
    fn unparseable_reply_is_classified_unknown() {
        let error = parse_reply::<MatchReply>("the model rambled instead", "policy match")
            .unwrap_err();
        assert_eq!(error.kind(), FailureKind::Unknown);
    }
}

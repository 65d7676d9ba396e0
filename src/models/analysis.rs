use chrono::{DateTime, Utc};
use garde::Validate;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Shop policy categories the engine understands.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, EnumString, Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum PolicyType {
    Returns,
    Privacy,
    Shipping,
}

/// A policy analysis submission.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct AnalysisRequest {
    #[garde(length(min = 2, max = 200))]
    pub shop_name: String,

    #[garde(length(min = 2, max = 200))]
    pub shop_specialization: String,

    #[garde(skip)]
    pub policy_type: PolicyType,

    #[garde(length(min = 50, max = 50_000))]
    pub policy_text: String,
}

/// Severity scale for compliance findings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, EnumString, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

/// A clause that directly violates a regulatory rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CriticalIssue {
    pub phrase: String,
    pub severity: Severity,
    pub suggestion: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub legal_reference: Option<String>,
}

/// A requirement the policy satisfies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompliancePoint {
    pub requirement: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub found_text: Option<String>,
}

/// A clause that partially satisfies a requirement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WeaknessPoint {
    pub issue: String,
    pub exact_text: String,
    pub severity: Severity,
    pub suggestion: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub legal_reference: Option<String>,
}

/// A mandatory standard the policy fails to address at all.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AmbiguityPoint {
    pub missing_standard: String,
    pub description: String,
    pub importance: Severity,
    pub suggested_text: String,
}

/// The compliance report produced by the analysis stage.
///
/// `overall_compliance_ratio` is a percentage in `[0, 100]` and is always
/// present on a completed job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComplianceReport {
    pub overall_compliance_ratio: f64,
    pub compliance_grade: String,
    pub summary: String,
    #[serde(default)]
    pub critical_issues: Vec<CriticalIssue>,
    #[serde(default)]
    pub strengths: Vec<CompliancePoint>,
    #[serde(default)]
    pub weaknesses: Vec<WeaknessPoint>,
    #[serde(default)]
    pub ambiguities: Vec<AmbiguityPoint>,
    #[serde(default)]
    pub recommendations: Vec<String>,
}

/// One rewrite applied during policy regeneration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImprovementDetail {
    pub category: String,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub before: Option<String>,
    pub after: String,
}

/// The regenerated policy produced when compliance falls below the
/// configured threshold.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImprovedPolicy {
    pub improved_policy: String,
    #[serde(default)]
    pub improvements_made: Vec<ImprovementDetail>,
    pub estimated_new_compliance: f64,
}

/// How a match verdict was reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum MatchMethod {
    RuleBased,
    LlmAssisted,
}

/// Whether the submitted text matches the declared policy type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum MatchVerdict {
    Match,
    Mismatch,
    Unsure,
}

/// Verdict on whether the policy text matches the declared type.
/// Confidence is in `[0, 1]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyMatch {
    pub verdict: MatchVerdict,
    pub confidence: f64,
    pub reason: String,
    pub method: MatchMethod,
}

/// The final payload of a successful analysis.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisResponse {
    pub success: bool,
    pub message: String,
    pub policy_match: Option<PolicyMatch>,
    pub compliance_report: Option<ComplianceReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub improved_policy: Option<ImprovedPolicy>,
    pub shop_name: String,
    pub shop_specialization: String,
    pub policy_type: PolicyType,
    pub analysis_timestamp: DateTime<Utc>,
    #[serde(default)]
    pub from_cache: bool,
    #[serde(default)]
    pub served_from_fallback: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn policy_type_wire_names() {
        assert_eq!(
            serde_json::to_string(&PolicyType::Returns).unwrap(),
            "\"returns\""
        );
        assert_eq!(
            serde_json::from_str::<PolicyType>("\"shipping\"").unwrap(),
            PolicyType::Shipping
        );
    }

    #[test]
    fn request_bounds_enforced() {
        let request = AnalysisRequest {
            shop_name: "A".to_string(),
            shop_specialization: "Electronics".to_string(),
            policy_type: PolicyType::Returns,
            policy_text: "x".repeat(100),
        };
        assert!(request.validate().is_err()); // shop_name below minimum

        let request = AnalysisRequest {
            shop_name: "Acme".to_string(),
            shop_specialization: "Electronics".to_string(),
            policy_type: PolicyType::Returns,
            policy_text: "x".repeat(100),
        };
        assert!(request.validate().is_ok());
    }

    #[test]
    fn report_optional_lists_default_empty() {
        let report: ComplianceReport = serde_json::from_str(
            r#"{
                "overall_compliance_ratio": 82.5,
                "compliance_grade": "B",
                "summary": "Mostly compliant"
            }"#,
        )
        .unwrap();
        assert!(report.critical_issues.is_empty());
        assert!(report.recommendations.is_empty());
        assert!((report.overall_compliance_ratio - 82.5).abs() < f64::EPSILON);
    }
}

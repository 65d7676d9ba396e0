//! Prompt construction for the LLM-backed operations.
//!
//! The text here is plumbing, not product: each function renders the inputs
//! into an instruction block and names the exact JSON shape the caller will
//! parse. The analyzer treats the returned strings as opaque.

use crate::models::analysis::{AnalysisRequest, ComplianceReport, PolicyType};

fn policy_type_label(policy_type: PolicyType) -> &'static str {
    match policy_type {
        PolicyType::Returns => "returns and exchange policy",
        PolicyType::Privacy => "account and privacy policy",
        PolicyType::Shipping => "shipping and delivery policy",
    }
}

/// Prompt for the LLM-assisted policy match check (light model).
pub fn policy_match_prompt(request: &AnalysisRequest) -> String {
    format!(
        "You are verifying a shop policy document. Decide whether the text below is a {label}.\n\
         Respond with ONLY a JSON object: {{\"is_matched\": boolean, \"confidence\": number between 0 and 1, \"reason\": string}}.\n\
         \n\
         Policy text:\n{text}",
        label = policy_type_label(request.policy_type),
        text = request.policy_text,
    )
}

/// Prompt for the compliance analysis (heavy model).
pub fn compliance_prompt(request: &AnalysisRequest) -> String {
    format!(
        "Assess the following {label} of the shop \"{shop}\" (specialization: {specialization}) \
         against consumer-protection and e-commerce regulations.\n\
         Respond with ONLY a JSON object with these fields: \
         overall_compliance_ratio (number 0-100), compliance_grade (string), summary (string), \
         critical_issues (array of {{phrase, severity, suggestion, legal_reference}}), \
         strengths (array of {{requirement, status, found_text}}), \
         weaknesses (array of {{issue, exact_text, severity, suggestion, legal_reference}}), \
         ambiguities (array of {{missing_standard, description, importance, suggested_text}}), \
         recommendations (array of strings). \
         Severity values: low, medium, high, critical.\n\
         \n\
         Policy text:\n{text}",
        label = policy_type_label(request.policy_type),
        shop = request.shop_name,
        specialization = request.shop_specialization,
        text = request.policy_text,
    )
}

/// Prompt for the policy regeneration (heavy model).
pub fn regeneration_prompt(request: &AnalysisRequest, report: &ComplianceReport) -> String {
    let issues = report
        .critical_issues
        .iter()
        .map(|i| format!("- {} ({})", i.phrase, i.severity))
        .chain(report.weaknesses.iter().map(|w| format!("- {}", w.issue)))
        .collect::<Vec<_>>()
        .join("\n");

    format!(
        "Rewrite the following {label} of the shop \"{shop}\" so it resolves the issues \
         listed below while keeping the shop's intent.\n\
         Respond with ONLY a JSON object: improved_policy (string), \
         improvements_made (array of {{category, description, before, after}}), \
         estimated_new_compliance (number 0-100).\n\
         \n\
         Issues found:\n{issues}\n\
         \n\
         Original policy:\n{text}",
        label = policy_type_label(request.policy_type),
        shop = request.shop_name,
        issues = issues,
        text = request.policy_text,
    )
}

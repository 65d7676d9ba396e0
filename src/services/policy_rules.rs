//! Rule-based policy matching.
//!
//! Scores a policy text against keyword tables for its declared type without
//! any LLM call. Clear matches and clear mismatches are decided here; the
//! uncertain middle band is handed to the LLM-assisted check.

use crate::models::analysis::{MatchMethod, MatchVerdict, PolicyMatch, PolicyType};

/// Verdict thresholds: confidence at or above `MATCH_THRESHOLD` is a match,
/// at or below `MISMATCH_THRESHOLD` a mismatch, anything between is unsure.
pub const MATCH_THRESHOLD: f64 = 0.70;
pub const MISMATCH_THRESHOLD: f64 = 0.30;

struct PolicyRules {
    /// At least one of these must appear or the text cannot be of this type.
    required_keywords: &'static [&'static str],
    /// Phrases strongly characteristic of the type.
    strong_indicators: &'static [&'static str],
    /// Vocabulary commonly found in the type.
    moderate_indicators: &'static [&'static str],
    /// Vocabulary belonging to the *other* policy types.
    foreign_topics: &'static [&'static str],
    /// Section headings a complete policy of this type tends to contain.
    expected_sections: &'static [&'static str],
    minimum_length: usize,
}

const RETURNS_RULES: PolicyRules = PolicyRules {
    required_keywords: &["return", "refund", "exchange", "send back"],
    strong_indicators: &[
        "days of delivery",
        "days of receipt",
        "original packaging",
        "proof of purchase",
        "full refund",
        "restocking fee",
        "store credit",
    ],
    moderate_indicators: &[
        "item",
        "product",
        "receipt",
        "invoice",
        "defect",
        "unused",
        "condition",
        "purchase",
    ],
    foreign_topics: &[
        "personal data",
        "privacy",
        "password",
        "shipping carrier",
        "delivery time",
        "tracking number",
    ],
    expected_sections: &["period", "condition", "exception"],
    minimum_length: 100,
};

const PRIVACY_RULES: PolicyRules = PolicyRules {
    required_keywords: &["privacy", "personal data", "personal information", "account"],
    strong_indicators: &[
        "data protection",
        "delete your account",
        "encryption",
        "third parties",
        "consent",
        "data retention",
        "right to access",
    ],
    moderate_indicators: &[
        "email",
        "address",
        "phone",
        "password",
        "collect",
        "share",
        "store",
        "cookies",
    ],
    foreign_topics: &[
        "refund",
        "exchange",
        "restocking",
        "shipping carrier",
        "delivery time",
    ],
    expected_sections: &["collect", "use", "protect", "rights"],
    minimum_length: 150,
};

const SHIPPING_RULES: PolicyRules = PolicyRules {
    required_keywords: &["shipping", "delivery", "dispatch", "courier"],
    strong_indicators: &[
        "delivery time",
        "shipping fee",
        "shipping cost",
        "tracking number",
        "business days",
        "carrier",
        "free shipping",
    ],
    moderate_indicators: &[
        "order",
        "address",
        "region",
        "package",
        "arrival",
        "estimate",
        "customs",
    ],
    foreign_topics: &[
        "refund",
        "exchange",
        "personal data",
        "privacy",
        "password",
    ],
    expected_sections: &["time", "cost", "region"],
    minimum_length: 100,
};

fn rules_for(policy_type: PolicyType) -> &'static PolicyRules {
    match policy_type {
        PolicyType::Returns => &RETURNS_RULES,
        PolicyType::Privacy => &PRIVACY_RULES,
        PolicyType::Shipping => &SHIPPING_RULES,
    }
}

#[derive(Debug, Clone, Copy)]
struct Scores {
    required: f64,
    strong: f64,
    moderate: f64,
    foreign: f64,
    length: f64,
    sections: f64,
}

fn fraction_present(text: &str, keywords: &[&str]) -> f64 {
    if keywords.is_empty() {
        return 0.0;
    }
    let found = keywords.iter().filter(|kw| text.contains(**kw)).count();
    found as f64 / keywords.len() as f64
}

fn calculate_scores(text: &str, rules: &PolicyRules) -> Scores {
    Scores {
        required: fraction_present(text, rules.required_keywords),
        strong: fraction_present(text, rules.strong_indicators),
        moderate: fraction_present(text, rules.moderate_indicators),
        foreign: fraction_present(text, rules.foreign_topics),
        length: (text.chars().count() as f64 / rules.minimum_length as f64).min(1.0),
        sections: fraction_present(text, rules.expected_sections),
    }
}

/// Score a policy text against its declared type.
///
/// Confidence is in `[0, 1]`; the verdict follows the threshold bands.
pub fn match_policy(policy_type: PolicyType, policy_text: &str) -> PolicyMatch {
    let rules = rules_for(policy_type);
    let text = policy_text.to_lowercase();
    let scores = calculate_scores(&text, rules);

    // No required keyword at all: the text cannot be of this type.
    if scores.required == 0.0 {
        let confidence = 0.1 + scores.moderate * 0.1;
        return PolicyMatch {
            verdict: MatchVerdict::Mismatch,
            confidence,
            reason: format!(
                "text contains none of the required {policy_type} vocabulary"
            ),
            method: MatchMethod::RuleBased,
        };
    }

    // Dominated by vocabulary of other policy types.
    if scores.foreign > 0.5 {
        return PolicyMatch {
            verdict: MatchVerdict::Mismatch,
            confidence: 0.2,
            reason: "text is dominated by topics of a different policy type".to_string(),
            method: MatchMethod::RuleBased,
        };
    }

    let mut confidence = scores.required * 0.35
        + scores.strong * 0.25
        + scores.moderate * 0.15
        + scores.length * 0.10
        + scores.sections * 0.15;
    // Penalize foreign vocabulary proportionally.
    confidence *= 1.0 - scores.foreign * 0.5;

    let (verdict, reason) = if confidence >= MATCH_THRESHOLD {
        (
            MatchVerdict::Match,
            "text carries the indicators expected for this policy type".to_string(),
        )
    } else if confidence <= MISMATCH_THRESHOLD {
        (
            MatchVerdict::Mismatch,
            "text carries too few indicators for this policy type".to_string(),
        )
    } else {
        (
            MatchVerdict::Unsure,
            "rule-based signals are inconclusive".to_string(),
        )
    };

    PolicyMatch {
        verdict,
        confidence,
        reason,
        method: MatchMethod::RuleBased,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RETURNS_TEXT: &str = "Return and refund policy. Customers may return any item \
        within 14 days of delivery for a full refund or exchange. The item must be unused, \
        in its original packaging, and accompanied by proof of purchase. Exceptions: \
        clearance products. Refunds are issued to the original payment method within the \
        stated period, subject to inspection of the product condition.";

    const PRIVACY_TEXT: &str = "Privacy and account policy. We collect personal data such \
        as your email, address and phone number when you create an account. Your personal \
        information is protected with encryption and never shared with third parties \
        without consent. You may delete your account at any time and exercise your right \
        to access. Data retention follows our published schedule and your rights are \
        described below, including how we collect, use and protect your information.";

    #[test]
    fn clear_returns_text_matches() {
        let result = match_policy(PolicyType::Returns, RETURNS_TEXT);
        assert_eq!(result.verdict, MatchVerdict::Match);
        assert!(result.confidence >= MATCH_THRESHOLD);
        assert_eq!(result.method, MatchMethod::RuleBased);
    }

    #[test]
    fn clear_privacy_text_matches() {
        let result = match_policy(PolicyType::Privacy, PRIVACY_TEXT);
        assert_eq!(result.verdict, MatchVerdict::Match);
    }

    #[test]
    fn privacy_text_mismatches_returns_type() {
        let result = match_policy(PolicyType::Returns, PRIVACY_TEXT);
        assert_eq!(result.verdict, MatchVerdict::Mismatch);
        assert!(result.confidence <= MISMATCH_THRESHOLD);
    }

    #[test]
    fn unrelated_text_has_no_required_keywords() {
        let result = match_policy(
            PolicyType::Shipping,
            "This document describes the history of our company and its founders.",
        );
        assert_eq!(result.verdict, MatchVerdict::Mismatch);
        assert!(result.confidence < 0.3);
        assert!(result.reason.contains("required"));
    }

    #[test]
    fn sparse_text_lands_in_uncertain_band() {
        // Mentions a required keyword but few other signals.
        let result = match_policy(
            PolicyType::Returns,
            "Items may be returned for a refund. Bring your receipt and the product to \
             the service desk and a clerk will assist with the exchange or refund of \
             your purchase.",
        );
        assert_eq!(result.verdict, MatchVerdict::Unsure);
        assert!(result.confidence > MISMATCH_THRESHOLD);
        assert!(result.confidence < MATCH_THRESHOLD);
    }

    #[test]
    fn confidence_bounded() {
        for text in [RETURNS_TEXT, PRIVACY_TEXT, "short"] {
            for policy_type in [PolicyType::Returns, PolicyType::Privacy, PolicyType::Shipping] {
                let result = match_policy(policy_type, text);
                assert!((0.0..=1.0).contains(&result.confidence));
            }
        }
    }
}

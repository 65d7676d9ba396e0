//! Pre-stage input validation.
//!
//! Runs before any pipeline stage. A failure here terminates the job with a
//! `validation` failure kind; no stages run and no progress is streamed.

use serde::{Deserialize, Serialize};
use strum::Display;

pub const MIN_TEXT_LENGTH: usize = 50;
pub const MAX_TEXT_LENGTH: usize = 50_000;
const MIN_FIELD_LENGTH: usize = 2;

/// Most frequent word may not account for more than this share of the text.
const MAX_WORD_FREQUENCY: f64 = 0.30;

/// The frequency test only applies once the top word repeats more than this
/// many times in absolute terms.
const MAX_WORD_REPETITION: usize = 10;

/// Words of this length or shorter are exempt from the repetition check;
/// connectors repeat legitimately.
const SPAM_WORD_MAX_EXEMPT_LENGTH: usize = 3;

/// Markers of injected markup or code that have no place in a policy text.
const FORBIDDEN_PATTERNS: &[&str] = &[
    "<script",
    "javascript:",
    "data:text/html",
    "onerror=",
    "onclick=",
    "onload=",
    "eval(",
    "exec(",
    "__import__",
    "os.system",
    "subprocess",
];

/// Vocabulary with no place in a legitimate policy document.
const BLOCKED_WORDS: &[&str] = &["spam", "hack", "crack", "exploit"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ValidationCategory {
    LengthError,
    SuspiciousContent,
    SpamDetected,
    InvalidShopName,
    InvalidSpecialization,
}

/// Structured rejection returned to the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationError {
    pub category: ValidationCategory,
    pub message: String,
    pub details: String,
    pub user_action: String,
}

/// Validate a submission. Checks run in a fixed order; the first failure is
/// returned.
pub fn validate_submission(
    shop_name: &str,
    shop_specialization: &str,
    policy_text: &str,
) -> Result<(), ValidationError> {
    check_text_length(policy_text)?;
    check_forbidden_patterns(policy_text)?;
    check_blocked_words(policy_text)?;
    check_repetition(policy_text)?;
    check_field(
        shop_name,
        ValidationCategory::InvalidShopName,
        "Shop name is invalid",
        "Enter a shop name of at least 2 characters",
    )?;
    check_field(
        shop_specialization,
        ValidationCategory::InvalidSpecialization,
        "Shop specialization is invalid",
        "Enter a specialization of at least 2 characters",
    )?;
    Ok(())
}

fn check_text_length(policy_text: &str) -> Result<(), ValidationError> {
    let length = policy_text.chars().count();
    if length < MIN_TEXT_LENGTH {
        return Err(ValidationError {
            category: ValidationCategory::LengthError,
            message: "Policy text is too short".to_string(),
            details: format!("{length} characters, minimum is {MIN_TEXT_LENGTH}"),
            user_action: format!(
                "Provide a policy text of at least {MIN_TEXT_LENGTH} characters"
            ),
        });
    }
    if length > MAX_TEXT_LENGTH {
        return Err(ValidationError {
            category: ValidationCategory::LengthError,
            message: "Policy text is too long".to_string(),
            details: format!("{length} characters, maximum is {MAX_TEXT_LENGTH}"),
            user_action: format!("Shorten the policy text to at most {MAX_TEXT_LENGTH} characters"),
        });
    }
    Ok(())
}

fn check_forbidden_patterns(policy_text: &str) -> Result<(), ValidationError> {
    let lower = policy_text.to_lowercase();
    if let Some(pattern) = FORBIDDEN_PATTERNS.iter().find(|p| lower.contains(**p)) {
        return Err(ValidationError {
            category: ValidationCategory::SuspiciousContent,
            message: "Suspicious content detected".to_string(),
            details: format!("forbidden pattern: {pattern}"),
            user_action: "Remove any code, scripts or markup from the policy text".to_string(),
        });
    }
    Ok(())
}

fn check_blocked_words(policy_text: &str) -> Result<(), ValidationError> {
    let lower = policy_text.to_lowercase();
    if let Some(word) = BLOCKED_WORDS.iter().find(|w| lower.contains(**w)) {
        return Err(ValidationError {
            category: ValidationCategory::SuspiciousContent,
            message: "Blocked content detected".to_string(),
            details: format!("blocked term: {word}"),
            user_action: "Remove inappropriate terms from the policy text".to_string(),
        });
    }
    Ok(())
}

/// Spam heuristic: a single word dominating the text indicates repetition
/// rather than a real policy. The word must repeat heavily in absolute
/// terms, be longer than a connector, and exceed the frequency share.
fn check_repetition(policy_text: &str) -> Result<(), ValidationError> {
    let words: Vec<&str> = policy_text.split_whitespace().collect();
    if words.is_empty() {
        return Ok(());
    }

    let mut counts = std::collections::HashMap::new();
    for word in &words {
        *counts.entry(*word).or_insert(0usize) += 1;
    }

    let (top_word, top_count) = counts
        .iter()
        .max_by_key(|(_, count)| **count)
        .map(|(word, count)| (*word, *count))
        .unwrap_or(("", 0));

    if top_count > MAX_WORD_REPETITION && top_word.chars().count() > SPAM_WORD_MAX_EXEMPT_LENGTH {
        let frequency = top_count as f64 / words.len() as f64;
        if frequency > MAX_WORD_FREQUENCY {
            return Err(ValidationError {
                category: ValidationCategory::SpamDetected,
                message: "Excessive repetition detected".to_string(),
                details: format!(
                    "the word \"{top_word}\" repeats {top_count} times ({:.0}% of the text)",
                    frequency * 100.0
                ),
                user_action: "Submit an actual policy text rather than repeated content"
                    .to_string(),
            });
        }
    }
    Ok(())
}

fn check_field(
    value: &str,
    category: ValidationCategory,
    message: &str,
    user_action: &str,
) -> Result<(), ValidationError> {
    if value.trim().chars().count() < MIN_FIELD_LENGTH {
        return Err(ValidationError {
            category,
            message: message.to_string(),
            details: format!("\"{}\" is shorter than {MIN_FIELD_LENGTH} characters", value.trim()),
            user_action: user_action.to_string(),
        });
    }
    Ok(())
}

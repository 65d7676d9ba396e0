//! Deterministic fingerprints for submissions.
//!
//! Two digests are derived from a submission:
//!
//! - the **idempotency key**, a SHA-256 over the normalized input tuple,
//!   stable across worker restarts and used to deduplicate completed results;
//! - the **content hash**, a SHA-256 over the normalized policy text alone,
//!   used for fallback lookups across different shops.

use sha2::{Digest, Sha256};

use crate::models::analysis::PolicyType;

/// Normalization applied before hashing: casefold, collapse whitespace runs
/// to a single space, trim.
pub fn normalize(text: &str) -> String {
    text.to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

fn sha256_hex(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
}

/// Idempotency key over the full normalized submission tuple.
///
/// Fields are joined with an unprintable separator so that no re-bracketing
/// of field contents can produce the same digest.
pub fn idempotency_key(
    shop_name: &str,
    shop_specialization: &str,
    policy_type: PolicyType,
    policy_text: &str,
) -> String {
    let tuple = [
        normalize(shop_name),
        normalize(shop_specialization),
        policy_type.to_string(),
        normalize(policy_text),
    ]
    .join("\u{1f}");
    sha256_hex(&tuple)
}

/// Content hash over the normalized policy text alone.
pub fn content_hash(policy_text: &str) -> String {
    sha256_hex(&normalize(policy_text))
}

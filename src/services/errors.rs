//! Error classification for LLM provider failures.
//!
//! Raw errors from providers arrive as strings of wildly varying shape
//! (HTTP status lines, SDK messages, connection errors). Classification maps
//! them onto the closed [`FailureKind`] taxonomy via a substring table over
//! a lowercased representation, and decides retryability.

use crate::models::job::FailureKind;

/// Substring patterns checked in order; first hit wins.
const CLASSIFICATION_TABLE: &[(FailureKind, &[&str])] = &[
    (
        FailureKind::QuotaExceeded,
        &[
            "429",
            "rate limit",
            "rate_limit",
            "quota",
            "insufficient_quota",
            "resource exhausted",
            "resource_exhausted",
            "too many requests",
            "billing",
        ],
    ),
    (
        FailureKind::Timeout,
        &["timeout", "timed out", "deadline exceeded", "deadline has elapsed"],
    ),
    (
        FailureKind::Authentication,
        &[
            "401",
            "403",
            "unauthorized",
            "forbidden",
            "api key",
            "api_key",
            "authentication",
            "permission denied",
        ],
    ),
    (
        FailureKind::ServerError,
        &[
            "500",
            "502",
            "503",
            "504",
            "bad gateway",
            "service unavailable",
            "internal server error",
            "internal error",
            "connection reset",
            "overloaded",
        ],
    ),
    (
        FailureKind::Network,
        &[
            "connection refused",
            "connection error",
            "network",
            "dns",
            "error sending request",
            "failed to fetch",
            "broken pipe",
        ],
    ),
    (FailureKind::Validation, &["validation"]),
    (FailureKind::MissingData, &["missing"]),
];

/// Map a raw error representation to the failure taxonomy.
pub fn classify(raw: &str) -> FailureKind {
    let normalized = raw.to_lowercase();
    for (kind, patterns) in CLASSIFICATION_TABLE {
        if patterns.iter().any(|p| normalized.contains(p)) {
            return *kind;
        }
    }
    FailureKind::Unknown
}

/// Whether a failure of this kind may succeed on another provider or retry.
pub fn retryable(kind: FailureKind) -> bool {
    matches!(
        kind,
        FailureKind::Timeout | FailureKind::ServerError | FailureKind::Network
    )
}

/// Errors surfaced by the analysis engine.
#[derive(Debug, thiserror::Error)]
pub enum AnalysisError {
    /// A provider or stage failure already mapped onto the taxonomy.
    #[error("{message}")]
    Classified { kind: FailureKind, message: String },

    /// Cooperative cancellation observed at a suspension point.
    #[error("job cancelled")]
    Cancelled,

    /// A required sub-result was absent at finalization.
    #[error("missing required data: {0}")]
    MissingData(String),

    /// Every provider was blacklisted, quota-denied, or failed.
    #[error("no LLM provider available")]
    Unavailable,

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl AnalysisError {
    pub fn classified(kind: FailureKind, message: impl Into<String>) -> Self {
        AnalysisError::Classified {
            kind,
            message: message.into(),
        }
    }

    /// The failure kind this error maps to.
    pub fn kind(&self) -> FailureKind {
        match self {
            AnalysisError::Classified { kind, .. } => *kind,
            AnalysisError::Cancelled => FailureKind::Cancelled,
            AnalysisError::MissingData(_) => FailureKind::MissingData,
            AnalysisError::Unavailable => FailureKind::ServerError,
            AnalysisError::Database(_) => FailureKind::ServerError,
            AnalysisError::Redis(_) => FailureKind::Network,
            AnalysisError::Serialization(_) => FailureKind::Unknown,
        }
    }

    /// Whether the broker should re-deliver the whole task.
    pub fn retryable(&self) -> bool {
        match self {
            AnalysisError::Cancelled => false,
            _ => retryable(self.kind()),
        }
    }
}

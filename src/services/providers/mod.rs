//! LLM provider routing: registry, health tracking, and failover.
//!
//! The registry keeps an ordered provider list with a designated primary and
//! per-provider blacklist timers. Selection is a pure function of the clock
//! and the recorded state, so failover behavior is testable without I/O.

pub mod gemini;
pub mod openai;

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::AppConfig;
use crate::models::job::FailureKind;
use crate::services::errors::{classify, retryable, AnalysisError};
use crate::services::quota::QuotaGate;

/// Build the registry from configuration: both known providers in order,
/// with the configured primary preferred.
pub fn registry_from_config(config: &AppConfig) -> ProviderRegistry {
    ProviderRegistry::new(
        &["openai", "gemini"],
        &config.provider_primary,
        config.provider_blacklist_secs,
    )
}

/// Instantiate the concrete provider clients from configuration.
pub fn providers_from_config(config: &AppConfig) -> Vec<Arc<dyn LlmProvider>> {
    vec![
        Arc::new(openai::OpenAiProvider::new(
            config.openai_base_url.clone(),
            config.openai_api_key.clone(),
            config.openai_light_model.clone(),
            config.openai_heavy_model.clone(),
        )),
        Arc::new(gemini::GeminiProvider::new(
            config.gemini_base_url.clone(),
            config.gemini_api_key.clone(),
            config.gemini_light_model.clone(),
            config.gemini_heavy_model.clone(),
        )),
    ]
}

/// Consecutive timeouts before a provider is treated as crashed.
const TIMEOUT_BLACKLIST_AFTER: u32 = 3;

/// Which model class a call should use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelTier {
    /// Cheap, fast model for short classification calls.
    Light,
    /// Full model for analysis and generation.
    Heavy,
}

/// A single completion request, provider-agnostic.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub prompt: String,
    pub tier: ModelTier,
    pub max_tokens: u32,
    pub temperature: f32,
}

/// A completed LLM response.
#[derive(Debug, Clone)]
pub struct LlmCompletion {
    pub text: String,
    pub tokens_used: u64,
}

/// Errors raised by a concrete provider client.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("provider returned HTTP {status}: {body}")]
    Api { status: u16, body: String },

    #[error("malformed provider response: {0}")]
    Malformed(String),
}

/// A concrete LLM backend.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    fn id(&self) -> &str;
    async fn complete(&self, request: &CompletionRequest) -> Result<LlmCompletion, ProviderError>;
}

/// Health record for one provider.
#[derive(Debug, Clone, Serialize)]
pub struct ProviderHealth {
    pub provider_id: String,
    pub is_primary: bool,
    pub consecutive_failures: u32,
    pub blacklisted_until: Option<DateTime<Utc>>,
    pub success_count: u64,
    pub failure_count: u64,
}

impl ProviderHealth {
    fn new(provider_id: String, is_primary: bool) -> Self {
        Self {
            provider_id,
            is_primary,
            consecutive_failures: 0,
            blacklisted_until: None,
            success_count: 0,
            failure_count: 0,
        }
    }

    pub fn blacklisted_at(&self, now: DateTime<Utc>) -> bool {
        self.blacklisted_until.is_some_and(|until| now < until)
    }
}

/// Ordered provider catalog with health state.
pub struct ProviderRegistry {
    state: Mutex<Vec<ProviderHealth>>,
    blacklist_duration: chrono::Duration,
}

impl ProviderRegistry {
    /// `provider_ids` keeps submission order; `primary` is preferred at
    /// selection time regardless of position.
    pub fn new(provider_ids: &[&str], primary: &str, blacklist_secs: u64) -> Self {
        let state = provider_ids
            .iter()
            .map(|id| ProviderHealth::new(id.to_string(), *id == primary))
            .collect();
        Self {
            state: Mutex::new(state),
            blacklist_duration: chrono::Duration::seconds(blacklist_secs as i64),
        }
    }

    /// Pick the provider to use at `now`: the primary when available, else
    /// the first non-blacklisted secondary in order.
    pub fn select_at(&self, now: DateTime<Utc>) -> Option<String> {
        self.select_excluding(now, &HashSet::new())
    }

    /// Like [`select_at`](Self::select_at), skipping already-attempted
    /// providers so one logical call never revisits a provider.
    pub fn select_excluding(&self, now: DateTime<Utc>, exclude: &HashSet<String>) -> Option<String> {
        let state = self.state.lock().expect("registry lock poisoned");
        let selectable =
            |p: &&ProviderHealth| !exclude.contains(&p.provider_id) && !p.blacklisted_at(now);
        state
            .iter()
            .filter(selectable)
            .find(|p| p.is_primary)
            .or_else(|| state.iter().find(selectable))
            .map(|p| p.provider_id.clone())
    }

    pub fn mark_success(&self, provider_id: &str) {
        let mut state = self.state.lock().expect("registry lock poisoned");
        if let Some(p) = state.iter_mut().find(|p| p.provider_id == provider_id) {
            p.success_count += 1;
            p.consecutive_failures = 0;
            if p.blacklisted_until.is_some() {
                p.blacklisted_until = None;
                tracing::info!(provider = provider_id, "provider recovered, blacklist cleared");
            }
        }
    }

    /// Record a failure. Server errors blacklist immediately; timeouts only
    /// once they repeat enough to look like a crashed service.
    pub fn mark_failure(&self, provider_id: &str, kind: FailureKind, now: DateTime<Utc>) {
        let mut state = self.state.lock().expect("registry lock poisoned");
        let Some(p) = state.iter_mut().find(|p| p.provider_id == provider_id) else {
            return;
        };
        p.failure_count += 1;
        p.consecutive_failures += 1;

        let crash_class = kind == FailureKind::ServerError
            || (kind == FailureKind::Timeout && p.consecutive_failures >= TIMEOUT_BLACKLIST_AFTER);
        if crash_class {
            p.blacklisted_until = Some(now + self.blacklist_duration);
            tracing::warn!(
                provider = provider_id,
                kind = %kind,
                until = %(now + self.blacklist_duration),
                "provider blacklisted"
            );
        }
    }

    /// Promote a provider to primary.
    pub fn switch_primary(&self, provider_id: &str) {
        let mut state = self.state.lock().expect("registry lock poisoned");
        if !state.iter().any(|p| p.provider_id == provider_id) {
            return;
        }
        for p in state.iter_mut() {
            p.is_primary = p.provider_id == provider_id;
        }
        tracing::info!(provider = provider_id, "primary provider switched");
    }

    /// True when at least one provider is selectable at `now`.
    pub fn has_available(&self, now: DateTime<Utc>) -> bool {
        let state = self.state.lock().expect("registry lock poisoned");
        state.iter().any(|p| !p.blacklisted_at(now))
    }

    pub fn health_report(&self) -> Vec<ProviderHealth> {
        self.state.lock().expect("registry lock poisoned").clone()
    }
}

/// Routes each LLM call to a healthy, in-quota provider with failover.
pub struct ProviderManager {
    registry: Arc<ProviderRegistry>,
    quota: Arc<dyn QuotaGate>,
    providers: HashMap<String, Arc<dyn LlmProvider>>,
    call_timeout: Duration,
}

impl ProviderManager {
    pub fn new(
        registry: Arc<ProviderRegistry>,
        quota: Arc<dyn QuotaGate>,
        providers: Vec<Arc<dyn LlmProvider>>,
        call_timeout: Duration,
    ) -> Self {
        let providers = providers
            .into_iter()
            .map(|p| (p.id().to_string(), p))
            .collect();
        Self {
            registry,
            quota,
            providers,
            call_timeout,
        }
    }

    pub fn registry(&self) -> &Arc<ProviderRegistry> {
        &self.registry
    }

    /// Issue a completion, failing over across providers.
    ///
    /// Quota denials and transient failures move on to the next provider;
    /// non-transient call failures propagate immediately. A provider is
    /// never attempted twice within one call.
    pub async fn call(
        &self,
        request: &CompletionRequest,
        estimated_tokens: u64,
    ) -> Result<LlmCompletion, AnalysisError> {
        let mut attempted: HashSet<String> = HashSet::new();
        let mut last_error: Option<AnalysisError> = None;

        loop {
            let Some(provider_id) = self.registry.select_excluding(Utc::now(), &attempted) else {
                return Err(last_error.unwrap_or(AnalysisError::Unavailable));
            };
            attempted.insert(provider_id.clone());

            if let Err(denial) = self.quota.check(&provider_id, estimated_tokens).await? {
                tracing::warn!(provider = %provider_id, denial = %denial, "quota denied, trying next provider");
                self.registry
                    .mark_failure(&provider_id, FailureKind::QuotaExceeded, Utc::now());
                last_error = Some(AnalysisError::classified(
                    FailureKind::QuotaExceeded,
                    format!("provider {provider_id} denied by {denial}"),
                ));
                continue;
            }

            let provider = self
                .providers
                .get(&provider_id)
                .ok_or(AnalysisError::Unavailable)?;

            match tokio::time::timeout(self.call_timeout, provider.complete(request)).await {
                Ok(Ok(completion)) => {
                    if let Err(e) = self
                        .quota
                        .record(&provider_id, completion.tokens_used, 1)
                        .await
                    {
                        // Usage bookkeeping must not fail a successful call.
                        tracing::error!(provider = %provider_id, error = %e, "failed to record quota usage");
                    }
                    self.registry.mark_success(&provider_id);
                    metrics::counter!("llm_calls_total", "provider" => provider_id.clone())
                        .increment(1);
                    return Ok(completion);
                }
                Ok(Err(provider_error)) => {
                    let kind = classify(&provider_error.to_string());
                    tracing::warn!(
                        provider = %provider_id,
                        kind = %kind,
                        error = %provider_error,
                        "provider call failed"
                    );
                    self.registry.mark_failure(&provider_id, kind, Utc::now());
                    metrics::counter!("llm_failovers_total").increment(1);
                    let error = AnalysisError::classified(kind, provider_error.to_string());
                    if !retryable(kind) {
                        return Err(error);
                    }
                    last_error = Some(error);
                }
                Err(_elapsed) => {
                    let kind = FailureKind::Timeout;
                    tracing::warn!(
                        provider = %provider_id,
                        deadline_secs = self.call_timeout.as_secs(),
                        "provider call exceeded deadline"
                    );
                    self.registry.mark_failure(&provider_id, kind, Utc::now());
                    metrics::counter!("llm_failovers_total").increment(1);
                    last_error = Some(AnalysisError::classified(
                        kind,
                        format!(
                            "call to {provider_id} timed out after {}s",
                            self.call_timeout.as_secs()
                        ),
                    ));
                }
            }
        }
    }
}

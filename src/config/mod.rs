use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Server bind address (e.g., "0.0.0.0:3000"). Optional for worker processes.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// PostgreSQL connection string
    pub database_url: String,

    /// Redis connection string (work broker, quota counters, event pub/sub)
    pub redis_url: String,

    // ---- LLM providers ----
    /// Which provider is tried first: "openai" or "gemini"
    #[serde(default = "default_primary_provider")]
    pub provider_primary: String,

    /// OpenAI-compatible API key
    #[serde(default)]
    pub openai_api_key: String,

    #[serde(default = "default_openai_base_url")]
    pub openai_base_url: String,

    #[serde(default = "default_openai_light_model")]
    pub openai_light_model: String,

    #[serde(default = "default_openai_heavy_model")]
    pub openai_heavy_model: String,

    /// Gemini API key
    #[serde(default)]
    pub gemini_api_key: String,

    #[serde(default = "default_gemini_base_url")]
    pub gemini_base_url: String,

    #[serde(default = "default_gemini_light_model")]
    pub gemini_light_model: String,

    #[serde(default = "default_gemini_heavy_model")]
    pub gemini_heavy_model: String,

    /// Per-call deadline for LLM requests, seconds
    #[serde(default = "default_llm_timeout_secs")]
    pub llm_timeout_secs: u64,

    /// Blacklist duration after a service-crash class failure, seconds
    #[serde(default = "default_blacklist_secs")]
    pub provider_blacklist_secs: u64,

    // ---- Quotas ----
    /// Per-provider daily token cap
    #[serde(default = "default_daily_tokens")]
    pub quota_daily_tokens: u64,

    /// Per-provider daily request cap
    #[serde(default = "default_daily_requests")]
    pub quota_daily_requests: u64,

    // ---- Stores ----
    /// Retention of completed results keyed by idempotency key, seconds
    #[serde(default = "default_idempotency_ttl")]
    pub idempotency_ttl_secs: u64,

    /// Retention of the graceful-degradation cache, seconds
    #[serde(default = "default_degradation_ttl")]
    pub degradation_ttl_secs: u64,

    // ---- Pipeline ----
    /// Compliance ratio below which the regeneration stage runs
    #[serde(default = "default_regeneration_threshold")]
    pub compliance_regeneration_threshold: f64,

    /// Lower bound of the stage-1 uncertainty band (exclusive)
    #[serde(default = "default_uncertainty_low")]
    pub stage1_uncertainty_low: f64,

    /// Upper bound of the stage-1 uncertainty band (exclusive)
    #[serde(default = "default_uncertainty_high")]
    pub stage1_uncertainty_high: f64,

    // ---- Worker ----
    /// Soft per-stage deadline, seconds (logged when exceeded)
    #[serde(default = "default_soft_time_limit")]
    pub worker_soft_time_limit_secs: u64,

    /// Hard per-stage deadline, seconds (classifies as timeout)
    #[serde(default = "default_hard_time_limit")]
    pub worker_hard_time_limit_secs: u64,

    /// Broker-level retries for transient failures
    #[serde(default = "default_max_retries")]
    pub worker_max_retries: i32,

    /// Exponential backoff base for broker retries, seconds
    #[serde(default = "default_retry_backoff")]
    pub worker_retry_backoff_secs: u64,

    // ---- Force-new rate limit ----
    /// Force-new requests allowed per origin per window
    #[serde(default = "default_force_new_limit")]
    pub force_new_limit: u32,

    /// Force-new rate-limit window, seconds
    #[serde(default = "default_force_new_window")]
    pub force_new_window_secs: u64,
}

fn default_bind_addr() -> String {
    "0.0.0.0:3000".to_string()
}

fn default_primary_provider() -> String {
    "openai".to_string()
}

fn default_openai_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_openai_light_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_openai_heavy_model() -> String {
    "gpt-4o".to_string()
}

fn default_gemini_base_url() -> String {
    "https://generativelanguage.googleapis.com/v1beta".to_string()
}

fn default_gemini_light_model() -> String {
    "gemini-1.5-flash".to_string()
}

fn default_gemini_heavy_model() -> String {
    "gemini-2.0-flash".to_string()
}

fn default_llm_timeout_secs() -> u64 {
    120
}

fn default_blacklist_secs() -> u64 {
    300
}

fn default_daily_tokens() -> u64 {
    1_000_000
}

fn default_daily_requests() -> u64 {
    1_000
}

fn default_idempotency_ttl() -> u64 {
    86_400
}

fn default_degradation_ttl() -> u64 {
    604_800
}

fn default_regeneration_threshold() -> f64 {
    95.0
}

fn default_uncertainty_low() -> f64 {
    0.30
}

fn default_uncertainty_high() -> f64 {
    0.70
}

fn default_soft_time_limit() -> u64 {
    540
}

fn default_hard_time_limit() -> u64 {
    600
}

fn default_max_retries() -> i32 {
    3
}

fn default_retry_backoff() -> u64 {
    60
}

fn default_force_new_limit() -> u32 {
    3
}

fn default_force_new_window() -> u64 {
    3_600
}

impl AppConfig {
    pub fn from_env() -> Result<Self, envy::Error> {
        dotenvy::dotenv().ok();
        envy::from_env()
    }

    /// Hourly caps are derived from the daily caps, matching the quota
    /// tracker's period model.
    pub fn quota_hourly_tokens(&self) -> u64 {
        self.quota_daily_tokens / 24
    }

    pub fn quota_hourly_requests(&self) -> u64 {
        self.quota_daily_requests / 24
    }
}

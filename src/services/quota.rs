//! Per-provider quota tracking.
//!
//! Counters live in Redis under period-scoped keys and are mutated with
//! atomic `INCRBY`, so concurrent workers never lose updates. Checks compute
//! would-exceed against the configured caps; warnings at 75% and 90% of the
//! daily token cap are logged but do not deny.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::AsyncCommands;
use serde::Serialize;

use crate::config::AppConfig;
use crate::services::errors::AnalysisError;

const WARNING_THRESHOLD: f64 = 0.75;
const CRITICAL_THRESHOLD: f64 = 0.90;

/// Daily keys linger one extra day, hourly keys one extra hour, so a
/// snapshot taken right at a period boundary still resolves.
const DAILY_KEY_TTL_SECS: i64 = 86_400 * 2;
const HOURLY_KEY_TTL_SECS: i64 = 7_200;

/// Why a quota check denied the call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QuotaDenial {
    DailyTokens,
    DailyRequests,
    HourlyTokens,
    HourlyRequests,
}

impl std::fmt::Display for QuotaDenial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            QuotaDenial::DailyTokens => "daily token cap",
            QuotaDenial::DailyRequests => "daily request cap",
            QuotaDenial::HourlyTokens => "hourly token cap",
            QuotaDenial::HourlyRequests => "hourly request cap",
        };
        f.write_str(s)
    }
}

/// Usage for one period of one metric.
#[derive(Debug, Clone, Serialize)]
pub struct MetricUsage {
    pub used: u64,
    pub limit: u64,
    pub remaining: u64,
    pub percentage: f64,
}

impl MetricUsage {
    fn new(used: u64, limit: u64) -> Self {
        Self {
            used,
            limit,
            remaining: limit.saturating_sub(used),
            percentage: if limit == 0 {
                0.0
            } else {
                used as f64 / limit as f64 * 100.0
            },
        }
    }
}

/// Full usage snapshot for a provider.
#[derive(Debug, Clone, Serialize)]
pub struct QuotaSnapshot {
    pub provider: String,
    pub daily_tokens: MetricUsage,
    pub daily_requests: MetricUsage,
    pub hourly_tokens: MetricUsage,
    pub hourly_requests: MetricUsage,
}

impl QuotaSnapshot {
    /// True when any period cap is fully consumed.
    pub fn exhausted(&self) -> bool {
        self.daily_tokens.remaining == 0
            || self.daily_requests.remaining == 0
            || self.hourly_tokens.remaining == 0
            || self.hourly_requests.remaining == 0
    }
}

/// Per-period Redis key, e.g. `quota:openai:daily:2026-08-02:tokens`.
fn period_key(provider: &str, period: &str, period_stamp: &str, metric: &str) -> String {
    format!("quota:{provider}:{period}:{period_stamp}:{metric}")
}

fn daily_stamp(now: DateTime<Utc>) -> String {
    now.format("%Y-%m-%d").to_string()
}

fn hourly_stamp(now: DateTime<Utc>) -> String {
    now.format("%Y-%m-%d:%H").to_string()
}

/// Redis-backed quota tracker.
#[derive(Clone)]
pub struct QuotaTracker {
    client: redis::Client,
    daily_tokens: u64,
    daily_requests: u64,
    hourly_tokens: u64,
    hourly_requests: u64,
}

impl QuotaTracker {
    pub fn new(client: redis::Client, config: &AppConfig) -> Self {
        Self {
            client,
            daily_tokens: config.quota_daily_tokens,
            daily_requests: config.quota_daily_requests,
            hourly_tokens: config.quota_hourly_tokens(),
            hourly_requests: config.quota_hourly_requests(),
        }
    }

    /// Check whether a call with `estimated_tokens` fits within every cap.
    pub async fn check(
        &self,
        provider: &str,
        estimated_tokens: u64,
    ) -> Result<Result<(), QuotaDenial>, redis::RedisError> {
        let snapshot = self.snapshot(provider).await?;

        if snapshot.daily_tokens.used + estimated_tokens > self.daily_tokens {
            return Ok(Err(QuotaDenial::DailyTokens));
        }
        if snapshot.daily_requests.used + 1 > self.daily_requests {
            return Ok(Err(QuotaDenial::DailyRequests));
        }
        if snapshot.hourly_tokens.used + estimated_tokens > self.hourly_tokens {
            return Ok(Err(QuotaDenial::HourlyTokens));
        }
        if snapshot.hourly_requests.used + 1 > self.hourly_requests {
            return Ok(Err(QuotaDenial::HourlyRequests));
        }

        let daily_pct = snapshot.daily_tokens.percentage / 100.0;
        if daily_pct >= CRITICAL_THRESHOLD {
            tracing::error!(
                provider,
                usage_pct = daily_pct * 100.0,
                "provider critically close to daily token cap"
            );
        } else if daily_pct >= WARNING_THRESHOLD {
            tracing::warn!(
                provider,
                usage_pct = daily_pct * 100.0,
                "provider approaching daily token cap"
            );
        }

        Ok(Ok(()))
    }

    /// Record actual usage after a successful call.
    pub async fn record(
        &self,
        provider: &str,
        tokens_used: u64,
        requests: u64,
    ) -> Result<(), redis::RedisError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let now = Utc::now();
        let daily = daily_stamp(now);
        let hourly = hourly_stamp(now);

        for (period, stamp, ttl) in [
            ("daily", daily.as_str(), DAILY_KEY_TTL_SECS),
            ("hourly", hourly.as_str(), HOURLY_KEY_TTL_SECS),
        ] {
            let tokens_key = period_key(provider, period, stamp, "tokens");
            let requests_key = period_key(provider, period, stamp, "requests");
            let _: () = conn.incr(&tokens_key, tokens_used).await?;
            let _: () = conn.expire(&tokens_key, ttl).await?;
            let _: () = conn.incr(&requests_key, requests).await?;
            let _: () = conn.expire(&requests_key, ttl).await?;
        }

        tracing::debug!(provider, tokens_used, requests, "quota usage recorded");
        Ok(())
    }

    /// Current usage across all periods and metrics.
    pub async fn snapshot(&self, provider: &str) -> Result<QuotaSnapshot, redis::RedisError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let now = Utc::now();
        let daily = daily_stamp(now);
        let hourly = hourly_stamp(now);

        let (daily_tokens, daily_requests, hourly_tokens, hourly_requests): (
            Option<u64>,
            Option<u64>,
            Option<u64>,
            Option<u64>,
        ) = redis::pipe()
            .get(period_key(provider, "daily", &daily, "tokens"))
            .get(period_key(provider, "daily", &daily, "requests"))
            .get(period_key(provider, "hourly", &hourly, "tokens"))
            .get(period_key(provider, "hourly", &hourly, "requests"))
            .query_async(&mut conn)
            .await?;

        Ok(QuotaSnapshot {
            provider: provider.to_string(),
            daily_tokens: MetricUsage::new(daily_tokens.unwrap_or(0), self.daily_tokens),
            daily_requests: MetricUsage::new(daily_requests.unwrap_or(0), self.daily_requests),
            hourly_tokens: MetricUsage::new(hourly_tokens.unwrap_or(0), self.hourly_tokens),
            hourly_requests: MetricUsage::new(hourly_requests.unwrap_or(0), self.hourly_requests),
        })
    }

    /// Drop the current-period counters for a provider (admin operation).
    pub async fn reset(&self, provider: &str) -> Result<(), redis::RedisError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let now = Utc::now();
        let daily = daily_stamp(now);
        let hourly = hourly_stamp(now);

        let keys = [
            period_key(provider, "daily", &daily, "tokens"),
            period_key(provider, "daily", &daily, "requests"),
            period_key(provider, "hourly", &hourly, "tokens"),
            period_key(provider, "hourly", &hourly, "requests"),
        ];
        let _: () = conn.del(&keys[..]).await?;

        tracing::info!(provider, "quota counters reset");
        Ok(())
    }
}

/// Quota operations the provider manager depends on. A trait seam so
/// failover logic is testable without Redis.
#[async_trait]
pub trait QuotaGate: Send + Sync {
    async fn check(
        &self,
        provider: &str,
        estimated_tokens: u64,
    ) -> Result<Result<(), QuotaDenial>, AnalysisError>;

    async fn record(
        &self,
        provider: &str,
        tokens_used: u64,
        requests: u64,
    ) -> Result<(), AnalysisError>;
}

#[async_trait]
impl QuotaGate for QuotaTracker {
    async fn check(
        &self,
        provider: &str,
        estimated_tokens: u64,
    ) -> Result<Result<(), QuotaDenial>, AnalysisError> {
        Ok(QuotaTracker::check(self, provider, estimated_tokens).await?)
    }

    async fn record(
        &self,
        provider: &str,
        tokens_used: u64,
        requests: u64,
    ) -> Result<(), AnalysisError> {
        Ok(QuotaTracker::record(self, provider, tokens_used, requests).await?)
    }
}

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use chrono::Utc;
use serde::Serialize;

use crate::app_state::AppState;
use crate::db::idempotency::IdempotencyStats;
use crate::services::providers::ProviderHealth;
use crate::services::quota::QuotaSnapshot;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub checks: HealthChecks,
    pub providers: Vec<ProviderHealth>,
    pub quota: Vec<QuotaSnapshot>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idempotency_cache: Option<IdempotencyStats>,
}

#[derive(Serialize)]
pub struct HealthChecks {
    pub database: ComponentHealth,
    pub broker: ComponentHealth,
    pub providers_available: bool,
    pub quota_available: bool,
}

#[derive(Serialize)]
pub struct ComponentHealth {
    pub status: String,
    pub latency_ms: Option<u64>,
}

/// GET /health — aggregated health of broker, document store, providers and
/// quota. `unhealthy` when infrastructure is down, `degraded` when no
/// provider can currently take a call.
pub async fn health_check(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let start = std::time::Instant::now();

    // Check document store connectivity
    let db_check = match sqlx::query("SELECT 1").execute(&state.db).await {
        Ok(_) => ComponentHealth {
            status: "ok".to_string(),
            latency_ms: Some(start.elapsed().as_millis() as u64),
        },
        Err(_) => ComponentHealth {
            status: "error".to_string(),
            latency_ms: None,
        },
    };

    // Check broker connectivity
    let broker_start = std::time::Instant::now();
    let broker_check = match state.queue.health_check().await {
        Ok(_) => ComponentHealth {
            status: "ok".to_string(),
            latency_ms: Some(broker_start.elapsed().as_millis() as u64),
        },
        Err(_) => ComponentHealth {
            status: "error".to_string(),
            latency_ms: None,
        },
    };

    let providers_available = state.registry.has_available(Utc::now());
    let providers = state.registry.health_report();

    let mut quota = Vec::new();
    let mut quota_available = true;
    for provider in &providers {
        match state.quota.snapshot(&provider.provider_id).await {
            Ok(snapshot) => {
                if snapshot.exhausted() {
                    quota_available = false;
                }
                quota.push(snapshot);
            }
            Err(e) => {
                tracing::warn!(provider = %provider.provider_id, error = %e, "quota snapshot failed");
            }
        }
    }

    let infra_healthy = db_check.status == "ok" && broker_check.status == "ok";
    // Quota counts as available if at least one provider still has headroom.
    let any_quota = quota.is_empty() || quota.iter().any(|s| !s.exhausted());

    let (status, status_code) = if !infra_healthy {
        ("unhealthy", StatusCode::SERVICE_UNAVAILABLE)
    } else if !providers_available || !any_quota {
        ("degraded", StatusCode::OK)
    } else {
        ("healthy", StatusCode::OK)
    };

    let idempotency_cache = state.idempotency.stats().await.ok();

    let response = HealthResponse {
        status: status.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        checks: HealthChecks {
            database: db_check,
            broker: broker_check,
            providers_available,
            quota_available,
        },
        providers,
        quota,
        idempotency_cache,
    };

    (status_code, Json(response))
}

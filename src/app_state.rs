use sqlx::PgPool;
use std::sync::Arc;

use crate::config::AppConfig;
use crate::db::degradation::DegradationStore;
use crate::db::idempotency::IdempotencyStore;
use crate::services::events::EventHub;
use crate::services::providers::ProviderRegistry;
use crate::services::queue::JobQueue;
use crate::services::quota::QuotaTracker;

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub db: PgPool,
    pub config: Arc<AppConfig>,
    pub queue: Arc<JobQueue>,
    pub idempotency: Arc<IdempotencyStore>,
    pub degradation: Arc<DegradationStore>,
    pub quota: Arc<QuotaTracker>,
    pub registry: Arc<ProviderRegistry>,
    pub events: Arc<EventHub>,
    pub redis: redis::Client,
}

impl AppState {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        db: PgPool,
        config: AppConfig,
        queue: JobQueue,
        idempotency: IdempotencyStore,
        degradation: DegradationStore,
        quota: QuotaTracker,
        registry: ProviderRegistry,
        events: EventHub,
        redis: redis::Client,
    ) -> Self {
        Self {
            db,
            config: Arc::new(config),
            queue: Arc::new(queue),
            idempotency: Arc::new(idempotency),
            degradation: Arc::new(degradation),
            quota: Arc::new(quota),
            registry: Arc::new(registry),
            events: Arc::new(events),
            redis,
        }
    }
}

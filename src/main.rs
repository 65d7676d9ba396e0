mod app_state;
mod config;
mod db;
mod models;
mod pipeline;
mod routes;
mod services;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{routing::delete, routing::get, routing::post, Router};
use metrics_exporter_prometheus::PrometheusBuilder;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use app_state::AppState;
use config::AppConfig;
use db::degradation::DegradationStore;
use db::idempotency::IdempotencyStore;
use services::events::EventHub;
use services::providers;
use services::queue::JobQueue;
use services::quota::QuotaTracker;

const REAPER_INTERVAL: Duration = Duration::from_secs(600);
const QUEUE_DEPTH_SAMPLE_INTERVAL: Duration = Duration::from_secs(15);

#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    // Load configuration from environment
    let config = AppConfig::from_env().expect("Failed to load configuration from environment");

    tracing::info!("Initializing policy-audit server");

    // Initialize Prometheus metrics recorder
    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus metrics recorder");
    let prometheus_handle = Arc::new(prometheus_handle);

    // Register application metrics
    metrics::describe_histogram!(
        "analysis_processing_seconds",
        "Time to process a policy analysis job"
    );
    metrics::describe_counter!("analysis_jobs_total", "Total analysis jobs submitted");
    metrics::describe_counter!("analysis_jobs_completed", "Total analysis jobs completed");
    metrics::describe_counter!("analysis_jobs_failed", "Total analysis jobs that failed");
    metrics::describe_counter!(
        "analysis_fallback_served_total",
        "Results served from the degradation cache"
    );
    metrics::describe_counter!("llm_calls_total", "Successful LLM provider calls");
    metrics::describe_counter!("llm_failovers_total", "LLM provider failover events");
    metrics::describe_gauge!(
        "analysis_queue_depth",
        "Current number of pending jobs in the queue"
    );

    // Initialize database connection pool
    tracing::info!("Connecting to PostgreSQL database");
    let db_pool = db::init_pool(&config.database_url)
        .await
        .expect("Failed to connect to database");

    // Run database migrations
    tracing::info!("Running database migrations");
    db::run_migrations(&db_pool)
        .await
        .expect("Failed to run database migrations");

    // Redis backs the broker, quota counters, and event channels
    tracing::info!("Connecting to Redis");
    let redis_client =
        redis::Client::open(config.redis_url.as_str()).expect("Failed to open Redis client");

    let queue = JobQueue::from_client(redis_client.clone());
    let quota = QuotaTracker::new(redis_client.clone(), &config);
    let events = EventHub::new(redis_client.clone());
    let registry = providers::registry_from_config(&config);

    let idempotency = IdempotencyStore::new(db_pool.clone(), config.idempotency_ttl_secs);
    let degradation = DegradationStore::new(db_pool.clone(), config.degradation_ttl_secs);

    // Background maintenance: expired-record reaper and queue-depth gauge
    db::spawn_reaper(db_pool.clone(), REAPER_INTERVAL);
    spawn_queue_depth_sampler(JobQueue::from_client(redis_client.clone()));

    let bind_addr = config.bind_addr.clone();
    let state = AppState::new(
        db_pool,
        config,
        queue,
        idempotency,
        degradation,
        quota,
        registry,
        events,
        redis_client,
    );

    // Build API routes
    let app = Router::new()
        .route("/health", get(routes::health::health_check))
        .route("/api/v1/analyze", post(routes::analyze::submit_analysis))
        .route("/api/v1/analyze/force", post(routes::analyze::force_analysis))
        .route("/api/v1/tasks/:task_id", get(routes::analyze::get_task_status))
        .route("/api/v1/tasks/:task_id", delete(routes::analyze::cancel_task))
        .route(
            "/api/v1/tasks/:task_id/stream",
            get(routes::stream::stream_task),
        )
        .with_state(state)
        // Prometheus metrics endpoint (separate state)
        .route(
            "/metrics",
            get(routes::metrics::prometheus_metrics).with_state(prometheus_handle),
        )
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive())
        .layer(RequestBodyLimitLayer::new(2 * 1024 * 1024)); // 2 MB limit

    tracing::info!("Starting policy-audit on {}", bind_addr);

    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .expect("Failed to bind to address");

    tracing::info!("Server listening on {}", bind_addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .expect("Server error");
}

/// Periodically sample broker depth into the queue-depth gauge.
fn spawn_queue_depth_sampler(queue: JobQueue) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(QUEUE_DEPTH_SAMPLE_INTERVAL);
        loop {
            ticker.tick().await;
            match queue.depth().await {
                Ok(depth) => metrics::gauge!("analysis_queue_depth").set(depth as f64),
                Err(e) => tracing::warn!(error = %e, "queue depth sample failed"),
            }
        }
    });
}

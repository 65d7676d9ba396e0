use policy_audit::{
    config::AppConfig,
    db::{self, degradation::DegradationStore, idempotency::IdempotencyStore, jobs},
    models::analysis::PolicyType,
    models::job::{FailureKind, JobError, JobProgress, JobStatus},
    services::events::{EventHub, JobEventPublisher},
    services::fingerprint,
    services::queue::{JobQueue, QueuedJob},
    services::quota::QuotaTracker,
};
use policy_audit::models::events::TaskEvent;
use uuid::Uuid;

const POLICY_TEXT: &str = "Return and refund policy. Customers may return any item within \
    14 days of delivery for a full refund or exchange, provided the item is unused and in \
    its original packaging with proof of purchase.";

/// Integration test: storage, broker, quota, and event plumbing.
///
/// This test verifies the infrastructure integration:
/// 1. Database connection and schema
/// 2. Job store lifecycle (create/progress/complete/cancel)
/// 3. Idempotency store TTL semantics
/// 4. Degradation store lookups
/// 5. Job queue (enqueue/dequeue/delayed promotion)
/// 6. Quota counters and snapshots
/// 7. Event pub/sub round trip
///
/// Note: This requires a running PostgreSQL and Redis instance
/// configured via environment variables.
#[tokio::test]
#[ignore] // Run with: cargo test --test integration_test -- --ignored
async fn test_full_integration() {
    let config = AppConfig::from_env().expect("Failed to load config");

    let db_pool = db::init_pool(&config.database_url)
        .await
        .expect("Failed to connect to database");

    db::run_migrations(&db_pool)
        .await
        .expect("Failed to run migrations");

    let redis_client =
        redis::Client::open(config.redis_url.as_str()).expect("Failed to open Redis client");
    let queue = JobQueue::from_client(redis_client.clone());
    let quota = QuotaTracker::new(redis_client.clone(), &config);
    let events = EventHub::new(redis_client);

    // 1. Job store lifecycle
    let job_id = Uuid::new_v4();
    let idempotency_key = fingerprint::idempotency_key(
        "Integration Shop",
        "Electronics",
        PolicyType::Returns,
        POLICY_TEXT,
    );
    let content_hash = fingerprint::content_hash(POLICY_TEXT);

    jobs::create_job(
        &db_pool,
        job_id,
        "Integration Shop",
        "Electronics",
        PolicyType::Returns,
        POLICY_TEXT,
        &idempotency_key,
        &content_hash,
    )
    .await
    .expect("Failed to create job");

    let job = jobs::get_job(&db_pool, job_id)
        .await
        .expect("Failed to get job")
        .expect("Job not found");
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.idempotency_key, idempotency_key);
    assert_eq!(job.retry_count, 0);

    jobs::mark_running(&db_pool, job_id)
        .await
        .expect("Failed to mark running");
    jobs::update_progress(
        &db_pool,
        job_id,
        &JobProgress {
            current: 2,
            total: 5,
            status: "Analyzing legal compliance...".to_string(),
        },
    )
    .await
    .expect("Failed to update progress");

    let job = jobs::get_job(&db_pool, job_id)
        .await
        .expect("Failed to get job")
        .expect("Job not found");
    assert_eq!(job.status, JobStatus::Running);
    assert_eq!(job.progress.as_ref().map(|p| p.current), Some(2));

    // 2. Queue round trip
    let queued = QueuedJob {
        job_id,
        shop_name: "Integration Shop".to_string(),
        shop_specialization: "Electronics".to_string(),
        policy_type: PolicyType::Returns,
        policy_text: POLICY_TEXT.to_string(),
        idempotency_key: idempotency_key.clone(),
        content_hash: content_hash.clone(),
    };

    queue.enqueue(&queued).await.expect("Failed to enqueue");
    assert!(queue.depth().await.expect("depth") >= 1);

    let dequeued = queue
        .dequeue()
        .await
        .expect("Failed to dequeue")
        .expect("No job in queue");
    assert_eq!(dequeued.job_id, job_id);
    queue.complete(&dequeued).await.expect("Failed to complete");

    // 3. Delayed delivery: not visible until promoted after its due time
    queue
        .enqueue_delayed(&queued, 0)
        .await
        .expect("Failed to enqueue delayed");
    let promoted = queue.promote_due().await.expect("Failed to promote");
    assert!(promoted >= 1);
    let redelivered = queue
        .dequeue()
        .await
        .expect("Failed to dequeue")
        .expect("No promoted job");
    assert_eq!(redelivered.job_id, job_id);
    queue.complete(&redelivered).await.expect("Failed to complete");

    // 4. Idempotency store
    let idempotency = IdempotencyStore::new(db_pool.clone(), 3600);
    let payload = serde_json::json!({"success": true, "compliance_report": {"overall_compliance_ratio": 91.0}});
    idempotency
        .store(&idempotency_key, &payload)
        .await
        .expect("Failed to store");
    assert!(idempotency.has(&idempotency_key).await.expect("has failed"));
    let cached = idempotency
        .get(&idempotency_key)
        .await
        .expect("get failed")
        .expect("cache miss");
    assert_eq!(cached["success"], true);

    // 5. Degradation store
    let degradation = DegradationStore::new(db_pool.clone(), 3600);
    degradation
        .store(PolicyType::Returns, &content_hash, &payload)
        .await
        .expect("Failed to store fallback");
    let fallback = degradation
        .find(PolicyType::Returns, &content_hash)
        .await
        .expect("find failed")
        .expect("fallback miss");
    assert_eq!(fallback["success"], true);
    assert!(degradation
        .find(PolicyType::Privacy, &content_hash)
        .await
        .expect("find failed")
        .is_none());

    // 6. Quota counters
    quota.reset("openai").await.expect("reset failed");
    quota.record("openai", 1234, 1).await.expect("record failed");
    let snapshot = quota.snapshot("openai").await.expect("snapshot failed");
    assert_eq!(snapshot.daily_tokens.used, 1234);
    assert_eq!(snapshot.daily_requests.used, 1);
    assert!(quota
        .check("openai", 100)
        .await
        .expect("check failed")
        .is_ok());

    // 7. Event pub/sub round trip
    let mut subscription = events.subscribe(job_id).await.expect("subscribe failed");
    let publisher = JobEventPublisher::new(std::sync::Arc::new(events.clone()), job_id);
    publisher
        .publish(&TaskEvent::Progress {
            current: 3,
            total: 5,
            status: "Rewriting improved policy...".to_string(),
            shop_name: Some("Integration Shop".to_string()),
        })
        .await
        .expect("publish failed");

    let received = tokio::time::timeout(
        std::time::Duration::from_secs(5),
        subscription.next_event(),
    )
    .await
    .expect("timed out waiting for event")
    .expect("subscription closed");
    assert_eq!(received.progress_current(), Some(3));

    // 8. Terminal transitions and replay state
    jobs::complete_job(&db_pool, job_id, &payload, &["rule_match".to_string()])
        .await
        .expect("Failed to complete job");
    let job = jobs::get_job(&db_pool, job_id)
        .await
        .expect("Failed to get job")
        .expect("Job not found");
    assert_eq!(job.status, JobStatus::Completed);
    assert!(job.result.is_some());
    assert_eq!(job.completed_stages, vec!["rule_match".to_string()]);

    // Cancellation on a terminal job is refused.
    assert!(!jobs::request_cancel(&db_pool, job_id)
        .await
        .expect("cancel query failed"));

    // 9. Failure record shape survives the round trip
    let failed_id = Uuid::new_v4();
    jobs::create_job(
        &db_pool,
        failed_id,
        "Integration Shop",
        "Electronics",
        PolicyType::Returns,
        POLICY_TEXT,
        "other-key",
        &content_hash,
    )
    .await
    .expect("Failed to create job");
    let mut error = JobError::new(FailureKind::Timeout, "deadline exceeded");
    error.failed_stage = Some("compliance_analysis".to_string());
    jobs::fail_job(&db_pool, failed_id, &error)
        .await
        .expect("Failed to fail job");
    let failed = jobs::get_job(&db_pool, failed_id)
        .await
        .expect("Failed to get job")
        .expect("Job not found");
    assert_eq!(failed.status, JobStatus::Failed);
    assert_eq!(
        failed.error.expect("error record").kind,
        FailureKind::Timeout
    );

    // Cleanup
    idempotency.delete(&idempotency_key).await.expect("delete failed");
    degradation
        .clear(PolicyType::Returns)
        .await
        .expect("clear failed");

    println!("All integration checks passed");
}

/// Fingerprints must be identical across processes and restarts.
#[test]
fn test_fingerprint_stability() {
    let a = fingerprint::idempotency_key("Shop", "Books", PolicyType::Shipping, "Some policy");
    let b = fingerprint::idempotency_key("  shop ", "BOOKS", PolicyType::Shipping, "some  policy");
    assert_eq!(a, b);
    assert_eq!(a.len(), 64);
}

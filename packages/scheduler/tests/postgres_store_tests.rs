//! Integration tests for the PostgreSQL job store and item storage.
//!
//! Need Docker: `cargo test -p scheduler --test postgres_store_tests -- --ignored`

mod common;

use std::sync::Arc;
use std::time::Duration;

use collectors::{CollectedItem, ItemFilter, PostgresStorage, RawItem, StorageAdapter};
use common::TestHarness;
use scheduler_core::kernel::jobs::{
    ClaimLane, FinishOutcome, HeartbeatOutcome, Job, JobOutcome, JobStatus, JobStore,
    PostgresJobStore, RetryPolicy,
};
use test_context::test_context;

fn job(name: &str, priority: i16) -> Job {
    Job::builder()
        .name(name)
        .collaborator("demo")
        .keywords(vec!["rust".to_string()])
        .priority(priority)
        .build()
}

fn store(ctx: &TestHarness) -> PostgresJobStore {
    PostgresJobStore::with_retry_policy(ctx.db_pool.clone(), RetryPolicy::immediate())
}

async fn age_heartbeat(ctx: &TestHarness, job_id: &str, secs: i64) {
    sqlx::query(
        "UPDATE jobs SET last_heartbeat = NOW() - $2 * INTERVAL '1 second' WHERE job_id = $1",
    )
    .bind(job_id)
    .bind(secs)
    .execute(&ctx.db_pool)
    .await
    .unwrap();
}

#[test_context(TestHarness)]
#[tokio::test]
#[ignore = "requires Docker"]
async fn insert_and_get_preserve_descriptor(ctx: &TestHarness) {
    let store = store(ctx);
    let mut j = job("descriptor", 4);
    j.storage_config = serde_json::json!({ "type": "json" });
    j.options = serde_json::json!({ "sort_by": "recent" });
    let inserted = store.insert(j.clone()).await.unwrap();

    let loaded = store.get(&inserted.job_id).await.unwrap().unwrap();
    assert_eq!(loaded.name, "descriptor");
    assert_eq!(loaded.keywords, vec!["rust".to_string()]);
    assert_eq!(loaded.storage_type(), Some("json"));
    assert_eq!(loaded.status, JobStatus::Pending);
    assert!(store.insert(j).await.is_err(), "duplicate id must be rejected");
}

#[test_context(TestHarness)]
#[tokio::test]
#[ignore = "requires Docker"]
async fn claim_ranks_priority_then_immediate_then_age(ctx: &TestHarness) {
    let store = store(ctx);
    let old = store.insert(job("old", 6)).await.unwrap();
    let young = store.insert(job("young", 6)).await.unwrap();
    let mut now = job("now", 6);
    now.immediate = true;
    let now = store.insert(now).await.unwrap();
    let best = store.insert(job("best", 4)).await.unwrap();

    let mut order = Vec::new();
    while let Some(claimed) = store.claim_next("w", ClaimLane::Normal).await.unwrap() {
        order.push(claimed.job_id);
    }
    assert_eq!(order, vec![best.job_id, now.job_id, old.job_id, young.job_id]);
}

#[test_context(TestHarness)]
#[tokio::test]
#[ignore = "requires Docker"]
async fn lanes_split_urgent_from_normal(ctx: &TestHarness) {
    let store = store(ctx);
    let urgent = store.insert(job("urgent", 2)).await.unwrap();
    let normal = store.insert(job("normal", 8)).await.unwrap();

    let claimed = store.claim_next("w", ClaimLane::Urgent).await.unwrap().unwrap();
    assert_eq!(claimed.job_id, urgent.job_id);
    assert!(store.claim_next("w", ClaimLane::Urgent).await.unwrap().is_none());

    let claimed = store.claim_next("w", ClaimLane::Normal).await.unwrap().unwrap();
    assert_eq!(claimed.job_id, normal.job_id);
    assert_eq!(claimed.status, JobStatus::Running);
    assert_eq!(claimed.worker_id.as_deref(), Some("w"));
}

#[test_context(TestHarness)]
#[tokio::test]
#[ignore = "requires Docker"]
async fn concurrent_claims_have_one_winner(ctx: &TestHarness) {
    let store = Arc::new(store(ctx));
    store.insert(job("contended", 5)).await.unwrap();

    let mut handles = Vec::new();
    for i in 0..8 {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            store
                .claim_next(&format!("worker-{i}"), ClaimLane::Normal)
                .await
                .unwrap()
        }));
    }

    let mut winners = 0;
    for handle in handles {
        if handle.await.unwrap().is_some() {
            winners += 1;
        }
    }
    assert_eq!(winners, 1);
}

#[test_context(TestHarness)]
#[tokio::test]
#[ignore = "requires Docker"]
async fn heartbeat_requires_ownership_and_keeps_max_progress(ctx: &TestHarness) {
    let store = store(ctx);
    let j = store.insert(job("beat", 5)).await.unwrap();
    store.claim_next("owner", ClaimLane::Normal).await.unwrap();

    assert_eq!(
        store.heartbeat(&j.job_id, "owner", 0.5).await.unwrap(),
        HeartbeatOutcome::Alive
    );
    store.heartbeat(&j.job_id, "owner", 0.3).await.unwrap();
    assert_eq!(
        store.heartbeat(&j.job_id, "intruder", 0.9).await.unwrap(),
        HeartbeatOutcome::OwnershipLost
    );

    let stored = store.get(&j.job_id).await.unwrap().unwrap();
    assert_eq!(stored.progress, 0.5);
}

#[test_context(TestHarness)]
#[tokio::test]
#[ignore = "requires Docker"]
async fn failures_retry_then_fail_terminally(ctx: &TestHarness) {
    let store = store(ctx);
    let mut j = job("flaky", 5);
    j.max_retry = 1;
    let j = store.insert(j).await.unwrap();

    store.claim_next("w", ClaimLane::Normal).await.unwrap().unwrap();
    let first = store
        .finish(&j.job_id, "w", JobOutcome::Failed { error: "boom".into() })
        .await
        .unwrap();
    assert!(matches!(first, FinishOutcome::Retrying { attempt: 1, .. }));

    store.claim_next("w", ClaimLane::Normal).await.unwrap().unwrap();
    let second = store
        .finish(&j.job_id, "w", JobOutcome::Failed { error: "boom again".into() })
        .await
        .unwrap();
    assert_eq!(second, FinishOutcome::Failed);

    let stored = store.get(&j.job_id).await.unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::Failed);
    assert_eq!(stored.current_retry, 1);
    assert_eq!(stored.error_message.as_deref(), Some("boom again"));
    assert!(stored.worker_id.is_none());
}

#[test_context(TestHarness)]
#[tokio::test]
#[ignore = "requires Docker"]
async fn backoff_hides_retried_job(ctx: &TestHarness) {
    let store = PostgresJobStore::new(ctx.db_pool.clone());
    let j = store.insert(job("backoff", 5)).await.unwrap();
    store.claim_next("w", ClaimLane::Normal).await.unwrap();
    store
        .finish(&j.job_id, "w", JobOutcome::Failed { error: "boom".into() })
        .await
        .unwrap();

    assert!(store.claim_next("w", ClaimLane::Normal).await.unwrap().is_none());
    let stored = store.get(&j.job_id).await.unwrap().unwrap();
    assert!(stored.retry_at.unwrap() > stored.updated_at);
}

#[test_context(TestHarness)]
#[tokio::test]
#[ignore = "requires Docker"]
async fn completion_records_count_and_rearms_schedules(ctx: &TestHarness) {
    let store = store(ctx);
    let once = store.insert(job("once", 5)).await.unwrap();
    let mut recurring = job("recurring", 5);
    recurring.schedule = Some("*/5 * * * *".into());
    recurring.immediate = true;
    let recurring = store.insert(recurring).await.unwrap();

    store.claim_next("w", ClaimLane::Urgent).await.unwrap().unwrap();
    store.claim_next("w", ClaimLane::Normal).await.unwrap().unwrap();

    let done = store
        .finish(&once.job_id, "w", JobOutcome::Completed { result_count: 7 })
        .await
        .unwrap();
    assert_eq!(done, FinishOutcome::Completed);
    let stored = store.get(&once.job_id).await.unwrap().unwrap();
    assert_eq!(stored.result_count, 7);
    assert_eq!(stored.progress, 1.0);

    let rearmed = store
        .finish(&recurring.job_id, "w", JobOutcome::Completed { result_count: 3 })
        .await
        .unwrap();
    assert!(matches!(rearmed, FinishOutcome::Rescheduled { .. }));
    let stored = store.get(&recurring.job_id).await.unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::Pending);
    assert!(stored.next_run_at.is_some());
}

#[test_context(TestHarness)]
#[tokio::test]
#[ignore = "requires Docker"]
async fn reaper_reclaims_silent_jobs(ctx: &TestHarness) {
    let store = store(ctx);
    let zombie = store.insert(job("zombie", 4)).await.unwrap();
    let alive = store.insert(job("alive", 6)).await.unwrap();
    store.claim_next("dead-worker", ClaimLane::Normal).await.unwrap();
    store.claim_next("live-worker", ClaimLane::Normal).await.unwrap();
    age_heartbeat(ctx, &zombie.job_id, 7200).await;

    let reaped = store.reap_zombies(Duration::from_secs(3600)).await.unwrap();
    assert_eq!(reaped.len(), 1);
    assert_eq!(reaped[0].job_id, zombie.job_id);
    assert_eq!(reaped[0].worker_id.as_deref(), Some("dead-worker"));
    assert!(matches!(reaped[0].outcome, FinishOutcome::Retrying { attempt: 1, .. }));

    let stored = store.get(&zombie.job_id).await.unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::Pending);
    assert!(stored
        .error_message
        .unwrap()
        .starts_with("zombie job reclaimed: no heartbeat for"));

    let other = store.get(&alive.job_id).await.unwrap().unwrap();
    assert_eq!(other.status, JobStatus::Running);

    // The dead worker can no longer finish what it lost
    let late = store
        .finish(&zombie.job_id, "dead-worker", JobOutcome::Completed { result_count: 1 })
        .await
        .unwrap();
    assert_eq!(late, FinishOutcome::OwnershipLost);
}

#[test_context(TestHarness)]
#[tokio::test]
#[ignore = "requires Docker"]
async fn cancel_signals_the_running_worker(ctx: &TestHarness) {
    let store = store(ctx);
    let j = store.insert(job("cancel me", 5)).await.unwrap();
    store.claim_next("w", ClaimLane::Normal).await.unwrap();

    assert!(store.cancel(&j.job_id).await.unwrap());
    assert_eq!(
        store.heartbeat(&j.job_id, "w", 0.4).await.unwrap(),
        HeartbeatOutcome::Cancelled
    );
    assert!(!store.cancel(&j.job_id).await.unwrap());

    let stats = store.stats().await.unwrap();
    assert_eq!(stats.count(JobStatus::Cancelled), 1);
    assert_eq!(stats.by_collaborator["demo"], 1);
}

#[test_context(TestHarness)]
#[tokio::test]
#[ignore = "requires Docker"]
async fn item_storage_commits_batches_and_skips_known_ids(ctx: &TestHarness) {
    let storage = PostgresStorage::from_pool(ctx.db_pool.clone()).await.unwrap();

    let item = |id: &str, content: &str| {
        let mut item =
            CollectedItem::from_raw(RawItem::new("demo", content).with_id(id), content.to_string());
        item.metadata
            .insert("job_id".into(), serde_json::Value::String("job-1".into()));
        item
    };

    let first = storage
        .save(&[item("a", "first item content"), item("b", "second item content")])
        .await
        .unwrap();
    assert_eq!(first, 2);

    let second = storage
        .save(&[item("a", "changed content"), item("c", "third item content")])
        .await
        .unwrap();
    assert_eq!(second, 1);

    let saved = storage.query(&ItemFilter::for_job("job-1")).await.unwrap();
    assert_eq!(saved.len(), 3);
    let a = saved.iter().find(|i| i.id == "a").unwrap();
    assert_eq!(a.content, "first item content");
}

//! Postgres store behavior, checked against a scratch database.
//!
//! Run with `DATABASE_URL=... cargo test --features postgres-tests`.
#![cfg(feature = "postgres-tests")]

use chrono::{DateTime, Duration, Utc};
use sqlx::PgPool;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use metrics_retention::db::Database;
use metrics_retention::error::AppError;
use metrics_retention::models::{ChangeDecision, CleanupStatus, PostKey, PostMetrics};
use metrics_retention::routes::metrics::Metrics;
use metrics_retention::store::{MetricsStore, PollRequest};
use metrics_retention::tasks::cleanup::DuplicateCleanupJob;
use metrics_retention::tracker::MetricsChangeTracker;

fn base_time() -> DateTime<Utc> {
    DateTime::parse_from_rfc3339("2025-03-01T12:00:00Z")
        .unwrap()
        .with_timezone(&Utc)
}

fn views(n: i64) -> PostMetrics {
    PostMetrics::new(n, 0, 0, 0)
}

async fn insert_post(pool: &PgPool, key: PostKey, date: DateTime<Utc>) {
    sqlx::query("INSERT INTO posts (channel_id, msg_id, date) VALUES ($1, $2, $3)")
        .bind(key.channel_id)
        .bind(key.msg_id)
        .bind(date)
        .execute(pool)
        .await
        .unwrap();
}

async fn insert_snapshot(pool: &PgPool, key: PostKey, at: DateTime<Utc>, metrics: PostMetrics) {
    sqlx::query(
        "INSERT INTO post_metrics (channel_id, msg_id, snapshot_time, views, forwards, replies, reactions)
         VALUES ($1, $2, $3, $4, $5, $6, $7)",
    )
    .bind(key.channel_id)
    .bind(key.msg_id)
    .bind(at)
    .bind(metrics.views)
    .bind(metrics.forwards)
    .bind(metrics.replies)
    .bind(metrics.reactions)
    .execute(pool)
    .await
    .unwrap();
}

async fn poll(
    db: &Database,
    key: PostKey,
    metrics: PostMetrics,
    at: DateTime<Utc>,
) -> ChangeDecision {
    db.apply_poll(
        &PollRequest {
            key,
            metrics,
            observed_at: at,
            posted_at: None,
        },
        &MetricsChangeTracker::default(),
    )
    .await
    .unwrap()
    .decision
}

#[sqlx::test(migrations = "./migrations")]
async fn apply_poll_saves_only_changes(pool: PgPool) {
    let db = Database::from_pool(pool.clone());
    let key = PostKey::new(-1001, 1);
    let t0 = base_time();
    insert_post(&pool, key, t0 - Duration::minutes(30)).await;

    assert_eq!(poll(&db, key, views(100), t0).await, ChangeDecision::Save);
    assert_eq!(poll(&db, key, views(100), t0 + Duration::minutes(10)).await, ChangeDecision::Skip);
    assert_eq!(poll(&db, key, views(100), t0 + Duration::minutes(20)).await, ChangeDecision::Skip);
    assert_eq!(poll(&db, key, views(150), t0 + Duration::minutes(30)).await, ChangeDecision::Save);
    // replay of an applied observation
    assert_eq!(poll(&db, key, views(999), t0).await, ChangeDecision::Stale);

    let record = db.check_record(key).await.unwrap().unwrap();
    assert_eq!(record.check_count, 4);
    assert_eq!(record.save_count, 2);
    assert_eq!(record.last_checked_at, t0 + Duration::minutes(30));
    assert_eq!(record.last_changed_at, Some(t0 + Duration::minutes(30)));
    assert_eq!(record.stable_since, None);
    assert_eq!(record.post_age_hours, Some(1.0));

    assert_eq!(db.count_snapshots().await.unwrap(), 2);
    let latest = db.latest_snapshot(key).await.unwrap().unwrap();
    assert_eq!(latest.metrics.views, 150);
}

#[sqlx::test(migrations = "./migrations")]
async fn apply_poll_for_unknown_post_leaves_nothing(pool: PgPool) {
    let db = Database::from_pool(pool);
    let key = PostKey::new(-1001, 404);

    let err = db
        .apply_poll(
            &PollRequest {
                key,
                metrics: views(1),
                observed_at: base_time(),
                posted_at: None,
            },
            &MetricsChangeTracker::default(),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, AppError::NotFound(_)));
    assert!(db.check_record(key).await.unwrap().is_none());
    assert_eq!(db.count_snapshots().await.unwrap(), 0);
}

#[sqlx::test(migrations = "./migrations")]
async fn due_candidates_follow_tier_intervals(pool: PgPool) {
    let db = Database::from_pool(pool.clone());
    let t0 = base_time();
    let fresh = PostKey::new(1, 1);
    let old = PostKey::new(1, 2);
    let unchecked = PostKey::new(1, 3);
    insert_post(&pool, fresh, t0 - Duration::minutes(30)).await;
    insert_post(&pool, old, t0 - Duration::days(10)).await;
    insert_post(&pool, unchecked, t0 - Duration::days(10)).await;

    poll(&db, fresh, views(1), t0).await;
    poll(&db, old, views(1), t0).await;

    let keys = |c: Vec<metrics_retention::models::PollCandidate>| {
        c.into_iter().map(|c| c.key).collect::<Vec<_>>()
    };

    let due = keys(db.due_candidates(t0 + Duration::minutes(5), 100).await.unwrap());
    assert_eq!(due, vec![unchecked]);

    let due = keys(db.due_candidates(t0 + Duration::minutes(10), 100).await.unwrap());
    assert_eq!(due, vec![unchecked, fresh]);

    let due = keys(db.due_candidates(t0 + Duration::hours(23), 100).await.unwrap());
    assert!(!due.contains(&old));

    let due = keys(db.due_candidates(t0 + Duration::hours(24), 100).await.unwrap());
    assert!(due.contains(&old));

    let due = db.due_candidates(t0 + Duration::hours(24), 1).await.unwrap();
    assert_eq!(due.len(), 1);
    assert_eq!(due[0].key, unchecked);
}

#[sqlx::test(migrations = "./migrations")]
async fn refresh_ages_and_report_stats(pool: PgPool) {
    let db = Database::from_pool(pool.clone());
    let t0 = base_time();
    let key = PostKey::new(2, 1);
    insert_post(&pool, key, t0).await;
    poll(&db, key, views(5), t0).await;
    poll(&db, key, views(5), t0 + Duration::minutes(10)).await;

    let updated = db.refresh_post_ages(t0 + Duration::hours(36)).await.unwrap();
    assert_eq!(updated, 1);
    let record = db.check_record(key).await.unwrap().unwrap();
    assert_eq!(record.post_age_hours, Some(36.0));

    let stats = db.efficiency_stats().await.unwrap();
    assert_eq!(stats.tracked_posts, 1);
    assert_eq!(stats.total_checks, 2);
    assert_eq!(stats.total_saves, 1);
    assert_eq!(stats.stable_posts, 1);
    assert_eq!(stats.by_tier.len(), 1);
    assert_eq!(stats.by_tier[0].tier, "daily");

    let storage = db.storage_report().await.unwrap();
    assert_eq!(storage.snapshot_rows, 1);
    assert_eq!(storage.rows_avoided, 1);
    assert!(storage.post_metrics_bytes.unwrap_or(0) > 0);
}

#[sqlx::test(migrations = "./migrations")]
async fn cleanup_removes_consecutive_duplicates_in_pages(pool: PgPool) {
    let db = Arc::new(Database::from_pool(pool.clone()));
    let t0 = base_time();
    for msg_id in 0..3 {
        let key = PostKey::new(3, msg_id);
        insert_post(&pool, key, t0 - Duration::days(8)).await;
        // 5 5 6 6 5 -> two duplicates per post
        for (i, n) in [5, 5, 6, 6, 5].into_iter().enumerate() {
            insert_snapshot(&pool, key, t0 + Duration::hours(i as i64), views(n)).await;
        }
    }

    let job = DuplicateCleanupJob::new(db.clone(), Arc::new(Metrics::new()));

    let dry = job.run(true, 4, CancellationToken::new()).await.unwrap();
    assert_eq!(dry.total_before, 15);
    assert_eq!(dry.duplicates_found, 6);
    assert_eq!(db.count_snapshots().await.unwrap(), 15);

    let live = job.run(false, 4, CancellationToken::new()).await.unwrap();
    assert_eq!(live.status, CleanupStatus::Completed);
    assert_eq!(live.duplicates_removed, 6);
    assert_eq!(db.count_snapshots().await.unwrap(), 9);

    let again = job.run(false, 4, CancellationToken::new()).await.unwrap();
    assert_eq!(again.duplicates_removed, 0);
}

#[sqlx::test(migrations = "./migrations")]
async fn deleting_post_cascades(pool: PgPool) {
    let db = Database::from_pool(pool.clone());
    let key = PostKey::new(4, 1);
    insert_post(&pool, key, base_time()).await;
    poll(&db, key, views(1), base_time()).await;

    sqlx::query("DELETE FROM posts WHERE channel_id = $1 AND msg_id = $2")
        .bind(key.channel_id)
        .bind(key.msg_id)
        .execute(&pool)
        .await
        .unwrap();

    assert!(db.check_record(key).await.unwrap().is_none());
    assert_eq!(db.count_snapshots().await.unwrap(), 0);
}

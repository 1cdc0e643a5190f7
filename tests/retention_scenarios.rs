//! End-to-end retention scenarios over the in-memory store

use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use metrics_retention::models::{
    ChangeDecision, CleanupStatus, PostKey, PostMetrics, PostMetricsSnapshot,
};
use metrics_retention::routes::metrics::Metrics;
use metrics_retention::store::{MemoryStore, MetricsStore};
use metrics_retention::tasks::cleanup::DuplicateCleanupJob;
use metrics_retention::tracker::{Materiality, MetricsChangeTracker};
use metrics_retention::writer::SnapshotWriter;

fn base_time() -> DateTime<Utc> {
    DateTime::parse_from_rfc3339("2025-03-01T12:00:00Z")
        .unwrap()
        .with_timezone(&Utc)
}

fn views(n: i64) -> PostMetrics {
    PostMetrics::new(n, 0, 0, 0)
}

fn setup(materiality: Materiality) -> (Arc<MemoryStore>, SnapshotWriter) {
    let store = Arc::new(MemoryStore::new());
    let writer = SnapshotWriter::new(
        store.clone(),
        MetricsChangeTracker::new(materiality),
        Arc::new(Metrics::new()),
    );
    (store, writer)
}

#[tokio::test]
async fn identical_polls_store_one_snapshot() {
    let (store, writer) = setup(Materiality::default());
    let key = PostKey::new(-1001, 1);
    let t0 = base_time();
    store.insert_post(key, t0 - Duration::minutes(30));

    let mut decisions = Vec::new();
    for i in 0..3 {
        let outcome = writer
            .process_poll(key, views(100), t0 + Duration::minutes(10 * i), None)
            .await
            .unwrap();
        decisions.push(outcome.decision);
    }

    assert_eq!(
        decisions,
        vec![ChangeDecision::Save, ChangeDecision::Skip, ChangeDecision::Skip]
    );
    assert_eq!(store.snapshots_for(key).len(), 1);

    let record = store.check_record(key).await.unwrap().unwrap();
    assert_eq!(record.check_count, 3);
    assert_eq!(record.save_count, 1);
    assert_eq!(record.stable_since, Some(t0 + Duration::minutes(10)));
    assert_eq!(record.last_changed_at, Some(t0));
    assert_eq!(record.last_checked_at, t0 + Duration::minutes(20));
}

#[tokio::test]
async fn change_then_repeat_stores_two_snapshots() {
    let (store, writer) = setup(Materiality::default());
    let key = PostKey::new(-1001, 2);
    let t0 = base_time();
    store.insert_post(key, t0 - Duration::hours(2));

    for (i, n) in [100, 150, 150].into_iter().enumerate() {
        writer
            .process_poll(key, views(n), t0 + Duration::minutes(30 * i as i64), None)
            .await
            .unwrap();
    }

    let snapshots = store.snapshots_for(key);
    assert_eq!(snapshots.len(), 2);
    assert_eq!(snapshots[0].metrics.views, 100);
    assert_eq!(snapshots[1].metrics.views, 150);

    let record = store.check_record(key).await.unwrap().unwrap();
    assert_eq!(record.check_count, 3);
    assert_eq!(record.save_count, 2);
    assert_eq!(record.last_changed_at, Some(t0 + Duration::minutes(30)));
    assert_eq!(record.stable_since, Some(t0 + Duration::minutes(60)));
}

#[tokio::test]
async fn unchanged_poll_advances_checked_but_not_changed() {
    let (store, writer) = setup(Materiality::default());
    let key = PostKey::new(-1001, 3);
    let t0 = base_time();
    store.insert_post(key, t0 - Duration::days(3));

    writer.process_poll(key, views(7), t0, None).await.unwrap();
    let before = store.check_record(key).await.unwrap().unwrap();

    writer
        .process_poll(key, views(7), t0 + Duration::hours(6), None)
        .await
        .unwrap();
    let after = store.check_record(key).await.unwrap().unwrap();

    assert!(after.last_checked_at > before.last_checked_at);
    assert_eq!(after.last_changed_at, before.last_changed_at);
    assert_eq!(store.snapshots_for(key).len(), 1);
}

#[tokio::test]
async fn save_count_never_exceeds_check_count() {
    let (store, writer) = setup(Materiality::default());
    let key = PostKey::new(-1001, 4);
    let t0 = base_time();
    store.insert_post(key, t0);

    let series = [1, 1, 2, 2, 2, 3, 5, 5, 8, 8, 8, 8, 13];
    for (i, n) in series.into_iter().enumerate() {
        let observed_at = t0 + Duration::minutes(10 * i as i64);
        writer.process_poll(key, views(n), observed_at, None).await.unwrap();

        let record = store.check_record(key).await.unwrap().unwrap();
        assert!(record.save_count <= record.check_count);
        assert_eq!(record.save_count as usize, store.snapshots_for(key).len());
    }

    // a replay of an already-applied observation changes nothing
    let replay = writer
        .process_poll(key, views(99), t0, None)
        .await
        .unwrap();
    assert_eq!(replay.decision, ChangeDecision::Stale);
    let record = store.check_record(key).await.unwrap().unwrap();
    assert_eq!(record.check_count, series.len() as i32);
    assert_eq!(record.save_count, 6);
}

#[tokio::test]
async fn thresholded_detection_compares_against_stored_snapshot() {
    let (store, writer) = setup(Materiality::new(10, 0.0));
    let key = PostKey::new(-1001, 5);
    let t0 = base_time();
    store.insert_post(key, t0);

    // each step is below the threshold; the drift from the stored row is not
    for (i, n) in [100, 104, 108, 112].into_iter().enumerate() {
        writer
            .process_poll(key, views(n), t0 + Duration::minutes(10 * i as i64), None)
            .await
            .unwrap();
    }

    let snapshots = store.snapshots_for(key);
    assert_eq!(snapshots.len(), 2);
    assert_eq!(snapshots[1].metrics.views, 112);
}

/// 10 posts with 10 rows each; every post has exactly one repeated row.
fn seed_hundred_rows(store: &MemoryStore) {
    let t0 = base_time();
    for msg_id in 0..10 {
        let key = PostKey::new(-2002, msg_id);
        store.insert_post(key, t0 - Duration::days(10));
        for j in 0..10 {
            let n = if j == 5 { 4 } else { j };
            store
                .insert_snapshot(PostMetricsSnapshot::new(
                    key,
                    t0 + Duration::hours(j),
                    views(n),
                ))
                .unwrap();
        }
    }
}

#[tokio::test]
async fn cleanup_dry_run_then_live_run() {
    let store = Arc::new(MemoryStore::new());
    seed_hundred_rows(&store);
    let job = DuplicateCleanupJob::new(store.clone(), Arc::new(Metrics::new()));

    let dry = job.run(true, 7, CancellationToken::new()).await.unwrap();
    assert_eq!(dry.total_before, 100);
    assert_eq!(dry.duplicates_found, 10);
    assert_eq!(dry.duplicates_removed, 0);
    assert_eq!(store.count_snapshots().await.unwrap(), 100);

    let live = job.run(false, 7, CancellationToken::new()).await.unwrap();
    assert_eq!(live.status, CleanupStatus::Completed);
    assert_eq!(live.duplicates_removed, 10);
    assert_eq!(live.unique_kept, 90);
    assert_eq!(store.count_snapshots().await.unwrap(), 90);

    let again = job.run(false, 7, CancellationToken::new()).await.unwrap();
    assert_eq!(again.duplicates_found, 0);
    assert_eq!(again.duplicates_removed, 0);
    assert_eq!(store.count_snapshots().await.unwrap(), 90);
}

#[tokio::test]
async fn deleting_post_removes_tracker_and_snapshots() {
    let (store, writer) = setup(Materiality::default());
    let key = PostKey::new(-1001, 6);
    let t0 = base_time();
    store.insert_post(key, t0);
    writer.process_poll(key, views(1), t0, None).await.unwrap();

    store.delete_post(key);

    assert!(store.check_record(key).await.unwrap().is_none());
    assert!(store.snapshots_for(key).is_empty());
    assert!(writer.process_poll(key, views(2), t0 + Duration::hours(1), None).await.is_err());
}

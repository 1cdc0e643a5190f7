//! Storage abstraction for snapshots and tracker records
//!
//! `Database` implements this over Postgres. `MemoryStore` keeps everything
//! in process and backs the tests and local runs without a database.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};

use crate::error::{AppError, Result};
use crate::models::{
    ChangeDecision, EfficiencyStats, MetricsCheckRecord, PollCandidate, PollOutcome, PostKey,
    PostMetrics, PostMetricsSnapshot, SnapshotCursor, StorageReport, TierEfficiency,
};
use crate::tiers::PollTier;
use crate::tracker::{post_age_hours, MetricsChangeTracker};

/// One fetched observation to apply to a post
#[derive(Debug, Clone)]
pub struct PollRequest {
    pub key: PostKey,
    pub metrics: PostMetrics,
    pub observed_at: DateTime<Utc>,
    pub posted_at: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait MetricsStore: Send + Sync {
    /// Run the tracker against the latest stored snapshot and persist the
    /// outcome atomically: the tracker record and the optional snapshot row
    /// commit together or not at all.
    async fn apply_poll(
        &self,
        request: &PollRequest,
        tracker: &MetricsChangeTracker,
    ) -> Result<PollOutcome>;

    /// Posts due for a poll at `now` by their tier interval, never-checked
    /// first, then most overdue first
    async fn due_candidates(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<PollCandidate>>;

    /// Recompute the cached `post_age_hours` of every tracked post
    async fn refresh_post_ages(&self, now: DateTime<Utc>) -> Result<u64>;

    async fn check_record(&self, key: PostKey) -> Result<Option<MetricsCheckRecord>>;

    async fn latest_snapshot(&self, key: PostKey) -> Result<Option<PostMetricsSnapshot>>;

    async fn count_snapshots(&self) -> Result<i64>;

    /// Next page of snapshots strictly after `after` in
    /// `(channel_id, msg_id, snapshot_time)` order
    async fn snapshot_page(
        &self,
        after: Option<SnapshotCursor>,
        limit: i64,
    ) -> Result<Vec<PostMetricsSnapshot>>;

    /// Delete the given rows in a single transaction
    async fn delete_snapshots(&self, rows: &[SnapshotCursor]) -> Result<u64>;

    async fn efficiency_stats(&self) -> Result<EfficiencyStats>;

    async fn storage_report(&self) -> Result<StorageReport>;

    async fn ping(&self) -> Result<()>;
}

#[derive(Default)]
struct MemoryInner {
    posts: HashMap<PostKey, DateTime<Utc>>,
    snapshots: BTreeMap<SnapshotCursor, PostMetrics>,
    checks: HashMap<PostKey, MetricsCheckRecord>,
    delete_failure_in: Option<usize>,
}

/// In-process store with the same semantics as the Postgres schema,
/// including the cascade from `posts`.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_post(&self, key: PostKey, posted_at: DateTime<Utc>) {
        self.inner.lock().posts.insert(key, posted_at);
    }

    /// Remove a post together with its snapshots and tracker record
    pub fn delete_post(&self, key: PostKey) {
        let mut inner = self.inner.lock();
        inner.posts.remove(&key);
        inner.checks.remove(&key);
        inner.snapshots.retain(|cursor, _| cursor.key != key);
    }

    /// Insert a raw snapshot row, bypassing change detection
    pub fn insert_snapshot(&self, snapshot: PostMetricsSnapshot) -> Result<()> {
        let mut inner = self.inner.lock();
        if !inner.posts.contains_key(&snapshot.key) {
            return Err(AppError::DatabaseError(format!(
                "post {} does not exist",
                snapshot.key
            )));
        }
        inner.snapshots.insert(snapshot.cursor(), snapshot.metrics);
        Ok(())
    }

    pub fn snapshots_for(&self, key: PostKey) -> Vec<PostMetricsSnapshot> {
        self.inner
            .lock()
            .snapshots
            .iter()
            .filter(|(cursor, _)| cursor.key == key)
            .map(|(cursor, metrics)| {
                PostMetricsSnapshot::new(cursor.key, cursor.snapshot_time, *metrics)
            })
            .collect()
    }

    /// Let `successes` more calls to `delete_snapshots` through, then fail
    /// the next one without deleting anything
    pub fn fail_delete_after(&self, successes: usize) {
        self.inner.lock().delete_failure_in = Some(successes);
    }
}

fn latest_for(inner: &MemoryInner, key: PostKey) -> Option<PostMetricsSnapshot> {
    inner
        .snapshots
        .iter()
        .rev()
        .find(|(cursor, _)| cursor.key == key)
        .map(|(cursor, metrics)| PostMetricsSnapshot::new(cursor.key, cursor.snapshot_time, *metrics))
}

#[async_trait]
impl MetricsStore for MemoryStore {
    async fn apply_poll(
        &self,
        request: &PollRequest,
        tracker: &MetricsChangeTracker,
    ) -> Result<PollOutcome> {
        let mut inner = self.inner.lock();

        let posted_at = match inner.posts.get(&request.key) {
            Some(posted_at) => *posted_at,
            None => {
                return Err(AppError::NotFound(format!("post {}", request.key)));
            }
        };

        let previous = latest_for(&inner, request.key);
        let existing = inner.checks.get(&request.key).cloned();
        let age = post_age_hours(request.posted_at.unwrap_or(posted_at), request.observed_at);

        let (record, decision) = tracker.record_check(
            existing,
            request.key,
            &request.metrics,
            previous.as_ref().map(|s| &s.metrics),
            request.observed_at,
            Some(age),
        );

        if decision == ChangeDecision::Save {
            let cursor = SnapshotCursor {
                key: request.key,
                snapshot_time: request.observed_at,
            };
            inner.snapshots.entry(cursor).or_insert(request.metrics);
        }
        if decision != ChangeDecision::Stale {
            inner.checks.insert(request.key, record.clone());
        }

        Ok(PollOutcome {
            key: request.key,
            decision,
            record,
        })
    }

    async fn due_candidates(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<PollCandidate>> {
        let inner = self.inner.lock();
        let mut due: Vec<(Option<DateTime<Utc>>, PollCandidate)> = inner
            .posts
            .iter()
            .filter_map(|(key, posted_at)| {
                let record = inner.checks.get(key);
                let candidate = PollCandidate {
                    key: *key,
                    posted_at: *posted_at,
                    last_checked_at: record.map(|r| r.last_checked_at),
                    post_age_hours: record.and_then(|r| r.post_age_hours),
                };
                let tier = PollTier::for_age(candidate.age_hours(now));
                if !tier.is_due(candidate.last_checked_at, now) {
                    return None;
                }
                let due_at = candidate.last_checked_at.map(|last| last + tier.interval());
                Some((due_at, candidate))
            })
            .collect();

        due.sort_by(|(a_due, a), (b_due, b)| a_due.cmp(b_due).then(a.key.cmp(&b.key)));
        Ok(due
            .into_iter()
            .take(limit.max(0) as usize)
            .map(|(_, candidate)| candidate)
            .collect())
    }

    async fn refresh_post_ages(&self, now: DateTime<Utc>) -> Result<u64> {
        let mut inner = self.inner.lock();
        let MemoryInner { posts, checks, .. } = &mut *inner;
        let mut updated = 0;
        for (key, record) in checks.iter_mut() {
            if let Some(posted_at) = posts.get(key) {
                let age = (post_age_hours(*posted_at, now) * 100.0).round() / 100.0;
                record.post_age_hours = Some(age);
                record.updated_at = now;
                updated += 1;
            }
        }
        Ok(updated)
    }

    async fn check_record(&self, key: PostKey) -> Result<Option<MetricsCheckRecord>> {
        Ok(self.inner.lock().checks.get(&key).cloned())
    }

    async fn latest_snapshot(&self, key: PostKey) -> Result<Option<PostMetricsSnapshot>> {
        Ok(latest_for(&self.inner.lock(), key))
    }

    async fn count_snapshots(&self) -> Result<i64> {
        Ok(self.inner.lock().snapshots.len() as i64)
    }

    async fn snapshot_page(
        &self,
        after: Option<SnapshotCursor>,
        limit: i64,
    ) -> Result<Vec<PostMetricsSnapshot>> {
        use std::ops::Bound;

        let inner = self.inner.lock();
        let lower = match after {
            Some(cursor) => Bound::Excluded(cursor),
            None => Bound::Unbounded,
        };
        Ok(inner
            .snapshots
            .range((lower, Bound::Unbounded))
            .take(limit.max(0) as usize)
            .map(|(cursor, metrics)| {
                PostMetricsSnapshot::new(cursor.key, cursor.snapshot_time, *metrics)
            })
            .collect())
    }

    async fn delete_snapshots(&self, rows: &[SnapshotCursor]) -> Result<u64> {
        let mut inner = self.inner.lock();
        match inner.delete_failure_in {
            Some(0) => {
                inner.delete_failure_in = None;
                return Err(AppError::DatabaseError("injected delete failure".into()));
            }
            Some(n) => inner.delete_failure_in = Some(n - 1),
            None => {}
        }
        let mut deleted = 0;
        for row in rows {
            if inner.snapshots.remove(row).is_some() {
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    async fn efficiency_stats(&self) -> Result<EfficiencyStats> {
        let inner = self.inner.lock();
        let mut stats = EfficiencyStats::default();
        let mut by_tier: BTreeMap<PollTier, TierEfficiency> = BTreeMap::new();

        for record in inner.checks.values() {
            stats.tracked_posts += 1;
            stats.total_checks += record.check_count as i64;
            stats.total_saves += record.save_count as i64;
            if record.stable_since.is_some() {
                stats.stable_posts += 1;
            }
            let tier = PollTier::for_age(record.post_age_hours.unwrap_or(0.0));
            let entry = by_tier.entry(tier).or_insert_with(|| TierEfficiency {
                tier: tier.as_str().to_string(),
                ..Default::default()
            });
            entry.posts += 1;
            entry.checks += record.check_count as i64;
            entry.saves += record.save_count as i64;
        }

        stats.by_tier = by_tier.into_values().collect();
        stats.compute_ratio();
        Ok(stats)
    }

    async fn storage_report(&self) -> Result<StorageReport> {
        let inner = self.inner.lock();
        let snapshot_rows = inner.snapshots.len() as i64;
        let tracked_posts = inner.checks.len() as i64;
        let (checks, saves) = inner.checks.values().fold((0i64, 0i64), |(c, s), r| {
            (c + r.check_count as i64, s + r.save_count as i64)
        });

        Ok(StorageReport {
            snapshot_rows,
            tracked_posts,
            avg_snapshots_per_post: if tracked_posts == 0 {
                0.0
            } else {
                snapshot_rows as f64 / tracked_posts as f64
            },
            rows_avoided: checks - saves,
            post_metrics_bytes: None,
            post_metrics_checks_bytes: None,
        })
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

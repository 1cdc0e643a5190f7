//! Core domain models for metrics retention

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Identifies a post by its channel and message id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PostKey {
    pub channel_id: i64,
    pub msg_id: i64,
}

impl PostKey {
    pub fn new(channel_id: i64, msg_id: i64) -> Self {
        Self { channel_id, msg_id }
    }
}

impl fmt::Display for PostKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.channel_id, self.msg_id)
    }
}

/// Engagement counters reported for a post
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PostMetrics {
    #[serde(default)]
    pub views: i64,
    #[serde(default)]
    pub forwards: i64,
    #[serde(default)]
    pub replies: i64,
    #[serde(default)]
    pub reactions: i64,
}

impl PostMetrics {
    pub fn new(views: i64, forwards: i64, replies: i64, reactions: i64) -> Self {
        Self {
            views,
            forwards,
            replies,
            reactions,
        }
    }

    /// Counter values in a fixed order, used for field-wise comparison
    pub fn counters(&self) -> [i64; 4] {
        [self.views, self.forwards, self.replies, self.reactions]
    }
}

/// A stored `post_metrics` row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostMetricsSnapshot {
    pub key: PostKey,
    pub snapshot_time: DateTime<Utc>,
    pub metrics: PostMetrics,
}

impl PostMetricsSnapshot {
    pub fn new(key: PostKey, snapshot_time: DateTime<Utc>, metrics: PostMetrics) -> Self {
        Self {
            key,
            snapshot_time,
            metrics,
        }
    }

    /// Position of this row in the cleanup scan order
    pub fn cursor(&self) -> SnapshotCursor {
        SnapshotCursor {
            key: self.key,
            snapshot_time: self.snapshot_time,
        }
    }
}

/// Keyset position within `post_metrics` ordered by
/// `(channel_id, msg_id, snapshot_time)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SnapshotCursor {
    pub key: PostKey,
    pub snapshot_time: DateTime<Utc>,
}

/// Per-post bookkeeping row (`post_metrics_checks`)
///
/// Holds statistics about the change history only, never metric values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsCheckRecord {
    pub key: PostKey,
    pub last_checked_at: DateTime<Utc>,
    pub last_changed_at: Option<DateTime<Utc>>,
    pub check_count: i32,
    pub save_count: i32,
    pub stable_since: Option<DateTime<Utc>>,
    pub post_age_hours: Option<f64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl MetricsCheckRecord {
    /// A record for a post that has never been checked
    pub fn new(key: PostKey, now: DateTime<Utc>) -> Self {
        Self {
            key,
            last_checked_at: now,
            last_changed_at: None,
            check_count: 0,
            save_count: 0,
            stable_since: None,
            post_age_hours: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Fraction of checks that produced a stored snapshot
    pub fn save_ratio(&self) -> f64 {
        if self.check_count == 0 {
            0.0
        } else {
            self.save_count as f64 / self.check_count as f64
        }
    }
}

/// Outcome of comparing a poll against the last stored snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeDecision {
    /// Metrics changed materially; a snapshot row is written
    Save,
    /// Metrics unchanged; only the tracker record is updated
    Skip,
    /// Poll is not newer than the last check; nothing is written
    Stale,
}

/// Result of processing one poll for one post
#[derive(Debug, Clone, Serialize)]
pub struct PollOutcome {
    pub key: PostKey,
    pub decision: ChangeDecision,
    pub record: MetricsCheckRecord,
}

/// A post eligible for polling, as returned by the scheduler scan
#[derive(Debug, Clone, PartialEq)]
pub struct PollCandidate {
    pub key: PostKey,
    pub posted_at: DateTime<Utc>,
    pub last_checked_at: Option<DateTime<Utc>>,
    pub post_age_hours: Option<f64>,
}

impl PollCandidate {
    /// Cached age when the tracker has one, otherwise derived from `posted_at`
    pub fn age_hours(&self, now: DateTime<Utc>) -> f64 {
        self.post_age_hours
            .unwrap_or_else(|| crate::tracker::post_age_hours(self.posted_at, now))
    }
}

/// Aggregate check/save statistics for a polling tier
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TierEfficiency {
    pub tier: String,
    pub posts: i64,
    pub checks: i64,
    pub saves: i64,
}

/// Check/save efficiency across all tracked posts
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EfficiencyStats {
    pub tracked_posts: i64,
    pub total_checks: i64,
    pub total_saves: i64,
    pub stable_posts: i64,
    /// `total_saves / total_checks`, 0 when nothing has been checked
    pub save_ratio: f64,
    pub by_tier: Vec<TierEfficiency>,
}

impl EfficiencyStats {
    pub fn compute_ratio(&mut self) {
        self.save_ratio = if self.total_checks == 0 {
            0.0
        } else {
            self.total_saves as f64 / self.total_checks as f64
        };
    }
}

/// Storage footprint of the snapshot history
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StorageReport {
    pub snapshot_rows: i64,
    pub tracked_posts: i64,
    pub avg_snapshots_per_post: f64,
    /// Checks that did not produce a row
    pub rows_avoided: i64,
    pub post_metrics_bytes: Option<i64>,
    pub post_metrics_checks_bytes: Option<i64>,
}

/// How a cleanup run ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum CleanupStatus {
    Completed,
    Cancelled,
    Failed { error: String },
}

/// Summary of a duplicate cleanup run
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CleanupReport {
    /// Correlates the report with the run's log lines
    pub run_id: Uuid,
    pub dry_run: bool,
    pub total_before: i64,
    pub duplicates_found: i64,
    pub duplicates_removed: i64,
    pub unique_kept: i64,
    pub batches: u64,
    pub duration_ms: u64,
    pub status: CleanupStatus,
}

//! Conditional snapshot persistence
//!
//! Every poll goes through `SnapshotWriter::process_poll`, which serializes
//! work per post and hands the transactional part to the store.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, warn};

use crate::error::Result;
use crate::models::{ChangeDecision, PollOutcome, PostKey, PostMetrics};
use crate::routes::metrics::Metrics;
use crate::store::{MetricsStore, PollRequest};
use crate::tracker::MetricsChangeTracker;

/// One async mutex per post key, created on demand and dropped when the
/// last holder releases it.
#[derive(Default)]
pub struct KeyedLocks {
    locks: Mutex<HashMap<PostKey, Arc<tokio::sync::Mutex<()>>>>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, key: PostKey) -> KeyGuard<'_> {
        let mutex = {
            let mut locks = self.locks.lock();
            locks.entry(key).or_default().clone()
        };
        let guard = mutex.lock_owned().await;
        KeyGuard {
            locks: self,
            key,
            guard: Some(guard),
        }
    }

    /// Number of keys currently locked or waited on
    pub fn len(&self) -> usize {
        self.locks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub struct KeyGuard<'a> {
    locks: &'a KeyedLocks,
    key: PostKey,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for KeyGuard<'_> {
    fn drop(&mut self) {
        self.guard.take();
        let mut locks = self.locks.locks.lock();
        if let Some(mutex) = locks.get(&self.key) {
            if Arc::strong_count(mutex) == 1 {
                locks.remove(&self.key);
            }
        }
    }
}

/// Writes a snapshot only when a poll changed the metrics
pub struct SnapshotWriter {
    store: Arc<dyn MetricsStore>,
    tracker: MetricsChangeTracker,
    locks: KeyedLocks,
    metrics: Arc<Metrics>,
}

impl SnapshotWriter {
    pub fn new(
        store: Arc<dyn MetricsStore>,
        tracker: MetricsChangeTracker,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            store,
            tracker,
            locks: KeyedLocks::new(),
            metrics,
        }
    }

    /// Apply one fetched observation for a post.
    ///
    /// Polls for the same post never overlap. A failed store transaction
    /// leaves neither a snapshot nor a tracker update behind.
    pub async fn process_poll(
        &self,
        key: PostKey,
        fetched: PostMetrics,
        observed_at: DateTime<Utc>,
        posted_at: Option<DateTime<Utc>>,
    ) -> Result<PollOutcome> {
        let _guard = self.locks.lock(key).await;

        let request = PollRequest {
            key,
            metrics: fetched,
            observed_at,
            posted_at,
        };

        let outcome = match self.store.apply_poll(&request, &self.tracker).await {
            Ok(outcome) => outcome,
            Err(e) => {
                self.metrics.inc_poll_errors();
                warn!(
                    channel_id = key.channel_id,
                    msg_id = key.msg_id,
                    error = %e,
                    "Poll rolled back"
                );
                return Err(e);
            }
        };

        match outcome.decision {
            ChangeDecision::Save => self.metrics.inc_saved(),
            ChangeDecision::Skip => self.metrics.inc_skipped(),
            ChangeDecision::Stale => self.metrics.inc_stale(),
        }
        self.metrics.inc_polls();

        debug!(
            channel_id = key.channel_id,
            msg_id = key.msg_id,
            decision = ?outcome.decision,
            check_count = outcome.record.check_count,
            save_count = outcome.record.save_count,
            "Poll processed"
        );

        Ok(outcome)
    }
}

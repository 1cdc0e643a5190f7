//! Retention scheduler - polls posts on an age-tiered cadence

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::SchedulerSettings;
use crate::models::{PollCandidate, PostKey};
use crate::routes::metrics::Metrics;
use crate::source::MetricsSource;
use crate::store::MetricsStore;
use crate::tiers::PollTier;
use crate::writer::SnapshotWriter;

/// What one scheduling cycle did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub candidates: usize,
    pub dispatched: usize,
    /// Due but still being polled from an earlier cycle
    pub in_flight: usize,
    pub not_due: usize,
}

/// Drives per-post polls. Tier membership is recomputed from the stored
/// post age on every cycle; nothing about tiers is kept in memory.
pub struct RetentionScheduler {
    store: Arc<dyn MetricsStore>,
    source: Arc<dyn MetricsSource>,
    writer: Arc<SnapshotWriter>,
    metrics: Arc<Metrics>,
    settings: SchedulerSettings,
    permits: Arc<Semaphore>,
    in_flight: Arc<Mutex<HashSet<PostKey>>>,
}

/// Removes a key from the in-flight set when the poll task ends, however it ends
struct InFlightGuard {
    key: PostKey,
    in_flight: Arc<Mutex<HashSet<PostKey>>>,
    metrics: Arc<Metrics>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.in_flight.lock().remove(&self.key);
        self.metrics.dec_in_flight();
    }
}

impl RetentionScheduler {
    pub fn new(
        store: Arc<dyn MetricsStore>,
        source: Arc<dyn MetricsSource>,
        writer: Arc<SnapshotWriter>,
        metrics: Arc<Metrics>,
        settings: SchedulerSettings,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(settings.max_concurrent_polls));
        Self {
            store,
            source,
            writer,
            metrics,
            settings,
            permits,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Runs cycles until cancelled, then waits for in-flight polls.
    pub async fn run(&self, cancellation_token: CancellationToken) {
        let mut interval = tokio::time::interval(self.settings.tick);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut tasks = JoinSet::new();
        let mut cycle: u64 = 0;

        info!(
            tick_secs = self.settings.tick.as_secs(),
            max_concurrent_polls = self.settings.max_concurrent_polls,
            "Retention scheduler started"
        );

        loop {
            tokio::select! {
                _ = cancellation_token.cancelled() => break,
                _ = interval.tick() => {}
            }

            while let Some(result) = tasks.try_join_next() {
                if let Err(e) = result {
                    error!(error = %e, "Poll task panicked");
                }
            }

            let now = Utc::now();
            if cycle % self.settings.age_refresh_every_cycles == 0 {
                match self.store.refresh_post_ages(now).await {
                    Ok(updated) => debug!(updated = updated, "Refreshed cached post ages"),
                    Err(e) => error!(error = %e, "Failed to refresh post ages"),
                }
            }
            cycle += 1;

            match self.run_cycle(now, &mut tasks).await {
                Ok(report) => {
                    if report.dispatched > 0 || report.in_flight > 0 {
                        info!(
                            candidates = report.candidates,
                            dispatched = report.dispatched,
                            in_flight = report.in_flight,
                            "Scheduler cycle dispatched polls"
                        );
                    }
                }
                Err(e) => error!(error = %e, "Scheduler cycle failed"),
            }
        }

        info!(pending = tasks.len(), "Retention scheduler stopping, waiting for polls");
        while tasks.join_next().await.is_some() {}
        info!("Retention scheduler stopped");
    }

    /// Select due posts and spawn one poll task per post into `tasks`.
    pub async fn run_cycle(
        &self,
        now: DateTime<Utc>,
        tasks: &mut JoinSet<()>,
    ) -> crate::error::Result<CycleReport> {
        let candidates = self
            .store
            .due_candidates(now, self.settings.candidate_batch_limit)
            .await?;

        let mut report = CycleReport {
            candidates: candidates.len(),
            ..Default::default()
        };

        for candidate in candidates {
            let tier = PollTier::for_age(candidate.age_hours(now));
            if !tier.is_due(candidate.last_checked_at, now) {
                report.not_due += 1;
                continue;
            }

            if !self.in_flight.lock().insert(candidate.key) {
                report.in_flight += 1;
                continue;
            }

            self.metrics.inc_in_flight();
            let guard = InFlightGuard {
                key: candidate.key,
                in_flight: self.in_flight.clone(),
                metrics: self.metrics.clone(),
            };
            tasks.spawn(poll_post(
                candidate,
                tier,
                self.source.clone(),
                self.writer.clone(),
                self.metrics.clone(),
                self.permits.clone(),
                guard,
            ));
            report.dispatched += 1;
        }

        if report.in_flight > 0 {
            self.metrics.inc_overlapping(report.in_flight as u64);
        }
        self.metrics.inc_cycles();
        Ok(report)
    }
}

/// Fetch and apply one poll. Failures stay with this post.
async fn poll_post(
    candidate: PollCandidate,
    tier: PollTier,
    source: Arc<dyn MetricsSource>,
    writer: Arc<SnapshotWriter>,
    metrics: Arc<Metrics>,
    permits: Arc<Semaphore>,
    _guard: InFlightGuard,
) {
    let Ok(_permit) = permits.acquire_owned().await else {
        return;
    };
    let key = candidate.key;

    let fetched = match source.fetch(key).await {
        Ok(fetched) => fetched,
        Err(e) => {
            metrics.inc_fetch_failures();
            warn!(
                channel_id = key.channel_id,
                msg_id = key.msg_id,
                tier = %tier,
                error = %e,
                "Metrics fetch failed, skipping this cycle"
            );
            return;
        }
    };

    // errors are logged and counted by the writer
    let _ = writer
        .process_poll(key, fetched, Utc::now(), Some(candidate.posted_at))
        .await;
}

//! Change detection and per-post check bookkeeping
//!
//! The tracker is pure: it takes the current tracker record and the last
//! stored snapshot and returns the updated record plus a decision. Stores run
//! it inside the transaction that persists both.

use crate::models::{ChangeDecision, MetricsCheckRecord, PostKey, PostMetrics};
use chrono::{DateTime, Utc};

/// Thresholds that decide whether a counter delta is worth a new snapshot.
///
/// A counter changed materially when its delta is non-zero and it reaches
/// one of the enabled floors: `min_absolute_delta` in counter units or
/// `min_relative_delta_pct` of the stored value. A floor of zero is
/// disabled; with both disabled any non-zero delta counts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Materiality {
    pub min_absolute_delta: i64,
    pub min_relative_delta_pct: f64,
}

impl Default for Materiality {
    /// Any difference counts
    fn default() -> Self {
        Self {
            min_absolute_delta: 1,
            min_relative_delta_pct: 0.0,
        }
    }
}

impl Materiality {
    pub fn new(min_absolute_delta: i64, min_relative_delta_pct: f64) -> Self {
        Self {
            min_absolute_delta: min_absolute_delta.max(0),
            min_relative_delta_pct: min_relative_delta_pct.max(0.0),
        }
    }

    fn counter_changed(&self, previous: i64, current: i64) -> bool {
        let delta = (current - previous).abs();
        if delta == 0 {
            return false;
        }
        let absolute_on = self.min_absolute_delta > 0;
        let relative_on = self.min_relative_delta_pct > 0.0;
        if !absolute_on && !relative_on {
            return true;
        }
        if absolute_on && delta >= self.min_absolute_delta {
            return true;
        }
        if relative_on {
            let base = previous.abs().max(1) as f64;
            return delta as f64 / base * 100.0 >= self.min_relative_delta_pct;
        }
        false
    }

    /// Whether `current` differs materially from the stored `previous`.
    /// A post with no stored snapshot always counts as changed.
    pub fn is_material(&self, previous: Option<&PostMetrics>, current: &PostMetrics) -> bool {
        let Some(previous) = previous else {
            return true;
        };
        previous
            .counters()
            .iter()
            .zip(current.counters().iter())
            .any(|(prev, cur)| self.counter_changed(*prev, *cur))
    }
}

/// Decides save/skip for each poll and maintains the check record
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsChangeTracker {
    materiality: Materiality,
}

impl MetricsChangeTracker {
    pub fn new(materiality: Materiality) -> Self {
        Self { materiality }
    }

    /// Apply one poll to the tracker record.
    ///
    /// `previous` is the last stored snapshot's metrics, not the last poll.
    /// Returns the record to persist and the decision; on `Stale` the record
    /// is returned unchanged.
    pub fn record_check(
        &self,
        record: Option<MetricsCheckRecord>,
        key: PostKey,
        current: &PostMetrics,
        previous: Option<&PostMetrics>,
        observed_at: DateTime<Utc>,
        post_age_hours: Option<f64>,
    ) -> (MetricsCheckRecord, ChangeDecision) {
        let mut record = record.unwrap_or_else(|| MetricsCheckRecord::new(key, observed_at));

        if record.check_count > 0 && observed_at <= record.last_checked_at {
            return (record, ChangeDecision::Stale);
        }

        record.check_count += 1;
        record.last_checked_at = observed_at;
        record.updated_at = observed_at;
        if let Some(age) = post_age_hours {
            record.post_age_hours = Some(round_hours(age));
        }

        let decision = if self.materiality.is_material(previous, current) {
            record.last_changed_at = Some(observed_at);
            record.stable_since = None;
            record.save_count += 1;
            ChangeDecision::Save
        } else {
            if record.stable_since.is_none() {
                record.stable_since = Some(observed_at);
            }
            ChangeDecision::Skip
        };

        debug_assert!(record.save_count <= record.check_count);
        (record, decision)
    }
}

/// Age of a post in hours at `now`, clamped to zero for clock skew
pub fn post_age_hours(posted_at: DateTime<Utc>, now: DateTime<Utc>) -> f64 {
    let secs = (now - posted_at).num_seconds().max(0);
    secs as f64 / 3600.0
}

/// Matches the NUMERIC(10,2) column
fn round_hours(hours: f64) -> f64 {
    (hours.max(0.0) * 100.0).round() / 100.0
}

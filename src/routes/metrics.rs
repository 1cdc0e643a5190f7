//! Prometheus metrics endpoint

use axum::response::IntoResponse;
use std::sync::atomic::{AtomicU64, Ordering};

/// Service counters for Prometheus
#[derive(Default)]
pub struct Metrics {
    /// Polls applied to the store (any decision)
    polls_total: AtomicU64,
    /// Polls that wrote a snapshot
    snapshots_saved_total: AtomicU64,
    /// Polls with unchanged metrics
    polls_skipped_total: AtomicU64,
    /// Replayed or out-of-order polls
    polls_stale_total: AtomicU64,
    /// Upstream fetch failures
    fetch_failures_total: AtomicU64,
    /// Store transactions that rolled back
    poll_errors_total: AtomicU64,
    /// Due posts not dispatched because their previous poll was still running
    polls_overlapping_total: AtomicU64,
    /// Completed scheduler cycles
    scheduler_cycles_total: AtomicU64,
    /// Snapshot rows deleted by the duplicate cleanup
    cleanup_rows_removed_total: AtomicU64,
    /// Poll tasks currently running
    polls_in_flight: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc_polls(&self) {
        self.polls_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_saved(&self) {
        self.snapshots_saved_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_skipped(&self) {
        self.polls_skipped_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_stale(&self) {
        self.polls_stale_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_fetch_failures(&self) {
        self.fetch_failures_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_poll_errors(&self) {
        self.poll_errors_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_overlapping(&self, count: u64) {
        self.polls_overlapping_total.fetch_add(count, Ordering::Relaxed);
    }

    pub fn inc_cycles(&self) {
        self.scheduler_cycles_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_cleanup_removed(&self, count: u64) {
        self.cleanup_rows_removed_total.fetch_add(count, Ordering::Relaxed);
    }

    pub fn inc_in_flight(&self) {
        self.polls_in_flight.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec_in_flight(&self) {
        self.polls_in_flight.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn get_metrics(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            polls_total: self.polls_total.load(Ordering::Relaxed),
            snapshots_saved_total: self.snapshots_saved_total.load(Ordering::Relaxed),
            polls_skipped_total: self.polls_skipped_total.load(Ordering::Relaxed),
            polls_stale_total: self.polls_stale_total.load(Ordering::Relaxed),
            fetch_failures_total: self.fetch_failures_total.load(Ordering::Relaxed),
            poll_errors_total: self.poll_errors_total.load(Ordering::Relaxed),
            polls_overlapping_total: self.polls_overlapping_total.load(Ordering::Relaxed),
            scheduler_cycles_total: self.scheduler_cycles_total.load(Ordering::Relaxed),
            cleanup_rows_removed_total: self.cleanup_rows_removed_total.load(Ordering::Relaxed),
            polls_in_flight: self.polls_in_flight.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub polls_total: u64,
    pub snapshots_saved_total: u64,
    pub polls_skipped_total: u64,
    pub polls_stale_total: u64,
    pub fetch_failures_total: u64,
    pub poll_errors_total: u64,
    pub polls_overlapping_total: u64,
    pub scheduler_cycles_total: u64,
    pub cleanup_rows_removed_total: u64,
    pub polls_in_flight: u64,
}

impl MetricsSnapshot {
    /// Prometheus text exposition
    pub fn render(&self) -> String {
        let mut out = String::new();
        let mut write = |name: &str, kind: &str, help: &str, value: u64| {
            out.push_str(&format!(
                "# HELP metrics_retention_{name} {help}\n\
                 # TYPE metrics_retention_{name} {kind}\n\
                 metrics_retention_{name} {value}\n\n"
            ));
        };

        write("polls_total", "counter", "Total polls applied to the store", self.polls_total);
        write(
            "snapshots_saved_total",
            "counter",
            "Polls that stored a new snapshot",
            self.snapshots_saved_total,
        );
        write(
            "polls_skipped_total",
            "counter",
            "Polls with unchanged metrics",
            self.polls_skipped_total,
        );
        write(
            "polls_stale_total",
            "counter",
            "Replayed or out-of-order polls",
            self.polls_stale_total,
        );
        write(
            "fetch_failures_total",
            "counter",
            "Failed upstream metric fetches",
            self.fetch_failures_total,
        );
        write(
            "poll_errors_total",
            "counter",
            "Poll transactions that rolled back",
            self.poll_errors_total,
        );
        write(
            "polls_overlapping_total",
            "counter",
            "Due polls skipped because the previous poll was still running",
            self.polls_overlapping_total,
        );
        write(
            "scheduler_cycles_total",
            "counter",
            "Completed scheduler cycles",
            self.scheduler_cycles_total,
        );
        write(
            "cleanup_rows_removed_total",
            "counter",
            "Duplicate snapshot rows deleted",
            self.cleanup_rows_removed_total,
        );
        write(
            "polls_in_flight",
            "gauge",
            "Poll tasks currently running",
            self.polls_in_flight,
        );

        out.push_str(&format!(
            "# HELP metrics_retention_info Build information\n\
             # TYPE metrics_retention_info gauge\n\
             metrics_retention_info{{version=\"{}\"}} 1\n",
            env!("CARGO_PKG_VERSION")
        ));
        out
    }
}

/// GET /metrics
///
/// Returns Prometheus-format metrics
pub async fn prometheus_metrics(
    axum::extract::State(state): axum::extract::State<crate::state::AppState>,
) -> impl IntoResponse {
    let output = state.metrics.get_metrics().render();

    (
        [(axum::http::header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        output,
    )
}

//! Duplicate cleanup - removes consecutive identical snapshots
//!
//! Walks `post_metrics` in `(channel_id, msg_id, snapshot_time)` order one
//! page at a time. Each page's deletions commit on their own, so an
//! interrupted run keeps everything up to its last page and a re-run picks
//! up the rest.

use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::{AppError, Result};
use crate::models::{CleanupReport, CleanupStatus, PostMetricsSnapshot, SnapshotCursor};
use crate::routes::metrics::Metrics;
use crate::store::MetricsStore;

/// Rows in `page` whose metrics equal the row right before them for the
/// same post. `carry` is the last row of the previous page.
pub fn consecutive_duplicates(
    carry: Option<&PostMetricsSnapshot>,
    page: &[PostMetricsSnapshot],
) -> Vec<SnapshotCursor> {
    let mut duplicates = Vec::new();
    let mut previous = carry;

    for row in page {
        if let Some(prev) = previous {
            if prev.key == row.key && prev.metrics == row.metrics {
                duplicates.push(row.cursor());
            }
        }
        previous = Some(row);
    }

    duplicates
}

pub struct DuplicateCleanupJob {
    store: Arc<dyn MetricsStore>,
    metrics: Arc<Metrics>,
}

impl DuplicateCleanupJob {
    pub fn new(store: Arc<dyn MetricsStore>, metrics: Arc<Metrics>) -> Self {
        Self { store, metrics }
    }

    /// Scan all snapshots and, unless `dry_run`, delete consecutive
    /// duplicates in batches of `batch_size` scanned rows.
    ///
    /// Only the initial count can fail the call. Later failures and
    /// cancellation end the run early and show up in the report's status.
    pub async fn run(
        &self,
        dry_run: bool,
        batch_size: i64,
        cancellation_token: CancellationToken,
    ) -> Result<CleanupReport> {
        if batch_size <= 0 {
            return Err(AppError::InvalidRequest(
                "batch_size must be positive".into(),
            ));
        }

        let run_id = Uuid::new_v4();
        let started = Instant::now();
        let total_before = self.store.count_snapshots().await?;

        info!(
            run_id = %run_id,
            dry_run = dry_run,
            batch_size = batch_size,
            total_before = total_before,
            "Starting duplicate snapshot cleanup"
        );

        let mut report = CleanupReport {
            run_id,
            dry_run,
            total_before,
            duplicates_found: 0,
            duplicates_removed: 0,
            unique_kept: 0,
            batches: 0,
            duration_ms: 0,
            status: CleanupStatus::Completed,
        };

        let mut cursor: Option<SnapshotCursor> = None;
        let mut carry: Option<PostMetricsSnapshot> = None;
        let mut scanned: i64 = 0;

        loop {
            if cancellation_token.is_cancelled() {
                warn!(run_id = %run_id, batches = report.batches, "Duplicate cleanup cancelled");
                report.status = CleanupStatus::Cancelled;
                break;
            }

            let page = match self.store.snapshot_page(cursor, batch_size).await {
                Ok(page) => page,
                Err(e) => {
                    error!(run_id = %run_id, error = %e, "Failed to read snapshot page");
                    report.status = CleanupStatus::Failed {
                        error: e.to_string(),
                    };
                    break;
                }
            };
            if page.is_empty() {
                break;
            }

            let duplicates = consecutive_duplicates(carry.as_ref(), &page);
            let found = duplicates.len() as i64;

            if !dry_run && !duplicates.is_empty() {
                match self.store.delete_snapshots(&duplicates).await {
                    Ok(removed) => {
                        report.duplicates_removed += removed as i64;
                        self.metrics.inc_cleanup_removed(removed);
                    }
                    Err(e) => {
                        error!(
                            run_id = %run_id,
                            error = %e,
                            batches = report.batches,
                            removed = report.duplicates_removed,
                            "Cleanup batch rolled back"
                        );
                        report.status = CleanupStatus::Failed {
                            error: e.to_string(),
                        };
                        break;
                    }
                }
            }

            report.duplicates_found += found;
            report.batches += 1;
            scanned += page.len() as i64;

            cursor = page.last().map(|row| row.cursor());
            carry = page.into_iter().last();

            if report.batches % 100 == 0 {
                info!(
                    run_id = %run_id,
                    batches = report.batches,
                    scanned = scanned,
                    duplicates_found = report.duplicates_found,
                    "Duplicate cleanup progress"
                );
            }
        }

        report.unique_kept = scanned - report.duplicates_found;
        report.duration_ms = started.elapsed().as_millis() as u64;

        info!(
            run_id = %run_id,
            dry_run = dry_run,
            total_before = report.total_before,
            duplicates_found = report.duplicates_found,
            duplicates_removed = report.duplicates_removed,
            unique_kept = report.unique_kept,
            duration_ms = report.duration_ms,
            status = ?report.status,
            "Duplicate snapshot cleanup finished"
        );

        Ok(report)
    }
}

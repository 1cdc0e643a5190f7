//! Admin endpoints for retention efficiency, storage and cleanup

use axum::{
    extract::{Path, State},
    http::HeaderMap,
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::info;

use crate::error::{AppError, Result};
use crate::models::{
    CleanupReport, EfficiencyStats, MetricsCheckRecord, PostKey, PostMetricsSnapshot,
    StorageReport,
};
use crate::state::AppState;
use crate::tiers::PollTier;

/// Extract Bearer token from Authorization header
fn extract_bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("Authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
}

/// Compares without short-circuiting on the first differing byte
fn tokens_match(given: &str, expected: &str) -> bool {
    let (given, expected) = (given.as_bytes(), expected.as_bytes());
    if given.len() != expected.len() {
        return false;
    }
    given
        .iter()
        .zip(expected)
        .fold(0u8, |diff, (a, b)| diff | (a ^ b))
        == 0
}

fn authorize(state: &AppState, headers: &HeaderMap) -> Result<()> {
    let Some(expected) = state.admin_token.as_deref() else {
        return Ok(());
    };
    match extract_bearer_token(headers) {
        Some(token) if tokens_match(token, expected) => Ok(()),
        Some(_) => Err(AppError::Unauthorized("Invalid admin token".into())),
        None => Err(AppError::Unauthorized("Missing Authorization header".into())),
    }
}

/// GET /api/v1/retention/efficiency
///
/// Check/save totals and the save ratio, overall and per tier.
pub async fn get_efficiency(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<EfficiencyStats>> {
    authorize(&state, &headers)?;
    Ok(Json(state.store.efficiency_stats().await?))
}

/// GET /api/v1/retention/storage
pub async fn get_storage(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<StorageReport>> {
    authorize(&state, &headers)?;
    Ok(Json(state.store.storage_report().await?))
}

#[derive(Debug, Serialize)]
pub struct PostStatusResponse {
    pub record: MetricsCheckRecord,
    pub tier: PollTier,
    pub next_poll_at: DateTime<Utc>,
    pub latest_snapshot: Option<PostMetricsSnapshot>,
}

/// GET /api/v1/retention/posts/:channel_id/:msg_id
///
/// Tracker record for one post, with its current tier and next poll time.
pub async fn get_post_status(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((channel_id, msg_id)): Path<(i64, i64)>,
) -> Result<Json<PostStatusResponse>> {
    authorize(&state, &headers)?;
    let key = PostKey::new(channel_id, msg_id);

    let record = state
        .store
        .check_record(key)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("No checks recorded for post {}", key)))?;
    let latest_snapshot = state.store.latest_snapshot(key).await?;

    let tier = PollTier::for_age(record.post_age_hours.unwrap_or(0.0));
    let next_poll_at = record.last_checked_at + tier.interval();

    Ok(Json(PostStatusResponse {
        record,
        tier,
        next_poll_at,
        latest_snapshot,
    }))
}

/// Request body for a cleanup run
#[derive(Debug, Deserialize)]
pub struct CleanupRequest {
    /// Count only (default: true)
    #[serde(default = "default_dry_run")]
    pub dry_run: bool,
    /// Rows scanned per batch (default: CLEANUP_BATCH_SIZE)
    pub batch_size: Option<i64>,
}

fn default_dry_run() -> bool {
    true
}

/// Clears the running flag when the request finishes or is dropped
struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// POST /api/v1/retention/cleanup
///
/// Runs the duplicate cleanup and returns its report. Only one run at a
/// time; a second request gets 409.
pub async fn run_cleanup(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<CleanupRequest>,
) -> Result<Json<CleanupReport>> {
    authorize(&state, &headers)?;
    let batch_size = request.batch_size.unwrap_or(state.cleanup_batch_size);
    if batch_size <= 0 {
        return Err(AppError::InvalidRequest(
            "batch_size must be positive".into(),
        ));
    }

    if state
        .cleanup_running
        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
        .is_err()
    {
        return Err(AppError::Conflict("A cleanup run is already in progress".into()));
    }
    let _running = RunningGuard(&state.cleanup_running);

    info!(dry_run = request.dry_run, batch_size = batch_size, "Cleanup requested over HTTP");
    let report = state
        .cleanup_job
        .run(request.dry_run, batch_size, state.shutdown.child_token())
        .await?;

    Ok(Json(report))
}

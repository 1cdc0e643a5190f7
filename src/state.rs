//! Application state shared across handlers

use crate::routes::metrics::Metrics;
use crate::store::MetricsStore;
use crate::tasks::cleanup::DuplicateCleanupJob;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    /// Snapshot and tracker storage
    pub store: Arc<dyn MetricsStore>,
    /// Application metrics for Prometheus
    pub metrics: Arc<Metrics>,
    pub cleanup_job: Arc<DuplicateCleanupJob>,
    /// Set while a cleanup started over HTTP is running
    pub cleanup_running: Arc<AtomicBool>,
    /// Bearer token required by the admin routes, if any
    pub admin_token: Option<Arc<str>>,
    /// Batch size for cleanup requests that do not name one
    pub cleanup_batch_size: i64,
    /// Cancelled on shutdown; cleanup runs stop between batches
    pub shutdown: CancellationToken,
}

impl AppState {
    /// Create new application state
    ///
    /// # Arguments
    /// * `store` - Snapshot and tracker storage
    /// * `metrics` - Counters shared with the background tasks
    /// * `admin_token` - Optional bearer token for admin routes
    /// * `cleanup_batch_size` - Default cleanup batch size
    /// * `shutdown` - Process-wide cancellation token
    pub fn new(
        store: Arc<dyn MetricsStore>,
        metrics: Arc<Metrics>,
        admin_token: Option<String>,
        cleanup_batch_size: i64,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            cleanup_job: Arc::new(DuplicateCleanupJob::new(store.clone(), metrics.clone())),
            store,
            metrics,
            cleanup_running: Arc::new(AtomicBool::new(false)),
            admin_token: admin_token.map(Arc::from),
            cleanup_batch_size,
            shutdown,
        }
    }
}

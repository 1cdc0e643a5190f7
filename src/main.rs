//! Metrics retention service - change-detecting snapshot poller

use anyhow::Context;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use metrics_retention::config::Settings;
use metrics_retention::db::Database;
use metrics_retention::routes::{self, metrics::Metrics};
use metrics_retention::source::HttpMetricsSource;
use metrics_retention::state::AppState;
use metrics_retention::store::MetricsStore;
use metrics_retention::tasks::scheduler::RetentionScheduler;
use metrics_retention::telemetry;
use metrics_retention::tiers::PollTier;
use metrics_retention::tracker::MetricsChangeTracker;
use metrics_retention::writer::SnapshotWriter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = Settings::from_env().context("Invalid configuration")?;
    telemetry::init_tracing(settings.log_format);

    // Connect to database
    let db = Database::new(&settings.database_url, settings.db_max_connections)
        .await
        .context("Failed to connect to database")?;
    if settings.run_migrations {
        db.migrate().await.context("Failed to run migrations")?;
    }
    let store: Arc<dyn MetricsStore> = Arc::new(db);

    let source = Arc::new(
        HttpMetricsSource::new(&settings.metrics_source_url, settings.fetch_timeout)
            .context("Failed to build metrics source client")?,
    );
    let metrics = Arc::new(Metrics::new());
    let shutdown = CancellationToken::new();

    // Background scheduler
    let writer = Arc::new(SnapshotWriter::new(
        store.clone(),
        MetricsChangeTracker::new(settings.materiality),
        metrics.clone(),
    ));
    let scheduler = RetentionScheduler::new(
        store.clone(),
        source,
        writer,
        metrics.clone(),
        settings.scheduler.clone(),
    );
    let scheduler_token = shutdown.clone();
    let scheduler_handle = tokio::spawn(async move {
        scheduler.run(scheduler_token).await;
    });

    let state = AppState::new(
        store,
        metrics,
        settings.admin_token.clone(),
        settings.cleanup_batch_size,
        shutdown.clone(),
    );
    let app = routes::router(state);

    info!(
        "Metrics retention v{} starting on {}",
        env!("CARGO_PKG_VERSION"),
        settings.listen_addr
    );
    info!(
        "Database: {}",
        settings.database_url.split('@').last().unwrap_or("***")
    );
    info!(
        min_absolute_delta = settings.materiality.min_absolute_delta,
        min_relative_delta_pct = settings.materiality.min_relative_delta_pct,
        admin_auth = settings.admin_token.is_some(),
        "Change detection configured"
    );

    if settings.scheduler.tick > PollTier::min_interval().to_std().unwrap_or_default() {
        warn!(
            tick_secs = settings.scheduler.tick.as_secs(),
            "Scheduler tick is longer than the shortest tier interval; fresh posts will be polled late"
        );
    }

    let listener = tokio::net::TcpListener::bind(settings.listen_addr)
        .await
        .with_context(|| format!("Failed to bind {}", settings.listen_addr))?;

    let server_token = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            server_token.cancel();
        })
        .await
        .context("Server error")?;

    shutdown.cancel();
    if let Err(e) = scheduler_handle.await {
        error!(error = %e, "Scheduler task ended abnormally");
    }
    info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl-C");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}

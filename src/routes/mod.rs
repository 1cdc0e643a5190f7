//! HTTP routes

pub mod admin;
pub mod health;
pub mod metrics;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::state::AppState;

/// Build the service router
pub fn router(state: AppState) -> Router {
    Router::new()
        // Health and metrics (Kubernetes probes + Prometheus)
        .route("/health", get(health::health))
        .route("/ready", get(health::ready))
        .route("/metrics", get(metrics::prometheus_metrics))
        // Retention admin
        .route(
            "/api/v1/retention/efficiency",
            get(admin::get_efficiency),
        )
        .route("/api/v1/retention/storage", get(admin::get_storage))
        .route(
            "/api/v1/retention/posts/:channel_id/:msg_id",
            get(admin::get_post_status),
        )
        .route("/api/v1/retention/cleanup", post(admin::run_cleanup))
        // State and middleware
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
}

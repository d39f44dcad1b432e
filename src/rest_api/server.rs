//! Axum HTTP server for the REST API

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::orchestrator::Orchestrator;
use crate::{Error, Result};

use super::handlers;

/// Metrics endpoint handler
#[cfg(feature = "metrics")]
async fn metrics_handler() -> String {
    crate::metrics::encode_text()
}

/// All routes, with the orchestrator as shared state
pub fn router(state: Arc<Orchestrator>) -> Router {
    let router = Router::new()
        .route("/health", get(handlers::health))
        .route("/api/v1/clusters", get(handlers::list_clusters))
        .route(
            "/api/v1/clusters/{cluster}/updates",
            get(handlers::check_updates),
        )
        .route(
            "/api/v1/clusters/{cluster}/updates/rolling",
            post(handlers::start_rolling_update).delete(handlers::cancel_rolling_update),
        )
        .route(
            "/api/v1/clusters/{cluster}/updates/rolling/resume",
            post(handlers::resume_rolling_update),
        )
        .route(
            "/api/v1/clusters/{cluster}/updates/rolling/pause",
            post(handlers::pause_rolling_update),
        )
        .route(
            "/api/v1/clusters/{cluster}/updates/status",
            get(handlers::get_rolling_status).delete(handlers::clear_rolling_update),
        )
        .route(
            "/api/v1/clusters/{cluster}/nodes/{node}/update",
            post(handlers::update_single_node),
        )
        .route(
            "/api/v1/clusters/{cluster}/updates/schedule",
            get(handlers::get_schedule)
                .post(handlers::set_schedule)
                .delete(handlers::delete_schedule),
        );

    #[cfg(feature = "metrics")]
    let router = router.route("/metrics", get(metrics_handler));

    router.layer(TraceLayer::new_for_http()).with_state(state)
}

/// Run the REST API server until `shutdown` resolves
pub async fn run_server<F>(state: Arc<Orchestrator>, addr: SocketAddr, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| Error::ConfigError(format!("Failed to bind to {}: {}", addr, e)))?;
    info!("REST API server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| Error::ConfigError(format!("Server error: {}", e)))?;

    Ok(())
}

//! Route configuration.

use crate::auth::auth_middleware;
use crate::handlers;
use crate::metrics::{metrics_handler, register_metrics};
use crate::state::AppState;
use axum::Router;
use axum::middleware;
use axum::routing::{get, post};
use tower_http::trace::TraceLayer;

/// Create the application router.
pub fn create_router(state: AppState) -> Router {
    let api_routes = Router::new()
        // Unauthenticated for load balancer probes
        .route("/v1/health", get(handlers::health_check))
        .route("/v1/auth/whoami", get(handlers::whoami))
        .route("/v1/signing-key", get(handlers::get_signing_key))
        .route("/v1/exports/files", post(handlers::export_file))
        .route("/v1/exports/images", post(handlers::export_image))
        .route("/v1/exports/{export_id}", get(handlers::get_export))
        .route("/v1/imports", post(handlers::import_archive));

    let mut router = Router::new().merge(api_routes);

    // Must be network-restricted to scrapers when enabled; see crate::metrics.
    if state.config.server.metrics_enabled {
        register_metrics();
        router = router.route("/metrics", get(metrics_handler));
    }

    router
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

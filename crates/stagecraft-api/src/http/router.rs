//! Axum router configuration with middleware.
//!
//! All run routes are under `/api/v1/`; `/health` sits at the root.
//! Middleware: CORS, tracing.

use axum::Router;
use axum::routing::{get, post};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::http::handlers;
use crate::state::AppState;

/// Build the complete API router with all routes and middleware.
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let api_routes = Router::new()
        .route(
            "/runs",
            post(handlers::runs::start_run).get(handlers::runs::list_runs),
        )
        .route("/runs/{id}", get(handlers::runs::get_run))
        .route("/runs/{id}/events", get(handlers::runs::run_events))
        .route("/runs/{id}/signals", get(handlers::runs::pending_signals))
        .route(
            "/runs/{id}/signals/{name}",
            post(handlers::runs::send_signal),
        )
        .route("/runs/{id}/cancel", post(handlers::runs::cancel_run));

    Router::new()
        .nest("/api/v1", api_routes)
        .route("/health", get(handlers::health::health_check))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// Route table for the Codepad API

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::handlers;
use crate::metrics;
use crate::AppState;

/// Room for the JSON envelope and field names on top of the payload
const BODY_SLACK_BYTES: usize = 64 * 1024;

pub fn routes(state: Arc<AppState>) -> Router {
    let limits = state.coordinator.limits();
    let body_limit = request_body_limit(limits.max_source_bytes, limits.max_stdin_bytes);

    Router::new()
        .route("/run-code", post(handlers::run_code))
        // Path used by the browser client
        .route("/api/run-code", post(handlers::run_code))
        .route("/languages", get(handlers::list_languages))
        .route("/status", get(handlers::health_check))
        .route("/metrics", get(metrics::metrics_handler))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Largest request body accepted before the engine checks sizes itself.
///
/// JSON escaping can double a payload (a newline becomes `\n`), so a source
/// and stdin right at their limits still has to fit.
fn request_body_limit(max_source_bytes: usize, max_stdin_bytes: usize) -> usize {
    max_source_bytes
        .saturating_add(max_stdin_bytes)
        .saturating_mul(2)
        .saturating_add(BODY_SLACK_BYTES)
}

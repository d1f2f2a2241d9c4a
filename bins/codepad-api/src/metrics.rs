// Prometheus metrics for the Codepad API

use axum::{http::header, http::StatusCode, response::IntoResponse};
use lazy_static::lazy_static;
use prometheus::{
    register_histogram_vec, register_int_counter, register_int_counter_vec, register_int_gauge,
    Encoder, HistogramVec, IntCounter, IntCounterVec, IntGauge, TextEncoder,
};
use tracing::error;

lazy_static! {
    pub static ref EXECUTIONS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "codepad_executions_total",
        "Completed executions by language and outcome",
        &["language", "outcome"]
    )
    .expect("metric can be registered");
    pub static ref EXECUTION_DURATION: HistogramVec = register_histogram_vec!(
        "codepad_execution_duration_seconds",
        "Wall-clock time spent compiling and running a submission",
        &["language"],
        vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]
    )
    .expect("metric can be registered");
    pub static ref REJECTIONS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "codepad_rejections_total",
        "Requests that never produced a result, by reason",
        &["reason"]
    )
    .expect("metric can be registered");
    pub static ref CLEANUP_FAILURES_TOTAL: IntCounter = register_int_counter!(
        "codepad_cleanup_failures_total",
        "Workspaces that could not be removed after producing a result"
    )
    .expect("metric can be registered");
    pub static ref IN_FLIGHT: IntGauge = register_int_gauge!(
        "codepad_in_flight",
        "Requests currently being handled by the execution engine"
    )
    .expect("metric can be registered");
}

/// Decrements the in-flight gauge when the request ends, including when the
/// client disconnects and the handler future is dropped.
pub struct InFlightGuard;

impl InFlightGuard {
    pub fn enter() -> Self {
        IN_FLIGHT.inc();
        InFlightGuard
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        IN_FLIGHT.dec();
    }
}

pub fn record_execution(language: &str, outcome: &str, duration_ms: u64) {
    EXECUTIONS_TOTAL.with_label_values(&[language, outcome]).inc();
    EXECUTION_DURATION
        .with_label_values(&[language])
        .observe(duration_ms as f64 / 1000.0);
}

pub fn record_cleanup_failure() {
    CLEANUP_FAILURES_TOTAL.inc();
}

pub fn record_rejection(reason: &str) {
    REJECTIONS_TOTAL.with_label_values(&[reason]).inc();
}

/// GET /metrics - Prometheus text exposition
pub async fn metrics_handler() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&prometheus::gather(), &mut buffer) {
        error!(error = %e, "Failed to encode metrics");
        return (StatusCode::INTERNAL_SERVER_ERROR, "Failed to encode metrics").into_response();
    }
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, encoder.format_type().to_string())],
        buffer,
    )
        .into_response()
}

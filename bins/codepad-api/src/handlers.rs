// HTTP route handlers for the Codepad API

use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use codepad_common::types::{ErrorBody, LanguageInfo, RunCodeRequest};
use codepad_engine::{ExecutionError, ExecutionRequest};
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::metrics::{self, InFlightGuard};
use crate::AppState;

/// POST /run-code - Execute a submission and return its output
///
/// A program that fails, crashes or times out still answers 200; only
/// requests the service refuses or cannot carry out map to 4xx/5xx.
pub async fn run_code(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<RunCodeRequest>, JsonRejection>,
) -> Response {
    let Json(payload) = match payload {
        Ok(payload) => payload,
        Err(rejection) => {
            let (status, reason) = rejection_status(&rejection);
            warn!(status = status.as_u16(), error = %rejection.body_text(), "Rejected request body");
            metrics::record_rejection(reason);
            return error_response(status, rejection.body_text());
        }
    };

    let request_id = Uuid::new_v4();
    let _in_flight = InFlightGuard::enter();

    info!(
        request_id = %request_id,
        language = %payload.language,
        source_size = payload.code.len(),
        has_stdin = payload.stdin.is_some(),
        "Received code"
    );

    match state
        .coordinator
        .execute_with_id(request_id, ExecutionRequest::from(payload))
        .await
    {
        Ok(report) => {
            if report.cleanup_failed {
                metrics::record_cleanup_failure();
            }
            if let Some(outcome) = report.outcome() {
                metrics::record_execution(&report.language, outcome.as_str(), report.total_duration_ms());
            }
            (StatusCode::OK, Json(report.to_response())).into_response()
        }
        Err(e) => {
            metrics::record_rejection(e.kind());
            let status = status_for(&e);
            if status.is_server_error() {
                error!(request_id = %request_id, error = %e, "Execution failed");
            }
            error_response(status, e.public_message())
        }
    }
}

/// GET /languages - Languages this server can run
pub async fn list_languages(State(state): State<Arc<AppState>>) -> Json<Vec<LanguageInfo>> {
    Json(
        state
            .coordinator
            .registry()
            .languages()
            .map(|descriptor| descriptor.info())
            .collect(),
    )
}

/// GET /status - Health check endpoint
pub async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

/// Body-limit and content-type rejections keep their own status; every
/// other extraction failure is a malformed request
fn rejection_status(rejection: &JsonRejection) -> (StatusCode, &'static str) {
    match rejection.status() {
        StatusCode::PAYLOAD_TOO_LARGE => (StatusCode::PAYLOAD_TOO_LARGE, "body_too_large"),
        StatusCode::UNSUPPORTED_MEDIA_TYPE => (StatusCode::UNSUPPORTED_MEDIA_TYPE, "unsupported_media_type"),
        _ => (StatusCode::BAD_REQUEST, "malformed_request"),
    }
}

fn status_for(error: &ExecutionError) -> StatusCode {
    match error {
        ExecutionError::UnsupportedLanguage(_) => StatusCode::BAD_REQUEST,
        ExecutionError::SourceTooLarge { .. } | ExecutionError::StdinTooLarge { .. } => {
            StatusCode::PAYLOAD_TOO_LARGE
        }
        ExecutionError::CapacityExhausted => StatusCode::SERVICE_UNAVAILABLE,
        ExecutionError::Workspace { .. }
        | ExecutionError::Spawn { .. }
        | ExecutionError::Supervise(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(ErrorBody::new(message))).into_response()
}

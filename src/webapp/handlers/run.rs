use axum::{
    body::Body,
    extract::State,
    http::{Request, StatusCode},
    response::{IntoResponse, Response},
    Json,
};

use crate::exec::{ExecutionResult, SubmissionRequest};
use super::super::{error_bad_request, exec_error_response, AppState};

/// Run a submission in a fresh sandbox
///
/// Compile and runtime failures, including limit breaches, are normal
/// results with status 200. Only malformed or rejected requests and
/// infrastructure failures map to error statuses.
#[utoipa::path(
    post,
    path = "/run",
    tag = "Execution",
    request_body = SubmissionRequest,
    responses(
        (status = 200, description = "Submission ran to completion (successfully or not)", body = ExecutionResult),
        (status = 400, description = "Malformed body or rejected submission", body = super::super::ErrorResponse),
        (status = 503, description = "No sandbox capacity available", body = super::super::ErrorResponse),
        (status = 500, description = "Internal error", body = super::super::ErrorResponse)
    )
)]
pub async fn run_handler(
    State(state): State<AppState>,
    req: Request<Body>,
) -> Response {
    let body = match axum::body::to_bytes(req.into_body(), state.request_limit).await {
        Ok(bytes) => bytes,
        Err(e) => {
            tracing::debug!(error = %e, limit = state.request_limit, "unreadable request body");
            return error_bad_request(&format!("Failed to read request body: {}", e));
        }
    };

    let submission: SubmissionRequest = match serde_json::from_slice(&body) {
        Ok(submission) => submission,
        Err(e) => return error_bad_request(&format!("Invalid JSON: {}", e)),
    };

    match state.executor.execute(submission).await {
        Ok(result) => (StatusCode::OK, Json(result)).into_response(),
        Err(e) => exec_error_response(&e),
    }
}

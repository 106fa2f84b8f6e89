use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use super::super::AppState;

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct SandboxStats {
    /// Submissions currently holding a sandbox
    pub active: usize,
    pub capacity: usize,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct HealthResponse {
    pub status: String,
    pub service: Vec<String>,
    pub service_uptime_secs: u64,
    /// "dedicated-uid" or "user-namespace"
    pub isolation: String,
    pub sandboxes: SandboxStats,
}

#[utoipa::path(
    get,
    path = "/health",
    tag = "Health",
    responses(
        (status = 200, description = "Service is healthy", body = HealthResponse)
    )
)]
pub async fn health_handler(State(state): State<AppState>) -> Response {
    let executor = &state.executor;
    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "ok".to_string(),
            service: [env!("CARGO_PKG_NAME").to_string(), env!("CARGO_PKG_VERSION").to_string()].to_vec(),
            service_uptime_secs: state.started_at.elapsed().as_secs(),
            isolation: executor.isolation_mode().to_string(),
            sandboxes: SandboxStats { active: executor.active(), capacity: executor.capacity() },
        }),
    )
        .into_response()
}

use std::path::PathBuf;

use axum::{http::StatusCode, response::IntoResponse, Json};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::exec::ExecError;
use crate::lang::{CommandTemplate, Language, Toolchain};
use crate::os::governor::resolve_program;

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ErrorResponse {
    pub error: String,
}

pub fn error_response(code: StatusCode, message: &str) -> axum::response::Response {
    (code, Json(ErrorResponse { error: message.to_string() })).into_response()
}

// Shortcut functions for common error codes
pub fn error_bad_request(message: &str) -> axum::response::Response {
    error_response(StatusCode::BAD_REQUEST, message)
}

pub fn error_unavailable(message: &str) -> axum::response::Response {
    error_response(StatusCode::SERVICE_UNAVAILABLE, message)
}

pub fn error_internal(message: &str) -> axum::response::Response {
    error_response(StatusCode::INTERNAL_SERVER_ERROR, message)
}

/// Transport-level response for an execution error; internal details stay in the logs
pub fn exec_error_response(err: &ExecError) -> axum::response::Response {
    match err {
        ExecError::Validation(e) => error_bad_request(&e.to_string()),
        ExecError::Busy => error_unavailable(&err.to_string()),
        ExecError::Provision(_) => error_unavailable("could not provision a sandbox, retry later"),
        ExecError::Internal(_) => error_internal("internal error"),
    }
}

/// One entry of `GET /languages`
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct LanguageInfo {
    pub id: Language,
    pub aliases: Vec<String>,
    /// "interpreted" or "compiled"
    #[schema(example = "compiled")]
    pub kind: String,
    #[schema(example = "gcc")]
    pub runtime: String,
    #[schema(example = "main.cpp")]
    pub source_file: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compile: Option<CommandTemplate>,
    pub run: CommandTemplate,
    /// Whether every program of the pipeline was found on this host
    pub available: bool,
}

impl LanguageInfo {
    pub fn from_toolchain(toolchain: &Toolchain, search_path: &[PathBuf]) -> Self {
        // `./` programs are build outputs, resolved against a placeholder dir
        let placeholder = std::path::Path::new("/");
        let available = toolchain.programs().iter()
            .all(|program| program.starts_with("./") || resolve_program(program, search_path, placeholder).is_some());

        Self {
            id: toolchain.language,
            aliases: toolchain.language.aliases().iter().map(|a| a.to_string()).collect(),
            kind: toolchain.pipeline.kind().to_string(),
            runtime: toolchain.runtime.name.clone(),
            source_file: toolchain.source_file.clone(),
            compile: toolchain.pipeline.compile().cloned(),
            run: toolchain.pipeline.run().clone(),
            available,
        }
    }
}

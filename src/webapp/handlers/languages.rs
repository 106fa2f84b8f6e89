use axum::{extract::State, Json};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use super::super::{AppState, LanguageInfo};

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ListLanguagesResponse {
    pub languages: Vec<LanguageInfo>,
}

/// Registered toolchains and whether they are installed on this host
#[utoipa::path(
    get,
    path = "/languages",
    tag = "Execution",
    responses(
        (status = 200, description = "Registered languages", body = ListLanguagesResponse)
    )
)]
pub async fn list_languages_handler(State(state): State<AppState>) -> Json<ListLanguagesResponse> {
    Json(ListLanguagesResponse { languages: state.languages.as_ref().clone() })
}

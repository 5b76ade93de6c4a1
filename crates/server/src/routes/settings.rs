use axum::extract::State;
use axum::Json;
use serde::{Deserialize, Serialize};
use tracing::info;
use utoipa::ToSchema;

use crate::state::AppState;

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct SettingsResponse {
    pub concurrency: u32,
    pub visible: bool,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct UpdateConcurrencyRequest {
    /// Requested worker count; clamped to 1..=10
    pub concurrency: i64,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct UpdateVisibleRequest {
    pub visible: bool,
}

fn current(state: &AppState) -> SettingsResponse {
    let progress = state.controller.progress();
    SettingsResponse {
        concurrency: progress.concurrency,
        visible: progress.visible,
    }
}

#[utoipa::path(
    get,
    path = "/api/settings",
    responses(
        (status = 200, description = "Current settings", body = SettingsResponse)
    ),
    tag = "settings"
)]
pub async fn get_settings(State(state): State<AppState>) -> Json<SettingsResponse> {
    Json(current(&state))
}

#[utoipa::path(
    put,
    path = "/api/settings/concurrency",
    request_body = UpdateConcurrencyRequest,
    responses(
        (status = 200, description = "Concurrency updated; applies to the next session", body = SettingsResponse)
    ),
    tag = "settings"
)]
pub async fn update_concurrency(
    State(state): State<AppState>,
    Json(payload): Json<UpdateConcurrencyRequest>,
) -> Json<SettingsResponse> {
    let applied = state.controller.set_concurrency(payload.concurrency);
    info!(requested = payload.concurrency, applied, "Concurrency updated");
    Json(current(&state))
}

#[utoipa::path(
    put,
    path = "/api/settings/visible",
    request_body = UpdateVisibleRequest,
    responses(
        (status = 200, description = "Visibility updated", body = SettingsResponse)
    ),
    tag = "settings"
)]
pub async fn update_visible(
    State(state): State<AppState>,
    Json(payload): Json<UpdateVisibleRequest>,
) -> Json<SettingsResponse> {
    state.controller.set_visible(payload.visible);
    info!(visible = payload.visible, "Visibility updated");
    Json(current(&state))
}

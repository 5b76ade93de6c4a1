use axum::extract::State;
use axum::Json;
use provision_core::{CommandAck, ProgressSnapshot, SessionParams};
use serde::{Deserialize, Serialize};
use tracing::info;
use utoipa::ToSchema;

use crate::error::AppError;
use crate::state::AppState;

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct StartSessionRequest {
    /// Number of units to produce
    pub target_count: usize,
    /// Overrides for the configured stage parameters
    #[serde(default)]
    #[schema(value_type = Object)]
    pub params: SessionParams,
}

#[utoipa::path(
    post,
    path = "/api/session/start",
    request_body = StartSessionRequest,
    responses(
        (status = 200, description = "Session started", body = CommandAck),
        (status = 400, description = "Invalid target count"),
        (status = 409, description = "A session is already running"),
        (status = 500, description = "Configuration could not be loaded")
    ),
    tag = "session"
)]
pub async fn start_session(
    State(state): State<AppState>,
    Json(payload): Json<StartSessionRequest>,
) -> Result<Json<CommandAck>, AppError> {
    info!(target_count = payload.target_count, "Start requested");

    let ack = state
        .controller
        .start(payload.target_count, payload.params)
        .await?;

    Ok(Json(ack))
}

#[utoipa::path(
    post,
    path = "/api/session/stop",
    responses(
        (status = 200, description = "Stop requested", body = CommandAck),
        (status = 409, description = "No session is running")
    ),
    tag = "session"
)]
pub async fn stop_session(State(state): State<AppState>) -> Result<Json<CommandAck>, AppError> {
    info!("Stop requested");
    Ok(Json(state.controller.stop()?))
}

#[utoipa::path(
    get,
    path = "/api/session/progress",
    responses(
        (status = 200, description = "Current session progress", body = ProgressSnapshot)
    ),
    tag = "session"
)]
pub async fn get_progress(State(state): State<AppState>) -> Json<ProgressSnapshot> {
    Json(state.controller.progress())
}

pub mod error;
pub mod routes;
pub mod state;

use axum::routing::{get, post, put};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::services::{ServeDir, ServeFile};
use tower_http::trace::TraceLayer;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use state::AppState;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Provisioner API",
        version = "0.1.0",
        description = "Control channel for the provisioning session engine"
    ),
    paths(
        routes::health_check,
        routes::start_session,
        routes::stop_session,
        routes::get_progress,
        routes::get_settings,
        routes::update_concurrency,
        routes::update_visible,
        routes::sse::events_stream,
    ),
    components(schemas(
        routes::HealthResponse,
        routes::StartSessionRequest,
        routes::SettingsResponse,
        routes::UpdateConcurrencyRequest,
        routes::UpdateVisibleRequest,
        provision_core::CommandAck,
        provision_core::ProgressSnapshot,
        provision_core::LogEntry,
        provision_core::LogLevel,
        provision_core::CompletedUnitRecord,
        provision_core::SlotOutcome,
    )),
    tags(
        (name = "health", description = "Health check endpoints"),
        (name = "session", description = "Session control endpoints"),
        (name = "settings", description = "Engine settings endpoints"),
        (name = "events", description = "Real-time event streaming (SSE)"),
    )
)]
pub struct ApiDoc;

pub fn create_router(state: AppState) -> Router {
    let app_dir = state.app_dir.clone();

    let api_router = Router::new()
        .merge(SwaggerUi::new("/swagger-ui").url("/api/openapi.json", ApiDoc::openapi()))
        .route("/health", get(routes::health_check))
        .route("/api/session/start", post(routes::start_session))
        .route("/api/session/stop", post(routes::stop_session))
        .route("/api/session/progress", get(routes::get_progress))
        .route("/api/settings", get(routes::get_settings))
        .route(
            "/api/settings/concurrency",
            put(routes::update_concurrency),
        )
        .route("/api/settings/visible", put(routes::update_visible))
        .route("/api/events", get(routes::sse::events_stream))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state);

    if let Some(app_dir) = app_dir {
        let index_file = app_dir.join("index.html");
        let serve_dir = ServeDir::new(&app_dir).not_found_service(ServeFile::new(&index_file));
        api_router.fallback_service(serve_dir)
    } else {
        api_router
    }
}

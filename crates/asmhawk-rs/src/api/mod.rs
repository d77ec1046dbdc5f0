use axum::{
    extract::State,
    http::StatusCode,
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use std::fmt;
use tracing::error;

use crate::{auth::auth_middleware, error::ScanError, AppState};

mod assets;
mod scans;

pub type AppResult<T> = Result<T, AppError>;

/// HTTP-facing error rendered as `{"error": {"message", "status"}}`.
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
}

impl AppError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, message)
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(StatusCode::CONFLICT, message)
    }

    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::new(StatusCode::TOO_MANY_REQUESTS, message)
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": {
                "message": self.message,
                "status": self.status.as_u16(),
            }
        }));
        (self.status, body).into_response()
    }
}

impl From<ScanError> for AppError {
    fn from(err: ScanError) -> Self {
        let status = match &err {
            ScanError::AssetNotFound(_) | ScanError::JobNotFound(_) => StatusCode::NOT_FOUND,
            ScanError::UnknownTool(_) | ScanError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            ScanError::InvalidTransition { .. } => StatusCode::CONFLICT,
            ScanError::OutOfScope(_) => StatusCode::FORBIDDEN,
            ScanError::QueueFull => StatusCode::SERVICE_UNAVAILABLE,
            ScanError::Storage(e) => {
                error!(error = %e, "storage failure");
                return Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal storage error");
            }
        };
        Self::new(status, err.to_string())
    }
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        ScanError::Storage(err).into()
    }
}

pub fn router(state: AppState) -> Router {
    let protected = Router::new()
        .route("/scans", get(scans::list).post(scans::create))
        .route("/scans/asset/{asset_id}", get(scans::by_asset))
        .route("/scans/{id}", get(scans::get).delete(scans::delete))
        .route("/scans/{id}/cancel", post(scans::cancel))
        .route("/assets", get(assets::list).post(assets::create))
        .route("/assets/stats", get(assets::stats))
        .route(
            "/assets/{id}",
            get(assets::get).patch(assets::update).delete(assets::delete),
        )
        .route_layer(middleware::from_fn_with_state(state.clone(), auth_middleware));

    let api = Router::new().route("/health", get(health)).merge(protected);
    Router::new().nest("/api", api).with_state(state)
}

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    let tools = state.orchestrator.registry().tools();
    let running = state.orchestrator.running().await;
    Json(json!({
        "status": "ok",
        "service": "asmhawk-rs",
        "runtime": state.config.container_runtime,
        "tools": tools,
        "runningScans": running,
    }))
}

fn deleted(what: &str) -> Json<serde_json::Value> {
    Json(json!({ "message": format!("{what} deleted successfully") }))
}

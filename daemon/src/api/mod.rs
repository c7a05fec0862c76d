pub mod adapters;
pub mod generate;
pub mod system;

use axum::{
    http::StatusCode,
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use std::sync::Arc;

use crate::error::SessionError;
use crate::state::AppState;

const INDEX_HTML: &str = include_str!("../../assets/index.html");

pub fn routes(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/health", get(health))
        .route("/api/generate", post(generate::generate))
        .route("/api/adapters", get(adapters::list_adapters))
        .route("/api/adapters/refresh", post(adapters::refresh_adapters))
        .route("/api/system/stats", get(system::stats))
        .route("/api/output/open", post(system::open_output))
        .route("/api/shutdown", post(system::shutdown))
        .with_state(state)
}

async fn index() -> Html<&'static str> {
    Html(INDEX_HTML)
}

async fn health() -> &'static str {
    "ok"
}

#[derive(Serialize)]
struct ErrorResponse {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    message: String,
    r#type: &'static str,
}

/// An error rendered as `{ "error": { "message", "type" } }`
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
    kind: &'static str,
}

impl ApiError {
    pub fn internal(err: impl std::fmt::Display) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: err.to_string(),
            kind: "internal_error",
        }
    }
}

impl From<SessionError> for ApiError {
    fn from(err: SessionError) -> Self {
        let status = match &err {
            SessionError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            SessionError::AdapterNotFound(_) => StatusCode::NOT_FOUND,
            SessionError::AdapterLoad { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            SessionError::Busy => StatusCode::TOO_MANY_REQUESTS,
            SessionError::GenerationFailed(_) | SessionError::Output(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        Self {
            status,
            message: err.to_string(),
            kind: err.kind(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(ErrorResponse {
                error: ErrorDetail {
                    message: self.message,
                    r#type: self.kind,
                },
            }),
        )
            .into_response()
    }
}

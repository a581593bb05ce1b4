// src/handlers/mod.rs
pub mod status;
pub mod webhook;

use crate::middleware::logging::request_logging_middleware;
use crate::AppState;
use axum::{http::StatusCode, Extension, Json, Router};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;
use uuid::Uuid;

/// Provider webhook bodies are small JSON documents.
const MAX_BODY_BYTES: usize = 256 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub message: String,
}

pub type ApiError = (StatusCode, Json<ErrorResponse>);

pub fn error_response(status: StatusCode, message: impl Into<String>) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            success: false,
            message: message.into(),
        }),
    )
}

/// Log an internal error under a fresh id and return only the id to the caller.
pub fn internal_error(err: &dyn std::error::Error) -> ApiError {
    let error_id = Uuid::new_v4();
    tracing::error!(error_id = %error_id, error = %err, "request failed internally");
    error_response(
        StatusCode::INTERNAL_SERVER_ERROR,
        format!("Internal server error (ID: {})", error_id),
    )
}

pub fn router(state: Arc<AppState>) -> Router {
    let request_timeout = state.request_timeout;
    Router::new()
        .merge(webhook::webhook_routes())
        .merge(status::status_routes())
        .layer(axum::middleware::from_fn(request_logging_middleware))
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .layer(TimeoutLayer::new(request_timeout))
        .layer(Extension(state))
}

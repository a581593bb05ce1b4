use crate::handlers::ErrorResponse;
use crate::AppState;
use axum::{
    extract::Request,
    http::{HeaderMap, StatusCode},
    middleware::Next,
    response::{IntoResponse, Json, Response},
    Extension,
};
use std::sync::Arc;

pub const API_KEY_HEADER: &str = "x-api-key";

/// Rejects requests whose `X-API-Key` is not exactly the shared webhook secret.
pub async fn require_api_key(
    Extension(state): Extension<Arc<AppState>>,
    headers: HeaderMap,
    request: Request,
    next: Next,
) -> Result<Response, impl IntoResponse> {
    let presented = match headers.get(API_KEY_HEADER).map(|v| v.as_bytes()) {
        Some(value) => value,
        None => {
            return Err(unauthorized("Missing X-API-Key header"));
        }
    };

    if !constant_time_eq(presented, state.webhook_secret.as_bytes()) {
        tracing::warn!("rejected request with wrong API key");
        return Err(unauthorized("Invalid API key"));
    }

    Ok(next.run(request).await)
}

fn unauthorized(message: &str) -> (StatusCode, Json<ErrorResponse>) {
    (
        StatusCode::UNAUTHORIZED,
        Json(ErrorResponse {
            success: false,
            message: message.to_string(),
        }),
    )
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

// src/handlers/webhook.rs
//! `POST /hook`: providers push finished tasks here.

use super::{error_response, internal_error, ApiError};
use crate::coordinator::state::Outcome;
use crate::middleware::api_key::require_api_key;
use crate::providers::StatusReport;
use crate::AppState;
use axum::{
    body::Bytes,
    http::{header, HeaderMap, StatusCode},
    routing::post,
    Extension, Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub fn webhook_routes() -> Router {
    Router::new()
        .route("/hook", post(receive_hook))
        .route_layer(axum::middleware::from_fn(require_api_key))
}

#[derive(Debug, Deserialize)]
pub struct HookPayload {
    pub data: HookData,
}

#[derive(Debug, Deserialize)]
pub struct HookData {
    #[serde(default)]
    pub task_id: Option<String>,
    #[serde(default)]
    pub output: Option<HookOutput>,
}

#[derive(Debug, Default, Deserialize)]
pub struct HookOutput {
    #[serde(default)]
    pub image_urls: Vec<String>,
    #[serde(default)]
    pub video_urls: Vec<String>,
    /// Follow-up operations offered on the finished task, as in a status poll.
    #[serde(default)]
    pub actions: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct HookResponse {
    pub success: bool,
    pub task_id: String,
    /// `accepted` when the result was folded in, `discarded` for stale or
    /// duplicate deliveries.
    pub result: &'static str,
}

async fn receive_hook(
    Extension(state): Extension<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<HookResponse>, ApiError> {
    let is_json = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|ct| ct.trim().to_ascii_lowercase().starts_with("application/json"))
        .unwrap_or(false);
    if !is_json {
        return Err(error_response(
            StatusCode::UNSUPPORTED_MEDIA_TYPE,
            "Content-Type must be application/json",
        ));
    }

    let payload: HookPayload = serde_json::from_slice(&body)
        .map_err(|e| error_response(StatusCode::BAD_REQUEST, format!("Invalid JSON body: {}", e)))?;

    let task_id = payload
        .data
        .task_id
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty())
        .ok_or_else(|| error_response(StatusCode::BAD_REQUEST, "data.task_id is required"))?;

    let output = payload.data.output.unwrap_or_default();
    let urls: Vec<String> = output
        .image_urls
        .into_iter()
        .chain(output.video_urls)
        .filter(|url| !url.trim().is_empty())
        .collect();
    if urls.is_empty() {
        return Err(error_response(
            StatusCode::BAD_REQUEST,
            "data.output carries no output URLs",
        ));
    }

    tracing::info!(
        task_id = %task_id,
        outputs = urls.len(),
        actions = output.actions.len(),
        "📬 webhook delivery"
    );

    let report = StatusReport {
        actions: output.actions,
        ..StatusReport::completed(urls)
    };
    let outcome = state
        .coordinator
        .handle_report(&task_id, report, chrono::Utc::now())
        .await
        .map_err(|e| internal_error(&e))?;

    let result = match outcome {
        Outcome::Ignored => "discarded",
        _ => "accepted",
    };
    Ok(Json(HookResponse {
        success: true,
        task_id,
        result,
    }))
}

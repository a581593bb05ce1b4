// src/handlers/status.rs
use crate::middleware::api_key::require_api_key;
use crate::AppState;
use axum::{routing::get, Extension, Json, Router};
use serde_json::{json, Value};
use std::sync::Arc;

pub fn status_routes() -> Router {
    Router::new()
        .route("/api/status", get(api_status))
        .route_layer(axum::middleware::from_fn(require_api_key))
}

/// Service health plus a summary of the pipeline documents.
async fn api_status(Extension(state): Extension<Arc<AppState>>) -> Json<Value> {
    let coordinator = &state.coordinator;
    let schedule: Vec<u64> = coordinator.policy().schedule().iter().map(|d| d.as_secs()).collect();

    let pipeline = match coordinator.load_state().await {
        Ok(pipeline) => pipeline,
        Err(e) => {
            tracing::warn!(error = %e, "status check could not read the store");
            return Json(json!({
                "status": "degraded",
                "version": env!("CARGO_PKG_VERSION"),
                "store": "unreachable",
                "providers": coordinator.providers().configured(),
            }));
        }
    };

    let active = pipeline.active.task.as_ref().map(|task| {
        json!({
            "task_id": task.task_id,
            "provider": task.provider,
            "stage": task.stage(),
            "status": task.status,
            "attempts": task.attempts,
            "submitted_at": task.submitted_at,
        })
    });

    Json(json!({
        "status": "operational",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_secs": state.started_at.elapsed().as_secs(),
        "store": "reachable",
        "providers": coordinator.providers().configured(),
        "polling": {
            "schedule_secs": schedule,
            "max_attempts": coordinator.policy().max_attempts(),
            "misses_since_start": coordinator.poll_misses(),
        },
        "pipeline": {
            "active_task": active,
            "last_escalation": pipeline.active.last_escalation,
            "fetch": {
                "done": pipeline.fetch.done,
                "fetch_attempts": pipeline.fetch.fetch_attempts,
            },
            "publish_queue": pipeline.run.publish_list,
            "empty_folders": pipeline.run.empty_folders.len(),
            "processing_lock": pipeline.run.processing_lock,
            "results": pipeline.run.results,
        },
    }))
}

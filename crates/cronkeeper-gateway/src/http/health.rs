use axum::{extract::State, Json};
use serde_json::{json, Value};
use std::sync::Arc;

use crate::app::AppState;

/// GET /health: liveness probe with scheduler status.
pub async fn health_handler(State(state): State<Arc<AppState>>) -> Json<Value> {
    let scheduler = if state.tasks.is_running() {
        "running"
    } else {
        "stopped"
    };
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "scheduler": scheduler,
        "uptime_secs": (chrono::Utc::now() - state.started_at).num_seconds(),
    }))
}

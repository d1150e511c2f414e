use std::sync::Arc;

use axum::{extract::State, Json};
use cronkeeper_protocol::frames::{parse_request, ResFrame};
use tracing::warn;

use crate::app::AppState;
use crate::rpc;

/// POST /rpc: one request frame in, one response frame out.
///
/// Framing errors are answered in-band with status 200, same as stdio.
pub async fn rpc_handler(State(state): State<Arc<AppState>>, body: String) -> Json<ResFrame> {
    match parse_request(&body) {
        Ok(req) => Json(rpc::route(&req, &state).await),
        Err(e) => {
            warn!(error = %e, "rejected rpc request");
            Json(e.to_response())
        }
    }
}

//! Transport-independent RPC dispatch.
//!
//! Both the stdio loop and `POST /rpc` hand a parsed [`ReqFrame`] to
//! [`route`] and write back whatever frame it returns.

mod handlers;
mod view;

use cronkeeper_protocol::{frames::ResFrame, methods, ReqFrame};
use tracing::debug;

use crate::app::AppState;

/// Route one request to its handler.
pub async fn route(req: &ReqFrame, app: &AppState) -> ResFrame {
    let params = req.params.as_ref();
    let req_id = req.id.as_str();
    debug!(method = %req.method, req_id, "rpc request");

    match req.method.as_str() {
        // ------------------------------------------------------------------
        // Utility
        // ------------------------------------------------------------------
        methods::PING => ResFrame::ok(req_id, serde_json::json!({ "pong": true })),

        methods::SERVER_INFO => handlers::handle_server_info(req_id, app),

        // ------------------------------------------------------------------
        // Tasks
        // ------------------------------------------------------------------
        methods::TASKS_LIST => handlers::handle_tasks_list(req_id, app),

        methods::TASKS_GET => handlers::handle_tasks_get(params, req_id, app),

        methods::TASKS_ADD => handlers::handle_tasks_add(params, req_id, app),

        methods::TASKS_UPDATE => handlers::handle_tasks_update(params, req_id, app),

        methods::TASKS_REMOVE => handlers::handle_tasks_remove(params, req_id, app),

        methods::TASKS_ENABLE => handlers::handle_tasks_set_enabled(params, req_id, app, true),

        methods::TASKS_DISABLE => handlers::handle_tasks_set_enabled(params, req_id, app, false),

        methods::TASKS_RUN_NOW => handlers::handle_tasks_run_now(params, req_id, app).await,

        methods::TASKS_EXECUTIONS => handlers::handle_tasks_executions(params, req_id, app),

        // ------------------------------------------------------------------
        // Fallthrough
        // ------------------------------------------------------------------
        other => ResFrame::err(
            req_id,
            "METHOD_NOT_FOUND",
            &format!("unknown method '{other}'"),
        ),
    }
}

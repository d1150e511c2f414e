//! Concrete RPC method handlers.
//!
//! Each function extracts its parameters, calls the [`TaskService`] and
//! returns a `ResFrame`. [`super::route`] is the only caller.
//!
//! [`TaskService`]: cronkeeper_scheduler::TaskService

use cronkeeper_protocol::{frames::ResFrame, methods};
use cronkeeper_scheduler::{NewTask, SchedulerError, TaskUpdate};
use serde_json::{json, Value};
use tracing::{info, warn};

use super::view;
use crate::app::AppState;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Pull the required `id` string out of `params`.
fn task_id<'a>(params: Option<&'a Value>, req_id: &str) -> Result<&'a str, ResFrame> {
    match params.and_then(|p| p.get("id")).and_then(|v| v.as_str()) {
        Some(s) if !s.is_empty() => Ok(s),
        _ => Err(ResFrame::err(
            req_id,
            "INVALID_PARAMS",
            "missing or empty 'id' field",
        )),
    }
}

/// Translate a scheduler error into an error frame with its stable code.
fn map_scheduler_error(req_id: &str, method: &str, e: SchedulerError) -> ResFrame {
    match &e {
        SchedulerError::StoreUnavailable(_)
        | SchedulerError::Serialization(_)
        | SchedulerError::NotClaimed { .. }
        | SchedulerError::ExecutionSealed { .. }
        | SchedulerError::DispatchAborted { .. } => {
            warn!(method, error = %e, "rpc call failed");
        }
        _ => {}
    }
    ResFrame::err(req_id, e.code(), &e.to_string())
}

// ---------------------------------------------------------------------------
// server.info
// ---------------------------------------------------------------------------

pub fn handle_server_info(req_id: &str, app: &AppState) -> ResFrame {
    let scheduler = &app.config.scheduler;
    let status = if app.tasks.is_running() {
        "running"
    } else {
        "stopped"
    };
    let ai_configured = app.config.ai.api_key.as_deref().is_some_and(|k| !k.is_empty());
    ResFrame::ok(
        req_id,
        json!({
            "name": app.config.server.name,
            "version": env!("CARGO_PKG_VERSION"),
            "git_sha": env!("CRONKEEPER_GIT_SHA"),
            "target": env!("CRONKEEPER_BUILD_TARGET"),
            "transport": app.config.server.transport.to_string(),
            "scheduler": {
                "status": status,
                "check_interval_secs": scheduler.check_interval_secs,
                "execution_timeout_secs": scheduler.execution_timeout_secs,
                "max_concurrent_runs": scheduler.max_concurrent_runs,
            },
            "ai": {
                "model": app.config.ai.model,
                "configured": ai_configured,
            },
            "started_at": app.started_at,
            "methods": methods::ALL,
        }),
    )
}

// ---------------------------------------------------------------------------
// tasks.list / tasks.get
// ---------------------------------------------------------------------------

pub fn handle_tasks_list(req_id: &str, app: &AppState) -> ResFrame {
    match app.tasks.list_tasks() {
        Ok(tasks) => ResFrame::ok(
            req_id,
            json!({ "tasks": view::tasks(&tasks), "count": tasks.len() }),
        ),
        Err(e) => map_scheduler_error(req_id, methods::TASKS_LIST, e),
    }
}

/// Params: `{ "id": string }`
pub fn handle_tasks_get(params: Option<&Value>, req_id: &str, app: &AppState) -> ResFrame {
    let id = match task_id(params, req_id) {
        Ok(id) => id,
        Err(res) => return res,
    };
    match app.tasks.get_task(id) {
        Ok(task) => ResFrame::ok(req_id, json!({ "task": view::task(&task) })),
        Err(e) => map_scheduler_error(req_id, methods::TASKS_GET, e),
    }
}

// ---------------------------------------------------------------------------
// tasks.add
// ---------------------------------------------------------------------------

/// Params: `{ "name", "schedule", "type", "description"?, "enabled"?,
/// "do_only_once"?, ...type fields }`.
///
/// Type fields sit next to the common ones, e.g. `"command"` for `command`
/// tasks or `"url"`, `"method"`, `"headers"`, `"body"` for `api` tasks.
pub fn handle_tasks_add(params: Option<&Value>, req_id: &str, app: &AppState) -> ResFrame {
    let Some(p) = params else {
        return ResFrame::err(req_id, "INVALID_PARAMS", "params object required");
    };
    let new: NewTask = match serde_json::from_value(p.clone()) {
        Ok(n) => n,
        Err(e) => {
            return ResFrame::err(req_id, "INVALID_PARAMS", &format!("bad task: {e}"));
        }
    };

    match app.tasks.add_task(new) {
        Ok(task) => {
            info!(task_id = %task.id, name = %task.name, "task added via rpc");
            ResFrame::ok(req_id, json!({ "task": view::task(&task) }))
        }
        Err(e) => map_scheduler_error(req_id, methods::TASKS_ADD, e),
    }
}

// ---------------------------------------------------------------------------
// tasks.update
// ---------------------------------------------------------------------------

/// Params: `{ "id", "name"?, "description"?, "schedule"?, "params"?,
/// "enabled"?, "do_only_once"? }` where `params` is a typed object such as
/// `{ "type": "command", "command": "..." }`.
pub fn handle_tasks_update(params: Option<&Value>, req_id: &str, app: &AppState) -> ResFrame {
    let id = match task_id(params, req_id) {
        Ok(id) => id,
        Err(res) => return res,
    };
    let mut fields = params.cloned().unwrap_or_default();
    if let Value::Object(map) = &mut fields {
        map.remove("id");
    }
    let update: TaskUpdate = match serde_json::from_value(fields) {
        Ok(u) => u,
        Err(e) => {
            return ResFrame::err(req_id, "INVALID_PARAMS", &format!("bad update: {e}"));
        }
    };

    match app.tasks.update_task(id, update) {
        Ok(task) => {
            let deferred = task.pending_update.is_some();
            ResFrame::ok(
                req_id,
                json!({ "task": view::task(&task), "deferred": deferred }),
            )
        }
        Err(e) => map_scheduler_error(req_id, methods::TASKS_UPDATE, e),
    }
}

// ---------------------------------------------------------------------------
// tasks.remove / tasks.enable / tasks.disable
// ---------------------------------------------------------------------------

/// Params: `{ "id": string }`
pub fn handle_tasks_remove(params: Option<&Value>, req_id: &str, app: &AppState) -> ResFrame {
    let id = match task_id(params, req_id) {
        Ok(id) => id,
        Err(res) => return res,
    };
    match app.tasks.remove_task(id) {
        Ok(()) => ResFrame::ok(req_id, json!({ "ok": true, "id": id })),
        Err(e) => map_scheduler_error(req_id, methods::TASKS_REMOVE, e),
    }
}

/// Params: `{ "id": string }`
pub fn handle_tasks_set_enabled(
    params: Option<&Value>,
    req_id: &str,
    app: &AppState,
    enabled: bool,
) -> ResFrame {
    let id = match task_id(params, req_id) {
        Ok(id) => id,
        Err(res) => return res,
    };
    let (method, result) = if enabled {
        (methods::TASKS_ENABLE, app.tasks.enable_task(id))
    } else {
        (methods::TASKS_DISABLE, app.tasks.disable_task(id))
    };
    match result {
        Ok(task) => ResFrame::ok(req_id, json!({ "task": view::task(&task) })),
        Err(e) => map_scheduler_error(req_id, method, e),
    }
}

// ---------------------------------------------------------------------------
// tasks.run_now
// ---------------------------------------------------------------------------

/// Params: `{ "id": string }`
///
/// Blocks until the dispatch finishes (bounded by the execution timeout) and
/// returns the sealed execution record.
pub async fn handle_tasks_run_now(
    params: Option<&Value>,
    req_id: &str,
    app: &AppState,
) -> ResFrame {
    let id = match task_id(params, req_id) {
        Ok(id) => id,
        Err(res) => return res,
    };
    match app.tasks.run_task_now(id).await {
        Ok(record) => ResFrame::ok(req_id, json!({ "execution": view::execution(&record) })),
        Err(e) => map_scheduler_error(req_id, methods::TASKS_RUN_NOW, e),
    }
}

// ---------------------------------------------------------------------------
// tasks.executions
// ---------------------------------------------------------------------------

/// Params: `{ "id": string, "limit"?: number }`
pub fn handle_tasks_executions(params: Option<&Value>, req_id: &str, app: &AppState) -> ResFrame {
    const DEFAULT_LIMIT: usize = 10;
    const MAX_LIMIT: usize = 100;

    let id = match task_id(params, req_id) {
        Ok(id) => id,
        Err(res) => return res,
    };
    let limit = params
        .and_then(|p| p.get("limit"))
        .and_then(|v| v.as_u64())
        .map(|n| (n as usize).min(MAX_LIMIT))
        .unwrap_or(DEFAULT_LIMIT);

    match app.tasks.get_task_executions(id, Some(limit)) {
        Ok(records) => {
            let records: Vec<_> = records.iter().map(view::execution).collect();
            ResFrame::ok(
                req_id,
                json!({ "executions": records, "count": records.len() }),
            )
        }
        Err(e) => map_scheduler_error(req_id, methods::TASKS_EXECUTIONS, e),
    }
}

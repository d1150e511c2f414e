use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Utc};
use cronkeeper_core::config::CronkeeperConfig;
use cronkeeper_scheduler::TaskService;

/// Central shared state, passed as `Arc<AppState>` to every transport.
pub struct AppState {
    pub config: CronkeeperConfig,
    pub tasks: TaskService,
    pub started_at: DateTime<Utc>,
}

impl AppState {
    pub fn new(config: CronkeeperConfig, tasks: TaskService) -> Self {
        Self {
            config,
            tasks,
            started_at: Utc::now(),
        }
    }
}

/// Assemble the HTTP router.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(crate::http::health::health_handler))
        .route("/rpc", post(crate::http::rpc::rpc_handler))
        .with_state(state)
        .layer(tower_http::trace::TraceLayer::new_for_http())
}

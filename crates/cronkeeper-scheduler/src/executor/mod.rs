//! Per-type executors behind one capability: `run(task, timeout) -> RunResult`.
//!
//! | Type       | Deadline enforcement                                   |
//! |------------|--------------------------------------------------------|
//! | `command`  | preemptive: the child's process group is killed        |
//! | `api`      | cooperative: per-request timeout on the HTTP client    |
//! | `ai`       | cooperative: the provider call is raced against it     |
//! | `reminder` | bounded by construction: never waits past a short bound |
//!
//! [`ExecutorRegistry::run`] additionally isolates each run on its own Tokio
//! task, so a panicking or overrunning executor becomes a `failure` or
//! `timeout` result instead of reaching the scheduler loop.

mod ai;
mod api;
mod command;
mod reminder;

use std::{collections::HashMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use cronkeeper_agent::LlmProvider;
use cronkeeper_core::config::{AiConfig, SchedulerConfig};
use tokio::task::AbortHandle;
use tracing::{error, warn};

pub use ai::{AiExecutor, SYSTEM_PROMPT};
pub use api::ApiExecutor;
pub use command::CommandExecutor;
pub use reminder::ReminderExecutor;

use crate::types::{RunResult, Task, TaskType};

/// Slack on top of the task timeout before the registry gives up on an
/// executor that ignores its deadline.
const DEADLINE_GRACE: Duration = Duration::from_secs(2);

/// Knobs shared by the built-in executors.
#[derive(Debug, Clone)]
pub struct ExecutorSettings {
    /// Command output and API bodies are truncated past this many chars.
    pub max_output_chars: usize,
    /// Model for `ai` tasks that do not name one.
    pub ai_model: String,
    /// Longest a reminder waits on the notification tool.
    pub reminder_bound: Duration,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            max_output_chars: cronkeeper_core::config::DEFAULT_MAX_OUTPUT_CHARS,
            ai_model: cronkeeper_core::config::DEFAULT_AI_MODEL.to_string(),
            reminder_bound: Duration::from_secs(10),
        }
    }
}

impl ExecutorSettings {
    pub fn from_config(scheduler: &SchedulerConfig, ai: &AiConfig) -> Self {
        Self {
            max_output_chars: scheduler.max_output_chars,
            ai_model: ai.model.clone(),
            ..Self::default()
        }
    }
}

/// Runs tasks of one [`TaskType`].
#[async_trait]
pub trait Executor: Send + Sync {
    fn kind(&self) -> TaskType;

    /// Run `task`, returning within roughly `timeout`.
    async fn run(&self, task: &Task, timeout: Duration) -> RunResult;
}

/// Dispatch table from task type to executor.
#[derive(Default, Clone)]
pub struct ExecutorRegistry {
    executors: HashMap<TaskType, Arc<dyn Executor>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The four built-in executors. `ai` tasks fail cleanly without a provider.
    pub fn with_defaults(
        settings: &ExecutorSettings,
        provider: Option<Arc<dyn LlmProvider>>,
    ) -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(CommandExecutor::new(settings.max_output_chars)));
        registry.register(Arc::new(ApiExecutor::new(settings.max_output_chars)));
        registry.register(Arc::new(AiExecutor::new(provider, settings.ai_model.clone())));
        registry.register(Arc::new(ReminderExecutor::new(settings.reminder_bound)));
        registry
    }

    /// Add or replace the executor for `executor.kind()`.
    pub fn register(&mut self, executor: Arc<dyn Executor>) {
        self.executors.insert(executor.kind(), executor);
    }

    /// Run `task` on its executor. Never panics and never outlives
    /// `timeout` by more than a small grace period.
    pub async fn run(&self, task: &Task, timeout: Duration) -> RunResult {
        let Some(executor) = self.executors.get(&task.task_type()).cloned() else {
            warn!(task_id = %task.id, kind = %task.task_type(), "no executor registered");
            return RunResult::failure(format!(
                "no executor registered for task type '{}'",
                task.task_type()
            ));
        };

        let owned = task.clone();
        let handle = tokio::spawn(async move { executor.run(&owned, timeout).await });
        // dropping this future (shutdown, caller timeout) cancels the run
        let _abort = AbortOnDrop(handle.abort_handle());

        match tokio::time::timeout(timeout + DEADLINE_GRACE, handle).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) if join_err.is_panic() => {
                let msg = panic_message(join_err.into_panic());
                error!(task_id = %task.id, panic = %msg, "executor panicked");
                RunResult::failure(format!("executor panicked: {msg}"))
            }
            Ok(Err(_cancelled)) => RunResult::failure("executor was cancelled"),
            Err(_elapsed) => {
                warn!(task_id = %task.id, "executor overran its deadline; aborting");
                RunResult::timeout(timeout)
            }
        }
    }
}

struct AbortOnDrop(AbortHandle);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

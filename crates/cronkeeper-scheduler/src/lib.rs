//! `cronkeeper-scheduler`: cron-driven task scheduler with SQLite persistence.
//!
//! # Overview
//!
//! Tasks live in the `tasks` table. The [`engine::SchedulerEngine`] wakes up
//! every `check_interval`, atomically claims every enabled idle task whose
//! `next_run_at` has passed, and dispatches each on its own Tokio task:
//!
//! ```text
//! claim_due ─▶ log.begin ─▶ registry.run(task, timeout) ─▶ log.complete ─▶ release
//! ```
//!
//! Manual runs ([`service::TaskService::run_task_now`]) go through the same
//! claim, so one task never has two overlapping executions.
//!
//! # Task types
//!
//! | Type       | Executor                                            |
//! |------------|-----------------------------------------------------|
//! | `command`  | Shell command, process group killed on timeout      |
//! | `api`      | HTTP request, success on 2xx or `accepted_statuses` |
//! | `ai`       | Prompt sent to an OpenAI-compatible provider        |
//! | `reminder` | Desktop notification, fire-and-forget               |

pub mod cron;
pub mod db;
pub mod engine;
pub mod error;
pub mod executor;
pub mod log;
pub mod service;
pub mod store;
pub mod types;

pub use engine::{SchedulerContext, SchedulerEngine, SchedulerSettings};
pub use error::{Result, SchedulerError};
pub use executor::{Executor, ExecutorRegistry, ExecutorSettings};
pub use service::TaskService;
pub use types::{
    ExecutionRecord, NewTask, Outcome, RunResult, Task, TaskParams, TaskStatus, TaskType,
    TaskUpdate,
};

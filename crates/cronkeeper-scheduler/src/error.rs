use thiserror::Error;

/// Errors surfaced by the scheduling core.
///
/// Executor faults are deliberately absent: a failing command, HTTP call or
/// provider is recorded as an execution outcome, never returned as an error.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Malformed cron expression, or one that can never fire.
    #[error("Invalid schedule: {0}")]
    InvalidSchedule(String),

    #[error("Task not found: {id}")]
    NotFound { id: String },

    /// Missing or mismatched task fields.
    #[error("Invalid task: {0}")]
    InvalidTask(String),

    #[error("Task is running: {id}")]
    TaskRunning { id: String },

    /// One-shot task that was already dispatched.
    #[error("One-shot task already ran: {id}")]
    AlreadyRan { id: String },

    /// `release` on a task that is not in the running state.
    #[error("Task is not claimed: {id}")]
    NotClaimed { id: String },

    #[error("Execution already sealed: {id}")]
    ExecutionSealed { id: String },

    /// The dispatch task of a manual run panicked or was cancelled.
    #[error("Dispatch aborted: {id}")]
    DispatchAborted { id: String },

    /// Underlying SQLite / rusqlite error.
    #[error("Store unavailable: {0}")]
    StoreUnavailable(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SchedulerError {
    /// Stable error code for RPC responses.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidSchedule(_) => "INVALID_SCHEDULE",
            Self::NotFound { .. } => "NOT_FOUND",
            Self::InvalidTask(_) => "INVALID_PARAMS",
            Self::TaskRunning { .. } => "TASK_RUNNING",
            Self::AlreadyRan { .. } => "ALREADY_RAN",
            Self::StoreUnavailable(_) => "STORE_UNAVAILABLE",
            Self::NotClaimed { .. }
            | Self::ExecutionSealed { .. }
            | Self::DispatchAborted { .. }
            | Self::Serialization(_) => "INTERNAL_ERROR",
        }
    }
}

pub type Result<T> = std::result::Result<T, SchedulerError>;

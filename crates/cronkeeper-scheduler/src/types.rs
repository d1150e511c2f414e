use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SchedulerError};

/// The four kinds of work a task can do. Fixed at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Command,
    Api,
    Ai,
    Reminder,
}

impl TaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::Command => "command",
            TaskType::Api => "api",
            TaskType::Ai => "ai",
            TaskType::Reminder => "reminder",
        }
    }
}

impl std::fmt::Display for TaskType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaskType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "command" => Ok(TaskType::Command),
            "api" => Ok(TaskType::Api),
            "ai" => Ok(TaskType::Ai),
            "reminder" => Ok(TaskType::Reminder),
            other => Err(format!("unknown task type: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandParams {
    pub command: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiParams {
    pub url: String,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    /// JSON body, only sent for POST / PUT / PATCH.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<serde_json::Value>,
    /// Statuses counted as success. `None` means any 2xx.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accepted_statuses: Option<Vec<u16>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AiParams {
    pub prompt: String,
    /// Overrides the configured default model.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReminderParams {
    pub message: String,
    /// Falls back to the task name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default = "default_true")]
    pub sound: bool,
}

fn default_method() -> String {
    "GET".to_string()
}

fn default_true() -> bool {
    true
}

/// Type-specific payload, tagged on the wire by `"type"`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskParams {
    Command(CommandParams),
    Api(ApiParams),
    Ai(AiParams),
    Reminder(ReminderParams),
}

impl TaskParams {
    pub fn task_type(&self) -> TaskType {
        match self {
            TaskParams::Command(_) => TaskType::Command,
            TaskParams::Api(_) => TaskType::Api,
            TaskParams::Ai(_) => TaskType::Ai,
            TaskParams::Reminder(_) => TaskType::Reminder,
        }
    }

    /// Check the fields each executor requires.
    pub fn validate(&self) -> Result<()> {
        match self {
            TaskParams::Command(p) => require("command", &p.command),
            TaskParams::Api(p) => {
                require("url", &p.url)?;
                let url = reqwest::Url::parse(&p.url)
                    .map_err(|e| SchedulerError::InvalidTask(format!("invalid url: {e}")))?;
                if !matches!(url.scheme(), "http" | "https") {
                    return Err(SchedulerError::InvalidTask(format!(
                        "unsupported url scheme: {}",
                        url.scheme()
                    )));
                }
                reqwest::Method::from_bytes(p.method.to_ascii_uppercase().as_bytes()).map_err(
                    |_| SchedulerError::InvalidTask(format!("invalid http method: {}", p.method)),
                )?;
                if p.accepted_statuses.as_ref().is_some_and(|s| s.is_empty()) {
                    return Err(SchedulerError::InvalidTask(
                        "accepted_statuses must not be empty".into(),
                    ));
                }
                Ok(())
            }
            TaskParams::Ai(p) => require("prompt", &p.prompt),
            TaskParams::Reminder(p) => require("message", &p.message),
        }
    }
}

pub(crate) fn require(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(SchedulerError::InvalidTask(format!("'{field}' is required")));
    }
    Ok(())
}

/// Lifecycle state stored with each task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting for `next_run_at`.
    Idle,
    /// Claimed; exactly one dispatch is in flight.
    Running,
    /// Never selected by the loop.
    Disabled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Idle => "idle",
            TaskStatus::Running => "running",
            TaskStatus::Disabled => "disabled",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "idle" => Ok(TaskStatus::Idle),
            "running" => Ok(TaskStatus::Running),
            "disabled" => Ok(TaskStatus::Disabled),
            other => Err(format!("unknown task status: {other}")),
        }
    }
}

/// A persisted task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// UUID v7 string, primary key.
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// 5-field cron expression or `@` macro.
    pub schedule: String,
    #[serde(flatten)]
    pub params: TaskParams,
    pub enabled: bool,
    pub do_only_once: bool,
    pub status: TaskStatus,
    pub next_run_at: Option<DateTime<Utc>>,
    pub last_run_at: Option<DateTime<Utc>>,
    /// Why the scheduler disabled this task, if it did.
    pub last_error: Option<String>,
    /// An update received while running, applied on release.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_update: Option<TaskUpdate>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn task_type(&self) -> TaskType {
        self.params.task_type()
    }

    pub fn is_running(&self) -> bool {
        self.status == TaskStatus::Running
    }

    /// A one-shot task that has already been dispatched.
    pub fn is_spent(&self) -> bool {
        self.do_only_once && self.last_run_at.is_some()
    }
}

/// Caller-supplied fields for a new task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewTask {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub schedule: String,
    #[serde(flatten)]
    pub params: TaskParams,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_true")]
    pub do_only_once: bool,
}

impl NewTask {
    pub fn new(name: impl Into<String>, schedule: impl Into<String>, params: TaskParams) -> Self {
        Self {
            name: name.into(),
            description: None,
            schedule: schedule.into(),
            params,
            enabled: true,
            do_only_once: true,
        }
    }

    pub fn recurring(mut self) -> Self {
        self.do_only_once = false;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

/// Partial update; `None` leaves the field unchanged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// An empty string clears the description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<TaskParams>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub do_only_once: Option<bool>,
}

impl TaskUpdate {
    pub fn is_empty(&self) -> bool {
        *self == TaskUpdate::default()
    }

    /// Fold `later` into `self`; fields set in `later` win.
    pub fn merge(&mut self, later: TaskUpdate) {
        if later.name.is_some() {
            self.name = later.name;
        }
        if later.description.is_some() {
            self.description = later.description;
        }
        if later.schedule.is_some() {
            self.schedule = later.schedule;
        }
        if later.params.is_some() {
            self.params = later.params;
        }
        if later.enabled.is_some() {
            self.enabled = later.enabled;
        }
        if later.do_only_once.is_some() {
            self.do_only_once = later.do_only_once;
        }
    }

    /// Write the set fields into `task`. Returns true if the schedule changed.
    ///
    /// Status and `next_run_at` are left to the caller.
    pub fn apply_to(&self, task: &mut Task) -> Result<bool> {
        if let Some(params) = &self.params {
            if params.task_type() != task.task_type() {
                return Err(SchedulerError::InvalidTask(format!(
                    "task type is fixed: cannot change {} to {}",
                    task.task_type(),
                    params.task_type()
                )));
            }
            params.validate()?;
        }
        if let Some(name) = &self.name {
            require("name", name)?;
            task.name = name.clone();
        }
        if let Some(description) = &self.description {
            task.description = Some(description.clone()).filter(|d| !d.is_empty());
        }
        if let Some(params) = &self.params {
            task.params = params.clone();
        }
        if let Some(enabled) = self.enabled {
            task.enabled = enabled;
        }
        if let Some(once) = self.do_only_once {
            task.do_only_once = once;
        }
        let schedule_changed = match &self.schedule {
            Some(s) if *s != task.schedule => {
                task.schedule = s.clone();
                true
            }
            _ => false,
        };
        Ok(schedule_changed)
    }
}

/// How a dispatch ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success,
    Failure,
    Timeout,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::Failure => "failure",
            Outcome::Timeout => "timeout",
        }
    }
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Outcome {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "success" => Ok(Outcome::Success),
            "failure" => Ok(Outcome::Failure),
            "timeout" => Ok(Outcome::Timeout),
            other => Err(format!("unknown outcome: {other}")),
        }
    }
}

/// What an executor reports back. `error` is set iff the outcome is not success.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunResult {
    pub outcome: Outcome,
    pub output: String,
    pub error: Option<String>,
}

impl RunResult {
    pub fn success(output: impl Into<String>) -> Self {
        Self {
            outcome: Outcome::Success,
            output: output.into(),
            error: None,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            outcome: Outcome::Failure,
            output: String::new(),
            error: Some(error.into()),
        }
    }

    pub fn timeout(after: std::time::Duration) -> Self {
        Self {
            outcome: Outcome::Timeout,
            output: String::new(),
            error: Some(format!("timed out after {}s", after.as_secs_f64())),
        }
    }

    /// Attach captured output to a non-success result.
    pub fn with_output(mut self, output: impl Into<String>) -> Self {
        self.output = output.into();
        self
    }
}

/// One dispatch attempt. `finished_at` and `outcome` are `None` while open.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub id: String,
    pub task_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub outcome: Option<Outcome>,
    pub output: Option<String>,
    pub error: Option<String>,
}

impl ExecutionRecord {
    pub fn is_finished(&self) -> bool {
        self.finished_at.is_some()
    }
}

/// Where a claimed task goes when its dispatch ends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReleaseStatus {
    /// Back to the schedule (or to `disabled` if it was disabled meanwhile).
    Idle,
    /// Disabled, optionally recording why.
    Disabled { reason: Option<String> },
}

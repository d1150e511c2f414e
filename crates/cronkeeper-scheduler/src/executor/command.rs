use std::time::Duration;

use async_trait::async_trait;
use cronkeeper_terminal::{exec, truncate::truncate_head, ExecOptions, TerminalError};
use tracing::debug;

use super::Executor;
use crate::types::{RunResult, Task, TaskParams, TaskType};

/// Longest stderr excerpt quoted in the error message of a failed command.
const ERROR_EXCERPT_CHARS: usize = 500;

/// Runs `command` tasks through the platform shell.
pub struct CommandExecutor {
    max_output_chars: usize,
}

impl CommandExecutor {
    pub fn new(max_output_chars: usize) -> Self {
        Self { max_output_chars }
    }
}

#[async_trait]
impl Executor for CommandExecutor {
    fn kind(&self) -> TaskType {
        TaskType::Command
    }

    async fn run(&self, task: &Task, timeout: Duration) -> RunResult {
        let TaskParams::Command(params) = &task.params else {
            return RunResult::failure("not a command task");
        };

        let options = ExecOptions::with_timeout(timeout).max_output_chars(self.max_output_chars);
        match exec(&params.command, &options).await {
            Ok(res) if res.success() => RunResult::success(res.combined()),
            Ok(res) => {
                debug!(task_id = %task.id, exit_code = res.exit_code, "command failed");
                let stderr = res.stderr.trim();
                let error = if stderr.is_empty() {
                    format!("command exited with code {}", res.exit_code)
                } else {
                    format!(
                        "command exited with code {}: {}",
                        res.exit_code,
                        truncate_head(stderr, ERROR_EXCERPT_CHARS)
                    )
                };
                RunResult::failure(error).with_output(res.combined())
            }
            Err(TerminalError::Timeout { .. }) => RunResult::timeout(timeout),
            Err(e) => RunResult::failure(e.to_string()),
        }
    }
}

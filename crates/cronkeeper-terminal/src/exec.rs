//! One-shot command execution with a hard deadline.

use std::process::Stdio;

use tokio::process::Command;
use tracing::{debug, warn};

use crate::{
    error::{Result, TerminalError},
    truncate,
    types::{ExecOptions, ExecResult},
};

/// Execute `command` through the platform shell (`sh -c` / `cmd /C`).
///
/// The child is placed in its own process group. When `options.timeout`
/// expires, or when the returned future is dropped before completion, the
/// whole group is killed so pipelines and background children go with it.
///
/// # Errors
///
/// - `EmptyCommand`: `command` is blank.
/// - `Spawn`: the shell could not be started.
/// - `Timeout`: the deadline expired; the group has been killed.
/// - `Io`: collecting output failed.
pub async fn exec(command: &str, options: &ExecOptions) -> Result<ExecResult> {
    if command.trim().is_empty() {
        return Err(TerminalError::EmptyCommand);
    }
    debug!("exec: {command}");

    let child = shell_command(command)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| TerminalError::Spawn(format!("spawn failed: {e}")))?;

    // `wait_with_output` takes the child by value, so it runs on its own task
    // and reports back through a oneshot. The guard keeps the pid so the
    // group can still be killed from here.
    let mut guard = GroupKill::new(child.id());
    let (tx, rx) = tokio::sync::oneshot::channel();
    tokio::spawn(async move {
        let _ = tx.send(child.wait_with_output().await);
    });

    match tokio::time::timeout(options.timeout, rx).await {
        Ok(Ok(Ok(output))) => {
            guard.disarm();
            let exit_code = output.status.code().unwrap_or(-1);
            let stdout =
                truncate::truncate_middle(&strip_text(&output.stdout), options.max_output_chars);
            let stderr =
                truncate::truncate_middle(&strip_text(&output.stderr), options.max_output_chars);
            Ok(ExecResult {
                exit_code,
                stdout,
                stderr,
            })
        }

        Ok(Ok(Err(e))) => Err(TerminalError::Io(e)),

        // The wait task was dropped without sending; the runtime is shutting down.
        Ok(Err(_recv_err)) => Err(TerminalError::Spawn(
            "wait task ended unexpectedly".to_string(),
        )),

        Err(_elapsed) => {
            warn!(command, timeout_ms = options.timeout.as_millis() as u64, "command timed out, killing process group");
            // guard drop kills the group
            drop(guard);
            Err(TerminalError::Timeout {
                ms: options.timeout.as_millis() as u64,
            })
        }
    }
}

#[cfg(unix)]
fn shell_command(command: &str) -> Command {
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(command).process_group(0);
    cmd
}

#[cfg(not(unix))]
fn shell_command(command: &str) -> Command {
    let mut cmd = Command::new("cmd");
    cmd.arg("/C").arg(command);
    cmd
}

/// Kills the child's process group on drop unless disarmed.
struct GroupKill {
    pid: Option<u32>,
}

impl GroupKill {
    fn new(pid: Option<u32>) -> Self {
        Self { pid }
    }

    fn disarm(&mut self) {
        self.pid = None;
    }
}

impl Drop for GroupKill {
    fn drop(&mut self) {
        let Some(pid) = self.pid.take() else {
            return;
        };
        #[cfg(unix)]
        {
            // The child called setpgid(0, 0) at spawn, so its pgid equals its pid.
            // Safety: kill(2) has no memory-safety preconditions.
            let rc = unsafe { libc::kill(-(pid as libc::pid_t), libc::SIGKILL) };
            if rc != 0 {
                debug!(pid, "process group already gone");
            }
        }
        #[cfg(not(unix))]
        {
            let _ = std::process::Command::new("taskkill")
                .args(["/T", "/F", "/PID", &pid.to_string()])
                .output();
        }
    }
}

fn strip_text(raw: &[u8]) -> String {
    let clean = strip_ansi_escapes::strip(raw);
    String::from_utf8_lossy(&clean).into_owned()
}

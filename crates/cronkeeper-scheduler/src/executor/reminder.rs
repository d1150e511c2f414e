use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, warn};

use super::Executor;
use crate::types::{RunResult, Task, TaskParams, TaskType};

const LINUX_SOUND: &str = "/usr/share/sounds/freedesktop/stereo/complete.oga";

/// One desktop notification call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Notifier {
    pub program: String,
    pub args: Vec<String>,
}

/// Shows `reminder` tasks as desktop notifications.
///
/// The notification tool is started and given at most `bound` to finish;
/// tools that keep a window open past that are left running.
pub struct ReminderExecutor {
    bound: Duration,
}

impl ReminderExecutor {
    pub fn new(bound: Duration) -> Self {
        Self { bound }
    }
}

#[async_trait]
impl Executor for ReminderExecutor {
    fn kind(&self) -> TaskType {
        TaskType::Reminder
    }

    async fn run(&self, task: &Task, timeout: Duration) -> RunResult {
        let TaskParams::Reminder(params) = &task.params else {
            return RunResult::failure("not a reminder task");
        };
        let title = params.title.as_deref().unwrap_or(&task.name);

        let Some(notifier) = find_notifier(title, &params.message, params.sound) else {
            return RunResult::failure(
                "no notification tool found (tried notify-send, zenity, xmessage, osascript)",
            );
        };
        debug!(task_id = %task.id, program = %notifier.program, "showing reminder");

        let mut child = match Command::new(&notifier.program)
            .args(&notifier.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
        {
            Ok(c) => c,
            Err(e) => return RunResult::failure(format!("{} failed to start: {e}", notifier.program)),
        };

        if params.sound && cfg!(target_os = "linux") {
            play_sound();
        }

        let shown = format!("reminder shown via {}", notifier.program);
        match tokio::time::timeout(self.bound.min(timeout), child.wait()).await {
            Ok(Ok(status)) if status.success() => RunResult::success(shown),
            Ok(Ok(status)) => {
                let mut stderr = String::new();
                if let Some(mut pipe) = child.stderr.take() {
                    use tokio::io::AsyncReadExt;
                    let _ = pipe.read_to_string(&mut stderr).await;
                }
                RunResult::failure(format!(
                    "{} exited with {status}: {}",
                    notifier.program,
                    stderr.trim()
                ))
            }
            Ok(Err(e)) => RunResult::failure(format!("{} failed: {e}", notifier.program)),
            // still on screen; not our concern any more
            Err(_) => RunResult::success(shown),
        }
    }
}

/// Pick the first available notification tool for this platform.
fn find_notifier(title: &str, message: &str, sound: bool) -> Option<Notifier> {
    if cfg!(target_os = "macos") {
        return Some(osascript(title, message, sound));
    }
    if cfg!(windows) {
        return Some(Notifier {
            program: "msg".into(),
            args: vec!["*".into(), "/TIME:10".into(), format!("{title}: {message}")],
        });
    }
    let available = |p: &str| which::which(p).is_ok();
    if available("notify-send") {
        Some(Notifier {
            program: "notify-send".into(),
            args: vec!["--app-name=cronkeeper".into(), title.into(), message.into()],
        })
    } else if available("zenity") {
        Some(Notifier {
            program: "zenity".into(),
            args: vec!["--notification".into(), format!("--text={title}\n{message}")],
        })
    } else if available("xmessage") {
        Some(Notifier {
            program: "xmessage".into(),
            args: vec![
                "-center".into(),
                "-timeout".into(),
                "10".into(),
                format!("{title}\n\n{message}"),
            ],
        })
    } else {
        None
    }
}

fn osascript(title: &str, message: &str, sound: bool) -> Notifier {
    let mut script = format!(
        "display notification {} with title {}",
        applescript_quote(message),
        applescript_quote(title)
    );
    if sound {
        script.push_str(" sound name \"default\"");
    }
    Notifier {
        program: "osascript".into(),
        args: vec!["-e".into(), script],
    }
}

fn applescript_quote(s: &str) -> String {
    format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\""))
}

/// Fire-and-forget chime; failures only log.
fn play_sound() {
    if which::which("paplay").is_err() || !std::path::Path::new(LINUX_SOUND).exists() {
        return;
    }
    if let Err(e) = Command::new("paplay")
        .arg(LINUX_SOUND)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
    {
        warn!(error = %e, "could not play reminder sound");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::tests::task_with;
    use crate::types::{CommandParams, Outcome};

    #[test]
    fn applescript_strings_are_escaped() {
        assert_eq!(applescript_quote(r#"say "hi" \o/"#), r#""say \"hi\" \\o/""#);
    }

    #[test]
    fn osascript_adds_sound_clause_only_when_asked() {
        let n = osascript("T", "M", true);
        assert_eq!(n.program, "osascript");
        assert_eq!(
            n.args[1],
            r#"display notification "M" with title "T" sound name "default""#
        );
        assert!(!osascript("T", "M", false).args[1].contains("sound"));
    }

    #[tokio::test]
    async fn wrong_params_fail() {
        let task = task_with(TaskParams::Command(CommandParams {
            command: "true".into(),
        }));
        let res = ReminderExecutor::new(Duration::from_secs(1))
            .run(&task, Duration::from_secs(1))
            .await;
        assert_eq!(res.outcome, Outcome::Failure);
    }
}

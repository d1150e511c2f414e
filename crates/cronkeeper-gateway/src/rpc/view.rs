use cronkeeper_scheduler::{cron, ExecutionRecord, Task};
use cronkeeper_terminal::truncate::truncate_head;
use serde_json::Value;

/// Execution output is cut to this many chars in RPC responses.
pub const MAX_VIEW_OUTPUT_CHARS: usize = 1000;

/// A task as callers see it: the stored fields plus `schedule_human_readable`.
pub fn task(task: &Task) -> Value {
    let mut value = serde_json::to_value(task).unwrap_or(Value::Null);
    if let Value::Object(map) = &mut value {
        map.insert(
            "schedule_human_readable".to_string(),
            Value::String(cron::describe(&task.schedule)),
        );
    }
    value
}

pub fn tasks(tasks: &[Task]) -> Vec<Value> {
    tasks.iter().map(task).collect()
}

pub fn execution(record: &ExecutionRecord) -> ExecutionRecord {
    let mut record = record.clone();
    if let Some(output) = record.output.as_mut() {
        *output = truncate_head(output, MAX_VIEW_OUTPUT_CHARS);
    }
    record
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use cronkeeper_scheduler::{types::CommandParams, Outcome, TaskParams, TaskStatus};

    #[test]
    fn task_view_is_flat_and_described() {
        let now = Utc::now();
        let t = Task {
            id: "t1".into(),
            name: "noon".into(),
            description: None,
            schedule: "0 12 * * *".into(),
            params: TaskParams::Command(CommandParams {
                command: "date".into(),
            }),
            enabled: true,
            do_only_once: false,
            status: TaskStatus::Idle,
            next_run_at: None,
            last_run_at: None,
            last_error: None,
            pending_update: None,
            created_at: now,
            updated_at: now,
        };
        let v = task(&t);
        assert_eq!(v["type"], "command");
        assert_eq!(v["command"], "date");
        assert_eq!(v["status"], "idle");
        assert_eq!(v["schedule_human_readable"], "Daily at 12:00");
    }

    #[test]
    fn execution_output_is_bounded() {
        let rec = ExecutionRecord {
            id: "e".into(),
            task_id: "t".into(),
            started_at: Utc::now(),
            finished_at: None,
            outcome: Some(Outcome::Success),
            output: Some("x".repeat(5000)),
            error: None,
        };
        let view = execution(&rec);
        assert!(view.output.unwrap().chars().count() < 1100);
    }
}

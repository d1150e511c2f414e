use std::sync::Arc;

use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    cron, db,
    engine::{self, SchedulerContext},
    error::{Result, SchedulerError},
    types::{require, ExecutionRecord, NewTask, Task, TaskStatus, TaskUpdate},
};

/// Task management façade used by the RPC layer.
///
/// Validates caller input, then maps each operation onto the store, the
/// execution log or a dispatch.
#[derive(Clone)]
pub struct TaskService {
    ctx: Arc<SchedulerContext>,
}

impl TaskService {
    pub fn new(ctx: Arc<SchedulerContext>) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &SchedulerContext {
        &self.ctx
    }

    pub fn list_tasks(&self) -> Result<Vec<Task>> {
        self.ctx.store.list()
    }

    pub fn get_task(&self, id: &str) -> Result<Task> {
        self.ctx.store.get(id)
    }

    /// Validate and persist a new task. Nothing is written if any check fails.
    pub fn add_task(&self, new: NewTask) -> Result<Task> {
        require("name", &new.name)?;
        require("schedule", &new.schedule)?;
        new.params.validate()?;

        let now = db::now();
        let schedule = new.schedule.trim().to_string();
        let next_run_at = if new.enabled {
            Some(cron::next_after(&schedule, now)?)
        } else {
            cron::validate(&schedule)?;
            None
        };

        let task = Task {
            id: Uuid::now_v7().to_string(),
            name: new.name,
            description: new.description.filter(|d| !d.is_empty()),
            schedule,
            params: new.params,
            enabled: new.enabled,
            do_only_once: new.do_only_once,
            status: if new.enabled {
                TaskStatus::Idle
            } else {
                TaskStatus::Disabled
            },
            next_run_at,
            last_run_at: None,
            last_error: None,
            pending_update: None,
            created_at: now,
            updated_at: now,
        };
        self.ctx.store.insert(&task)?;
        Ok(task)
    }

    /// Change the given fields. On a running task the change is held until
    /// its dispatch finishes.
    pub fn update_task(&self, id: &str, mut update: TaskUpdate) -> Result<Task> {
        if update.is_empty() {
            return Err(SchedulerError::InvalidTask("no fields to update".into()));
        }
        if let Some(schedule) = update.schedule.as_mut() {
            require("schedule", schedule)?;
            *schedule = schedule.trim().to_string();
        }
        self.ctx.store.update(id, update, db::now())
    }

    pub fn remove_task(&self, id: &str) -> Result<()> {
        self.ctx.store.delete(id)
    }

    pub fn enable_task(&self, id: &str) -> Result<Task> {
        self.ctx.store.set_enabled(id, true, db::now())
    }

    pub fn disable_task(&self, id: &str) -> Result<Task> {
        self.ctx.store.set_enabled(id, false, db::now())
    }

    /// Dispatch a task immediately, through the same claim as the loop.
    ///
    /// Fails with `TaskRunning` if the task is already being dispatched and
    /// with `AlreadyRan` for a one-shot task that has had its run. Disabled
    /// tasks may be run; they stay disabled afterwards.
    ///
    /// The dispatch runs on its own task, so dropping the returned future
    /// only discards the result; the run itself completes.
    pub async fn run_task_now(&self, id: &str) -> Result<ExecutionRecord> {
        let now = db::now();
        let task = self.ctx.store.claim(id, now)?;
        info!(task_id = %id, "manual run requested");

        let ctx = self.ctx.clone();
        let handle = tokio::spawn(async move { engine::dispatch(&ctx, task, now).await });
        match handle.await {
            Ok(result) => result,
            Err(e) => {
                warn!(task_id = %id, error = %e, "manual dispatch did not complete");
                Err(SchedulerError::DispatchAborted { id: id.to_string() })
            }
        }
    }

    /// Execution history of one task, most recent first.
    pub fn get_task_executions(&self, id: &str, limit: Option<usize>) -> Result<Vec<ExecutionRecord>> {
        // unknown ids are an error, not an empty history
        self.ctx.store.get(id)?;
        self.ctx.log.list_for_task(id, limit)
    }

    /// Whether the scheduler loop is running.
    pub fn is_running(&self) -> bool {
        self.ctx.is_active()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::SchedulerSettings;
    use crate::executor::{ExecutorRegistry, ExecutorSettings};
    use crate::types::{CommandParams, Outcome, ReminderParams, TaskParams};

    fn service() -> TaskService {
        let registry = ExecutorRegistry::with_defaults(&ExecutorSettings::default(), None);
        let ctx = SchedulerContext::open(":memory:", SchedulerSettings::default(), registry).unwrap();
        TaskService::new(ctx)
    }

    fn command(cmd: &str) -> TaskParams {
        TaskParams::Command(CommandParams {
            command: cmd.into(),
        })
    }

    #[test]
    fn add_then_get_round_trips() {
        let svc = service();
        let mut new = NewTask::new("nightly", "0 3 * * *", command("echo hi")).recurring();
        new.description = Some("backup".into());
        let added = svc.add_task(new).unwrap();

        let got = svc.get_task(&added.id).unwrap();
        assert_eq!(got, added);
        assert_eq!(got.name, "nightly");
        assert_eq!(got.description.as_deref(), Some("backup"));
        assert_eq!(got.schedule, "0 3 * * *");
        assert!(got.enabled);
        assert!(!got.do_only_once);
        assert_eq!(got.status, TaskStatus::Idle);
        assert!(got.next_run_at.unwrap() > got.created_at);
    }

    #[test]
    fn invalid_schedule_is_not_persisted() {
        let svc = service();
        let err = svc
            .add_task(NewTask::new("bad", "99 * * * *", command("true")))
            .unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidSchedule(_)));
        assert!(svc.list_tasks().unwrap().is_empty());

        // also checked for tasks created disabled
        let err = svc
            .add_task(NewTask::new("bad", "nope", command("true")).disabled())
            .unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidSchedule(_)));
    }

    #[test]
    fn missing_fields_are_invalid() {
        let svc = service();
        assert!(matches!(
            svc.add_task(NewTask::new(" ", "* * * * *", command("true"))),
            Err(SchedulerError::InvalidTask(_))
        ));
        assert!(matches!(
            svc.add_task(NewTask::new("x", "* * * * *", command(""))),
            Err(SchedulerError::InvalidTask(_))
        ));
        assert!(matches!(
            svc.update_task("whatever", TaskUpdate::default()),
            Err(SchedulerError::InvalidTask(_))
        ));
    }

    #[test]
    fn update_changes_only_given_fields() {
        let svc = service();
        let added = svc
            .add_task(NewTask::new("n", "0 3 * * *", command("true")).recurring())
            .unwrap();
        let updated = svc
            .update_task(
                &added.id,
                TaskUpdate {
                    schedule: Some(" 30 4 * * * ".into()),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(updated.schedule, "30 4 * * *");
        assert_eq!(updated.name, added.name);
        assert_eq!(updated.params, added.params);
        assert_eq!(svc.get_task(&added.id).unwrap(), updated);

        assert!(matches!(
            svc.update_task(
                &added.id,
                TaskUpdate {
                    params: Some(TaskParams::Reminder(ReminderParams {
                        message: "m".into(),
                        title: None,
                        sound: true,
                    })),
                    ..Default::default()
                }
            ),
            Err(SchedulerError::InvalidTask(_))
        ));
    }

    #[test]
    fn enable_and_disable_toggle_scheduling() {
        let svc = service();
        let added = svc
            .add_task(NewTask::new("n", "* * * * *", command("true")))
            .unwrap();
        let off = svc.disable_task(&added.id).unwrap();
        assert_eq!(off.status, TaskStatus::Disabled);
        assert!(off.next_run_at.is_none());
        let on = svc.enable_task(&added.id).unwrap();
        assert_eq!(on.status, TaskStatus::Idle);
        assert!(on.next_run_at.is_some());
    }

    #[test]
    fn unknown_ids_are_not_found() {
        let svc = service();
        assert!(matches!(svc.get_task("x"), Err(SchedulerError::NotFound { .. })));
        assert!(matches!(svc.remove_task("x"), Err(SchedulerError::NotFound { .. })));
        assert!(matches!(svc.enable_task("x"), Err(SchedulerError::NotFound { .. })));
        assert!(matches!(
            svc.get_task_executions("x", None),
            Err(SchedulerError::NotFound { .. })
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn run_now_records_an_execution() {
        let svc = service();
        let added = svc
            .add_task(NewTask::new("n", "0 0 1 1 *", command("echo manual")).recurring())
            .unwrap();
        let rec = svc.run_task_now(&added.id).await.unwrap();
        assert_eq!(rec.outcome, Some(Outcome::Success));
        assert!(rec.output.unwrap().contains("manual"));

        let task = svc.get_task(&added.id).unwrap();
        assert_eq!(task.status, TaskStatus::Idle);
        assert!(task.last_run_at.is_some());
        assert_eq!(svc.get_task_executions(&added.id, Some(10)).unwrap().len(), 1);

        svc.remove_task(&added.id).unwrap();
        assert!(svc.list_tasks().unwrap().is_empty());
        assert!(!svc.is_running());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn dropped_caller_does_not_cancel_the_run() {
        let svc = service();
        let added = svc
            .add_task(NewTask::new("n", "0 0 1 1 *", command("sleep 0.3; echo finished")).recurring())
            .unwrap();

        let abandoned =
            tokio::time::timeout(std::time::Duration::from_millis(50), svc.run_task_now(&added.id))
                .await;
        assert!(abandoned.is_err());

        let mut records = Vec::new();
        for _ in 0..100 {
            records = svc.get_task_executions(&added.id, None).unwrap();
            let released = svc.get_task(&added.id).unwrap().status == TaskStatus::Idle;
            if released && records.first().is_some_and(|r| r.is_finished()) {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        }
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].outcome, Some(Outcome::Success));
        assert!(records[0].output.as_deref().unwrap_or("").contains("finished"));
        assert_eq!(svc.get_task(&added.id).unwrap().status, TaskStatus::Idle);
    }
}

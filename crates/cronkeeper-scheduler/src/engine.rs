use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use cronkeeper_core::config::SchedulerConfig;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::{
    cron, db,
    error::Result,
    executor::ExecutorRegistry,
    log::ExecutionLog,
    store::{Recovery, TaskStore},
    types::{ExecutionRecord, ReleaseStatus, RunResult, Task},
};

/// Loop timing and limits.
#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub check_interval: Duration,
    pub execution_timeout: Duration,
    /// Upper bound on loop dispatches in flight at once.
    pub max_concurrent_runs: usize,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self::from(&SchedulerConfig::default())
    }
}

impl From<&SchedulerConfig> for SchedulerSettings {
    fn from(cfg: &SchedulerConfig) -> Self {
        Self {
            check_interval: cfg.check_interval(),
            execution_timeout: cfg.execution_timeout(),
            max_concurrent_runs: cfg.max_concurrent_runs.max(1),
        }
    }
}

/// Process-scoped scheduler state, built once at startup and shared by the
/// loop and the management façade.
pub struct SchedulerContext {
    pub store: TaskStore,
    pub log: ExecutionLog,
    pub registry: ExecutorRegistry,
    pub settings: SchedulerSettings,
    active: AtomicBool,
}

impl SchedulerContext {
    pub fn new(
        store: TaskStore,
        log: ExecutionLog,
        registry: ExecutorRegistry,
        settings: SchedulerSettings,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            log,
            registry,
            settings,
            active: AtomicBool::new(false),
        })
    }

    /// Open the database at `db_path` and wire the store and log to it.
    ///
    /// A file database gets one connection per component; `":memory:"` has
    /// to share a single connection or the two would see different databases.
    pub fn open(
        db_path: &str,
        settings: SchedulerSettings,
        registry: ExecutorRegistry,
    ) -> Result<Arc<Self>> {
        let store_conn = Arc::new(Mutex::new(db::open(db_path)?));
        let log_conn = if db_path == ":memory:" {
            store_conn.clone()
        } else {
            Arc::new(Mutex::new(db::open(db_path)?))
        };
        info!(path = %db_path, "scheduler database opened");
        Ok(Self::new(
            TaskStore::new(store_conn),
            ExecutionLog::new(log_conn),
            registry,
            settings,
        ))
    }

    /// Repair what a previous process left behind. Call before the loop starts.
    pub fn recover(&self) -> Result<Recovery> {
        let now = db::now();
        let sealed = self.log.recover_unfinished(now)?;
        let report = self.store.recover(now)?;
        if sealed > 0 || report.released > 0 || report.reseeded > 0 {
            info!(
                sealed,
                released = report.released,
                reseeded = report.reseeded,
                "startup recovery finished"
            );
        }
        Ok(report)
    }

    /// Whether a [`SchedulerEngine`] loop is currently running.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }
}

/// Periodic driver: claims due tasks and dispatches each on its own Tokio task.
pub struct SchedulerEngine {
    ctx: Arc<SchedulerContext>,
    slots: Arc<Semaphore>,
    inflight: JoinSet<()>,
}

impl SchedulerEngine {
    pub fn new(ctx: Arc<SchedulerContext>) -> Self {
        let slots = Arc::new(Semaphore::new(ctx.settings.max_concurrent_runs));
        Self {
            ctx,
            slots,
            inflight: JoinSet::new(),
        }
    }

    /// Main loop. Ticks every `check_interval` until `shutdown` turns `true`,
    /// then waits for in-flight dispatches to finish.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        self.ctx.active.store(true, Ordering::Release);
        info!(
            interval_secs = self.ctx.settings.check_interval.as_secs_f64(),
            timeout_secs = self.ctx.settings.execution_timeout.as_secs_f64(),
            "scheduler engine started"
        );

        let mut interval = tokio::time::interval(self.ctx.settings.check_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.tick() {
                        // store trouble only costs this tick
                        error!(error = %e, "scheduler tick failed");
                    }
                }
                Some(joined) = self.inflight.join_next(), if !self.inflight.is_empty() => {
                    log_join(joined);
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("scheduler engine shutting down");
                        break;
                    }
                }
            }
        }

        self.drain().await;
        self.ctx.active.store(false, Ordering::Release);
        info!("scheduler engine stopped");
    }

    /// Claim what is due now and start dispatching it. Returns how many
    /// tasks were claimed.
    ///
    /// Only as many tasks as there are free slots are claimed; the rest stay
    /// idle for a later tick.
    pub fn tick(&mut self) -> Result<usize> {
        let now = db::now();
        let free = self.slots.available_permits();
        if free == 0 {
            debug!("all dispatch slots busy; skipping claim");
            return Ok(0);
        }

        let due = self.ctx.store.claim_due(now, free)?;
        let claimed = due.len();
        for task in due {
            let Ok(permit) = self.slots.clone().try_acquire_owned() else {
                // only this loop takes permits, so this is unreachable in practice
                warn!(task_id = %task.id, "no free slot for claimed task; handing it back");
                self.ctx
                    .store
                    .release(&task.id, ReleaseStatus::Idle, task.next_run_at)?;
                continue;
            };
            let ctx = self.ctx.clone();
            self.inflight.spawn(async move {
                let _permit = permit;
                let task_id = task.id.clone();
                if let Err(e) = dispatch(&ctx, task, now).await {
                    error!(task_id = %task_id, error = %e, "dispatch failed");
                }
            });
        }
        Ok(claimed)
    }

    /// Wait for every in-flight dispatch to finish.
    pub async fn drain(&mut self) {
        if !self.inflight.is_empty() {
            info!(count = self.inflight.len(), "waiting for in-flight dispatches");
        }
        while let Some(joined) = self.inflight.join_next().await {
            log_join(joined);
        }
    }
}

fn log_join(joined: std::result::Result<(), tokio::task::JoinError>) {
    if let Err(e) = joined {
        if e.is_panic() {
            error!(error = %e, "dispatch task panicked");
        }
    }
}

/// Run one claimed task: open a record, execute, seal the record, release.
///
/// `task` must already be claimed (status `running`). The claim is released
/// on every exit path; if this future is dropped or unwinds before it
/// finishes, the open record is sealed as a failure on the way out.
pub async fn dispatch(
    ctx: &SchedulerContext,
    task: Task,
    dispatched_at: DateTime<Utc>,
) -> Result<ExecutionRecord> {
    let mut guard = ClaimGuard::new(ctx, &task);

    let execution_id = ctx.log.begin(&task.id, dispatched_at)?;
    guard.execution_id = Some(execution_id.clone());
    info!(task_id = %task.id, execution_id = %execution_id, kind = %task.task_type(), "dispatching task");

    let result = ctx.registry.run(&task, ctx.settings.execution_timeout).await;
    let record = ctx.log.complete(&execution_id, &result)?;
    guard.execution_id = None;

    let (status, next) = disposition(&task, dispatched_at);
    let released = guard.release(status, next)?;
    info!(
        task_id = %task.id,
        execution_id = %record.id,
        outcome = %result.outcome,
        status = %released.status,
        next_run_at = ?released.next_run_at,
        "dispatch finished"
    );
    Ok(record)
}

/// Where a task goes after a dispatch that started at `dispatched_at`.
fn disposition(task: &Task, dispatched_at: DateTime<Utc>) -> (ReleaseStatus, Option<DateTime<Utc>>) {
    if task.do_only_once {
        return (ReleaseStatus::Disabled { reason: None }, None);
    }
    match cron::next_after(&task.schedule, dispatched_at) {
        Ok(next) => (ReleaseStatus::Idle, Some(next)),
        Err(e) => {
            warn!(task_id = %task.id, error = %e, "schedule cannot be evaluated; disabling task");
            (
                ReleaseStatus::Disabled {
                    reason: Some(e.to_string()),
                },
                None,
            )
        }
    }
}

/// Releases a claim when dropped unless [`release`](Self::release) ran first.
struct ClaimGuard<'a> {
    ctx: &'a SchedulerContext,
    task_id: String,
    do_only_once: bool,
    /// Set while an execution record is open.
    execution_id: Option<String>,
    armed: bool,
}

impl<'a> ClaimGuard<'a> {
    fn new(ctx: &'a SchedulerContext, task: &Task) -> Self {
        Self {
            ctx,
            task_id: task.id.clone(),
            do_only_once: task.do_only_once,
            execution_id: None,
            armed: true,
        }
    }

    fn release(mut self, status: ReleaseStatus, next: Option<DateTime<Utc>>) -> Result<Task> {
        self.armed = false;
        self.ctx.store.release(&self.task_id, status, next)
    }
}

impl Drop for ClaimGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        warn!(task_id = %self.task_id, "dispatch did not finish; releasing claim");

        if let Some(execution_id) = self.execution_id.take() {
            let aborted = RunResult::failure("dispatch aborted before the executor finished");
            if let Err(e) = self.ctx.log.complete(&execution_id, &aborted) {
                error!(execution_id = %execution_id, error = %e, "could not seal aborted execution");
            }
        }

        // a one-shot task that got this far has had its attempt
        let status = if self.do_only_once {
            ReleaseStatus::Disabled { reason: None }
        } else {
            ReleaseStatus::Idle
        };
        // None lets release recompute next_run_at from the current time
        if let Err(e) = self.ctx.store.release(&self.task_id, status, None) {
            error!(task_id = %self.task_id, error = %e, "could not release claim");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::Executor;
    use crate::types::{CommandParams, Outcome, TaskParams, TaskStatus, TaskType};
    use async_trait::async_trait;

    struct Sleeper;

    #[async_trait]
    impl Executor for Sleeper {
        fn kind(&self) -> TaskType {
            TaskType::Command
        }
        async fn run(&self, _task: &Task, _timeout: Duration) -> RunResult {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            RunResult::success("never")
        }
    }

    struct Quick;

    #[async_trait]
    impl Executor for Quick {
        fn kind(&self) -> TaskType {
            TaskType::Command
        }
        async fn run(&self, _task: &Task, _timeout: Duration) -> RunResult {
            RunResult::success("done")
        }
    }

    fn context(executor: Arc<dyn Executor>, max_concurrent_runs: usize) -> Arc<SchedulerContext> {
        let mut registry = ExecutorRegistry::new();
        registry.register(executor);
        SchedulerContext::open(
            ":memory:",
            SchedulerSettings {
                check_interval: Duration::from_millis(50),
                execution_timeout: Duration::from_secs(5),
                max_concurrent_runs,
            },
            registry,
        )
        .unwrap()
    }

    /// Insert a task that is already due. The yearly schedule keeps it from
    /// coming due a second time during the test.
    fn due_task(ctx: &SchedulerContext, id: &str, once: bool) {
        let now = db::now();
        ctx.store
            .insert(&Task {
                id: id.into(),
                name: id.into(),
                description: None,
                schedule: "0 0 1 1 *".into(),
                params: TaskParams::Command(CommandParams {
                    command: "true".into(),
                }),
                enabled: true,
                do_only_once: once,
                status: TaskStatus::Idle,
                next_run_at: Some(now - chrono::Duration::seconds(1)),
                last_run_at: None,
                last_error: None,
                pending_update: None,
                created_at: now,
                updated_at: now,
            })
            .unwrap();
    }

    #[tokio::test]
    async fn tick_dispatches_and_reschedules() {
        let ctx = context(Arc::new(Quick), 4);
        due_task(&ctx, "a", false);
        let mut engine = SchedulerEngine::new(ctx.clone());

        assert_eq!(engine.tick().unwrap(), 1);
        engine.drain().await;

        let task = ctx.store.get("a").unwrap();
        assert_eq!(task.status, TaskStatus::Idle);
        let last = task.last_run_at.unwrap();
        assert_eq!(
            task.next_run_at.unwrap(),
            cron::next_after("0 0 1 1 *", last).unwrap()
        );
        let runs = ctx.log.list_for_task("a", None).unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].outcome, Some(Outcome::Success));

        assert_eq!(engine.tick().unwrap(), 0);
    }

    #[tokio::test]
    async fn once_task_ends_disabled() {
        let ctx = context(Arc::new(Quick), 4);
        due_task(&ctx, "once", true);
        let mut engine = SchedulerEngine::new(ctx.clone());
        engine.tick().unwrap();
        engine.drain().await;

        let task = ctx.store.get("once").unwrap();
        assert_eq!(task.status, TaskStatus::Disabled);
        assert!(!task.enabled);
        assert!(task.next_run_at.is_none());
    }

    #[tokio::test]
    async fn claims_are_bounded_by_free_slots() {
        let ctx = context(Arc::new(Sleeper), 1);
        due_task(&ctx, "a", false);
        due_task(&ctx, "b", false);
        let mut engine = SchedulerEngine::new(ctx.clone());

        assert_eq!(engine.tick().unwrap(), 1);
        // the only slot is taken by the sleeper
        assert_eq!(engine.tick().unwrap(), 0);
        let statuses: Vec<TaskStatus> = ctx.store.list().unwrap().into_iter().map(|t| t.status).collect();
        assert!(statuses.contains(&TaskStatus::Running));
        assert!(statuses.contains(&TaskStatus::Idle));
        engine.inflight.abort_all();
        engine.drain().await;
    }

    #[tokio::test]
    async fn cancelled_dispatch_releases_and_seals() {
        let ctx = context(Arc::new(Sleeper), 1);
        due_task(&ctx, "slow", false);
        let now = db::now();
        let task = ctx.store.claim("slow", now).unwrap();

        let handle = tokio::spawn({
            let ctx = ctx.clone();
            async move { dispatch(&ctx, task, now).await }
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.abort();
        assert!(handle.await.unwrap_err().is_cancelled());

        let task = ctx.store.get("slow").unwrap();
        assert_eq!(task.status, TaskStatus::Idle);
        assert!(task.next_run_at.unwrap() > now);
        let runs = ctx.log.list_for_task("slow", None).unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].outcome, Some(Outcome::Failure));
    }

    #[tokio::test]
    async fn run_loop_stops_on_shutdown() {
        let ctx = context(Arc::new(Quick), 2);
        due_task(&ctx, "a", false);
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(SchedulerEngine::new(ctx.clone()).run(rx));

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(ctx.is_active());
        tx.send(true).unwrap();
        handle.await.unwrap();

        assert!(!ctx.is_active());
        assert_eq!(ctx.log.list_for_task("a", None).unwrap().len(), 1);
    }
}

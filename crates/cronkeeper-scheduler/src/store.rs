use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use tracing::{debug, info, instrument, warn};

use crate::{
    cron,
    db::{self, fmt_ts, parse_opt_ts, parse_ts},
    error::{Result, SchedulerError},
    types::{ReleaseStatus, Task, TaskParams, TaskStatus, TaskUpdate},
};

const TASK_COLUMNS: &str = "id, name, description, type, schedule, params, enabled, do_only_once,
     status, next_run_at, last_run_at, last_error, pending_update, created_at, updated_at";

/// What [`TaskStore::recover`] changed.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Recovery {
    /// Tasks found `running` and released.
    pub released: usize,
    /// Enabled tasks whose missing `next_run_at` was recomputed.
    pub reseeded: usize,
}

/// Durable task table.
///
/// Every state transition runs inside a `BEGIN IMMEDIATE` transaction, so the
/// write lock is taken before the row is read. Two stores on separate
/// connections to the same file therefore can never both claim one task.
#[derive(Clone)]
pub struct TaskStore {
    conn: Arc<Mutex<Connection>>,
}

impl TaskStore {
    /// Wrap a connection whose schema is already initialised (see [`db::open`]).
    pub fn new(conn: Arc<Mutex<Connection>>) -> Self {
        Self { conn }
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn insert(&self, task: &Task) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            &format!(
                "INSERT INTO tasks ({TASK_COLUMNS})
                 VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15)"
            ),
            params![
                task.id,
                task.name,
                task.description,
                task.task_type().as_str(),
                task.schedule,
                serde_json::to_string(&task.params)?,
                task.enabled,
                task.do_only_once,
                task.status.as_str(),
                task.next_run_at.as_ref().map(fmt_ts),
                task.last_run_at.as_ref().map(fmt_ts),
                task.last_error,
                encode_pending(task)?,
                fmt_ts(&task.created_at),
                fmt_ts(&task.updated_at),
            ],
        )?;
        info!(task_id = %task.id, name = %task.name, kind = %task.task_type(), "task stored");
        Ok(())
    }

    #[instrument(skip(self), level = "debug")]
    pub fn get(&self, id: &str) -> Result<Task> {
        let conn = self.lock();
        select_task(&conn, id)?.ok_or_else(|| not_found(id))
    }

    /// All tasks, oldest first.
    pub fn list(&self) -> Result<Vec<Task>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE deleted_at IS NULL ORDER BY created_at, id"
        ))?;
        let rows = stmt
            .query_map([], TaskRow::read)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter().map(TaskRow::into_task).collect()
    }

    /// Apply `update` now, or park it until release if the task is running.
    ///
    /// A changed schedule, or enabling a disabled task, recomputes
    /// `next_run_at` from `now`. A schedule that fails to evaluate is rejected
    /// and nothing is written.
    #[instrument(skip(self, update), level = "debug")]
    pub fn update(&self, id: &str, update: TaskUpdate, now: DateTime<Utc>) -> Result<Task> {
        let mut conn = self.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let mut task = select_task(&tx, id)?.ok_or_else(|| not_found(id))?;

        if task.is_running() {
            // validate eagerly so the caller still hears about bad input
            let mut preview = task.clone();
            if update.apply_to(&mut preview)? {
                cron::validate(&preview.schedule)?;
            }
            let merged = match task.pending_update.take() {
                Some(mut pending) => {
                    pending.merge(update);
                    pending
                }
                None => update,
            };
            task.pending_update = Some(merged);
            task.updated_at = now;
            write_task(&tx, &task)?;
            tx.commit()?;
            info!(task_id = %id, "task running; update deferred until release");
            return Ok(task);
        }

        let was_enabled = task.enabled;
        let schedule_changed = update.apply_to(&mut task)?;
        if task.enabled && task.is_spent() {
            return Err(SchedulerError::AlreadyRan { id: id.to_string() });
        }
        if task.enabled {
            if schedule_changed || !was_enabled || task.next_run_at.is_none() {
                task.next_run_at = Some(cron::next_after(&task.schedule, now)?);
                task.last_error = None;
            }
            task.status = TaskStatus::Idle;
        } else {
            if schedule_changed {
                cron::validate(&task.schedule)?;
            }
            task.next_run_at = None;
            task.status = TaskStatus::Disabled;
        }
        task.updated_at = now;
        write_task(&tx, &task)?;
        tx.commit()?;
        debug!(task_id = %id, "task updated");
        Ok(task)
    }

    /// Flip `enabled` immediately, even while a dispatch is in flight.
    ///
    /// A running task keeps running; the flag decides where release puts it.
    #[instrument(skip(self), level = "debug")]
    pub fn set_enabled(&self, id: &str, enabled: bool, now: DateTime<Utc>) -> Result<Task> {
        let mut conn = self.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let mut task = select_task(&tx, id)?.ok_or_else(|| not_found(id))?;
        if enabled && task.is_spent() {
            return Err(SchedulerError::AlreadyRan { id: id.to_string() });
        }

        if !task.is_running() {
            if enabled && task.status == TaskStatus::Disabled {
                task.next_run_at = Some(cron::next_after(&task.schedule, now)?);
                task.last_error = None;
                task.status = TaskStatus::Idle;
            } else if !enabled {
                task.next_run_at = None;
                task.status = TaskStatus::Disabled;
            }
        }
        task.enabled = enabled;
        task.updated_at = now;
        write_task(&tx, &task)?;
        tx.commit()?;
        info!(task_id = %id, enabled, "task enabled flag set");
        Ok(task)
    }

    /// Remove a task. Its execution history is kept.
    ///
    /// The row is tombstoned rather than deleted so sealed records keep their
    /// task reference; a removed task is invisible to every other operation.
    #[instrument(skip(self), level = "debug")]
    pub fn delete(&self, id: &str) -> Result<()> {
        let mut conn = self.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let task = select_task(&tx, id)?.ok_or_else(|| not_found(id))?;
        if task.is_running() {
            return Err(SchedulerError::TaskRunning { id: id.to_string() });
        }
        tx.execute(
            "UPDATE tasks SET deleted_at = ?2, enabled = 0, status = 'disabled',
                    next_run_at = NULL, pending_update = NULL, updated_at = ?2
             WHERE id = ?1",
            params![id, fmt_ts(&db::now())],
        )?;
        tx.commit()?;
        info!(task_id = %id, "task removed");
        Ok(())
    }

    /// Atomically move up to `limit` due tasks from `idle` to `running`.
    ///
    /// Due means enabled, idle and `next_run_at <= now`; the earliest due
    /// come first. Tasks beyond `limit` stay idle for the next scan.
    pub fn claim_due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Task>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let now_str = fmt_ts(&now);
        let mut conn = self.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let ids: Vec<String> = {
            let mut stmt = tx.prepare_cached(
                "SELECT id FROM tasks
                 WHERE status = 'idle' AND enabled = 1 AND deleted_at IS NULL
                   AND next_run_at IS NOT NULL AND next_run_at <= ?1
                   AND NOT (do_only_once = 1 AND last_run_at IS NOT NULL)
                 ORDER BY next_run_at, id
                 LIMIT ?2",
            )?;
            let rows = stmt
                .query_map(params![now_str, limit as i64], |r| r.get(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        };

        let mut claimed = Vec::with_capacity(ids.len());
        for id in ids {
            let n = tx.execute(
                "UPDATE tasks SET status = 'running', last_run_at = ?2, updated_at = ?2
                 WHERE id = ?1 AND status = 'idle'",
                params![id, now_str],
            )?;
            if n == 1 {
                if let Some(task) = select_task(&tx, &id)? {
                    claimed.push(task);
                }
            }
        }
        tx.commit()?;

        if !claimed.is_empty() {
            debug!(count = claimed.len(), "claimed due tasks");
        }
        Ok(claimed)
    }

    /// Claim one task regardless of its schedule or enabled flag.
    ///
    /// Fails with `TaskRunning` if a dispatch of the task is already in flight,
    /// and with `AlreadyRan` for a one-shot task that has been dispatched.
    #[instrument(skip(self), level = "debug")]
    pub fn claim(&self, id: &str, now: DateTime<Utc>) -> Result<Task> {
        let mut conn = self.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let task = select_task(&tx, id)?.ok_or_else(|| not_found(id))?;
        if task.is_running() {
            return Err(SchedulerError::TaskRunning { id: id.to_string() });
        }
        if task.is_spent() {
            return Err(SchedulerError::AlreadyRan { id: id.to_string() });
        }
        let now_str = fmt_ts(&now);
        tx.execute(
            "UPDATE tasks SET status = 'running', last_run_at = ?2, updated_at = ?2 WHERE id = ?1",
            params![id, now_str],
        )?;
        let task = select_task(&tx, id)?.ok_or_else(|| not_found(id))?;
        tx.commit()?;
        Ok(task)
    }

    /// End a claim. Any update deferred while the task ran is applied here.
    #[instrument(skip(self), level = "debug")]
    pub fn release(
        &self,
        id: &str,
        status: ReleaseStatus,
        next_run_at: Option<DateTime<Utc>>,
    ) -> Result<Task> {
        let now = db::now();
        let mut conn = self.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let mut task = select_task(&tx, id)?.ok_or_else(|| not_found(id))?;
        if !task.is_running() {
            return Err(SchedulerError::NotClaimed { id: id.to_string() });
        }
        settle(&mut task, status, next_run_at, now);
        write_task(&tx, &task)?;
        tx.commit()?;
        debug!(task_id = %id, status = %task.status, next_run_at = ?task.next_run_at, "task released");
        Ok(task)
    }

    /// Repair state left behind by a process that exited mid-dispatch.
    ///
    /// Running tasks are released as if their dispatch had just finished:
    /// one-shot tasks end disabled, recurring ones are rescheduled from `now`.
    /// Enabled idle tasks without a `next_run_at` are re-seeded.
    pub fn recover(&self, now: DateTime<Utc>) -> Result<Recovery> {
        let mut conn = self.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let stale: Vec<Task> = {
            let mut stmt = tx.prepare(&format!(
                "SELECT {TASK_COLUMNS} FROM tasks
                 WHERE deleted_at IS NULL
                   AND (status = 'running'
                        OR (status = 'idle' AND enabled = 1 AND next_run_at IS NULL))"
            ))?;
            let rows = stmt
                .query_map([], TaskRow::read)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows.into_iter()
                .map(TaskRow::into_task)
                .collect::<Result<_>>()?
        };

        let mut report = Recovery::default();
        for mut task in stale {
            if task.is_running() {
                let status = if task.do_only_once {
                    ReleaseStatus::Disabled { reason: None }
                } else {
                    ReleaseStatus::Idle
                };
                // next_run_at is recomputed by settle
                task.next_run_at = None;
                settle(&mut task, status, None, now);
                report.released += 1;
                warn!(task_id = %task.id, status = %task.status, "released task left running by a previous process");
            } else {
                task.status = TaskStatus::Running;
                settle(&mut task, ReleaseStatus::Idle, None, now);
                report.reseeded += 1;
            }
            write_task(&tx, &task)?;
        }
        tx.commit()?;
        Ok(report)
    }
}

/// Compute the post-claim state of `task` in memory.
fn settle(
    task: &mut Task,
    status: ReleaseStatus,
    next_run_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) {
    match status {
        ReleaseStatus::Idle => task.next_run_at = next_run_at,
        ReleaseStatus::Disabled { reason } => {
            task.enabled = false;
            task.next_run_at = None;
            if reason.is_some() {
                task.last_error = reason;
            }
        }
    }

    let mut schedule_changed = false;
    if let Some(update) = task.pending_update.take() {
        match update.apply_to(task) {
            Ok(changed) => schedule_changed = changed,
            Err(e) => warn!(task_id = %task.id, error = %e, "dropping deferred update"),
        }
    }
    if task.is_spent() {
        task.enabled = false;
    }

    if task.enabled && (schedule_changed || task.next_run_at.is_none()) {
        match cron::next_after(&task.schedule, now) {
            Ok(next) => task.next_run_at = Some(next),
            Err(e) => {
                warn!(task_id = %task.id, error = %e, "schedule cannot be evaluated; disabling task");
                task.enabled = false;
                task.last_error = Some(e.to_string());
            }
        }
    }
    if !task.enabled {
        task.next_run_at = None;
    }
    task.status = if task.enabled {
        TaskStatus::Idle
    } else {
        TaskStatus::Disabled
    };
    task.updated_at = now;
}

fn not_found(id: &str) -> SchedulerError {
    SchedulerError::NotFound { id: id.to_string() }
}

fn encode_pending(task: &Task) -> Result<Option<String>> {
    Ok(task
        .pending_update
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?)
}

fn select_task(conn: &Connection, id: &str) -> Result<Option<Task>> {
    let row = conn
        .query_row(
            &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1 AND deleted_at IS NULL"),
            [id],
            TaskRow::read,
        )
        .optional()?;
    row.map(TaskRow::into_task).transpose()
}

/// Persist every mutable column of `task`.
fn write_task(conn: &Connection, task: &Task) -> Result<()> {
    conn.execute(
        "UPDATE tasks SET name = ?2, description = ?3, schedule = ?4, params = ?5,
                enabled = ?6, do_only_once = ?7, status = ?8, next_run_at = ?9,
                last_run_at = ?10, last_error = ?11, pending_update = ?12, updated_at = ?13
         WHERE id = ?1",
        params![
            task.id,
            task.name,
            task.description,
            task.schedule,
            serde_json::to_string(&task.params)?,
            task.enabled,
            task.do_only_once,
            task.status.as_str(),
            task.next_run_at.as_ref().map(fmt_ts),
            task.last_run_at.as_ref().map(fmt_ts),
            task.last_error,
            encode_pending(task)?,
            fmt_ts(&task.updated_at),
        ],
    )?;
    Ok(())
}

/// Raw column values; decoded outside the rusqlite row callback.
struct TaskRow {
    id: String,
    name: String,
    description: Option<String>,
    params: String,
    schedule: String,
    enabled: bool,
    do_only_once: bool,
    status: String,
    next_run_at: Option<String>,
    last_run_at: Option<String>,
    last_error: Option<String>,
    pending_update: Option<String>,
    created_at: String,
    updated_at: String,
}

impl TaskRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            description: row.get(2)?,
            // column 3 (type) is derived from params
            schedule: row.get(4)?,
            params: row.get(5)?,
            enabled: row.get(6)?,
            do_only_once: row.get(7)?,
            status: row.get(8)?,
            next_run_at: row.get(9)?,
            last_run_at: row.get(10)?,
            last_error: row.get(11)?,
            pending_update: row.get(12)?,
            created_at: row.get(13)?,
            updated_at: row.get(14)?,
        })
    }

    fn into_task(self) -> Result<Task> {
        let params: TaskParams = serde_json::from_str(&self.params)?;
        let status: TaskStatus = self.status.parse().map_err(|e: String| {
            SchedulerError::StoreUnavailable(rusqlite::Error::InvalidColumnType(
                8,
                e,
                rusqlite::types::Type::Text,
            ))
        })?;
        let pending_update = self
            .pending_update
            .as_deref()
            .map(serde_json::from_str::<TaskUpdate>)
            .transpose()?;
        Ok(Task {
            id: self.id,
            name: self.name,
            description: self.description,
            schedule: self.schedule,
            params,
            enabled: self.enabled,
            do_only_once: self.do_only_once,
            status,
            next_run_at: parse_opt_ts(self.next_run_at)?,
            last_run_at: parse_opt_ts(self.last_run_at)?,
            last_error: self.last_error,
            pending_update,
            created_at: parse_ts(&self.created_at)?,
            updated_at: parse_ts(&self.updated_at)?,
        })
    }
}

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::{
    db::{self, fmt_ts, parse_opt_ts, parse_ts},
    error::{Result, SchedulerError},
    types::{ExecutionRecord, Outcome, RunResult},
};

/// Error stored on records that were still open when the process exited.
pub const INTERRUPTED: &str = "interrupted: process exited before the execution completed";

const EXECUTION_COLUMNS: &str = "id, task_id, started_at, finished_at, outcome, output, error";

/// Append-only execution history.
///
/// A record is opened by [`begin`](Self::begin) and sealed exactly once by
/// [`complete`](Self::complete); sealed rows are never written again.
#[derive(Clone)]
pub struct ExecutionLog {
    conn: Arc<Mutex<Connection>>,
}

impl ExecutionLog {
    /// Wrap a connection whose schema is already initialised (see [`db::open`]).
    pub fn new(conn: Arc<Mutex<Connection>>) -> Self {
        Self { conn }
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Open a record for `task_id`. Fails with `NotFound` for an unknown or
    /// removed task.
    #[instrument(skip(self), level = "debug")]
    pub fn begin(&self, task_id: &str, started_at: DateTime<Utc>) -> Result<String> {
        let id = Uuid::now_v7().to_string();
        let conn = self.lock();
        let n = conn.execute(
            "INSERT INTO executions (id, task_id, started_at)
             SELECT ?1, id, ?3 FROM tasks WHERE id = ?2 AND deleted_at IS NULL",
            params![id, task_id, fmt_ts(&started_at)],
        )?;
        if n == 0 {
            return Err(SchedulerError::NotFound {
                id: task_id.to_string(),
            });
        }
        debug!(task_id, execution_id = %id, "execution opened");
        Ok(id)
    }

    /// Seal an open record with `result`.
    #[instrument(skip(self, result), level = "debug")]
    pub fn complete(&self, execution_id: &str, result: &RunResult) -> Result<ExecutionRecord> {
        let conn = self.lock();
        let n = conn.execute(
            "UPDATE executions SET finished_at = ?2, outcome = ?3, output = ?4, error = ?5
             WHERE id = ?1 AND finished_at IS NULL",
            params![
                execution_id,
                fmt_ts(&db::now()),
                result.outcome.as_str(),
                result.output,
                result.error,
            ],
        )?;
        if n == 0 {
            return Err(match select_execution(&conn, execution_id)? {
                Some(_) => SchedulerError::ExecutionSealed {
                    id: execution_id.to_string(),
                },
                None => SchedulerError::NotFound {
                    id: execution_id.to_string(),
                },
            });
        }
        select_execution(&conn, execution_id)?.ok_or_else(|| SchedulerError::NotFound {
            id: execution_id.to_string(),
        })
    }

    pub fn get(&self, execution_id: &str) -> Result<ExecutionRecord> {
        let conn = self.lock();
        select_execution(&conn, execution_id)?.ok_or_else(|| SchedulerError::NotFound {
            id: execution_id.to_string(),
        })
    }

    /// Records for one task, most recent first.
    pub fn list_for_task(&self, task_id: &str, limit: Option<usize>) -> Result<Vec<ExecutionRecord>> {
        let conn = self.lock();
        // LIMIT -1 means no limit in SQLite
        let limit = limit.map(|l| l as i64).unwrap_or(-1);
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {EXECUTION_COLUMNS} FROM executions
             WHERE task_id = ?1
             ORDER BY started_at DESC, id DESC
             LIMIT ?2"
        ))?;
        let rows = stmt
            .query_map(params![task_id, limit], ExecutionRow::read)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter().map(ExecutionRow::into_record).collect()
    }

    /// Seal every open record as an interrupted failure. Returns how many.
    pub fn recover_unfinished(&self, now: DateTime<Utc>) -> Result<usize> {
        let conn = self.lock();
        let n = conn.execute(
            "UPDATE executions SET finished_at = ?1, outcome = ?2, error = ?3
             WHERE finished_at IS NULL",
            params![fmt_ts(&now), Outcome::Failure.as_str(), INTERRUPTED],
        )?;
        if n > 0 {
            warn!(count = n, "sealed executions interrupted by a previous exit");
        }
        Ok(n)
    }
}

fn select_execution(conn: &Connection, id: &str) -> Result<Option<ExecutionRecord>> {
    let row = conn
        .query_row(
            &format!("SELECT {EXECUTION_COLUMNS} FROM executions WHERE id = ?1"),
            [id],
            ExecutionRow::read,
        )
        .optional()?;
    row.map(ExecutionRow::into_record).transpose()
}

struct ExecutionRow {
    id: String,
    task_id: String,
    started_at: String,
    finished_at: Option<String>,
    outcome: Option<String>,
    output: Option<String>,
    error: Option<String>,
}

impl ExecutionRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            task_id: row.get(1)?,
            started_at: row.get(2)?,
            finished_at: row.get(3)?,
            outcome: row.get(4)?,
            output: row.get(5)?,
            error: row.get(6)?,
        })
    }

    fn into_record(self) -> Result<ExecutionRecord> {
        let outcome = self
            .outcome
            .map(|o| {
                o.parse::<Outcome>().map_err(|e| {
                    SchedulerError::StoreUnavailable(rusqlite::Error::InvalidColumnType(
                        4,
                        e,
                        rusqlite::types::Type::Text,
                    ))
                })
            })
            .transpose()?;
        Ok(ExecutionRecord {
            id: self.id,
            task_id: self.task_id,
            started_at: parse_ts(&self.started_at)?,
            finished_at: parse_opt_ts(self.finished_at)?,
            outcome,
            output: self.output,
            error: self.error,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        store::TaskStore,
        types::{CommandParams, Task, TaskParams, TaskStatus},
    };
    use chrono::Duration;

    fn setup() -> (TaskStore, ExecutionLog) {
        let conn = Arc::new(Mutex::new(db::open(":memory:").unwrap()));
        let store = TaskStore::new(conn.clone());
        let now = db::now();
        store
            .insert(&Task {
                id: "t1".into(),
                name: "t1".into(),
                description: None,
                schedule: "* * * * *".into(),
                params: TaskParams::Command(CommandParams {
                    command: "true".into(),
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
            })
            .unwrap();
        (store, ExecutionLog::new(conn))
    }

    #[test]
    fn begin_then_complete_seals_once() {
        let (_store, log) = setup();
        let id = log.begin("t1", db::now()).unwrap();
        let open = log.get(&id).unwrap();
        assert!(!open.is_finished());
        assert!(open.outcome.is_none());

        let rec = log.complete(&id, &RunResult::success("ok")).unwrap();
        assert_eq!(rec.outcome, Some(Outcome::Success));
        assert_eq!(rec.output.as_deref(), Some("ok"));
        assert!(rec.error.is_none());
        assert!(rec.finished_at.unwrap() >= rec.started_at);

        assert!(matches!(
            log.complete(&id, &RunResult::failure("again")),
            Err(SchedulerError::ExecutionSealed { .. })
        ));
        assert_eq!(log.get(&id).unwrap(), rec);
    }

    #[test]
    fn begin_for_unknown_task_is_not_found() {
        let (_store, log) = setup();
        assert!(matches!(
            log.begin("ghost", db::now()),
            Err(SchedulerError::NotFound { .. })
        ));
        assert!(matches!(
            log.complete("nope", &RunResult::success("")),
            Err(SchedulerError::NotFound { .. })
        ));
    }

    #[test]
    fn list_is_newest_first_and_limited() {
        let (_store, log) = setup();
        let base = db::now();
        let ids: Vec<String> = (0..3)
            .map(|i| log.begin("t1", base + Duration::seconds(i)).unwrap())
            .collect();

        let all = log.list_for_task("t1", None).unwrap();
        assert_eq!(
            all.iter().map(|r| r.id.clone()).collect::<Vec<_>>(),
            vec![ids[2].clone(), ids[1].clone(), ids[0].clone()]
        );
        assert_eq!(log.list_for_task("t1", Some(1)).unwrap().len(), 1);
        assert!(log.list_for_task("other", None).unwrap().is_empty());
    }

    #[test]
    fn recovery_marks_open_records_interrupted() {
        let (_store, log) = setup();
        let open = log.begin("t1", db::now()).unwrap();
        let done = log.begin("t1", db::now()).unwrap();
        log.complete(&done, &RunResult::success("")).unwrap();

        assert_eq!(log.recover_unfinished(db::now()).unwrap(), 1);
        let rec = log.get(&open).unwrap();
        assert_eq!(rec.outcome, Some(Outcome::Failure));
        assert_eq!(rec.error.as_deref(), Some(INTERRUPTED));
        assert_eq!(log.get(&done).unwrap().outcome, Some(Outcome::Success));
        assert_eq!(log.recover_unfinished(db::now()).unwrap(), 0);
    }

    #[test]
    fn removing_a_task_keeps_its_history() {
        let (store, log) = setup();
        let id = log.begin("t1", db::now()).unwrap();
        let sealed = log.complete(&id, &RunResult::success("done")).unwrap();
        store.delete("t1").unwrap();

        assert_eq!(log.get(&id).unwrap(), sealed);
        assert_eq!(log.list_for_task("t1", None).unwrap(), vec![sealed]);
        // a removed task takes no new records
        assert!(matches!(
            log.begin("t1", db::now()),
            Err(SchedulerError::NotFound { .. })
        ));
    }
}

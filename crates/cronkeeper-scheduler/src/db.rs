use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use rusqlite::Connection;

use crate::error::{Result, SchedulerError};

/// How long a connection waits on another connection's write lock.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Open (or create) the database at `path` and make sure the schema exists.
///
/// Parent directories are created as needed. `":memory:"` opens a private
/// in-memory database.
pub fn open(path: &str) -> Result<Connection> {
    let conn = if path == ":memory:" {
        Connection::open_in_memory()?
    } else {
        if let Some(parent) = Path::new(path).parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                SchedulerError::StoreUnavailable(rusqlite::Error::InvalidPath(
                    format!("{}: {e}", parent.display()).into(),
                ))
            })?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn
    };
    conn.busy_timeout(BUSY_TIMEOUT)?;
    conn.execute_batch("PRAGMA foreign_keys=ON;")?;
    init_db(&conn)?;
    Ok(conn)
}

/// Initialise the scheduler schema in `conn`.
///
/// Creates the `tasks` and `executions` tables (idempotent) plus the indexes
/// used by the due-task scan and the per-task history query.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS tasks (
            id             TEXT    NOT NULL PRIMARY KEY,
            name           TEXT    NOT NULL,
            description    TEXT,
            type           TEXT    NOT NULL,   -- command | api | ai | reminder
            schedule       TEXT    NOT NULL,   -- cron expression
            params         TEXT    NOT NULL,   -- JSON-encoded TaskParams
            enabled        INTEGER NOT NULL DEFAULT 1,
            do_only_once   INTEGER NOT NULL DEFAULT 1,
            status         TEXT    NOT NULL DEFAULT 'idle',
            next_run_at    TEXT,               -- RFC 3339 UTC or NULL
            last_run_at    TEXT,
            last_error     TEXT,
            pending_update TEXT,               -- JSON-encoded TaskUpdate or NULL
            created_at     TEXT    NOT NULL,
            updated_at     TEXT    NOT NULL,
            deleted_at     TEXT                -- set by remove; history outlives the task
        ) STRICT;

        -- Due scan: WHERE status = 'idle' AND enabled = 1 AND next_run_at <= ?
        CREATE INDEX IF NOT EXISTS idx_tasks_due ON tasks (status, next_run_at);

        CREATE TABLE IF NOT EXISTS executions (
            id          TEXT NOT NULL PRIMARY KEY,
            task_id     TEXT NOT NULL REFERENCES tasks (id),
            started_at  TEXT NOT NULL,
            finished_at TEXT,                  -- NULL while open
            outcome     TEXT,                  -- success | failure | timeout
            output      TEXT,
            error       TEXT
        ) STRICT;

        CREATE INDEX IF NOT EXISTS idx_executions_task
            ON executions (task_id, started_at DESC);
        ",
    )?;
    add_column_if_missing(conn, "tasks", "deleted_at", "TEXT")?;
    Ok(())
}

/// Bring databases created before `column` existed up to date.
fn add_column_if_missing(conn: &Connection, table: &str, column: &str, decl: &str) -> Result<()> {
    let exists = {
        let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;
        let names = stmt
            .query_map([], |r| r.get::<_, String>(1))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        names.iter().any(|n| n == column)
    };
    if !exists {
        conn.execute_batch(&format!("ALTER TABLE {table} ADD COLUMN {column} {decl};"))?;
    }
    Ok(())
}

/// Current time at the precision the store keeps.
pub fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(3)
}

/// Fixed-width UTC timestamp, so string order is time order.
pub fn fmt_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn parse_ts(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            SchedulerError::StoreUnavailable(rusqlite::Error::FromSqlConversionFailure(
                0,
                rusqlite::types::Type::Text,
                Box::new(e),
            ))
        })
}

pub fn parse_opt_ts(raw: Option<String>) -> Result<Option<DateTime<Utc>>> {
    raw.as_deref().map(parse_ts).transpose()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_is_idempotent() {
        let conn = open(":memory:").unwrap();
        init_db(&conn).unwrap();
        let n: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table'
                 AND name IN ('tasks', 'executions')",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(n, 2);
    }

    #[test]
    fn older_schema_gains_tombstone_column() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE tasks (id TEXT NOT NULL PRIMARY KEY, name TEXT NOT NULL) STRICT;",
        )
        .unwrap();
        add_column_if_missing(&conn, "tasks", "deleted_at", "TEXT").unwrap();
        add_column_if_missing(&conn, "tasks", "deleted_at", "TEXT").unwrap();
        conn.execute("INSERT INTO tasks (id, name, deleted_at) VALUES ('a', 'a', NULL)", [])
            .unwrap();
    }

    #[test]
    fn foreign_keys_are_enforced() {
        let conn = open(":memory:").unwrap();
        let res = conn.execute(
            "INSERT INTO executions (id, task_id, started_at) VALUES ('e1', 'missing', 'x')",
            [],
        );
        assert!(res.is_err());
    }

    #[test]
    fn timestamps_sort_lexicographically() {
        let a = parse_ts("2024-05-01T09:59:59.5+00:00").unwrap();
        let b = parse_ts("2024-05-01T10:00:00Z").unwrap();
        assert!(fmt_ts(&a) < fmt_ts(&b));
        assert_eq!(fmt_ts(&b), "2024-05-01T10:00:00.000Z");
        assert_eq!(parse_ts(&fmt_ts(&a)).unwrap(), a);
    }

    #[test]
    fn file_database_creates_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/deeper/tasks.db");
        open(path.to_str().unwrap()).unwrap();
        assert!(path.exists());
    }
}

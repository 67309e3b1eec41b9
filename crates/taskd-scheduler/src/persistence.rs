//! SQLite-backed task store and execution log.
//!
//! All cross-task coordination lives here: the due-task query gates on
//! status, time, in-flight executions and dependencies, and claiming inserts
//! the `running` execution inside the same immediate transaction, so a task
//! can never be handed out twice.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row, TransactionBehavior, params};
use serde::{Deserialize, Serialize};
use taskd_core::{Result, TaskdError};

use crate::schedule::checked_add_secs;
use crate::tasks::{
    Execution, ExecutionId, ExecutionStatus, MAX_SPAN_SECS, Schedule, Task, TaskId, TaskStatus,
};

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS tasks (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL,
        description TEXT,
        category TEXT NOT NULL DEFAULT 'custom'
            CHECK (category IN ('monitoring', 'social', 'financial', 'maintenance', 'custom')),
        command TEXT NOT NULL,
        schedule_kind TEXT NOT NULL CHECK (schedule_kind IN ('once', 'recurring', 'cron')),
        interval_secs INTEGER,
        cron_expression TEXT,
        next_run_at TEXT NOT NULL,
        last_run_at TEXT,
        last_success_at TEXT,
        status TEXT NOT NULL DEFAULT 'active'
            CHECK (status IN ('active', 'paused', 'completed', 'failed')),
        priority INTEGER NOT NULL DEFAULT 5 CHECK (priority BETWEEN 1 AND 10),
        max_retries INTEGER NOT NULL DEFAULT 3 CHECK (max_retries >= 0),
        retry_count INTEGER NOT NULL DEFAULT 0 CHECK (retry_count >= 0),
        timeout_seconds INTEGER NOT NULL DEFAULT 300 CHECK (timeout_seconds > 0),
        depends_on INTEGER REFERENCES tasks(id),
        is_active INTEGER NOT NULL DEFAULT 1,
        metadata TEXT NOT NULL DEFAULT '{}',
        created_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS executions (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        task_id INTEGER NOT NULL REFERENCES tasks(id),
        status TEXT NOT NULL
            CHECK (status IN ('running', 'success', 'failed', 'timeout', 'cancelled')),
        started_at TEXT NOT NULL,
        completed_at TEXT,
        exit_code INTEGER,
        output TEXT,
        error TEXT,
        execution_time_ms INTEGER
    );

    CREATE INDEX IF NOT EXISTS idx_tasks_due ON tasks(status, is_active, next_run_at);
    CREATE INDEX IF NOT EXISTS idx_executions_task ON executions(task_id, completed_at);
    -- At most one in-flight execution per task.
    CREATE UNIQUE INDEX IF NOT EXISTS idx_executions_running
        ON executions(task_id) WHERE status = 'running';

    CREATE VIEW IF NOT EXISTS task_stats AS
    SELECT
        t.id AS task_id,
        t.name AS name,
        COUNT(e.id) AS total_runs,
        COALESCE(SUM(e.status = 'success'), 0) AS successes,
        COALESCE(SUM(e.status IN ('failed', 'timeout')), 0) AS failures,
        AVG(e.execution_time_ms) AS avg_execution_ms,
        MAX(e.completed_at) AS last_completed_at,
        MAX(CASE WHEN e.status IN ('failed', 'timeout') THEN e.completed_at END) AS last_failure_at
    FROM tasks t
    LEFT JOIN executions e ON e.task_id = t.id
    GROUP BY t.id, t.name;
";

const TASK_COLUMNS: &str = "id, name, description, category, command, schedule_kind, interval_secs, \
     cron_expression, next_run_at, last_run_at, last_success_at, status, priority, max_retries, \
     retry_count, timeout_seconds, depends_on, is_active, metadata, created_at";

const EXECUTION_COLUMNS: &str =
    "id, task_id, status, started_at, completed_at, exit_code, output, error, execution_time_ms";

/// Selectable tasks: active, due, nothing in flight, dependency satisfied.
/// A dependency is satisfied when its latest terminal execution succeeded and
/// finished after this task last ran (or this task never ran).
const DUE_FILTER: &str = "
    is_active = 1
    AND status = 'active'
    AND next_run_at <= ?1
    AND NOT EXISTS (
        SELECT 1 FROM executions r
        WHERE r.task_id = tasks.id AND r.status = 'running'
    )
    AND (
        depends_on IS NULL
        OR (
            SELECT d.status = 'success'
                AND (tasks.last_run_at IS NULL OR d.completed_at > tasks.last_run_at)
            FROM executions d
            WHERE d.task_id = tasks.depends_on AND d.status != 'running'
            ORDER BY d.completed_at DESC, d.id DESC
            LIMIT 1
        ) = 1
    )
    ORDER BY priority DESC, next_run_at ASC, id ASC
    LIMIT ?2";

/// A task handed to the coordinator together with its `running` execution.
#[derive(Debug, Clone, PartialEq)]
pub struct Claim {
    pub task: Task,
    pub execution_id: ExecutionId,
    pub started_at: DateTime<Utc>,
}

/// Terminal outcome of a claimed execution.
#[derive(Debug, Clone, PartialEq)]
pub struct FinishedRun {
    pub execution_id: ExecutionId,
    pub status: ExecutionStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub exit_code: Option<i32>,
    pub output: Option<String>,
    pub error: Option<String>,
}

/// An orphaned `running` execution closed out by [`SchedulerDb::reconcile_stale`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaleRun {
    pub execution_id: ExecutionId,
    pub task_id: TaskId,
    pub task_name: String,
    pub started_at: DateTime<Utc>,
}

/// One row of the `task_stats` view.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskStats {
    pub task_id: TaskId,
    pub name: String,
    pub total_runs: i64,
    pub successes: i64,
    /// `failed` plus `timeout`.
    pub failures: i64,
    pub avg_execution_ms: Option<f64>,
    pub last_completed_at: Option<DateTime<Utc>>,
    pub last_failure_at: Option<DateTime<Utc>>,
}

/// SQLite persistence for tasks and their execution history.
pub struct SchedulerDb {
    conn: Mutex<Connection>,
}

impl SchedulerDb {
    /// Open or create the database at `path`, creating parent directories.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path).map_err(db_err)?;
        conn.busy_timeout(Duration::from_secs(5)).map_err(db_err)?;
        conn.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()))
            .map_err(db_err)?;
        Self::init(conn)
    }

    /// Private in-memory database.
    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory().map_err(db_err)?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch("PRAGMA foreign_keys = ON;").map_err(db_err)?;
        conn.execute_batch(SCHEMA)
            .map_err(|e| TaskdError::Store(format!("migration failed: {e}")))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| TaskdError::Store(format!("connection lock poisoned: {e}")))
    }

    // ─── Task Store ──────────────────────────────────────────

    /// Validate and insert a new task. Returns the new id.
    pub fn insert_task(&self, task: &Task) -> Result<TaskId> {
        task.validate()?;
        let conn = self.lock()?;
        if let Some(dep) = task.depends_on {
            let exists: bool = conn
                .query_row("SELECT EXISTS(SELECT 1 FROM tasks WHERE id = ?1)", [dep], |r| r.get(0))
                .map_err(db_err)?;
            if !exists {
                return Err(TaskdError::NotFound(format!("dependency task {dep}")));
            }
        }

        let (interval_secs, cron_expression) = schedule_columns(&task.schedule);
        conn.execute(
            "INSERT INTO tasks
             (name, description, category, command, schedule_kind, interval_secs, cron_expression,
              next_run_at, last_run_at, last_success_at, status, priority, max_retries, retry_count,
              timeout_seconds, depends_on, is_active, metadata, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19)",
            params![
                task.name,
                task.description,
                task.category.as_str(),
                task.command,
                task.schedule.kind(),
                interval_secs,
                cron_expression,
                ts(task.next_run_at),
                task.last_run_at.map(ts),
                task.last_success_at.map(ts),
                task.status.as_str(),
                task.priority,
                task.max_retries,
                task.retry_count,
                task.timeout_seconds as i64,
                task.depends_on,
                task.is_active,
                task.metadata.to_string(),
                ts(task.created_at),
            ],
        )
        .map_err(db_err)?;
        let id = conn.last_insert_rowid();
        tracing::info!("📅 Task added: '{}' (#{id}, {})", task.name, task.schedule);
        Ok(id)
    }

    pub fn get_task(&self, id: TaskId) -> Result<Task> {
        let conn = self.lock()?;
        conn.query_row(
            &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"),
            [id],
            task_from_row,
        )
        .optional()
        .map_err(db_err)?
        .ok_or_else(|| TaskdError::NotFound(format!("task {id}")))
    }

    /// Tasks ordered as the selector would rank them. Soft-deleted tasks are
    /// included only on request.
    pub fn list_tasks(&self, include_inactive: bool) -> Result<Vec<Task>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {TASK_COLUMNS} FROM tasks
                 WHERE ?1 OR is_active = 1
                 ORDER BY priority DESC, next_run_at ASC, id ASC"
            ))
            .map_err(db_err)?;
        let rows = stmt
            .query_map([include_inactive], task_from_row)
            .map_err(db_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
    }

    pub fn task_count(&self) -> Result<usize> {
        let conn = self.lock()?;
        let n: i64 = conn
            .query_row("SELECT COUNT(*) FROM tasks WHERE is_active = 1", [], |r| r.get(0))
            .map_err(db_err)?;
        Ok(n as usize)
    }

    /// Write back the scheduling state the coordinator owns.
    pub fn update_task_state(&self, task: &Task) -> Result<()> {
        let conn = self.lock()?;
        write_task_state(&conn, task)
    }

    pub fn set_status(&self, id: TaskId, status: TaskStatus) -> Result<()> {
        let conn = self.lock()?;
        let changed = conn
            .execute(
                "UPDATE tasks SET status = ?1 WHERE id = ?2",
                params![status.as_str(), id],
            )
            .map_err(db_err)?;
        require_row(changed, id)
    }

    /// Operator reset after the circuit breaker tripped: active again, retry
    /// counter cleared, due immediately.
    pub fn reset_task(&self, id: TaskId, now: DateTime<Utc>) -> Result<()> {
        let conn = self.lock()?;
        let changed = conn
            .execute(
                "UPDATE tasks SET status = 'active', retry_count = 0, next_run_at = ?1 WHERE id = ?2",
                params![ts(now), id],
            )
            .map_err(db_err)?;
        require_row(changed, id)?;
        tracing::info!("🔄 Task #{id} reset");
        Ok(())
    }

    /// Soft delete (`false`) or restore (`true`).
    pub fn set_active(&self, id: TaskId, active: bool) -> Result<()> {
        let conn = self.lock()?;
        let changed = conn
            .execute("UPDATE tasks SET is_active = ?1 WHERE id = ?2", params![active, id])
            .map_err(db_err)?;
        require_row(changed, id)
    }

    // ─── Due-Task Selector ───────────────────────────────────

    /// Read-only view of what the next claim would return.
    pub fn due_tasks(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Task>> {
        let conn = self.lock()?;
        select_due(&conn, now, limit)
    }

    /// Select due tasks and open a `running` execution for each, atomically.
    pub fn claim_due_tasks(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Claim>> {
        let mut conn = self.lock()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(db_err)?;

        let due = select_due(&tx, now, limit)?;
        let mut claims = Vec::with_capacity(due.len());
        for task in due {
            tx.execute(
                "INSERT INTO executions (task_id, status, started_at) VALUES (?1, 'running', ?2)",
                params![task.id, ts(now)],
            )
            .map_err(db_err)?;
            claims.push(Claim {
                execution_id: tx.last_insert_rowid(),
                task,
                started_at: now,
            });
        }
        tx.commit().map_err(db_err)?;
        Ok(claims)
    }

    // ─── Execution Log ───────────────────────────────────────

    /// Close a running execution and, in the same transaction, write the
    /// task's new scheduling state. Returns `false` if the execution was
    /// no longer `running` (e.g. reconciled as stale); nothing is written then.
    pub fn complete_execution(&self, run: &FinishedRun, task: Option<&Task>) -> Result<bool> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(db_err)?;

        let elapsed_ms = (run.completed_at - run.started_at).num_milliseconds().max(0);
        let changed = tx
            .execute(
                "UPDATE executions
                 SET status = ?1, completed_at = ?2, exit_code = ?3, output = ?4, error = ?5,
                     execution_time_ms = ?6
                 WHERE id = ?7 AND status = 'running'",
                params![
                    run.status.as_str(),
                    ts(run.completed_at),
                    run.exit_code,
                    run.output,
                    run.error,
                    elapsed_ms,
                    run.execution_id,
                ],
            )
            .map_err(db_err)?;
        if changed == 0 {
            return Ok(false);
        }
        if let Some(task) = task {
            write_task_state(&tx, task)?;
        }
        tx.commit().map_err(db_err)?;
        Ok(true)
    }

    /// Most recent executions first, optionally for a single task.
    pub fn recent_executions(&self, limit: usize, task_id: Option<TaskId>) -> Result<Vec<Execution>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {EXECUTION_COLUMNS} FROM executions
                 WHERE ?1 IS NULL OR task_id = ?1
                 ORDER BY started_at DESC, id DESC
                 LIMIT ?2"
            ))
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![task_id, clamp_limit(limit)], execution_from_row)
            .map_err(db_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
    }

    /// Full history of one task, oldest first.
    pub fn executions_for(&self, task_id: TaskId) -> Result<Vec<Execution>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {EXECUTION_COLUMNS} FROM executions WHERE task_id = ?1 ORDER BY id ASC"
            ))
            .map_err(db_err)?;
        let rows = stmt.query_map([task_id], execution_from_row).map_err(db_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
    }

    /// Fail `running` executions left behind by a crashed coordinator: any run
    /// older than its task's timeout plus `grace_secs`. No retry is charged.
    /// Stored timeouts beyond [`MAX_SPAN_SECS`] are treated as that bound.
    pub fn reconcile_stale(&self, now: DateTime<Utc>, grace_secs: u64) -> Result<Vec<StaleRun>> {
        let mut conn = self.lock()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(db_err)?;

        let running: Vec<(StaleRun, i64)> = {
            let mut stmt = tx
                .prepare(
                    "SELECT e.id, e.task_id, t.name, e.started_at, t.timeout_seconds
                     FROM executions e JOIN tasks t ON t.id = e.task_id
                     WHERE e.status = 'running'",
                )
                .map_err(db_err)?;
            let rows = stmt
                .query_map([], |row| {
                    let started: String = row.get(3)?;
                    Ok((
                        StaleRun {
                            execution_id: row.get(0)?,
                            task_id: row.get(1)?,
                            task_name: row.get(2)?,
                            started_at: parse_ts(3, &started)?,
                        },
                        row.get::<_, i64>(4)?,
                    ))
                })
                .map_err(db_err)?;
            rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)?
        };

        let mut stale = Vec::new();
        for (run, timeout_secs) in running {
            let limit = timeout_secs.clamp(1, MAX_SPAN_SECS as i64) as u64;
            let window = limit.saturating_add(grace_secs.min(MAX_SPAN_SECS));
            let deadline = checked_add_secs(run.started_at, window);
            if deadline.is_none_or(|d| d >= now) {
                continue;
            }
            let elapsed_ms = (now - run.started_at).num_milliseconds();
            tx.execute(
                "UPDATE executions
                 SET status = 'failed', completed_at = ?1, execution_time_ms = ?2, error = ?3
                 WHERE id = ?4 AND status = 'running'",
                params![
                    ts(now),
                    elapsed_ms,
                    format!(
                        "orphaned: still running {}s after start with no coordinator attached",
                        elapsed_ms / 1000
                    ),
                    run.execution_id,
                ],
            )
            .map_err(db_err)?;
            tracing::warn!(
                "🧹 Reconciled orphaned execution #{} of '{}'",
                run.execution_id,
                run.task_name
            );
            stale.push(run);
        }
        tx.commit().map_err(db_err)?;
        Ok(stale)
    }

    /// Per-task aggregates from the `task_stats` view.
    pub fn task_stats(&self) -> Result<Vec<TaskStats>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT task_id, name, total_runs, successes, failures, avg_execution_ms,
                        last_completed_at, last_failure_at
                 FROM task_stats ORDER BY task_id",
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map([], |row| {
                Ok(TaskStats {
                    task_id: row.get(0)?,
                    name: row.get(1)?,
                    total_runs: row.get(2)?,
                    successes: row.get(3)?,
                    failures: row.get(4)?,
                    avg_execution_ms: row.get(5)?,
                    last_completed_at: parse_opt_ts(6, row.get(6)?)?,
                    last_failure_at: parse_opt_ts(7, row.get(7)?)?,
                })
            })
            .map_err(db_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
    }
}

fn db_err(e: rusqlite::Error) -> TaskdError {
    TaskdError::Store(e.to_string())
}

fn require_row(changed: usize, id: TaskId) -> Result<()> {
    if changed == 0 {
        Err(TaskdError::NotFound(format!("task {id}")))
    } else {
        Ok(())
    }
}

fn clamp_limit(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

fn select_due(conn: &Connection, now: DateTime<Utc>, limit: usize) -> Result<Vec<Task>> {
    let mut stmt = conn
        .prepare(&format!("SELECT {TASK_COLUMNS} FROM tasks WHERE {DUE_FILTER}"))
        .map_err(db_err)?;
    let rows = stmt
        .query_map(params![ts(now), clamp_limit(limit)], task_from_row)
        .map_err(db_err)?;
    rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
}

fn write_task_state(conn: &Connection, task: &Task) -> Result<()> {
    let changed = conn
        .execute(
            "UPDATE tasks
             SET next_run_at = ?1, last_run_at = ?2, last_success_at = ?3, status = ?4, retry_count = ?5
             WHERE id = ?6",
            params![
                ts(task.next_run_at),
                task.last_run_at.map(ts),
                task.last_success_at.map(ts),
                task.status.as_str(),
                task.retry_count,
                task.id,
            ],
        )
        .map_err(db_err)?;
    require_row(changed, task.id)
}

fn schedule_columns(schedule: &Schedule) -> (Option<i64>, Option<&str>) {
    match schedule {
        Schedule::Once => (None, None),
        Schedule::Recurring { interval_secs } => (Some(*interval_secs as i64), None),
        Schedule::Cron { expression } => (None, Some(expression.as_str())),
    }
}

/// Fixed-width UTC timestamps so text comparison in SQL matches time order.
fn ts(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_ts(idx: usize, s: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn parse_opt_ts(idx: usize, s: Option<String>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    s.map(|s| parse_ts(idx, &s)).transpose()
}

fn parse_enum<T: std::str::FromStr<Err = TaskdError>>(idx: usize, s: &str) -> rusqlite::Result<T> {
    s.parse()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn task_from_row(row: &Row<'_>) -> rusqlite::Result<Task> {
    let kind: String = row.get(5)?;
    let schedule = match kind.as_str() {
        "once" => Schedule::Once,
        "recurring" => Schedule::Recurring {
            interval_secs: row.get::<_, Option<i64>>(6)?.unwrap_or(0).max(0) as u64,
        },
        "cron" => Schedule::Cron {
            expression: row.get::<_, Option<String>>(7)?.unwrap_or_default(),
        },
        other => {
            return Err(rusqlite::Error::FromSqlConversionFailure(
                5,
                Type::Text,
                Box::new(TaskdError::Store(format!("unknown schedule kind '{other}'"))),
            ));
        }
    };
    let category: String = row.get(3)?;
    let next_run_at: String = row.get(8)?;
    let status: String = row.get(11)?;
    let metadata: String = row.get(18)?;
    let created_at: String = row.get(19)?;

    Ok(Task {
        id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        category: parse_enum(3, &category)?,
        command: row.get(4)?,
        schedule,
        next_run_at: parse_ts(8, &next_run_at)?,
        last_run_at: parse_opt_ts(9, row.get(9)?)?,
        last_success_at: parse_opt_ts(10, row.get(10)?)?,
        status: parse_enum(11, &status)?,
        priority: row.get(12)?,
        max_retries: row.get(13)?,
        retry_count: row.get(14)?,
        timeout_seconds: row.get::<_, i64>(15)?.max(1) as u64,
        depends_on: row.get(16)?,
        is_active: row.get(17)?,
        metadata: serde_json::from_str(&metadata)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(18, Type::Text, Box::new(e)))?,
        created_at: parse_ts(19, &created_at)?,
    })
}

fn execution_from_row(row: &Row<'_>) -> rusqlite::Result<Execution> {
    let status: String = row.get(2)?;
    let started_at: String = row.get(3)?;
    Ok(Execution {
        id: row.get(0)?,
        task_id: row.get(1)?,
        status: parse_enum(2, &status)?,
        started_at: parse_ts(3, &started_at)?,
        completed_at: parse_opt_ts(4, row.get(4)?)?,
        exit_code: row.get(5)?,
        output: row.get(6)?,
        error: row.get(7)?,
        execution_time_ms: row.get(8)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::TaskCategory;
    use chrono::TimeZone;

    fn t(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 6, 1, h, m, 0).unwrap()
    }

    fn db() -> SchedulerDb {
        SchedulerDb::open_in_memory().unwrap()
    }

    fn add(db: &SchedulerDb, name: &str, priority: u8, due: DateTime<Utc>) -> TaskId {
        let task = Task::recurring(name, "true", 3600, t(0, 0))
            .with_priority(priority)
            .due_at(due);
        db.insert_task(&task).unwrap()
    }

    fn finish(db: &SchedulerDb, claim: &Claim, status: ExecutionStatus, at: DateTime<Utc>) {
        let run = FinishedRun {
            execution_id: claim.execution_id,
            status,
            started_at: claim.started_at,
            completed_at: at,
            exit_code: Some(if status == ExecutionStatus::Success { 0 } else { 1 }),
            output: None,
            error: None,
        };
        assert!(db.complete_execution(&run, None).unwrap());
    }

    #[test]
    fn test_insert_and_get() {
        let db = db();
        let task = Task::cron("backup", "git push", "0 23 * * *", t(12, 0))
            .with_category(TaskCategory::Maintenance)
            .with_description("nightly push")
            .with_priority(7)
            .with_metadata(serde_json::json!({"repo": "notes"}));
        let id = db.insert_task(&task).unwrap();

        let stored = db.get_task(id).unwrap();
        assert_eq!(stored.id, id);
        assert_eq!(stored.name, "backup");
        assert_eq!(stored.category, TaskCategory::Maintenance);
        assert_eq!(stored.schedule, Schedule::Cron { expression: "0 23 * * *".into() });
        assert_eq!(stored.next_run_at, t(23, 0));
        assert_eq!(stored.metadata["repo"], "notes");
        assert_eq!(stored.description.as_deref(), Some("nightly push"));
        assert!(matches!(db.get_task(id + 1), Err(TaskdError::NotFound(_))));
    }

    #[test]
    fn test_insert_rejects_invalid() {
        let db = db();
        let bad = Task::recurring("x", "true", 60, t(0, 0)).with_priority(0);
        assert!(matches!(db.insert_task(&bad), Err(TaskdError::InvalidTask(_))));

        let orphan = Task::recurring("x", "true", 60, t(0, 0)).with_dependency(42);
        assert!(matches!(db.insert_task(&orphan), Err(TaskdError::NotFound(_))));

        let bad_cron = Task::cron("x", "true", "* * *", t(0, 0));
        assert!(matches!(db.insert_task(&bad_cron), Err(TaskdError::InvalidSchedule(_))));
        assert_eq!(db.task_count().unwrap(), 0);
    }

    #[test]
    fn test_due_ordering() {
        let db = db();
        let low = add(&db, "low", 2, t(8, 0));
        let high_late = add(&db, "high-late", 9, t(9, 0));
        let high_early = add(&db, "high-early", 9, t(8, 30));
        let _future = add(&db, "future", 10, t(11, 0));

        let due: Vec<TaskId> = db.due_tasks(t(10, 0), 10).unwrap().iter().map(|t| t.id).collect();
        assert_eq!(due, vec![high_early, high_late, low]);

        let limited = db.due_tasks(t(10, 0), 2).unwrap();
        assert_eq!(limited.len(), 2);
    }

    #[test]
    fn test_due_excludes_paused_and_inactive() {
        let db = db();
        let paused = add(&db, "paused", 5, t(8, 0));
        let removed = add(&db, "removed", 5, t(8, 0));
        let live = add(&db, "live", 5, t(8, 0));
        db.set_status(paused, TaskStatus::Paused).unwrap();
        db.set_active(removed, false).unwrap();

        let due: Vec<TaskId> = db.due_tasks(t(9, 0), 10).unwrap().iter().map(|t| t.id).collect();
        assert_eq!(due, vec![live]);
        assert_eq!(db.list_tasks(false).unwrap().len(), 2);
        assert_eq!(db.list_tasks(true).unwrap().len(), 3);
    }

    #[test]
    fn test_claim_prevents_double_dispatch() {
        let db = db();
        let id = add(&db, "job", 5, t(8, 0));

        let first = db.claim_due_tasks(t(9, 0), 5).unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].task.id, id);

        // Still due by time, but a running execution exists.
        assert!(db.claim_due_tasks(t(9, 1), 5).unwrap().is_empty());
        assert!(db.due_tasks(t(9, 1), 5).unwrap().is_empty());

        let running = db.executions_for(id).unwrap();
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].status, ExecutionStatus::Running);
        assert_eq!(running[0].completed_at, None);

        finish(&db, &first[0], ExecutionStatus::Failed, t(9, 2));
        assert_eq!(db.claim_due_tasks(t(9, 3), 5).unwrap().len(), 1);
    }

    #[test]
    fn test_complete_execution_is_guarded() {
        let db = db();
        add(&db, "job", 5, t(8, 0));
        let claim = db.claim_due_tasks(t(9, 0), 5).unwrap().remove(0);

        let mut task = claim.task.clone();
        task.last_run_at = Some(t(9, 1));
        task.next_run_at = t(10, 1);
        let run = FinishedRun {
            execution_id: claim.execution_id,
            status: ExecutionStatus::Success,
            started_at: claim.started_at,
            completed_at: t(9, 1),
            exit_code: Some(0),
            output: Some("ok\n".into()),
            error: None,
        };
        assert!(db.complete_execution(&run, Some(&task)).unwrap());

        // A second terminal write is refused and leaves the task untouched.
        let mut other = task.clone();
        other.next_run_at = t(23, 0);
        let again = FinishedRun {
            status: ExecutionStatus::Failed,
            ..run
        };
        assert!(!db.complete_execution(&again, Some(&other)).unwrap());

        let stored = db.get_task(task.id).unwrap();
        assert_eq!(stored.next_run_at, t(10, 1));
        let history = db.executions_for(task.id).unwrap();
        assert_eq!(history[0].status, ExecutionStatus::Success);
        assert_eq!(history[0].execution_time_ms, Some(60_000));
        assert_eq!(history[0].output.as_deref(), Some("ok\n"));
        assert_eq!(history[0].exit_code, Some(0));
    }

    #[test]
    fn test_dependency_gating() {
        let db = db();
        let b = add(&db, "fetch", 5, t(8, 0));
        let a_task = Task::recurring("report", "true", 3600, t(0, 0))
            .with_dependency(b)
            .with_priority(9)
            .due_at(t(8, 0));
        let a = db.insert_task(&a_task).unwrap();

        // B never ran: A is held back.
        let due: Vec<TaskId> = db.due_tasks(t(9, 0), 10).unwrap().iter().map(|t| t.id).collect();
        assert_eq!(due, vec![b]);

        // B fails: still held back.
        let claim = db.claim_due_tasks(t(9, 0), 10).unwrap().remove(0);
        finish(&db, &claim, ExecutionStatus::Failed, t(9, 1));
        let mut b_task = db.get_task(b).unwrap();
        b_task.next_run_at = t(9, 5);
        db.update_task_state(&b_task).unwrap();
        assert!(db.due_tasks(t(9, 2), 10).unwrap().is_empty());

        // B succeeds: A becomes due.
        let claim = db.claim_due_tasks(t(9, 5), 10).unwrap().remove(0);
        assert_eq!(claim.task.id, b);
        finish(&db, &claim, ExecutionStatus::Success, t(9, 6));
        let mut b_task = db.get_task(b).unwrap();
        b_task.next_run_at = t(12, 0);
        db.update_task_state(&b_task).unwrap();
        let due: Vec<TaskId> = db.due_tasks(t(9, 7), 10).unwrap().iter().map(|t| t.id).collect();
        assert_eq!(due, vec![a]);

        // A ran after B's success: it waits for a fresh B success.
        let mut a_task = db.get_task(a).unwrap();
        a_task.last_run_at = Some(t(9, 8));
        db.update_task_state(&a_task).unwrap();
        assert!(db.due_tasks(t(9, 9), 10).unwrap().is_empty());
    }

    #[test]
    fn test_reset_reactivates_failed_task() {
        let db = db();
        let id = add(&db, "job", 5, t(8, 0));
        let mut task = db.get_task(id).unwrap();
        task.status = TaskStatus::Failed;
        task.retry_count = 3;
        db.update_task_state(&task).unwrap();
        assert!(db.due_tasks(t(9, 0), 5).unwrap().is_empty());

        db.reset_task(id, t(9, 0)).unwrap();
        let task = db.get_task(id).unwrap();
        assert_eq!(task.status, TaskStatus::Active);
        assert_eq!(task.retry_count, 0);
        assert_eq!(task.next_run_at, t(9, 0));
        assert_eq!(db.due_tasks(t(9, 0), 5).unwrap().len(), 1);
        assert!(matches!(db.reset_task(999, t(9, 0)), Err(TaskdError::NotFound(_))));
    }

    #[test]
    fn test_reconcile_stale() {
        let db = db();
        let id = db
            .insert_task(&Task::once("slow", "sleep 1000", t(8, 0)).with_timeout(600))
            .unwrap();
        let claim = db.claim_due_tasks(t(8, 0), 5).unwrap().remove(0);

        // timeout 600s + grace 300s: not stale at 08:14, stale at 08:16.
        assert!(db.reconcile_stale(t(8, 14), 300).unwrap().is_empty());
        let stale = db.reconcile_stale(t(8, 16), 300).unwrap();
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].execution_id, claim.execution_id);
        assert_eq!(stale[0].task_name, "slow");

        let history = db.executions_for(id).unwrap();
        assert_eq!(history[0].status, ExecutionStatus::Failed);
        assert!(history[0].error.as_deref().unwrap_or("").contains("orphaned"));
        // No retry charged and the task is selectable again.
        assert_eq!(db.get_task(id).unwrap().retry_count, 0);
        assert_eq!(db.due_tasks(t(8, 16), 5).unwrap().len(), 1);
        // The late-finishing worker cannot overwrite the reconciled row.
        let late = FinishedRun {
            execution_id: claim.execution_id,
            status: ExecutionStatus::Success,
            started_at: claim.started_at,
            completed_at: t(8, 17),
            exit_code: Some(0),
            output: None,
            error: None,
        };
        assert!(!db.complete_execution(&late, None).unwrap());
    }

    #[test]
    fn test_reconcile_stale_with_out_of_range_timeout() {
        let db = db();
        let id = db.insert_task(&Task::once("odd", "true", t(8, 0))).unwrap();
        // Written by another tool; `insert_task` would have rejected it.
        db.lock()
            .unwrap()
            .execute(
                "UPDATE tasks SET timeout_seconds = ?1 WHERE id = ?2",
                params![10_000_000_000_000_i64, id],
            )
            .unwrap();
        db.claim_due_tasks(t(8, 0), 5).unwrap();

        assert!(db.reconcile_stale(t(9, 0), 300).unwrap().is_empty());
        assert!(db.reconcile_stale(t(9, 0), u64::MAX).unwrap().is_empty());
        let far = t(8, 0) + chrono::Duration::seconds(MAX_SPAN_SECS as i64 + 301);
        assert_eq!(db.reconcile_stale(far, 300).unwrap().len(), 1);
    }

    #[test]
    fn test_task_stats_view() {
        let db = db();
        let id = add(&db, "job", 5, t(8, 0));
        let idle = add(&db, "idle", 5, t(20, 0));

        for (start, status) in [
            (t(8, 0), ExecutionStatus::Success),
            (t(9, 0), ExecutionStatus::Failed),
            (t(10, 0), ExecutionStatus::Timeout),
        ] {
            let claim = db.claim_due_tasks(start, 1).unwrap().remove(0);
            finish(&db, &claim, status, start + chrono::Duration::seconds(2));
        }

        let stats = db.task_stats().unwrap();
        let job = stats.iter().find(|s| s.task_id == id).unwrap();
        assert_eq!(job.total_runs, 3);
        assert_eq!(job.successes, 1);
        assert_eq!(job.failures, 2);
        assert_eq!(job.avg_execution_ms, Some(2000.0));
        assert_eq!(job.last_completed_at, Some(t(10, 0) + chrono::Duration::seconds(2)));
        assert_eq!(job.last_failure_at, Some(t(10, 0) + chrono::Duration::seconds(2)));

        let idle = stats.iter().find(|s| s.task_id == idle).unwrap();
        assert_eq!(idle.total_runs, 0);
        assert_eq!(idle.avg_execution_ms, None);
    }

    #[test]
    fn test_recent_executions() {
        let db = db();
        let a = add(&db, "a", 5, t(8, 0));
        let b = add(&db, "b", 4, t(8, 0));
        let claims = db.claim_due_tasks(t(8, 0), 5).unwrap();
        for claim in &claims {
            finish(&db, claim, ExecutionStatus::Success, t(8, 1));
        }
        assert_eq!(db.recent_executions(10, None).unwrap().len(), 2);
        let only_b = db.recent_executions(10, Some(b)).unwrap();
        assert_eq!(only_b.len(), 1);
        assert_eq!(only_b[0].task_id, b);
        assert_eq!(db.recent_executions(1, None).unwrap().len(), 1);
        assert_ne!(a, b);
    }

    #[test]
    fn test_reopen_file_database() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("tasks.db");
        let id = {
            let db = SchedulerDb::open(&path).unwrap();
            add(&db, "persisted", 5, t(8, 0))
        };
        let db = SchedulerDb::open(&path).unwrap();
        assert_eq!(db.get_task(id).unwrap().name, "persisted");
    }
}

//! SQLite store implementation.
//!
//! One `tasks` table is the whole persisted state. The CLI process and the
//! daemon open the same file; SQLite serialises their writers, and every
//! mutation below runs inside an `IMMEDIATE` transaction so a check and the
//! write that depends on it cannot interleave with another process.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Value;
use rusqlite::{Connection, ErrorCode, OptionalExtension, TransactionBehavior, params_from_iter};

use super::TaskStore;
use crate::domain::{
    NewTask, Task, TaskAction, TaskFilter, TaskId, TaskStatus, TaskUpdate, latest_storable_time,
};
use crate::error::StoreError;
use crate::observability::QueueCounts;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS tasks (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    action      TEXT    NOT NULL,
    payload     TEXT    NOT NULL,
    status      TEXT    NOT NULL,
    attempts    INTEGER NOT NULL DEFAULT 0,
    last_error  TEXT,
    not_before  TEXT,
    created_at  TEXT    NOT NULL,
    updated_at  TEXT    NOT NULL
);
CREATE INDEX IF NOT EXISTS tasks_status_action ON tasks (status, action);
"#;

const COLUMNS: &str =
    "id, action, payload, status, attempts, last_error, not_before, created_at, updated_at";

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

pub struct SqliteTaskStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteTaskStore {
    /// Open (or create) the database file and make sure the schema exists.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let conn = Connection::open(path).map_err(map_sqlite_error)?;
        conn.busy_timeout(BUSY_TIMEOUT).map_err(map_sqlite_error)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))
            .map_err(map_sqlite_error)?;
        Self::init(conn)
    }

    /// Private database, gone when the store is dropped.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().map_err(map_sqlite_error)?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA).map_err(map_sqlite_error)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `f` against the connection on the blocking pool.
    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| StoreError::Unavailable("sqlite connection lock poisoned".to_string()))?;
            f(&mut guard)
        })
        .await
        .map_err(|e| StoreError::Unavailable(format!("store thread failed: {e}")))?
    }
}

#[async_trait]
impl TaskStore for SqliteTaskStore {
    async fn insert(&self, task: NewTask) -> Result<Task, StoreError> {
        check_new(&task)?;
        self.with_conn(move |conn| {
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(map_sqlite_error)?;
            let task = insert_row(&tx, task)?;
            tx.commit().map_err(map_sqlite_error)?;
            Ok(task)
        })
        .await
    }

    async fn insert_unique(&self, task: NewTask) -> Result<Option<Task>, StoreError> {
        check_new(&task)?;
        self.with_conn(move |conn| {
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(map_sqlite_error)?;
            let payload = encode_payload(&task.payload)?;
            let exists: Option<i64> = tx
                .query_row(
                    "SELECT id FROM tasks WHERE action = ?1 AND payload = ?2 AND status = ?3 LIMIT 1",
                    rusqlite::params![task.action.as_str(), payload, TaskStatus::Pending.as_str()],
                    |row| row.get(0),
                )
                .optional()
                .map_err(map_sqlite_error)?;
            if exists.is_some() {
                return Ok(None);
            }
            let task = insert_row(&tx, task)?;
            tx.commit().map_err(map_sqlite_error)?;
            Ok(Some(task))
        })
        .await
    }

    async fn find(&self, filter: &TaskFilter) -> Result<Vec<Task>, StoreError> {
        filter.validate()?;
        let filter = filter.clone();
        self.with_conn(move |conn| {
            let (clause, values) = where_clause(&filter)?;
            let sql = format!(
                "SELECT {COLUMNS} FROM tasks{clause} ORDER BY id{}",
                limit_clause(&filter)
            );
            let mut stmt = conn.prepare(&sql).map_err(map_sqlite_error)?;
            let rows = stmt
                .query_map(params_from_iter(values), TaskRow::read)
                .map_err(map_sqlite_error)?;
            let mut tasks = Vec::new();
            for row in rows {
                tasks.push(row.map_err(map_sqlite_error)?.into_task()?);
            }
            Ok(tasks)
        })
        .await
    }

    async fn delete_where(&self, filter: &TaskFilter) -> Result<u64, StoreError> {
        filter.validate()?;
        let filter = filter.clone();
        self.with_conn(move |conn| {
            let (clause, values) = where_clause(&filter)?;
            let sql = format!(
                "DELETE FROM tasks WHERE id IN (SELECT id FROM tasks{clause} ORDER BY id{})",
                limit_clause(&filter)
            );
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(map_sqlite_error)?;
            let removed = tx
                .execute(&sql, params_from_iter(values))
                .map_err(map_sqlite_error)?;
            tx.commit().map_err(map_sqlite_error)?;
            Ok(removed as u64)
        })
        .await
    }

    async fn compare_and_set(
        &self,
        id: TaskId,
        expected: TaskStatus,
        update: TaskUpdate,
    ) -> Result<Task, StoreError> {
        self.with_conn(move |conn| {
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(map_sqlite_error)?;
            let current = tx
                .query_row(
                    &format!("SELECT {COLUMNS} FROM tasks WHERE id = ?1"),
                    [id_value(id)],
                    TaskRow::read,
                )
                .optional()
                .map_err(map_sqlite_error)?;
            let Some(current) = current else {
                return Err(StoreError::NotFound(id));
            };
            let mut task = current.into_task()?;
            if task.status != expected {
                return Err(StoreError::ClaimConflict {
                    id,
                    expected,
                    actual: task.status,
                });
            }

            task.apply(&update, Utc::now());
            let changed = tx
                .execute(
                    r#"
                    UPDATE tasks
                    SET status = ?1, attempts = ?2, last_error = ?3, not_before = ?4, updated_at = ?5
                    WHERE id = ?6 AND status = ?7
                    "#,
                    rusqlite::params![
                        task.status.as_str(),
                        i64::from(task.attempts),
                        task.last_error,
                        task.not_before.map(encode_time),
                        encode_time(task.updated_at),
                        id_value(id),
                        expected.as_str(),
                    ],
                )
                .map_err(map_sqlite_error)?;
            if changed != 1 {
                return Err(row_conflict(&tx, id, expected)?);
            }
            tx.commit().map_err(map_sqlite_error)?;
            Ok(task)
        })
        .await
    }

    async fn counts(&self) -> Result<QueueCounts, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare("SELECT action, status, COUNT(*) FROM tasks GROUP BY action, status")
                .map_err(map_sqlite_error)?;
            let rows = stmt
                .query_map([], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, i64>(2)?,
                    ))
                })
                .map_err(map_sqlite_error)?;
            let mut counts = QueueCounts::default();
            for row in rows {
                let (action, status, n) = row.map_err(map_sqlite_error)?;
                let status = status.parse::<TaskStatus>().map_err(StoreError::Malformed)?;
                counts.record(TaskAction::new(action), status, n.max(0) as u64);
            }
            Ok(counts)
        })
        .await
    }
}

/// Raw column values, decoded into a [`Task`] outside the rusqlite callback
/// so decode failures surface as `Malformed` instead of a sqlite error.
struct TaskRow {
    id: i64,
    action: String,
    payload: String,
    status: String,
    attempts: i64,
    last_error: Option<String>,
    not_before: Option<String>,
    created_at: String,
    updated_at: String,
}

impl TaskRow {
    fn read(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            action: row.get(1)?,
            payload: row.get(2)?,
            status: row.get(3)?,
            attempts: row.get(4)?,
            last_error: row.get(5)?,
            not_before: row.get(6)?,
            created_at: row.get(7)?,
            updated_at: row.get(8)?,
        })
    }

    fn into_task(self) -> Result<Task, StoreError> {
        let id = u64::try_from(self.id)
            .map_err(|_| StoreError::Malformed(format!("negative task id {}", self.id)))?;
        Ok(Task {
            id: TaskId::new(id),
            action: TaskAction::new(self.action),
            payload: serde_json::from_str(&self.payload)
                .map_err(|e| StoreError::Malformed(format!("payload of task-{id}: {e}")))?,
            status: self.status.parse().map_err(StoreError::Malformed)?,
            attempts: u32::try_from(self.attempts)
                .map_err(|_| StoreError::Malformed(format!("attempts of task-{id}")))?,
            last_error: self.last_error,
            not_before: self.not_before.as_deref().map(decode_time).transpose()?,
            created_at: decode_time(&self.created_at)?,
            updated_at: decode_time(&self.updated_at)?,
        })
    }
}

fn check_new(task: &NewTask) -> Result<(), StoreError> {
    if task.action.is_empty() {
        return Err(StoreError::Malformed("task action must not be empty".to_string()));
    }
    Ok(())
}

fn insert_row(tx: &rusqlite::Transaction<'_>, new: NewTask) -> Result<Task, StoreError> {
    let now = Utc::now();
    let payload = encode_payload(&new.payload)?;
    tx.execute(
        r#"
        INSERT INTO tasks (action, payload, status, attempts, created_at, updated_at)
        VALUES (?1, ?2, ?3, 0, ?4, ?4)
        "#,
        rusqlite::params![
            new.action.as_str(),
            payload,
            TaskStatus::Pending.as_str(),
            encode_time(now),
        ],
    )
    .map_err(map_sqlite_error)?;
    let id = TaskId::new(tx.last_insert_rowid() as u64);
    Ok(Task::from_new(id, new, now))
}

/// Translate the filter into a `WHERE` clause plus positional parameters.
fn where_clause(filter: &TaskFilter) -> Result<(String, Vec<Value>), StoreError> {
    let mut terms = Vec::new();
    let mut values = Vec::new();

    if let Some(id) = filter.id {
        values.push(id_value(id));
        terms.push(format!("id = ?{}", values.len()));
    }
    if let Some(action) = &filter.action {
        values.push(Value::Text(action.as_str().to_string()));
        terms.push(format!("action = ?{}", values.len()));
    }
    if let Some(status) = filter.status {
        values.push(Value::Text(status.as_str().to_string()));
        terms.push(format!("status = ?{}", values.len()));
    }
    if let Some(payload) = &filter.payload {
        values.push(Value::Text(encode_payload(payload)?));
        terms.push(format!("payload = ?{}", values.len()));
    }
    if let Some(now) = filter.ready_at {
        values.push(Value::Text(encode_time(now)));
        terms.push(format!("(not_before IS NULL OR not_before <= ?{})", values.len()));
    }

    if terms.is_empty() {
        Ok((String::new(), values))
    } else {
        Ok((format!(" WHERE {}", terms.join(" AND ")), values))
    }
}

/// The error for a compare-and-set that matched no row, built from what the
/// row holds now.
fn row_conflict(conn: &Connection, id: TaskId, expected: TaskStatus) -> Result<StoreError, StoreError> {
    let actual = conn
        .query_row("SELECT status FROM tasks WHERE id = ?1", [id_value(id)], |row| {
            row.get::<_, String>(0)
        })
        .optional()
        .map_err(map_sqlite_error)?;
    match actual {
        None => Ok(StoreError::NotFound(id)),
        Some(raw) => Ok(StoreError::ClaimConflict {
            id,
            expected,
            actual: raw.parse().map_err(StoreError::Malformed)?,
        }),
    }
}

fn limit_clause(filter: &TaskFilter) -> String {
    filter
        .limit
        .map(|limit| format!(" LIMIT {limit}"))
        .unwrap_or_default()
}

fn id_value(id: TaskId) -> Value {
    Value::Integer(id.get() as i64)
}

// serde_json maps are ordered, so equal payloads encode to equal text.
fn encode_payload(payload: &serde_json::Value) -> Result<String, StoreError> {
    serde_json::to_string(payload).map_err(|e| StoreError::Malformed(format!("payload: {e}")))
}

// Fixed-width UTC text compares in time order, but only up to year 9999:
// later years gain a sign and sort before every four-digit year.
fn encode_time(at: DateTime<Utc>) -> String {
    at.min(latest_storable_time())
        .to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn decode_time(raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|at| at.with_timezone(&Utc))
        .map_err(|e| StoreError::Malformed(format!("timestamp {raw:?}: {e}")))
}

fn map_sqlite_error(err: rusqlite::Error) -> StoreError {
    match &err {
        rusqlite::Error::SqliteFailure(failure, _) => match failure.code {
            ErrorCode::DatabaseBusy
            | ErrorCode::DatabaseLocked
            | ErrorCode::CannotOpen
            | ErrorCode::SystemIoFailure
            | ErrorCode::FileLockingProtocolFailed
            | ErrorCode::PermissionDenied
            | ErrorCode::DiskFull
            | ErrorCode::OperationInterrupted => StoreError::Unavailable(err.to_string()),
            _ => StoreError::Malformed(err.to_string()),
        },
        _ => StoreError::Malformed(err.to_string()),
    }
}

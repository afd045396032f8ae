//! SQLite database for tasks, delivery outcomes and alerts.
//!
//! Timestamps are stored as INTEGER microseconds since the Unix epoch so
//! the `updated_at` version compares exactly in compare-and-set writes.

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chime_scheduler::{
    DeliveryOutcome, DeliveryStatus, NewTask, StoreError, Task, TaskAlert, TaskId, TaskStore,
};
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, ErrorCode, OptionalExtension, Row, params};
use tracing::{debug, info};

use crate::SqliteStoreError;

const TASK_COLUMNS: &str = "id, uuid, name, endpoint, message_type, message_content, schedule, \
                            next_fire_at, enabled, created_at, updated_at";

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS task (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        uuid TEXT NOT NULL UNIQUE,
        name TEXT NOT NULL,
        endpoint TEXT NOT NULL,
        message_type TEXT NOT NULL DEFAULT 'text',
        message_content TEXT NOT NULL,
        schedule TEXT NOT NULL,
        next_fire_at INTEGER,
        enabled INTEGER NOT NULL DEFAULT 1,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_task_enabled ON task(enabled);

    CREATE TABLE IF NOT EXISTS delivery_outcome (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        task_id INTEGER NOT NULL,
        occurrence_time INTEGER NOT NULL,
        attempt INTEGER NOT NULL,
        result TEXT NOT NULL,
        reason TEXT,
        timestamp INTEGER NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_outcome_task ON delivery_outcome(task_id, timestamp);

    CREATE TABLE IF NOT EXISTS task_alert (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        task_id INTEGER NOT NULL,
        task_name TEXT NOT NULL,
        consecutive_failures INTEGER NOT NULL,
        last_reason TEXT NOT NULL,
        raised_at INTEGER NOT NULL
    );
";

/// Field changes applied by [`SqliteTaskStore::update`]. `None` leaves a
/// field as it is.
#[derive(Debug, Clone, Default)]
pub struct TaskUpdate {
    pub name: Option<String>,
    pub endpoint: Option<String>,
    pub message_type: Option<String>,
    pub message_content: Option<String>,
    /// New canonical schedule together with its first fire time.
    pub schedule: Option<(String, DateTime<Utc>)>,
}

impl TaskUpdate {
    pub fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.endpoint.is_none()
            && self.message_type.is_none()
            && self.message_content.is_none()
            && self.schedule.is_none()
    }
}

/// SQLite-backed task store.
#[derive(Clone)]
pub struct SqliteTaskStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteTaskStore {
    /// Open or create the database at `path`.
    pub fn open(path: &Path) -> Result<Self, SqliteStoreError> {
        let conn = Connection::open(path)?;

        // WAL lets the CLI read while the daemon writes
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        conn.execute_batch(SCHEMA)?;

        info!(path = %path.display(), "task database initialized");
        Ok(Self::from_connection(conn))
    }

    /// A private in-memory database.
    pub fn open_in_memory() -> Result<Self, SqliteStoreError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self::from_connection(conn))
    }

    fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
        }
    }

    fn with_conn<T, F>(&self, f: F) -> Result<T, SqliteStoreError>
    where
        F: FnOnce(&Connection) -> Result<T, SqliteStoreError>,
    {
        let conn = self.conn.lock().map_err(|_| SqliteStoreError::Poisoned)?;
        f(&conn)
    }

    /// Run `f` against the connection on the blocking pool.
    async fn blocking<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Connection) -> Result<T, SqliteStoreError> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        let result = tokio::task::spawn_blocking(move || {
            let conn = conn.lock().map_err(|_| SqliteStoreError::Poisoned)?;
            f(&conn)
        })
        .await
        .map_err(|e| SqliteStoreError::Worker(e.to_string()))?;
        Ok(result?)
    }

    // =========================================================================
    // Tasks
    // =========================================================================

    /// Insert a task, rejecting a duplicate uuid.
    pub fn insert(&self, task: &NewTask) -> Result<Task, SqliteStoreError> {
        self.with_conn(|conn| insert_task(conn, task))
    }

    /// Get a task by id.
    pub fn get(&self, id: TaskId) -> Result<Option<Task>, SqliteStoreError> {
        self.with_conn(|conn| get_task(conn, id))
    }

    /// Get a task by uuid.
    pub fn get_by_uuid(&self, uuid: &str) -> Result<Option<Task>, SqliteStoreError> {
        self.with_conn(|conn| {
            let sql = format!("SELECT {} FROM task WHERE uuid = ?1", TASK_COLUMNS);
            Ok(conn
                .query_row(&sql, params![uuid], task_from_row)
                .optional()?)
        })
    }

    /// List every task, enabled or not, ordered by id.
    pub fn list_all(&self) -> Result<Vec<Task>, SqliteStoreError> {
        self.with_conn(|conn| query_tasks(conn, "ORDER BY id"))
    }

    /// List enabled tasks ordered by id.
    pub fn list_enabled(&self) -> Result<Vec<Task>, SqliteStoreError> {
        self.with_conn(list_enabled)
    }

    /// Apply an administrative edit, bumping the version so a running
    /// scheduler reloads the task.
    ///
    /// One statement: only the requested columns change, so a fire time the
    /// daemon wrote in the meantime is never put back.
    pub fn update(
        &self,
        id: TaskId,
        update: &TaskUpdate,
        now: DateTime<Utc>,
    ) -> Result<Task, SqliteStoreError> {
        self.with_conn(|conn| {
            let (schedule, next_fire_at) = match &update.schedule {
                Some((schedule, next)) => (Some(schedule.as_str()), Some(next.timestamp_micros())),
                None => (None, None),
            };
            let changed = conn.execute(
                "UPDATE task SET
                     name = COALESCE(?2, name),
                     endpoint = COALESCE(?3, endpoint),
                     message_type = COALESCE(?4, message_type),
                     message_content = COALESCE(?5, message_content),
                     schedule = COALESCE(?6, schedule),
                     next_fire_at = CASE WHEN ?6 IS NULL THEN next_fire_at ELSE ?7 END,
                     updated_at = MAX(?8, updated_at + 1)
                 WHERE id = ?1",
                params![
                    id,
                    update.name,
                    update.endpoint,
                    update.message_type,
                    update.message_content,
                    schedule,
                    next_fire_at,
                    now.timestamp_micros(),
                ],
            )?;
            if changed == 0 {
                return Err(SqliteStoreError::NotFound(id));
            }
            debug!(task_id = id, "task updated");
            get_task(conn, id)?.ok_or(SqliteStoreError::NotFound(id))
        })
    }

    /// Enable or disable a task. Returns false if it does not exist.
    pub fn set_enabled_at(
        &self,
        id: TaskId,
        enabled: bool,
        now: DateTime<Utc>,
    ) -> Result<bool, SqliteStoreError> {
        self.with_conn(|conn| set_enabled(conn, id, enabled, now))
    }

    /// Delete a task. Its outcomes and alerts are kept as history.
    pub fn delete(&self, id: TaskId) -> Result<bool, SqliteStoreError> {
        self.with_conn(|conn| Ok(conn.execute("DELETE FROM task WHERE id = ?1", params![id])? > 0))
    }

    // =========================================================================
    // Outcomes and alerts
    // =========================================================================

    /// Most recent outcomes for a task, newest first.
    pub fn recent_outcomes(
        &self,
        task_id: TaskId,
        limit: usize,
    ) -> Result<Vec<DeliveryOutcome>, SqliteStoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT task_id, occurrence_time, attempt, result, reason, timestamp
                 FROM delivery_outcome WHERE task_id = ?1
                 ORDER BY timestamp DESC, id DESC LIMIT ?2",
            )?;
            let rows = stmt
                .query_map(params![task_id, limit as i64], outcome_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Most recent alerts, newest first.
    pub fn recent_alerts(&self, limit: usize) -> Result<Vec<TaskAlert>, SqliteStoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT task_id, task_name, consecutive_failures, last_reason, raised_at
                 FROM task_alert ORDER BY raised_at DESC, id DESC LIMIT ?1",
            )?;
            let rows = stmt
                .query_map(params![limit as i64], |row| {
                    Ok(TaskAlert {
                        task_id: row.get(0)?,
                        task_name: row.get(1)?,
                        consecutive_failures: row.get(2)?,
                        last_reason: row.get(3)?,
                        raised_at: micros(row, 4)?,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }
}

#[async_trait]
impl TaskStore for SqliteTaskStore {
    async fn list_enabled_tasks(&self) -> Result<Vec<Task>, StoreError> {
        self.blocking(list_enabled).await
    }

    async fn get_task(&self, id: TaskId) -> Result<Option<Task>, StoreError> {
        self.blocking(move |conn| get_task(conn, id)).await
    }

    async fn insert_task(&self, task: NewTask) -> Result<Task, StoreError> {
        self.blocking(move |conn| insert_task(conn, &task)).await
    }

    async fn compare_and_set_schedule(
        &self,
        id: TaskId,
        expected_updated_at: DateTime<Utc>,
        next_fire_at: Option<DateTime<Utc>>,
        updated_at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        self.blocking(move |conn| {
            let changed = conn.execute(
                "UPDATE task SET next_fire_at = ?3, updated_at = ?4
                 WHERE id = ?1 AND updated_at = ?2",
                params![
                    id,
                    expected_updated_at.timestamp_micros(),
                    next_fire_at.map(|t| t.timestamp_micros()),
                    updated_at.timestamp_micros(),
                ],
            )?;
            Ok(changed == 1)
        })
        .await
    }

    async fn set_enabled(&self, id: TaskId, enabled: bool) -> Result<bool, StoreError> {
        self.blocking(move |conn| set_enabled(conn, id, enabled, Utc::now()))
            .await
    }

    async fn record_outcome(&self, outcome: &DeliveryOutcome) -> Result<(), StoreError> {
        let outcome = outcome.clone();
        self.blocking(move |conn| {
            conn.execute(
                "INSERT INTO delivery_outcome
                 (task_id, occurrence_time, attempt, result, reason, timestamp)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    outcome.task_id,
                    outcome.occurrence_time.timestamp_micros(),
                    outcome.attempt,
                    outcome.result.as_str(),
                    outcome.reason,
                    outcome.timestamp.timestamp_micros(),
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn raise_alert(&self, alert: &TaskAlert) -> Result<(), StoreError> {
        let alert = alert.clone();
        self.blocking(move |conn| {
            conn.execute(
                "INSERT INTO task_alert
                 (task_id, task_name, consecutive_failures, last_reason, raised_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    alert.task_id,
                    alert.task_name,
                    alert.consecutive_failures,
                    alert.last_reason,
                    alert.raised_at.timestamp_micros(),
                ],
            )?;
            Ok(())
        })
        .await
    }
}

fn insert_task(conn: &Connection, task: &NewTask) -> Result<Task, SqliteStoreError> {
    let created_at = task.created_at.timestamp_micros();
    let inserted = conn.execute(
        "INSERT INTO task
         (uuid, name, endpoint, message_type, message_content, schedule, next_fire_at,
          enabled, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)",
        params![
            task.uuid,
            task.name,
            task.endpoint,
            task.message_type,
            task.message_content,
            task.schedule,
            task.next_fire_at.map(|t| t.timestamp_micros()),
            task.enabled,
            created_at,
        ],
    );

    match inserted {
        Ok(_) => {}
        Err(rusqlite::Error::SqliteFailure(e, _)) if e.code == ErrorCode::ConstraintViolation => {
            return Err(SqliteStoreError::Duplicate(task.uuid.clone()));
        }
        Err(e) => return Err(e.into()),
    }

    let id = conn.last_insert_rowid();
    get_task(conn, id)?.ok_or(SqliteStoreError::NotFound(id))
}

fn get_task(conn: &Connection, id: TaskId) -> Result<Option<Task>, SqliteStoreError> {
    let sql = format!("SELECT {} FROM task WHERE id = ?1", TASK_COLUMNS);
    Ok(conn.query_row(&sql, params![id], task_from_row).optional()?)
}

fn list_enabled(conn: &Connection) -> Result<Vec<Task>, SqliteStoreError> {
    query_tasks(conn, "WHERE enabled = 1 ORDER BY id")
}

fn query_tasks(conn: &Connection, clause: &str) -> Result<Vec<Task>, SqliteStoreError> {
    let sql = format!("SELECT {} FROM task {}", TASK_COLUMNS, clause);
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map([], task_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn set_enabled(
    conn: &Connection,
    id: TaskId,
    enabled: bool,
    now: DateTime<Utc>,
) -> Result<bool, SqliteStoreError> {
    // Same version rule as `next_version`, applied against the current row
    let changed = conn.execute(
        "UPDATE task SET enabled = ?2, updated_at = MAX(?3, updated_at + 1) WHERE id = ?1",
        params![id, enabled, now.timestamp_micros()],
    )?;
    if changed > 0 {
        debug!(task_id = id, enabled, "task enabled flag changed");
    }
    Ok(changed > 0)
}

fn task_from_row(row: &Row<'_>) -> rusqlite::Result<Task> {
    Ok(Task {
        id: row.get(0)?,
        uuid: row.get(1)?,
        name: row.get(2)?,
        endpoint: row.get(3)?,
        message_type: row.get(4)?,
        message_content: row.get(5)?,
        schedule: row.get(6)?,
        next_fire_at: optional_micros(row, 7)?,
        enabled: row.get(8)?,
        created_at: micros(row, 9)?,
        updated_at: micros(row, 10)?,
    })
}

fn outcome_from_row(row: &Row<'_>) -> rusqlite::Result<DeliveryOutcome> {
    let result: String = row.get(3)?;
    let result = result
        .parse::<DeliveryStatus>()
        .map_err(|_| rusqlite::Error::InvalidColumnType(3, "result".to_string(), Type::Text))?;

    Ok(DeliveryOutcome {
        task_id: row.get(0)?,
        occurrence_time: micros(row, 1)?,
        attempt: row.get(2)?,
        result,
        reason: row.get(4)?,
        timestamp: micros(row, 5)?,
    })
}

fn micros(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let value: i64 = row.get(idx)?;
    DateTime::from_timestamp_micros(value)
        .ok_or(rusqlite::Error::IntegralValueOutOfRange(idx, value))
}

fn optional_micros(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let value: Option<i64> = row.get(idx)?;
    value
        .map(|v| {
            DateTime::from_timestamp_micros(v)
                .ok_or(rusqlite::Error::IntegralValueOutOfRange(idx, v))
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use pretty_assertions::assert_eq;

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, h, m, 0).unwrap()
    }

    fn new_task(uuid: &str) -> NewTask {
        NewTask {
            uuid: uuid.to_string(),
            name: "Standup".to_string(),
            endpoint: "https://example.com/hook".to_string(),
            message_type: "text".to_string(),
            message_content: "stand up!".to_string(),
            schedule: "0 9 * * *".to_string(),
            next_fire_at: Some(at(9, 0)),
            enabled: true,
            created_at: at(8, 0) + Duration::nanoseconds(123_456_789),
        }
    }

    #[test]
    fn test_insert_and_get() {
        let store = SqliteTaskStore::open_in_memory().unwrap();
        let task = store.insert(&new_task("a")).unwrap();

        assert_eq!(task.id, 1);
        assert_eq!(task.uuid, "a");
        assert_eq!(task.next_fire_at, Some(at(9, 0)));
        // Stored at microsecond precision
        assert_eq!(task.created_at, at(8, 0) + Duration::microseconds(123_456));
        assert_eq!(task.updated_at, task.created_at);

        assert_eq!(store.get(task.id).unwrap(), Some(task.clone()));
        assert_eq!(store.get_by_uuid("a").unwrap(), Some(task));
        assert_eq!(store.get(42).unwrap(), None);
    }

    #[test]
    fn test_duplicate_uuid_rejected() {
        let store = SqliteTaskStore::open_in_memory().unwrap();
        store.insert(&new_task("a")).unwrap();

        let err = store.insert(&new_task("a")).unwrap_err();
        assert!(matches!(err, SqliteStoreError::Duplicate(uuid) if uuid == "a"));
        assert_eq!(store.list_all().unwrap().len(), 1);
    }

    #[test]
    fn test_update_bumps_version() {
        let store = SqliteTaskStore::open_in_memory().unwrap();
        let task = store.insert(&new_task("a")).unwrap();

        let update = TaskUpdate {
            name: Some("Renamed".to_string()),
            schedule: Some(("30 9 * * *".to_string(), at(9, 30))),
            ..TaskUpdate::default()
        };
        let updated = store.update(task.id, &update, at(8, 30)).unwrap();

        assert_eq!(updated.name, "Renamed");
        assert_eq!(updated.schedule, "30 9 * * *");
        assert_eq!(updated.next_fire_at, Some(at(9, 30)));
        assert_eq!(updated.updated_at, at(8, 30));
        assert_eq!(store.get(task.id).unwrap(), Some(updated));

        assert!(matches!(
            store.update(99, &update, at(8, 30)),
            Err(SqliteStoreError::NotFound(99))
        ));
    }

    #[test]
    fn test_enable_disable_and_delete() {
        let store = SqliteTaskStore::open_in_memory().unwrap();
        let a = store.insert(&new_task("a")).unwrap();
        store.insert(&new_task("b")).unwrap();

        assert!(store.set_enabled_at(a.id, false, at(8, 30)).unwrap());
        assert_eq!(store.list_enabled().unwrap().len(), 1);
        assert_eq!(store.list_all().unwrap().len(), 2);

        assert!(store.delete(a.id).unwrap());
        assert!(!store.delete(a.id).unwrap());
        assert!(!store.set_enabled_at(a.id, true, at(8, 30)).unwrap());
    }

    #[test]
    fn test_update_is_empty() {
        assert!(TaskUpdate::default().is_empty());
        assert!(
            !TaskUpdate {
                message_content: Some("x".to_string()),
                ..TaskUpdate::default()
            }
            .is_empty()
        );
    }
}

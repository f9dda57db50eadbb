use chrono::{TimeZone, Utc};
use rusqlite::{OptionalExtension, Row};

use crate::db::Database;
use crate::error::ReinError;
use crate::models::{TaskFlags, TaskState, TaskStatus};

#[derive(Clone)]
pub struct TaskStore {
    db: Database,
}

impl TaskStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Insert or update the task row. Control flags are only written on
    /// insert; afterwards they belong to the control channel.
    pub async fn save(&self, task: &TaskState) -> Result<(), ReinError> {
        let t = task.clone();
        self.db
            .with_conn_async(move |conn| {
                conn.execute(
                    "INSERT INTO tasks (id, workflow, status, input, paused, cancel_requested, error, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                     ON CONFLICT(id) DO UPDATE SET
                       workflow = excluded.workflow,
                       status = excluded.status,
                       input = excluded.input,
                       error = excluded.error,
                       updated_at = excluded.updated_at",
                    rusqlite::params![
                        t.id,
                        t.workflow,
                        t.status.as_str(),
                        serde_json::to_string(&t.input).unwrap_or_else(|_| "{}".to_string()),
                        t.paused as i64,
                        t.cancel_requested as i64,
                        t.error,
                        t.created_at.timestamp_millis(),
                        Utc::now().timestamp_millis(),
                    ],
                )?;
                Ok(())
            })
            .await
    }

    pub async fn get(&self, task_id: &str) -> Result<Option<TaskState>, ReinError> {
        let id = task_id.to_string();
        self.db
            .with_conn_async(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, workflow, status, input, paused, cancel_requested, error, created_at, updated_at
                     FROM tasks WHERE id = ?1",
                )?;
                stmt.query_row(rusqlite::params![id], |row| Ok(row_to_task(row)))
                    .optional()
            })
            .await
    }

    pub async fn list(&self) -> Result<Vec<TaskState>, ReinError> {
        self.db
            .with_conn_async(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, workflow, status, input, paused, cancel_requested, error, created_at, updated_at
                     FROM tasks ORDER BY created_at DESC",
                )?;
                let rows = stmt
                    .query_map([], |row| Ok(row_to_task(row)))?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
    }

    pub async fn set_status(
        &self,
        task_id: &str,
        status: TaskStatus,
        error: Option<String>,
    ) -> Result<(), ReinError> {
        let id = task_id.to_string();
        self.db
            .with_conn_async(move |conn| {
                conn.execute(
                    "UPDATE tasks SET status = ?1, error = COALESCE(?2, error), updated_at = ?3 WHERE id = ?4",
                    rusqlite::params![status.as_str(), error, Utc::now().timestamp_millis(), id],
                )?;
                Ok(())
            })
            .await
    }

    pub async fn flags(&self, task_id: &str) -> Result<TaskFlags, ReinError> {
        let id = task_id.to_string();
        let flags = self
            .db
            .with_conn_async(move |conn| {
                conn.query_row(
                    "SELECT paused, cancel_requested FROM tasks WHERE id = ?1",
                    rusqlite::params![id],
                    |row| {
                        Ok(TaskFlags {
                            paused: row.get::<_, i64>(0)? != 0,
                            cancel_requested: row.get::<_, i64>(1)? != 0,
                        })
                    },
                )
                .optional()
            })
            .await?;
        flags.ok_or_else(|| ReinError::NotFound(format!("task '{}'", task_id)))
    }

    /// Set or clear the workflow pause flag. Returns `false` when the flag
    /// already had the requested value.
    pub async fn set_paused(&self, task_id: &str, paused: bool) -> Result<bool, ReinError> {
        let id = task_id.to_string();
        let changed = self
            .db
            .with_conn_async(move |conn| {
                conn.execute(
                    "UPDATE tasks SET paused = ?1, updated_at = ?2 WHERE id = ?3 AND paused != ?1",
                    rusqlite::params![paused as i64, Utc::now().timestamp_millis(), id],
                )
            })
            .await?;
        Ok(changed > 0)
    }

    pub async fn set_cancel_requested(&self, task_id: &str, cancel: bool) -> Result<bool, ReinError> {
        let id = task_id.to_string();
        let changed = self
            .db
            .with_conn_async(move |conn| {
                conn.execute(
                    "UPDATE tasks SET cancel_requested = ?1, updated_at = ?2 WHERE id = ?3",
                    rusqlite::params![cancel as i64, Utc::now().timestamp_millis(), id],
                )
            })
            .await?;
        Ok(changed > 0)
    }
}

/// Convert a database row to a TaskState (without blocks).
/// Column order: id(0), workflow(1), status(2), input(3), paused(4),
///               cancel_requested(5), error(6), created_at(7), updated_at(8)
fn row_to_task(row: &Row<'_>) -> TaskState {
    let created_ms: i64 = row.get(7).unwrap_or(0);
    let updated_ms: i64 = row.get(8).unwrap_or(0);
    let input: String = row.get(3).unwrap_or_else(|_| "{}".to_string());

    TaskState {
        id: row.get(0).unwrap_or_default(),
        workflow: row.get(1).unwrap_or_default(),
        status: TaskStatus::from_str(&row.get::<_, String>(2).unwrap_or_default()),
        input: serde_json::from_str(&input).unwrap_or_else(|_| serde_json::json!({})),
        paused: row.get::<_, i64>(4).unwrap_or(0) != 0,
        cancel_requested: row.get::<_, i64>(5).unwrap_or(0) != 0,
        error: row.get(6).unwrap_or(None),
        created_at: Utc
            .timestamp_millis_opt(created_ms)
            .single()
            .unwrap_or_else(Utc::now),
        updated_at: Utc
            .timestamp_millis_opt(updated_ms)
            .single()
            .unwrap_or_else(Utc::now),
        blocks: Vec::new(),
    }
}

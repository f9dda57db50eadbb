use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{Connection, OptionalExtension, Row};

use crate::db::Database;
use crate::error::ReinError;
use crate::models::{BlockRunState, BlockStatus};

const SELECT_COLUMNS: &str = "SELECT name, status, run_count, max_runs, phase, position, started_at, finished_at,
     output_path, last_error, held, cancel_requested, usage, updated_at FROM block_states";

#[derive(Clone)]
pub struct BlockStateStore {
    db: Database,
}

impl BlockStateStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Atomic upsert of one block-state transition.
    pub async fn save(&self, task_id: &str, state: &BlockRunState) -> Result<(), ReinError> {
        let id = task_id.to_string();
        let s = state.clone();
        self.db
            .with_conn_async(move |conn| upsert(conn, &id, &s))
            .await
    }

    /// Upsert many states inside one transaction.
    pub async fn save_all(&self, task_id: &str, states: &[BlockRunState]) -> Result<(), ReinError> {
        let id = task_id.to_string();
        let all = states.to_vec();
        self.db
            .with_conn_mut_async(move |conn| {
                let tx = conn.transaction()?;
                for s in &all {
                    upsert(&tx, &id, s)?;
                }
                tx.commit()
            })
            .await
    }

    pub async fn get(&self, task_id: &str, name: &str) -> Result<Option<BlockRunState>, ReinError> {
        let id = task_id.to_string();
        let n = name.to_string();
        self.db
            .with_conn_async(move |conn| {
                let mut stmt =
                    conn.prepare(&format!("{} WHERE task_id = ?1 AND name = ?2", SELECT_COLUMNS))?;
                stmt.query_row(rusqlite::params![id, n], |row| Ok(row_to_block(row)))
                    .optional()
            })
            .await
    }

    pub async fn list(&self, task_id: &str) -> Result<Vec<BlockRunState>, ReinError> {
        let id = task_id.to_string();
        self.db
            .with_conn_async(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "{} WHERE task_id = ?1 ORDER BY position ASC",
                    SELECT_COLUMNS
                ))?;
                let rows = stmt
                    .query_map(rusqlite::params![id], |row| Ok(row_to_block(row)))?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
    }

    /// Set or clear the hold flag of a block. Returns `false` if the block
    /// does not exist.
    pub async fn set_held(&self, task_id: &str, name: &str, held: bool) -> Result<bool, ReinError> {
        self.set_flag(task_id, name, "held", held).await
    }

    pub async fn set_cancel_requested(
        &self,
        task_id: &str,
        name: &str,
        cancel: bool,
    ) -> Result<bool, ReinError> {
        self.set_flag(task_id, name, "cancel_requested", cancel).await
    }

    async fn set_flag(
        &self,
        task_id: &str,
        name: &str,
        column: &'static str,
        value: bool,
    ) -> Result<bool, ReinError> {
        let id = task_id.to_string();
        let n = name.to_string();
        let changed = self
            .db
            .with_conn_async(move |conn| {
                conn.execute(
                    &format!(
                        "UPDATE block_states SET {} = ?1, updated_at = ?2 WHERE task_id = ?3 AND name = ?4",
                        column
                    ),
                    rusqlite::params![value as i64, Utc::now().timestamp_millis(), id, n],
                )
            })
            .await?;
        Ok(changed > 0)
    }
}

/// Status, counters and timestamps are owned by the scheduler. `held` and
/// `cancel_requested` are only written on first insert so that a scheduler
/// write never clobbers a pending control request.
fn upsert(conn: &Connection, task_id: &str, s: &BlockRunState) -> Result<(), rusqlite::Error> {
    conn.execute(
        "INSERT INTO block_states (task_id, name, status, run_count, max_runs, phase, position, started_at,
         finished_at, output_path, last_error, held, cancel_requested, usage, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
         ON CONFLICT(task_id, name) DO UPDATE SET
           status = excluded.status,
           run_count = excluded.run_count,
           max_runs = excluded.max_runs,
           phase = excluded.phase,
           position = excluded.position,
           started_at = excluded.started_at,
           finished_at = excluded.finished_at,
           output_path = excluded.output_path,
           last_error = excluded.last_error,
           usage = excluded.usage,
           updated_at = excluded.updated_at",
        rusqlite::params![
            task_id,
            s.name,
            s.status.as_str(),
            s.run_count,
            s.max_runs,
            s.phase,
            s.position,
            s.started_at.map(|t| t.timestamp_millis()),
            s.finished_at.map(|t| t.timestamp_millis()),
            s.output_path,
            s.last_error,
            s.held as i64,
            s.cancel_requested as i64,
            s.usage.as_ref().and_then(|u| serde_json::to_string(u).ok()),
            Utc::now().timestamp_millis(),
        ],
    )?;
    Ok(())
}

fn millis_to_time(ms: Option<i64>) -> Option<DateTime<Utc>> {
    ms.and_then(|v| Utc.timestamp_millis_opt(v).single())
}

/// Convert a database row to a BlockRunState.
/// Column order: name(0), status(1), run_count(2), max_runs(3), phase(4), position(5),
///               started_at(6), finished_at(7), output_path(8), last_error(9),
///               held(10), cancel_requested(11), usage(12), updated_at(13)
fn row_to_block(row: &Row<'_>) -> BlockRunState {
    let usage: Option<String> = row.get(12).unwrap_or(None);
    BlockRunState {
        name: row.get(0).unwrap_or_default(),
        status: BlockStatus::from_str(&row.get::<_, String>(1).unwrap_or_default()),
        run_count: row.get(2).unwrap_or(0),
        max_runs: row.get(3).unwrap_or(1),
        phase: row.get(4).unwrap_or(1),
        position: row.get(5).unwrap_or(0),
        started_at: millis_to_time(row.get(6).unwrap_or(None)),
        finished_at: millis_to_time(row.get(7).unwrap_or(None)),
        output_path: row.get(8).unwrap_or(None),
        last_error: row.get(9).unwrap_or(None),
        held: row.get::<_, i64>(10).unwrap_or(0) != 0,
        cancel_requested: row.get::<_, i64>(11).unwrap_or(0) != 0,
        usage: usage.and_then(|u| serde_json::from_str(&u).ok()),
        updated_at: millis_to_time(row.get(13).unwrap_or(None)).unwrap_or_else(Utc::now),
    }
}

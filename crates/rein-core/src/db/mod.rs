//! SQLite database layer for the task state store.
//!
//! Uses rusqlite with WAL mode so the control channel and `rein status`
//! can read while the scheduler writes. All database operations go through
//! `tokio::task::spawn_blocking` to avoid blocking the async runtime.

use rusqlite::Connection;
use std::path::Path;
use std::sync::{Arc, Mutex};

use crate::error::ReinError;

/// Thread-safe handle to the SQLite database.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open (or create) a SQLite database at the given path.
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self, ReinError> {
        let path = db_path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }

        let conn = Connection::open(path)
            .map_err(|e| ReinError::Database(format!("Failed to open database: {}", e)))?;

        conn.execute_batch(
            "PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL; PRAGMA busy_timeout=5000; PRAGMA foreign_keys=ON;",
        )
        .map_err(|e| ReinError::Database(format!("Failed to set pragmas: {}", e)))?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.initialize_tables()?;

        tracing::info!("[Database] State store opened at: {}", path.display());
        Ok(db)
    }

    /// Open an in-memory database (for testing).
    pub fn open_in_memory() -> Result<Self, ReinError> {
        let conn = Connection::open_in_memory()
            .map_err(|e| ReinError::Database(format!("Failed to open in-memory db: {}", e)))?;

        conn.execute_batch("PRAGMA foreign_keys=ON;")
            .map_err(|e| ReinError::Database(format!("Failed to set pragmas: {}", e)))?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.initialize_tables()?;
        Ok(db)
    }

    /// Execute a closure with access to the database connection.
    pub fn with_conn<F, T>(&self, f: F) -> Result<T, ReinError>
    where
        F: FnOnce(&Connection) -> Result<T, rusqlite::Error>,
    {
        let conn = self
            .conn
            .lock()
            .map_err(|e| ReinError::Database(format!("Lock poisoned: {}", e)))?;
        f(&conn).map_err(|e| ReinError::Database(e.to_string()))
    }

    /// Same as [`with_conn`](Self::with_conn), but the closure receives a
    /// mutable connection so it can open a transaction.
    pub fn with_conn_mut<F, T>(&self, f: F) -> Result<T, ReinError>
    where
        F: FnOnce(&mut Connection) -> Result<T, rusqlite::Error>,
    {
        let mut conn = self
            .conn
            .lock()
            .map_err(|e| ReinError::Database(format!("Lock poisoned: {}", e)))?;
        f(&mut conn).map_err(|e| ReinError::Database(e.to_string()))
    }

    /// Execute a closure with access to the database connection (async-friendly).
    pub async fn with_conn_async<F, T>(&self, f: F) -> Result<T, ReinError>
    where
        F: FnOnce(&Connection) -> Result<T, rusqlite::Error> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.clone();
        tokio::task::spawn_blocking(move || db.with_conn(f))
            .await
            .map_err(|e| ReinError::Database(format!("Task join error: {}", e)))?
    }

    /// Async variant of [`with_conn_mut`](Self::with_conn_mut).
    pub async fn with_conn_mut_async<F, T>(&self, f: F) -> Result<T, ReinError>
    where
        F: FnOnce(&mut Connection) -> Result<T, rusqlite::Error> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.clone();
        tokio::task::spawn_blocking(move || db.with_conn_mut(f))
            .await
            .map_err(|e| ReinError::Database(format!("Task join error: {}", e)))?
    }

    /// Create all tables if they don't exist.
    fn initialize_tables(&self) -> Result<(), ReinError> {
        self.with_conn(|conn| {
            conn.execute_batch(
                "
                CREATE TABLE IF NOT EXISTS tasks (
                    id                  TEXT PRIMARY KEY,
                    workflow            TEXT NOT NULL,
                    status              TEXT NOT NULL DEFAULT 'pending',
                    input               TEXT NOT NULL DEFAULT '{}',
                    paused              INTEGER NOT NULL DEFAULT 0,
                    cancel_requested    INTEGER NOT NULL DEFAULT 0,
                    error               TEXT,
                    created_at          INTEGER NOT NULL,
                    updated_at          INTEGER NOT NULL
                );

                CREATE TABLE IF NOT EXISTS block_states (
                    task_id             TEXT NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
                    name                TEXT NOT NULL,
                    status              TEXT NOT NULL DEFAULT 'pending',
                    run_count           INTEGER NOT NULL DEFAULT 0,
                    max_runs            INTEGER NOT NULL DEFAULT 1,
                    phase               INTEGER NOT NULL DEFAULT 1,
                    position            INTEGER NOT NULL DEFAULT 0,
                    started_at          INTEGER,
                    finished_at         INTEGER,
                    output_path         TEXT,
                    last_error          TEXT,
                    held                INTEGER NOT NULL DEFAULT 0,
                    cancel_requested    INTEGER NOT NULL DEFAULT 0,
                    usage               TEXT,
                    updated_at          INTEGER NOT NULL,
                    PRIMARY KEY (task_id, name)
                );
                CREATE INDEX IF NOT EXISTS idx_block_states_task ON block_states(task_id, position);
                ",
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_creates_parent_dirs_and_tables() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("rein.db");
        let db = Database::open(&path).unwrap();
        assert!(path.exists());

        let count: i64 = db
            .with_conn(|conn| {
                conn.query_row(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name IN ('tasks', 'block_states')",
                    [],
                    |row| row.get(0),
                )
            })
            .unwrap();
        assert_eq!(count, 2);
    }

    #[test]
    fn test_reopen_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rein.db");
        Database::open(&path).unwrap();
        Database::open(&path).unwrap();
    }
}

//! Durable task state: the single source of truth for the scheduler, the
//! control channel and `rein status`.
//!
//! ```text
//!            ┌──────────── StateStore ────────────┐
//! Scheduler ─┤ put(task, block)   get(task)       ├─ Control channel
//!            │ TaskStore          BlockStateStore │   rein status
//!            └──────────── state/rein.db ─────────┘
//! ```

pub mod block_state_store;
pub mod task_store;

pub use block_state_store::BlockStateStore;
pub use task_store::TaskStore;

use crate::db::Database;
use crate::error::ReinError;
use crate::models::{BlockRunState, TaskFlags, TaskState, TaskStatus};

/// Facade over the task and block-state tables of one database.
#[derive(Clone)]
pub struct StateStore {
    pub tasks: TaskStore,
    pub blocks: BlockStateStore,
}

impl StateStore {
    pub fn new(db: Database) -> Self {
        Self {
            tasks: TaskStore::new(db.clone()),
            blocks: BlockStateStore::new(db),
        }
    }

    /// Persist one block-state transition.
    pub async fn put(&self, task_id: &str, state: &BlockRunState) -> Result<(), ReinError> {
        self.blocks.save(task_id, state).await
    }

    /// Full task state including every block, in declaration order.
    pub async fn get(&self, task_id: &str) -> Result<TaskState, ReinError> {
        let mut task = self
            .tasks
            .get(task_id)
            .await?
            .ok_or_else(|| ReinError::NotFound(format!("task '{}'", task_id)))?;
        task.blocks = self.blocks.list(task_id).await?;
        Ok(task)
    }

    /// Create (or overwrite) a task together with its initial block states.
    pub async fn create(&self, task: &TaskState) -> Result<(), ReinError> {
        self.tasks.save(task).await?;
        self.blocks.save_all(&task.id, &task.blocks).await
    }

    pub async fn set_task_status(
        &self,
        task_id: &str,
        status: TaskStatus,
        error: Option<String>,
    ) -> Result<(), ReinError> {
        self.tasks.set_status(task_id, status, error).await
    }

    pub async fn flags(&self, task_id: &str) -> Result<TaskFlags, ReinError> {
        self.tasks.flags(task_id).await
    }

    // ─── Control requests ───────────────────────────────────────────────

    pub async fn request_pause(&self, task_id: &str) -> Result<bool, ReinError> {
        self.tasks.set_paused(task_id, true).await
    }

    pub async fn request_resume(&self, task_id: &str) -> Result<bool, ReinError> {
        self.tasks.set_paused(task_id, false).await
    }

    pub async fn request_cancel(&self, task_id: &str) -> Result<bool, ReinError> {
        self.tasks.set_cancel_requested(task_id, true).await
    }

    pub async fn hold_block(&self, task_id: &str, name: &str) -> Result<bool, ReinError> {
        self.blocks.set_held(task_id, name, true).await
    }

    pub async fn release_block(&self, task_id: &str, name: &str) -> Result<bool, ReinError> {
        self.blocks.set_held(task_id, name, false).await
    }

    pub async fn cancel_block(&self, task_id: &str, name: &str) -> Result<bool, ReinError> {
        self.blocks.set_cancel_requested(task_id, name, true).await
    }
}

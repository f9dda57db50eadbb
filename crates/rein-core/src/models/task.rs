use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::block_state::{BlockRunState, BlockStatus};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "running" => Self::Running,
            "paused" => Self::Paused,
            "completed" => Self::Completed,
            "failed" => Self::Failed,
            "cancelled" => Self::Cancelled,
            _ => Self::Pending,
        }
    }

    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Process exit code for a finished task.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Completed => 0,
            _ => 1,
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Durable control flags the scheduler polls.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TaskFlags {
    pub paused: bool,
    pub cancel_requested: bool,
}

/// One run instance of a workflow, as persisted in the state store.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskState {
    pub id: String,
    pub workflow: String,
    pub status: TaskStatus,
    pub input: serde_json::Value,
    pub paused: bool,
    pub cancel_requested: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Block states in declaration order.
    #[serde(default)]
    pub blocks: Vec<BlockRunState>,
}

impl TaskState {
    pub fn new(id: String, workflow: String, input: serde_json::Value) -> Self {
        let now = Utc::now();
        Self {
            id,
            workflow,
            status: TaskStatus::Pending,
            input,
            paused: false,
            cancel_requested: false,
            error: None,
            created_at: now,
            updated_at: now,
            blocks: Vec::new(),
        }
    }

    pub fn block(&self, name: &str) -> Option<&BlockRunState> {
        self.blocks.iter().find(|b| b.name == name)
    }

    pub fn count(&self, status: BlockStatus) -> usize {
        self.blocks.iter().filter(|b| b.status == status).count()
    }

    pub fn flags(&self) -> TaskFlags {
        TaskFlags {
            paused: self.paused,
            cancel_requested: self.cancel_requested,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_code_only_zero_when_completed() {
        assert_eq!(TaskStatus::Completed.exit_code(), 0);
        assert_eq!(TaskStatus::Failed.exit_code(), 1);
        assert_eq!(TaskStatus::Cancelled.exit_code(), 1);
    }

    #[test]
    fn test_count_by_status() {
        let mut task = TaskState::new("t".into(), "wf".into(), serde_json::json!({}));
        let mut a = BlockRunState::new("a", 1, 1, 0);
        a.status = BlockStatus::Done;
        let b = BlockRunState::new("b", 1, 1, 1);
        task.blocks = vec![a, b];
        assert_eq!(task.count(BlockStatus::Done), 1);
        assert_eq!(task.count(BlockStatus::Pending), 1);
        assert!(task.block("a").is_some());
        assert!(task.block("zzz").is_none());
    }
}

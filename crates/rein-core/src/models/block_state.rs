use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::provider::UsageStats;

/// Lifecycle state of one block inside one task.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum BlockStatus {
    Pending,
    Ready,
    Running,
    Done,
    Failed,
    Skipped,
    /// Held by a control-channel pause; not dispatched until released.
    Waiting,
}

impl BlockStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Ready => "ready",
            Self::Running => "running",
            Self::Done => "done",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
            Self::Waiting => "waiting",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "ready" => Self::Ready,
            "running" => Self::Running,
            "done" => Self::Done,
            "failed" => Self::Failed,
            "skipped" => Self::Skipped,
            "waiting" => Self::Waiting,
            _ => Self::Pending,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed | Self::Skipped)
    }

    /// Terminal without having produced an output.
    pub fn is_unsuccessful(&self) -> bool {
        matches!(self, Self::Failed | Self::Skipped)
    }
}

impl std::fmt::Display for BlockStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persisted per-block run record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockRunState {
    pub name: String,
    pub status: BlockStatus,
    pub run_count: u32,
    pub max_runs: u32,
    pub phase: u32,
    /// Declaration order inside the workflow.
    pub position: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Set by `pause <block>`, cleared by `resume <block>`.
    #[serde(default)]
    pub held: bool,
    /// Set by `cancel <block>`; honoured by the scheduler.
    #[serde(default)]
    pub cancel_requested: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<UsageStats>,
    pub updated_at: DateTime<Utc>,
}

impl BlockRunState {
    pub fn new(name: impl Into<String>, max_runs: u32, phase: u32, position: u32) -> Self {
        Self {
            name: name.into(),
            status: BlockStatus::Pending,
            run_count: 0,
            max_runs,
            phase,
            position,
            started_at: None,
            finished_at: None,
            output_path: None,
            last_error: None,
            held: false,
            cancel_requested: false,
            usage: None,
            updated_at: Utc::now(),
        }
    }

    /// Whether a forced `next` transition may re-enter this block.
    pub fn can_reenter(&self) -> bool {
        self.run_count < self.max_runs
    }

    /// Reset to a fresh pending record, keeping identity and control flags.
    pub fn reset(&mut self) {
        self.status = BlockStatus::Pending;
        self.run_count = 0;
        self.started_at = None;
        self.finished_at = None;
        self.output_path = None;
        self.last_error = None;
        self.cancel_requested = false;
        self.usage = None;
        self.updated_at = Utc::now();
    }
}

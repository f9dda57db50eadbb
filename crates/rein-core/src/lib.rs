//! Rein Core: the workflow engine behind the `rein` CLI.
//!
//! A workflow is a YAML file of blocks. Each block renders a prompt, calls an
//! LLM provider (or a custom script) and writes `outputs/result.json` into the
//! task directory. `depends_on` edges form an acyclic graph; `next` rules add
//! bounded revision loops and branches on top of it.
//!
//! ```text
//! WorkflowGraph ──► Scheduler ──► BlockRunner ──► Provider / hooks
//!                      │  ▲
//!                      ▼  │ durable flags
//!                  StateStore ◄── control socket, `rein status`
//! ```
//!
//! The crate has no CLI dependency; `rein-cli` is a thin front end over
//! [`orchestration::Orchestrator`].

pub mod config;
pub mod control;
pub mod db;
pub mod error;
pub mod hooks;
pub mod models;
pub mod orchestration;
pub mod output;
pub mod provider;
pub mod runner;
pub mod scheduler;
pub mod store;
pub mod task_dir;
pub mod template;
pub mod workflow;

// Convenience re-exports
pub use config::{ReinConfig, ResumePolicy};
pub use db::Database;
pub use error::ReinError;
pub use models::{BlockRunState, BlockStatus, TaskState, TaskStatus};
pub use orchestration::{Orchestrator, PreparedTask, RunRequest, TaskReport};
pub use store::StateStore;
pub use task_dir::{RunLog, TaskDir};
pub use workflow::{WorkflowDefinition, WorkflowGraph};

//! Task orchestration: from a workflow file to a finished task directory.
//!
//! ```text
//! RunRequest ─► Orchestrator::prepare ─► PreparedTask ─► run ─► TaskReport
//!                 load graph, .env         control socket
//!                 create / resume task     scheduler loop
//!                 pick provider            finalize files
//! ```
//!
//! `prepare` and `run` are separate so callers (the CLI, tests) can reach the
//! task's store and id while the run is in flight.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::{json, Value};

use crate::config::{load_dotenv, ReinConfig, ResumePolicy};
use crate::db::Database;
use crate::error::ReinError;
use crate::models::{BlockStatus, TaskState, TaskStatus};
use crate::provider::{create_provider, Provider};
use crate::runner::BlockRunner;
use crate::scheduler::{cost_line, resume_task, RunOutcome, Scheduler, SchedulerOptions};
use crate::store::StateStore;
use crate::task_dir::{RunLog, TaskDir};
use crate::template::unwrap_envelope;
use crate::workflow::{resolve_inputs, AgentLibrary, WorkflowGraph};

/// What to run.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub workflow_path: PathBuf,
    pub input: Value,
    /// Overrides the workflow's `max_parallel`.
    pub max_parallel: Option<usize>,
    /// Resume this task id instead of creating a new task.
    pub resume: Option<String>,
    /// Overrides the configured resume policy.
    pub resume_policy: Option<ResumePolicy>,
    pub control_socket: bool,
}

impl RunRequest {
    pub fn new(workflow_path: impl Into<PathBuf>, input: Value) -> Self {
        Self {
            workflow_path: workflow_path.into(),
            input,
            max_parallel: None,
            resume: None,
            resume_policy: None,
            control_socket: false,
        }
    }
}

pub struct Orchestrator {
    config: ReinConfig,
    provider: Option<Arc<dyn Provider>>,
}

impl Orchestrator {
    pub fn new(config: ReinConfig) -> Self {
        Self {
            config,
            provider: None,
        }
    }

    /// Use this provider instead of the one the workflow selects.
    pub fn with_provider(mut self, provider: Arc<dyn Provider>) -> Self {
        self.provider = Some(provider);
        self
    }

    pub fn config(&self) -> &ReinConfig {
        &self.config
    }

    /// Load the workflow and create (or reconcile) the task.
    pub async fn prepare(&self, request: RunRequest) -> Result<PreparedTask, ReinError> {
        let graph = Arc::new(WorkflowGraph::from_file(&request.workflow_path)?);
        let definition = graph.definition();
        let workflow_dir = request
            .workflow_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        load_dotenv(&workflow_dir);

        let tasks_dir = self.config.tasks_dir();
        std::fs::create_dir_all(&tasks_dir)?;

        let (task_dir, store, input, log) = match &request.resume {
            Some(task_id) => {
                let task_dir = TaskDir::open(&tasks_dir, task_id)?;
                let store = StateStore::new(Database::open(task_dir.db_path())?);
                let task = store.get(task_id).await?;
                if task.workflow != graph.name() {
                    return Err(ReinError::Input(format!(
                        "task '{}' ran workflow '{}', not '{}'",
                        task_id,
                        task.workflow,
                        graph.name()
                    )));
                }
                let log = Arc::new(RunLog::new(task_dir.log_path()));
                let policy = request.resume_policy.unwrap_or(self.config.resume_policy);
                resume_task(&graph, &store, task_id, &task_dir, policy, &log).await?;
                (task_dir, store, task.input, log)
            }
            None => {
                let resolved = resolve_inputs(definition, request.input.clone())?;
                let task_id = TaskDir::new_id();
                let task_dir =
                    TaskDir::create(&tasks_dir, &task_id, graph.name(), &resolved.input)?;
                let store = StateStore::new(Database::open(task_dir.db_path())?);
                let mut task = TaskState::new(
                    task_id.clone(),
                    graph.name().to_string(),
                    resolved.input.clone(),
                );
                task.blocks = graph.initial_states();
                store.create(&task).await?;

                let log = Arc::new(RunLog::new(task_dir.log_path()));
                for name in &resolved.defaulted {
                    log.write(format!("INPUT DEFAULT | {}", name));
                }
                for name in &resolved.undeclared {
                    log.write(format!("INPUT WARN | undeclared input field: {}", name));
                }
                (task_dir, store, resolved.input, log)
            }
        };

        let provider = match &self.provider {
            Some(p) => Some(p.clone()),
            None if definition.needs_provider() => {
                Some(create_provider(&definition.provider_settings())?)
            }
            None => None,
        };
        if let Some(p) = &provider {
            log.write(format!("PROVIDER | {} | model={}", p.name(), p.model()));
        }

        let library = AgentLibrary::new(&self.config.agents_dir);
        let team_tone = definition
            .team
            .as_deref()
            .map(|team| library.team_tone(team))
            .unwrap_or_default();

        let runner = Arc::new(BlockRunner::new(
            task_dir.clone(),
            &workflow_dir,
            input.clone(),
            team_tone,
            library,
            provider,
            Duration::from_secs(self.config.hook_timeout_secs),
            log.clone(),
        )
        .with_readable_outputs(definition.readable_outputs));

        let options = SchedulerOptions {
            max_parallel: request.max_parallel.unwrap_or(definition.max_parallel as usize),
            poll_interval: Duration::from_millis(self.config.poll_interval_ms),
            timeout: definition.timeout.map(Duration::from_secs),
        };

        Ok(PreparedTask {
            task_id: task_dir.id().to_string(),
            task_dir,
            store,
            graph,
            input,
            runner,
            log,
            options,
            socket_dir: request.control_socket.then(|| self.config.socket_dir()),
        })
    }

    /// `prepare` then `run`.
    pub async fn run(&self, request: RunRequest) -> Result<TaskReport, ReinError> {
        self.prepare(request).await?.run().await
    }
}

/// A task ready to be driven by the scheduler.
pub struct PreparedTask {
    pub task_id: String,
    pub task_dir: TaskDir,
    pub store: StateStore,
    graph: Arc<WorkflowGraph>,
    input: Value,
    runner: Arc<BlockRunner>,
    log: Arc<RunLog>,
    options: SchedulerOptions,
    socket_dir: Option<PathBuf>,
}

impl PreparedTask {
    pub fn log(&self) -> Arc<RunLog> {
        self.log.clone()
    }

    /// The workflow asked for its final result on stdout.
    pub fn print_final(&self) -> bool {
        self.graph.definition().print_final
    }

    /// Control socket path, when the control channel is enabled.
    pub fn socket_path(&self) -> Option<PathBuf> {
        self.socket_dir
            .as_ref()
            .map(|dir| crate::control::socket_path(dir, &self.task_id))
    }

    pub async fn run(self) -> Result<TaskReport, ReinError> {
        let started = Utc::now();
        self.task_dir.write_status(TaskStatus::Running)?;

        let control = match self.socket_path() {
            Some(path) => Some(
                crate::control::ControlServer::start(
                    path,
                    self.store.clone(),
                    self.task_id.clone(),
                    self.log.clone(),
                )
                .await?,
            ),
            None => None,
        };

        let scheduler = Scheduler::new(
            self.graph.clone(),
            self.store.clone(),
            self.task_id.clone(),
            self.input.clone(),
            self.runner.clone(),
            self.log.clone(),
            self.options.clone(),
        );
        let result = scheduler.run().await;

        if let Some(server) = control {
            server.shutdown().await;
        }

        let outcome = match result {
            Ok(outcome) => outcome,
            Err(e) => {
                self.log.write(format!("REIN ERROR | {}", e));
                self.task_dir.write_status(TaskStatus::Failed)?;
                self.task_dir.write_exit_code(TaskStatus::Failed.exit_code())?;
                self.task_dir.update_task_json(TaskStatus::Failed)?;
                return Err(e);
            }
        };

        self.finalize(&outcome, started)?;
        Ok(TaskReport {
            task_id: self.task_id,
            task_dir: self.task_dir,
            outcome,
        })
    }

    fn finalize(&self, outcome: &RunOutcome, started: DateTime<Utc>) -> Result<(), ReinError> {
        let status = outcome.status;
        self.task_dir.write_status(status)?;
        self.task_dir.write_exit_code(status.exit_code())?;
        self.task_dir.update_task_json(status)?;

        let count = |s: BlockStatus| outcome.blocks.iter().filter(|b| b.status == s).count();
        let block_usage: BTreeMap<&str, Value> = outcome
            .blocks
            .iter()
            .filter_map(|b| {
                b.usage
                    .as_ref()
                    .map(|u| (b.name.as_str(), serde_json::to_value(u).unwrap_or(Value::Null)))
            })
            .collect();
        let summary = json!({
            "task_id": self.task_id,
            "workflow": self.graph.name(),
            "status": status.as_str(),
            "error": outcome.error,
            "started": started.to_rfc3339(),
            "finished": Utc::now().to_rfc3339(),
            "blocks": {
                "total": outcome.blocks.len(),
                "done": count(BlockStatus::Done),
                "failed": count(BlockStatus::Failed),
                "skipped": count(BlockStatus::Skipped),
            },
            "usage": outcome.usage,
            "block_usage": block_usage,
        });
        self.task_dir.write_summary(&summary)?;

        let cost = cost_line(&outcome.usage);
        self.log.write(&cost);
        tracing::info!("{}", cost);
        self.log.write(format!(
            "REIN FINISHED | status={} | completed={} | failed={} | total={}",
            status,
            count(BlockStatus::Done),
            count(BlockStatus::Failed),
            outcome.blocks.len()
        ));
        Ok(())
    }
}

/// What a finished run leaves behind.
#[derive(Debug, Clone)]
pub struct TaskReport {
    pub task_id: String,
    pub task_dir: TaskDir,
    pub outcome: RunOutcome,
}

impl TaskReport {
    pub fn status(&self) -> TaskStatus {
        self.outcome.status
    }

    /// Output of the last `done` block in declaration order.
    pub fn final_output(&self) -> Option<Value> {
        let last = self
            .outcome
            .blocks
            .iter()
            .rev()
            .find(|b| b.status == BlockStatus::Done)?;
        let text = std::fs::read_to_string(self.task_dir.result_path(&last.name)).ok()?;
        serde_json::from_str(&text).ok().map(unwrap_envelope)
    }
}

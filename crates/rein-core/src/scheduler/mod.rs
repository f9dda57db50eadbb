//! Dispatch scheduler: the single writer of block state.
//!
//! ```text
//!            ┌──────────────────── loop ─────────────────────┐
//!  store ──► │ control flags ─► readiness ─► dispatch        │
//!            │        ▲                         │ JoinSet     │
//!            │        └── next / gates ◄── completion ◄──────┘
//!            └────────────────────────────────────────────────┘
//! ```
//!
//! Block executions run concurrently (up to `max_parallel`) but every status
//! transition happens in this loop, which persists it through the
//! [`StateStore`] before anything else observes it. Control requests are
//! never delivered to the loop directly: the control channel flips durable
//! flags and the loop polls them.

pub mod next;
pub mod resume;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde_json::Value;
use tokio::task::{AbortHandle, JoinSet};

use crate::error::ReinError;
use crate::models::{BlockRunState, BlockStatus, TaskStatus};
use crate::provider::UsageStats;
use crate::runner::{BlockRunner, RunResult};
use crate::store::StateStore;
use crate::task_dir::RunLog;
use crate::workflow::WorkflowGraph;

pub use next::{decide, NextDecision};
pub use resume::{reconcile, resume_task, Reconciliation};

#[derive(Debug, Clone)]
pub struct SchedulerOptions {
    pub max_parallel: usize,
    pub poll_interval: Duration,
    /// Wall-clock limit for the whole run.
    pub timeout: Option<Duration>,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            max_parallel: 3,
            poll_interval: Duration::from_millis(500),
            timeout: None,
        }
    }
}

/// Final result of a scheduler run.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub status: TaskStatus,
    pub blocks: Vec<BlockRunState>,
    pub usage: UsageStats,
    pub error: Option<String>,
}

pub struct Scheduler {
    graph: Arc<WorkflowGraph>,
    store: StateStore,
    task_id: String,
    task_input: Value,
    runner: Arc<BlockRunner>,
    log: Arc<RunLog>,
    options: SchedulerOptions,
}

/// Mutable state owned by one `run` call.
struct LoopState {
    blocks: Vec<BlockRunState>,
    /// In-flight executions with the run number they were dispatched as.
    running: HashMap<String, (u32, AbortHandle)>,
    /// Gated blocks whose branch decision has fallen through.
    released: HashSet<String>,
    usage: UsageStats,
    paused: bool,
    halted: Option<String>,
}

impl LoopState {
    fn index(&self, name: &str) -> Option<usize> {
        self.blocks.iter().position(|b| b.name == name)
    }

    fn status(&self, name: &str) -> Option<BlockStatus> {
        self.index(name).map(|i| self.blocks[i].status)
    }

    fn has(&self, status: BlockStatus) -> bool {
        self.blocks.iter().any(|b| b.status == status)
    }
}

impl Scheduler {
    pub fn new(
        graph: Arc<WorkflowGraph>,
        store: StateStore,
        task_id: impl Into<String>,
        task_input: Value,
        runner: Arc<BlockRunner>,
        log: Arc<RunLog>,
        options: SchedulerOptions,
    ) -> Self {
        Self {
            graph,
            store,
            task_id: task_id.into(),
            task_input,
            runner,
            log,
            options,
        }
    }

    /// Drive the task until every block is terminal, the task is cancelled,
    /// or the run halts. Store failures abort the run with `Err`.
    pub async fn run(&self) -> Result<RunOutcome, ReinError> {
        let task = self.store.get(&self.task_id).await?;
        let mut st = LoopState {
            blocks: task.blocks,
            running: HashMap::new(),
            released: HashSet::new(),
            usage: UsageStats::default(),
            paused: false,
            halted: None,
        };
        for block in &st.blocks {
            if let Some(usage) = &block.usage {
                st.usage.accumulate(usage);
            }
        }
        if let Some(name) = self.untolerated_failure(&st) {
            let reason = format!("block '{}' failed before this run", name);
            self.log.write(format!("HALT | {} | continue_if_failed=false", name));
            tracing::warn!("[Scheduler] Halting run: {}", reason);
            st.halted = Some(reason);
        }

        self.store
            .set_task_status(&self.task_id, TaskStatus::Running, None)
            .await?;
        let max_parallel = self.options.max_parallel.max(1);
        self.log.write(format!(
            "REIN STARTED | task={} | workflow={} | blocks={} | max_parallel={}",
            self.task_id,
            self.graph.name(),
            st.blocks.len(),
            max_parallel
        ));
        tracing::info!(
            "[Scheduler] Task {} started ({} blocks, max_parallel={})",
            self.task_id,
            st.blocks.len(),
            max_parallel
        );

        let deadline = self.options.timeout.map(|t| Instant::now() + t);
        let mut join_set: JoinSet<(String, u32, RunResult)> = JoinSet::new();

        let (status, error) = loop {
            let flags = self.store.flags(&self.task_id).await?;

            if flags.cancel_requested {
                self.log.write("WORKFLOW CANCEL | aborting running blocks");
                self.abort_all(&mut st, "cancelled").await?;
                break (TaskStatus::Cancelled, Some("cancelled".to_string()));
            }

            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    let secs = self.options.timeout.map(|t| t.as_secs()).unwrap_or(0);
                    self.log
                        .write(format!("WORKFLOW TIMEOUT | exceeded {}s", secs));
                    self.abort_all(&mut st, "workflow timeout").await?;
                    self.skip_remaining(&mut st, "workflow timeout").await?;
                    break (
                        TaskStatus::Failed,
                        Some(format!("workflow timed out after {}s", secs)),
                    );
                }
            }

            if flags.paused != st.paused {
                st.paused = flags.paused;
                let (msg, status) = if st.paused {
                    ("WORKFLOW PAUSED", TaskStatus::Paused)
                } else {
                    ("WORKFLOW RESUMED", TaskStatus::Running)
                };
                self.log.write(msg);
                tracing::info!("[Scheduler] {}", msg);
                self.store.set_task_status(&self.task_id, status, None).await?;
            }

            self.apply_block_controls(&mut st).await?;
            self.promote_ready(&mut st).await?;

            if !st.paused && st.halted.is_none() {
                self.dispatch(&mut st, &mut join_set, max_parallel).await?;
            }

            if st.running.is_empty() {
                if let Some(reason) = st.halted.clone() {
                    self.skip_remaining(&mut st, "run halted").await?;
                    break (TaskStatus::Failed, Some(reason));
                }
                if st.paused || st.has(BlockStatus::Waiting) {
                    tokio::time::sleep(self.options.poll_interval).await;
                    continue;
                }
                if st.has(BlockStatus::Ready) {
                    continue;
                }
                if self.skip_untaken_branches(&mut st).await? {
                    continue;
                }
                if st.has(BlockStatus::Pending) {
                    self.skip_remaining(&mut st, "unreachable").await?;
                }
                break (TaskStatus::Completed, None);
            }

            tokio::select! {
                joined = join_set.join_next() => {
                    match joined {
                        Some(Ok((name, run, result))) => {
                            self.complete(&mut st, &name, run, result).await?
                        }
                        Some(Err(e)) if e.is_cancelled() => {}
                        Some(Err(e)) => {
                            tracing::error!("[Scheduler] Block task panicked: {}", e);
                            self.log.write(format!("BLOCK PANIC | {}", e));
                        }
                        None => {}
                    }
                }
                _ = tokio::time::sleep(self.options.poll_interval) => {}
            }
        };

        join_set.abort_all();
        self.store
            .set_task_status(&self.task_id, status, error.clone())
            .await?;

        let failed = st.blocks.iter().filter(|b| b.status == BlockStatus::Failed).count();
        if status == TaskStatus::Completed && failed > 0 {
            self.log.write(format!(
                "WARN | {} block(s) failed with continue_if_failed",
                failed
            ));
        }
        tracing::info!("[Scheduler] Task {} finished: {}", self.task_id, status);

        Ok(RunOutcome {
            status,
            blocks: st.blocks,
            usage: st.usage,
            error,
        })
    }

    /// Honour per-block hold and cancel requests.
    async fn apply_block_controls(&self, st: &mut LoopState) -> Result<(), ReinError> {
        let persisted = self.store.blocks.list(&self.task_id).await?;
        for flags in persisted {
            let Some(i) = st.index(&flags.name) else {
                continue;
            };
            st.blocks[i].held = flags.held;

            if flags.cancel_requested {
                let name = flags.name.clone();
                match st.blocks[i].status {
                    BlockStatus::Running => {
                        if let Some((_, handle)) = st.running.remove(&name) {
                            handle.abort();
                        }
                        self.finish_block(st, i, BlockStatus::Failed, Some("cancelled".to_string()))
                            .await?;
                        self.log.write(format!("BLOCK CANCELLED | {} | aborted", name));
                    }
                    BlockStatus::Pending | BlockStatus::Ready | BlockStatus::Waiting => {
                        self.finish_block(st, i, BlockStatus::Skipped, Some("cancelled".to_string()))
                            .await?;
                        self.log.write(format!("BLOCK CANCELLED | {} | skipped", name));
                    }
                    _ => {}
                }
                self.store.blocks.set_cancel_requested(&self.task_id, &name, false).await?;
                continue;
            }

            let status = st.blocks[i].status;
            if flags.held && matches!(status, BlockStatus::Pending | BlockStatus::Ready) {
                st.blocks[i].status = BlockStatus::Waiting;
                self.persist(st, i).await?;
                self.log.write(format!("BLOCK HELD | {}", flags.name));
            } else if !flags.held && status == BlockStatus::Waiting {
                st.blocks[i].status = BlockStatus::Pending;
                self.persist(st, i).await?;
                self.log.write(format!("BLOCK RELEASED | {}", flags.name));
            }
        }
        Ok(())
    }

    /// Move pending blocks whose dependencies are all terminal to `ready`,
    /// or to `skipped` when a failed dependency is not tolerated.
    async fn promote_ready(&self, st: &mut LoopState) -> Result<(), ReinError> {
        loop {
            let mut changed = false;
            for i in 0..st.blocks.len() {
                if st.blocks[i].status != BlockStatus::Pending {
                    continue;
                }
                let name = st.blocks[i].name.clone();
                let Some(spec) = self.graph.block(&name) else {
                    continue;
                };
                if !self.gate_open(st, &name) {
                    continue;
                }

                let mut all_terminal = true;
                let mut failed_dep = None;
                for dep in &spec.depends_on {
                    match st.status(dep) {
                        Some(s) if s.is_terminal() => {
                            if s.is_unsuccessful() && failed_dep.is_none() {
                                failed_dep = Some(dep.clone());
                            }
                        }
                        _ => all_terminal = false,
                    }
                }
                if !all_terminal {
                    continue;
                }

                match failed_dep {
                    Some(dep) if spec.skip_if_previous_failed => {
                        let reason = format!("dependency '{}' did not succeed", dep);
                        self.log.write(format!("BLOCK SKIPPED | {} | {}", name, reason));
                        self.finish_block(st, i, BlockStatus::Skipped, Some(reason)).await?;
                    }
                    _ => {
                        st.blocks[i].status = BlockStatus::Ready;
                        self.persist(st, i).await?;
                    }
                }
                changed = true;
            }
            if !changed {
                return Ok(());
            }
        }
    }

    /// Launch ready blocks in declaration order while slots are free.
    async fn dispatch(
        &self,
        st: &mut LoopState,
        join_set: &mut JoinSet<(String, u32, RunResult)>,
        max_parallel: usize,
    ) -> Result<(), ReinError> {
        for i in 0..st.blocks.len() {
            if st.running.len() >= max_parallel {
                break;
            }
            if st.blocks[i].status != BlockStatus::Ready {
                continue;
            }
            let name = st.blocks[i].name.clone();
            let Some(spec) = self.graph.block(&name).cloned() else {
                continue;
            };

            let state = &mut st.blocks[i];
            state.status = BlockStatus::Running;
            state.run_count += 1;
            state.started_at = Some(Utc::now());
            state.finished_at = None;
            state.last_error = None;
            let run = state.run_count;
            let line = format!(
                "BLOCK STARTED | {} | phase={} | run={}/{}",
                name, state.phase, run, state.max_runs
            );
            self.persist(st, i).await?;
            self.log.write(line);
            tracing::info!("[Scheduler] Dispatching {} (run {})", name, run);

            let runner = self.runner.clone();
            let block_name = name.clone();
            let handle = join_set.spawn(async move {
                let result = runner.run(&spec, run).await;
                (block_name, run, result)
            });
            st.running.insert(name, (run, handle));
        }
        Ok(())
    }

    /// Record a finished execution and apply the block's `next` rule.
    async fn complete(
        &self,
        st: &mut LoopState,
        name: &str,
        run: u32,
        result: RunResult,
    ) -> Result<(), ReinError> {
        match st.running.get(name) {
            Some((current, _)) if *current == run => {
                st.running.remove(name);
            }
            // Aborted by a cancel, or left over from an earlier run.
            _ => return Ok(()),
        }
        let Some(i) = st.index(name) else {
            return Ok(());
        };

        if let Some(usage) = &result.usage {
            st.usage.accumulate(usage);
            st.blocks[i]
                .usage
                .get_or_insert_with(UsageStats::default)
                .accumulate(usage);
        }
        st.blocks[i].output_path = result
            .output_path
            .as_ref()
            .map(|p| p.display().to_string());
        self.finish_block(st, i, result.status, result.error.clone()).await?;

        let Some(spec) = self.graph.block(name) else {
            return Ok(());
        };

        if result.status == BlockStatus::Failed {
            let error = result.error.unwrap_or_default();
            self.log.write(format!("BLOCK FAILED | {} | {}", name, error));
            if !spec.continue_if_failed {
                let reason = format!("block '{}' failed: {}", name, error);
                self.log.write(format!("HALT | {} | continue_if_failed=false", name));
                tracing::warn!("[Scheduler] Halting run: {}", reason);
                st.halted = Some(reason);
            }
            self.release_gates(st, name);
            return Ok(());
        }

        self.log.write(format!(
            "BLOCK DONE | {} | run={}",
            name, st.blocks[i].run_count
        ));
        let output = result.output.unwrap_or(Value::Null);
        let conditional = spec.next.as_ref().is_some_and(|n| n.is_conditional());

        match decide(spec, &output, &self.task_input) {
            NextDecision::Natural => {}
            NextDecision::NoBranch => {
                self.log.write(format!("NEXT | {} | no branch taken", name));
                self.release_gates(st, name);
            }
            NextDecision::Goto { target, reason } => {
                let forced = self.force_ready(st, name, &target, &reason).await?;
                if !forced && conditional {
                    self.release_gates(st, name);
                }
            }
        }
        Ok(())
    }

    /// Returns whether `target` was moved to `ready`.
    async fn force_ready(
        &self,
        st: &mut LoopState,
        source: &str,
        target: &str,
        reason: &str,
    ) -> Result<bool, ReinError> {
        let Some(t) = st.index(target) else {
            return Ok(false);
        };
        let state = &st.blocks[t];
        if state.status == BlockStatus::Running {
            self.log.write(format!("NEXT BLOCKED | {} | already running", target));
            return Ok(false);
        }
        if !state.can_reenter() {
            self.log.write(format!(
                "NEXT BLOCKED | {} | run_count={} >= max_runs={}",
                target, state.run_count, state.max_runs
            ));
            tracing::info!("[Scheduler] Loop bound reached for {}", target);
            return Ok(false);
        }

        let state = &mut st.blocks[t];
        state.status = BlockStatus::Ready;
        state.finished_at = None;
        state.last_error = None;
        self.persist(st, t).await?;
        self.log
            .write(format!("NEXT | {} -> {} | {}", source, target, reason));
        Ok(true)
    }

    fn release_gates(&self, st: &mut LoopState, source: &str) {
        for gated in self.graph.gated_by(source) {
            if st.released.insert(gated.clone()) {
                self.log.write(format!("GATE RELEASED | {} | by {}", gated, source));
            }
        }
    }

    /// Whether `name` may be dispatched by dependency readiness. A gate opens
    /// when released by a branch decision or when a gate source ended
    /// `failed` or `skipped`.
    fn gate_open(&self, st: &LoopState, name: &str) -> bool {
        if !self.graph.is_gated(name) || st.released.contains(name) {
            return true;
        }
        self.graph
            .gate_sources(name)
            .iter()
            .any(|source| st.status(source).is_some_and(|s| s.is_unsuccessful()))
    }

    /// First failed block whose failure the workflow does not tolerate.
    fn untolerated_failure(&self, st: &LoopState) -> Option<String> {
        st.blocks
            .iter()
            .filter(|b| b.status == BlockStatus::Failed)
            .find(|b| {
                self.graph
                    .block(&b.name)
                    .is_some_and(|spec| !spec.continue_if_failed)
            })
            .map(|b| b.name.clone())
    }

    /// Skip gated blocks nobody chose. Returns whether anything changed.
    async fn skip_untaken_branches(&self, st: &mut LoopState) -> Result<bool, ReinError> {
        let mut changed = false;
        for i in 0..st.blocks.len() {
            let name = st.blocks[i].name.clone();
            if st.blocks[i].status == BlockStatus::Pending && !self.gate_open(st, &name) {
                self.log
                    .write(format!("BLOCK SKIPPED | {} | branch not taken", name));
                self.finish_block(st, i, BlockStatus::Skipped, Some("branch not taken".to_string()))
                    .await?;
                changed = true;
            }
        }
        Ok(changed)
    }

    async fn skip_remaining(&self, st: &mut LoopState, reason: &str) -> Result<(), ReinError> {
        for i in 0..st.blocks.len() {
            if matches!(
                st.blocks[i].status,
                BlockStatus::Pending | BlockStatus::Ready | BlockStatus::Waiting
            ) {
                self.log.write(format!(
                    "BLOCK SKIPPED | {} | {}",
                    st.blocks[i].name, reason
                ));
                self.finish_block(st, i, BlockStatus::Skipped, Some(reason.to_string()))
                    .await?;
            }
        }
        Ok(())
    }

    async fn abort_all(&self, st: &mut LoopState, reason: &str) -> Result<(), ReinError> {
        let running: Vec<(String, (u32, AbortHandle))> = st.running.drain().collect();
        for (name, (_, handle)) in running {
            handle.abort();
            if let Some(i) = st.index(&name) {
                self.finish_block(st, i, BlockStatus::Failed, Some(reason.to_string()))
                    .await?;
                self.log.write(format!("BLOCK ABORTED | {} | {}", name, reason));
            }
        }
        Ok(())
    }

    async fn finish_block(
        &self,
        st: &mut LoopState,
        i: usize,
        status: BlockStatus,
        error: Option<String>,
    ) -> Result<(), ReinError> {
        let state = &mut st.blocks[i];
        state.status = status;
        state.finished_at = Some(Utc::now());
        state.last_error = error;
        self.persist(st, i).await
    }

    async fn persist(&self, st: &mut LoopState, i: usize) -> Result<(), ReinError> {
        let state = &mut st.blocks[i];
        state.updated_at = Utc::now();
        self.store.put(&self.task_id, state).await
    }
}

/// `[COST] Total: $x.xxxx | Tokens: N (in:… out:…) | Provider: … | Model: …`
pub fn cost_line(usage: &UsageStats) -> String {
    let mut line = format!(
        "[COST] Total: ${:.4} | Tokens: {} (in:{} out:{})",
        usage.cost, usage.total_tokens, usage.input_tokens, usage.output_tokens
    );
    if !usage.provider.is_empty() {
        line.push_str(&format!(" | Provider: {}", usage.provider));
    }
    if !usage.model.is_empty() {
        line.push_str(&format!(" | Model: {}", usage.model));
    }
    line
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::models::TaskState;
    use crate::task_dir::TaskDir;
    use crate::workflow::{AgentLibrary, WorkflowDefinition};
    use serde_json::json;
    use tempfile::TempDir;

    async fn scheduler(tmp: &TempDir, yaml: &str) -> Scheduler {
        let graph = Arc::new(
            WorkflowGraph::load(WorkflowDefinition::from_yaml(yaml).unwrap()).unwrap(),
        );
        let store = StateStore::new(Database::open_in_memory().unwrap());
        let mut task = TaskState::new("task-1".to_string(), graph.name().to_string(), json!({}));
        task.blocks = graph.initial_states();
        store.create(&task).await.unwrap();

        let task_dir = TaskDir::create(&tmp.path().join("tasks"), "task-1", graph.name(), &json!({}))
            .unwrap();
        let log = Arc::new(RunLog::new(task_dir.log_path()));
        let runner = Arc::new(BlockRunner::new(
            task_dir,
            tmp.path(),
            json!({}),
            String::new(),
            AgentLibrary::new(tmp.path().join("agents")),
            None,
            Duration::from_secs(5),
            log.clone(),
        ));
        Scheduler::new(graph, store, "task-1", json!({}), runner, log, SchedulerOptions::default())
    }

    #[tokio::test]
    async fn test_result_from_earlier_run_is_discarded() {
        let tmp = TempDir::new().unwrap();
        let sched = scheduler(&tmp, "name: t\nblocks:\n  - name: a\n    max_runs: 3\n").await;
        let mut st = LoopState {
            blocks: sched.store.get("task-1").await.unwrap().blocks,
            running: HashMap::new(),
            released: HashSet::new(),
            usage: UsageStats::default(),
            paused: false,
            halted: None,
        };
        st.blocks[0].status = BlockStatus::Running;
        st.blocks[0].run_count = 2;

        let mut pending: JoinSet<()> = JoinSet::new();
        let handle = pending.spawn(std::future::pending::<()>());
        st.running.insert("a".to_string(), (2, handle));

        sched
            .complete(&mut st, "a", 1, RunResult::failed("from run 1"))
            .await
            .unwrap();
        assert_eq!(st.blocks[0].status, BlockStatus::Running);
        assert!(st.running.contains_key("a"));

        sched
            .complete(&mut st, "a", 2, RunResult::failed("from run 2"))
            .await
            .unwrap();
        assert_eq!(st.blocks[0].status, BlockStatus::Failed);
        assert_eq!(st.blocks[0].last_error.as_deref(), Some("from run 2"));
        assert!(st.running.is_empty());
        pending.abort_all();
    }

    #[tokio::test]
    async fn test_restored_untolerated_failure_halts() {
        let tmp = TempDir::new().unwrap();
        let sched = scheduler(
            &tmp,
            "name: t\nblocks:\n  - name: a\n    continue_if_failed: false\n  - name: b\n",
        )
        .await;
        let mut a = sched.store.blocks.get("task-1", "a").await.unwrap().unwrap();
        a.status = BlockStatus::Failed;
        a.last_error = Some("interrupted".to_string());
        sched.store.put("task-1", &a).await.unwrap();

        let outcome = sched.run().await.unwrap();
        assert_eq!(outcome.status, TaskStatus::Failed);
        let b = outcome.blocks.iter().find(|s| s.name == "b").unwrap();
        assert_eq!(b.status, BlockStatus::Skipped);
        assert_eq!(b.last_error.as_deref(), Some("run halted"));
    }

    #[test]
    fn test_cost_line_format() {
        let usage = UsageStats {
            input_tokens: 1200,
            output_tokens: 300,
            total_tokens: 1500,
            cost: 0.0081,
            model: "claude-sonnet-4-20250514".to_string(),
            provider: "anthropic".to_string(),
            duration_ms: 0,
        };
        assert_eq!(
            cost_line(&usage),
            "[COST] Total: $0.0081 | Tokens: 1500 (in:1200 out:300) | Provider: anthropic | Model: claude-sonnet-4-20250514"
        );
        assert_eq!(
            cost_line(&UsageStats::default()),
            "[COST] Total: $0.0000 | Tokens: 0 (in:0 out:0)"
        );
    }
}

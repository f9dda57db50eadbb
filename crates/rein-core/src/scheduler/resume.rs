//! Reconcile persisted block states before a resumed run.

use std::collections::HashSet;

use crate::config::ResumePolicy;
use crate::error::ReinError;
use crate::models::{BlockRunState, BlockStatus};
use crate::store::StateStore;
use crate::task_dir::{RunLog, TaskDir};
use crate::workflow::WorkflowGraph;

/// What reconciliation changed.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Reconciliation {
    /// Invalidated blocks (failed roots plus their dependents), reset to pending.
    pub reset: Vec<String>,
    /// Interrupted blocks recorded as failed.
    pub marked_failed: Vec<String>,
    /// Interrupted blocks moved to `waiting` and held.
    pub held: Vec<String>,
}

/// Apply `policy` to `states` in place.
///
/// `done` blocks stay done unless they depend on an invalidated block.
pub fn reconcile(
    graph: &WorkflowGraph,
    states: &mut [BlockRunState],
    policy: ResumePolicy,
) -> Reconciliation {
    let mut outcome = Reconciliation::default();
    let mut roots = Vec::new();

    for state in states.iter_mut() {
        match state.status {
            BlockStatus::Failed => roots.push(state.name.clone()),
            BlockStatus::Running => match policy {
                ResumePolicy::Rerun => roots.push(state.name.clone()),
                ResumePolicy::MarkFailed => {
                    state.status = BlockStatus::Failed;
                    state.last_error = Some("interrupted".to_string());
                    outcome.marked_failed.push(state.name.clone());
                }
                ResumePolicy::Manual => {
                    state.status = BlockStatus::Waiting;
                    state.held = true;
                    outcome.held.push(state.name.clone());
                }
            },
            BlockStatus::Skipped | BlockStatus::Ready => state.status = BlockStatus::Pending,
            _ => {}
        }
    }

    let invalid: HashSet<String> = graph
        .with_transitive_dependents(roots.iter().map(String::as_str))
        .into_iter()
        .collect();
    for state in states.iter_mut() {
        if invalid.contains(&state.name) && !outcome.held.contains(&state.name) {
            state.reset();
            outcome.reset.push(state.name.clone());
        }
    }
    outcome
}

/// Load, reconcile and persist the states of `task_id`. Invalidated blocks
/// lose their `outputs/` directory.
pub async fn resume_task(
    graph: &WorkflowGraph,
    store: &StateStore,
    task_id: &str,
    task_dir: &TaskDir,
    policy: ResumePolicy,
    log: &RunLog,
) -> Result<Reconciliation, ReinError> {
    let task = store.get(task_id).await?;
    let mut states = task.blocks.clone();

    // Blocks added to the workflow since the task was created.
    let known: HashSet<String> = states.iter().map(|s| s.name.clone()).collect();
    for fresh in graph.initial_states() {
        if !known.contains(&fresh.name) {
            states.push(fresh);
        }
    }

    let outcome = reconcile(graph, &mut states, policy);

    for name in &outcome.reset {
        let outputs = task_dir.block_dir(name).join("outputs");
        if outputs.is_dir() {
            std::fs::remove_dir_all(&outputs)?;
        }
    }
    store.blocks.save_all(task_id, &states).await?;
    for name in &outcome.held {
        store.hold_block(task_id, name).await?;
    }

    // Cancel requests belong to the run that received them.
    if task.flags().cancel_requested {
        store.tasks.set_cancel_requested(task_id, false).await?;
        log.write("RESUME | cleared task cancel request");
    }
    for state in states.iter().filter(|s| s.cancel_requested) {
        store
            .blocks
            .set_cancel_requested(task_id, &state.name, false)
            .await?;
    }

    let done = states.iter().filter(|s| s.status == BlockStatus::Done).count();
    log.write(format!(
        "RESUME | policy={} | done={} | reset={} | marked_failed={} | held={}",
        policy.as_str(),
        done,
        outcome.reset.join(","),
        outcome.marked_failed.join(","),
        outcome.held.join(",")
    ));
    tracing::info!(
        "[Scheduler] Resuming {}: {} done, {} reset",
        task_id,
        done,
        outcome.reset.len()
    );
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::WorkflowDefinition;

    fn graph() -> WorkflowGraph {
        let yaml = r#"
name: t
blocks:
  - name: a
  - name: b
    depends_on: [a]
  - name: c
    depends_on: [b]
  - name: d
"#;
        WorkflowGraph::load(WorkflowDefinition::from_yaml(yaml).unwrap()).unwrap()
    }

    fn states(statuses: &[BlockStatus]) -> Vec<BlockRunState> {
        let mut states = graph().initial_states();
        for (state, status) in states.iter_mut().zip(statuses) {
            state.status = *status;
            if *status != BlockStatus::Pending {
                state.run_count = 1;
            }
        }
        states
    }

    #[test]
    fn test_rerun_resets_interrupted_block_and_dependents() {
        let mut s = states(&[
            BlockStatus::Done,
            BlockStatus::Running,
            BlockStatus::Pending,
            BlockStatus::Done,
        ]);
        let outcome = reconcile(&graph(), &mut s, ResumePolicy::Rerun);

        assert_eq!(outcome.reset, vec!["b", "c"]);
        assert_eq!(s[0].status, BlockStatus::Done);
        assert_eq!(s[1].status, BlockStatus::Pending);
        assert_eq!(s[1].run_count, 0);
        assert_eq!(s[3].status, BlockStatus::Done);
    }

    #[test]
    fn test_failed_block_invalidates_done_dependents() {
        let mut s = states(&[
            BlockStatus::Failed,
            BlockStatus::Done,
            BlockStatus::Skipped,
            BlockStatus::Done,
        ]);
        let outcome = reconcile(&graph(), &mut s, ResumePolicy::Rerun);
        assert_eq!(outcome.reset, vec!["a", "b", "c"]);
        assert!(s[..3].iter().all(|b| b.status == BlockStatus::Pending));
        assert_eq!(s[3].status, BlockStatus::Done);
    }

    #[test]
    fn test_mark_failed_keeps_block_failed() {
        let mut s = states(&[
            BlockStatus::Done,
            BlockStatus::Running,
            BlockStatus::Pending,
            BlockStatus::Ready,
        ]);
        let outcome = reconcile(&graph(), &mut s, ResumePolicy::MarkFailed);
        assert_eq!(outcome.marked_failed, vec!["b"]);
        assert!(outcome.reset.is_empty());
        assert_eq!(s[1].status, BlockStatus::Failed);
        assert_eq!(s[1].last_error.as_deref(), Some("interrupted"));
        assert_eq!(s[3].status, BlockStatus::Pending);
    }

    #[test]
    fn test_manual_holds_interrupted_block() {
        let mut s = states(&[
            BlockStatus::Done,
            BlockStatus::Running,
            BlockStatus::Pending,
            BlockStatus::Pending,
        ]);
        let outcome = reconcile(&graph(), &mut s, ResumePolicy::Manual);
        assert_eq!(outcome.held, vec!["b"]);
        assert_eq!(s[1].status, BlockStatus::Waiting);
        assert!(s[1].held);
    }
}

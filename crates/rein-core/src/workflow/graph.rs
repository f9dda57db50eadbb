//! Validated block graph.
//!
//! `depends_on` edges form the data-dependency DAG. `next`/`goto` edges are
//! control transfers layered on top and never take part in cycle detection.
//!
//! A block that is the target of a conditional `next` on one of its own
//! ancestors is *branch-gated*: ordinary readiness does not dispatch it, the
//! branch decision does.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;

use super::schema::{BlockSpec, NextRule, WorkflowDefinition};
use crate::error::ReinError;
use crate::models::BlockRunState;

pub struct WorkflowGraph {
    definition: WorkflowDefinition,
    index: HashMap<String, usize>,
    phases: Vec<u32>,
    dependents: HashMap<String, Vec<String>>,
    /// target → conditional `next` sources that gate it
    gates: HashMap<String, Vec<String>>,
}

impl WorkflowGraph {
    /// Validate a definition and build the graph.
    pub fn load(definition: WorkflowDefinition) -> Result<Self, ReinError> {
        let errors = validate(&definition);
        if !errors.is_empty() {
            return Err(ReinError::Definition(errors));
        }

        let index: HashMap<String, usize> = definition
            .blocks
            .iter()
            .enumerate()
            .map(|(i, b)| (b.name.clone(), i))
            .collect();

        let mut dependents: HashMap<String, Vec<String>> = definition
            .blocks
            .iter()
            .map(|b| (b.name.clone(), Vec::new()))
            .collect();
        for block in &definition.blocks {
            for dep in &block.depends_on {
                if let Some(list) = dependents.get_mut(dep) {
                    list.push(block.name.clone());
                }
            }
        }

        let mut graph = Self {
            definition,
            index,
            phases: Vec::new(),
            dependents,
            gates: HashMap::new(),
        };
        graph.phases = graph.compute_phases();
        graph.gates = graph.compute_gates();
        Ok(graph)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ReinError> {
        Self::load(WorkflowDefinition::from_file(path)?)
    }

    pub fn definition(&self) -> &WorkflowDefinition {
        &self.definition
    }

    pub fn name(&self) -> &str {
        &self.definition.name
    }

    /// Blocks in declaration order.
    pub fn blocks(&self) -> &[BlockSpec] {
        &self.definition.blocks
    }

    pub fn block(&self, name: &str) -> Option<&BlockSpec> {
        self.index.get(name).map(|&i| &self.definition.blocks[i])
    }

    pub fn position(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    /// Display phase: explicit `phase`, else 1 + max phase of dependencies.
    pub fn phase(&self, name: &str) -> u32 {
        self.index.get(name).map(|&i| self.phases[i]).unwrap_or(1)
    }

    /// Direct dependents in declaration order.
    pub fn dependents(&self, name: &str) -> &[String] {
        self.dependents.get(name).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Every block `name` transitively depends on.
    pub fn ancestors(&self, name: &str) -> HashSet<String> {
        let mut seen = HashSet::new();
        let mut stack: Vec<&str> = self
            .block(name)
            .map(|b| b.depends_on.iter().map(String::as_str).collect())
            .unwrap_or_default();
        while let Some(current) = stack.pop() {
            if seen.insert(current.to_string()) {
                if let Some(block) = self.block(current) {
                    stack.extend(block.depends_on.iter().map(String::as_str));
                }
            }
        }
        seen
    }

    /// The given blocks plus everything downstream of them (BFS order).
    pub fn with_transitive_dependents<'a>(
        &self,
        roots: impl IntoIterator<Item = &'a str>,
    ) -> Vec<String> {
        let mut seen = HashSet::new();
        let mut order = Vec::new();
        let mut queue: VecDeque<String> = roots.into_iter().map(str::to_string).collect();
        while let Some(name) = queue.pop_front() {
            if !seen.insert(name.clone()) {
                continue;
            }
            for dependent in self.dependents(&name) {
                queue.push_back(dependent.clone());
            }
            order.push(name);
        }
        order
    }

    /// Conditional `next` sources gating `name`. Empty when not gated.
    pub fn gate_sources(&self, name: &str) -> &[String] {
        self.gates.get(name).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn is_gated(&self, name: &str) -> bool {
        !self.gate_sources(name).is_empty()
    }

    /// Blocks gated by `source`'s conditional `next`.
    pub fn gated_by(&self, source: &str) -> Vec<String> {
        self.blocks()
            .iter()
            .filter(|b| self.gate_sources(&b.name).iter().any(|s| s == source))
            .map(|b| b.name.clone())
            .collect()
    }

    /// Blocks grouped by phase, ascending, each group in declaration order.
    pub fn execution_phases(&self) -> Vec<Vec<String>> {
        let max = self.phases.iter().copied().max().unwrap_or(0);
        (1..=max)
            .map(|phase| {
                self.blocks()
                    .iter()
                    .enumerate()
                    .filter(|(i, _)| self.phases[*i] == phase)
                    .map(|(_, b)| b.name.clone())
                    .collect::<Vec<_>>()
            })
            .filter(|group| !group.is_empty())
            .collect()
    }

    /// Fresh `pending` state for every block.
    pub fn initial_states(&self) -> Vec<BlockRunState> {
        self.blocks()
            .iter()
            .enumerate()
            .map(|(i, b)| BlockRunState::new(&b.name, b.max_runs, self.phases[i], i as u32))
            .collect()
    }

    fn compute_phases(&self) -> Vec<u32> {
        // Validation guarantees the dependency relation is acyclic.
        fn depth(graph: &WorkflowGraph, i: usize, memo: &mut Vec<Option<u32>>) -> u32 {
            if let Some(d) = memo[i] {
                return d;
            }
            let block = &graph.definition.blocks[i];
            let d = block
                .depends_on
                .iter()
                .filter_map(|dep| graph.index.get(dep))
                .map(|&j| depth(graph, j, memo))
                .max()
                .map(|m| m + 1)
                .unwrap_or(1);
            memo[i] = Some(d);
            d
        }

        let mut memo = vec![None; self.definition.blocks.len()];
        (0..self.definition.blocks.len())
            .map(|i| {
                let natural = depth(self, i, &mut memo);
                self.definition.blocks[i].phase.unwrap_or(natural)
            })
            .collect()
    }

    fn compute_gates(&self) -> HashMap<String, Vec<String>> {
        let mut gates: HashMap<String, Vec<String>> = HashMap::new();
        for block in self.blocks() {
            let Some(rule @ NextRule::Branches(_)) = &block.next else {
                continue;
            };
            for target in rule.targets() {
                if self.ancestors(target).contains(&block.name) {
                    let sources = gates.entry(target.to_string()).or_default();
                    if !sources.contains(&block.name) {
                        sources.push(block.name.clone());
                    }
                }
            }
        }
        gates
    }
}

// ─── Validation ─────────────────────────────────────────────────────────

static WORKFLOW_NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9-]+$").expect("valid regex"));
static TEAM_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^team-[a-z0-9-]+$").expect("valid regex"));
static BLOCK_NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9_]+$").expect("valid regex"));
/// Top-level task directory entries a block directory must not collide with.
const RESERVED_BLOCK_NAMES: [&str; 2] = ["input", "state"];

static INPUT_REF_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{\{\s*task\.input\.(\w+)").expect("valid regex"));

/// Collect every problem with a definition. Empty means valid.
pub fn validate(def: &WorkflowDefinition) -> Vec<String> {
    let mut errors = Vec::new();

    if !WORKFLOW_NAME_RE.is_match(&def.name) {
        errors.push(format!(
            "workflow name '{}' must match ^[a-z0-9-]+$",
            def.name
        ));
    }
    if let Some(team) = &def.team {
        if !TEAM_RE.is_match(team) {
            errors.push(format!("team '{}' must match ^team-[a-z0-9-]+$", team));
        }
    }
    if !(1..=10).contains(&def.max_parallel) {
        errors.push(format!(
            "max_parallel must be between 1 and 10 (got {})",
            def.max_parallel
        ));
    }
    if let Some(t) = def.timeout {
        if !(30..=86400).contains(&t) {
            errors.push(format!("workflow timeout must be between 30 and 86400 seconds (got {})", t));
        }
    }
    if def.blocks.is_empty() {
        errors.push("workflow must declare at least one block".to_string());
    }

    if let Some(inputs) = &def.inputs {
        for (name, field) in inputs {
            if field.required && field.default.is_some() {
                errors.push(format!(
                    "input '{}': 'default' only valid when required=false",
                    name
                ));
            }
        }
    }

    let mut seen = HashSet::new();
    for block in &def.blocks {
        if !seen.insert(block.name.as_str()) {
            errors.push(format!("duplicate block name '{}'", block.name));
        }
    }
    let names: HashSet<&str> = def.blocks.iter().map(|b| b.name.as_str()).collect();

    for block in &def.blocks {
        validate_block(def, block, &names, &mut errors);
    }

    if let Some(cycle) = find_cycle(def) {
        errors.push(format!("Circular dependency detected: {}", cycle.join(" -> ")));
    }

    errors
}

fn validate_block(
    def: &WorkflowDefinition,
    block: &BlockSpec,
    names: &HashSet<&str>,
    errors: &mut Vec<String>,
) {
    let name = &block.name;
    if !BLOCK_NAME_RE.is_match(name) {
        errors.push(format!("block name '{}' must match ^[a-z0-9_]+$", name));
    }
    if RESERVED_BLOCK_NAMES.contains(&name.as_str()) {
        errors.push(format!(
            "block name '{}' is reserved for the task directory layout",
            name
        ));
    }
    if let Some(specialist) = &block.specialist {
        if !WORKFLOW_NAME_RE.is_match(specialist) {
            errors.push(format!(
                "block '{}': specialist '{}' must match ^[a-z0-9-]+$",
                name, specialist
            ));
        }
    }
    if !(1..=10).contains(&block.max_runs) {
        errors.push(format!(
            "block '{}': max_runs must be between 1 and 10 (got {})",
            name, block.max_runs
        ));
    }
    if let Some(phase) = block.phase {
        if !(1..=10).contains(&phase) {
            errors.push(format!(
                "block '{}': phase must be between 1 and 10 (got {})",
                name, phase
            ));
        }
    }
    if let Some(t) = block.timeout {
        if !(30..=7200).contains(&t) {
            errors.push(format!(
                "block '{}': timeout must be between 30 and 7200 seconds (got {})",
                name, t
            ));
        }
    }

    for dep in &block.depends_on {
        if dep == name {
            errors.push(format!("block '{}' depends on itself", name));
        } else if !names.contains(dep.as_str()) {
            errors.push(format!(
                "block '{}' depends on non-existent block '{}'",
                name, dep
            ));
        }
    }

    if let Some(rule) = &block.next {
        if let NextRule::Branches(branches) = rule {
            for (i, branch) in branches.iter().enumerate() {
                if branch.target().is_none() {
                    errors.push(format!(
                        "block '{}': next entry {} has no goto/else target",
                        name,
                        i + 1
                    ));
                }
                if !branch.is_else() && branch.condition.is_none() {
                    errors.push(format!(
                        "block '{}': next entry {} needs an 'if' condition or 'else'",
                        name,
                        i + 1
                    ));
                }
            }
        }
        for target in rule.targets() {
            if !names.contains(target) {
                errors.push(format!(
                    "block '{}': next target '{}' does not exist",
                    name, target
                ));
            }
        }
    }

    if let Some(inputs) = &def.inputs {
        let mut undeclared = BTreeSet::new();
        for caps in INPUT_REF_RE.captures_iter(&block.prompt) {
            let field = &caps[1];
            if !inputs.contains_key(field) {
                undeclared.insert(field.to_string());
            }
        }
        for field in undeclared {
            errors.push(format!(
                "block '{}' uses undeclared input 'task.input.{}'. Add it to 'inputs:' section.",
                name, field
            ));
        }
    }
}

/// First `depends_on` cycle found, as a closed path (`a -> b -> a`).
fn find_cycle(def: &WorkflowDefinition) -> Option<Vec<String>> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        New,
        Active,
        Finished,
    }

    fn visit<'a>(
        name: &'a str,
        deps: &HashMap<&'a str, Vec<&'a str>>,
        marks: &mut HashMap<&'a str, Mark>,
        path: &mut Vec<&'a str>,
    ) -> Option<Vec<String>> {
        marks.insert(name, Mark::Active);
        path.push(name);
        for &dep in deps.get(name).map(Vec::as_slice).unwrap_or(&[]) {
            match marks.get(dep).copied().unwrap_or(Mark::Finished) {
                Mark::Active => {
                    let start = path.iter().position(|n| *n == dep).unwrap_or(0);
                    let mut cycle: Vec<String> =
                        path[start..].iter().map(|s| s.to_string()).collect();
                    cycle.push(dep.to_string());
                    return Some(cycle);
                }
                Mark::New => {
                    if let Some(cycle) = visit(dep, deps, marks, path) {
                        return Some(cycle);
                    }
                }
                Mark::Finished => {}
            }
        }
        path.pop();
        marks.insert(name, Mark::Finished);
        None
    }

    let deps: HashMap<&str, Vec<&str>> = def
        .blocks
        .iter()
        .map(|b| {
            (
                b.name.as_str(),
                b.depends_on
                    .iter()
                    .map(String::as_str)
                    .filter(|d| *d != b.name)
                    .collect(),
            )
        })
        .collect();
    let mut marks: HashMap<&str, Mark> = deps.keys().map(|k| (*k, Mark::New)).collect();

    for block in &def.blocks {
        if marks.get(block.name.as_str()) == Some(&Mark::New) {
            let mut path = Vec::new();
            if let Some(cycle) = visit(&block.name, &deps, &mut marks, &mut path) {
                return Some(cycle);
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph(yaml: &str) -> Result<WorkflowGraph, ReinError> {
        WorkflowGraph::load(WorkflowDefinition::from_yaml(yaml).unwrap())
    }

    fn errors(yaml: &str) -> Vec<String> {
        match graph(yaml) {
            Err(ReinError::Definition(errs)) => errs,
            Err(other) => panic!("unexpected error {:?}", other),
            Ok(_) => Vec::new(),
        }
    }

    #[test]
    fn test_phases_from_dependencies() {
        let g = graph(
            r#"
name: phases
blocks:
  - name: a
  - name: b
  - name: c
    depends_on: [a, b]
  - name: d
    depends_on: [c]
  - name: e
    depends_on: [a]
    phase: 7
"#,
        )
        .unwrap();
        assert_eq!(g.phase("a"), 1);
        assert_eq!(g.phase("b"), 1);
        assert_eq!(g.phase("c"), 2);
        assert_eq!(g.phase("d"), 3);
        assert_eq!(g.phase("e"), 7);
        assert_eq!(
            g.execution_phases(),
            vec![
                vec!["a".to_string(), "b".to_string()],
                vec!["c".to_string()],
                vec!["d".to_string()],
                vec!["e".to_string()],
            ]
        );
        assert_eq!(g.dependents("a"), &["c".to_string(), "e".to_string()]);
    }

    #[test]
    fn test_cycle_is_named() {
        let errs = errors(
            r#"
name: loop
blocks:
  - name: a
    depends_on: [c]
  - name: b
    depends_on: [a]
  - name: c
    depends_on: [b]
"#,
        );
        assert_eq!(errs.len(), 1);
        assert!(errs[0].starts_with("Circular dependency detected: "));
        assert!(errs[0].contains("a -> c -> b -> a"));
    }

    #[test]
    fn test_next_edges_do_not_count_as_cycles() {
        let g = graph(
            r#"
name: revise
blocks:
  - name: gate
    max_runs: 3
    next:
      - if: "{{ result.approved }}"
        goto: publish
      - else: revision
  - name: revision
    depends_on: [gate]
    max_runs: 2
    next: gate
  - name: publish
    depends_on: [gate]
"#,
        );
        assert!(g.is_ok());
    }

    #[test]
    fn test_collects_every_problem() {
        let errs = errors(
            r#"
name: Bad_Name
team: writers
max_parallel: 11
blocks:
  - name: a
    max_runs: 0
    depends_on: [a, ghost]
    next: nowhere
  - name: a
  - name: Upper
    timeout: 5
"#,
        );
        let joined = errs.join("\n");
        assert!(joined.contains("workflow name 'Bad_Name'"));
        assert!(joined.contains("team 'writers'"));
        assert!(joined.contains("max_parallel must be between 1 and 10"));
        assert!(joined.contains("max_runs must be between 1 and 10"));
        assert!(joined.contains("block 'a' depends on itself"));
        assert!(joined.contains("non-existent block 'ghost'"));
        assert!(joined.contains("next target 'nowhere' does not exist"));
        assert!(joined.contains("duplicate block name 'a'"));
        assert!(joined.contains("block name 'Upper'"));
        assert!(joined.contains("timeout must be between 30 and 7200"));
    }

    #[test]
    fn test_reserved_block_names_rejected() {
        let errs = errors(
            r#"
name: reserved
blocks:
  - name: state
  - name: input
    depends_on: [state]
  - name: states
"#,
        );
        assert_eq!(errs.len(), 2, "{:?}", errs);
        assert!(errs.iter().any(|e| e.contains("'state' is reserved")));
        assert!(errs.iter().any(|e| e.contains("'input' is reserved")));
    }

    #[test]
    fn test_inputs_must_cover_prompt_references() {
        let errs = errors(
            r#"
name: inputs
inputs:
  topic:
    description: "subject"
  tone:
    required: true
    default: "calm"
blocks:
  - name: a
    prompt: "{{ task.input.topic }} for {{ task.input.audience }}"
"#,
        );
        let joined = errs.join("\n");
        assert!(joined.contains("undeclared input 'task.input.audience'"));
        assert!(joined.contains("input 'tone': 'default' only valid when required=false"));
        assert!(!joined.contains("task.input.topic'"));
    }

    #[test]
    fn test_branch_targets_below_source_are_gated() {
        let g = graph(
            r#"
name: gated
blocks:
  - name: draft
  - name: gate
    depends_on: [draft]
    next:
      - if: "{{ result.approved }}"
        goto: publish
      - else: draft
  - name: publish
    depends_on: [gate]
  - name: archive
    depends_on: [publish]
"#,
        )
        .unwrap();
        assert_eq!(g.gate_sources("publish"), &["gate".to_string()]);
        // `draft` is upstream of `gate`, so it is a plain re-entry target.
        assert!(!g.is_gated("draft"));
        assert!(!g.is_gated("archive"));
        assert_eq!(g.gated_by("gate"), vec!["publish".to_string()]);
    }

    #[test]
    fn test_transitive_dependents_bfs() {
        let g = graph(
            r#"
name: chain
blocks:
  - name: a
  - name: b
    depends_on: [a]
  - name: c
    depends_on: [b]
  - name: d
"#,
        )
        .unwrap();
        assert_eq!(g.with_transitive_dependents(["a"]), vec!["a", "b", "c"]);
        let expected: HashSet<String> = ["a", "b"].iter().map(|s| s.to_string()).collect();
        assert_eq!(g.ancestors("c"), expected);

        let states = g.initial_states();
        assert_eq!(states.len(), 4);
        assert_eq!(states[2].name, "c");
        assert_eq!(states[2].phase, 3);
        assert_eq!(states[2].position, 2);
    }
}

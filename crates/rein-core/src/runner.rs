//! Executes one block to completion.
//!
//! ```text
//! render prompt ─► inputs/prompt.txt ─► pre ─► provider | custom
//!     ─► outputs/result.json.pending ─► validate ─► post ─► outputs/result.json
//! ```
//!
//! Block failures are never `Err` at this level: they come back as a
//! [`RunResult`] with status `failed` so the scheduler can apply the
//! workflow's failure policy.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::{json, Value};

use crate::error::ReinError;
use crate::hooks::{HookContext, HookKind, HookRunner};
use crate::models::BlockStatus;
use crate::provider::{Provider, UsageStats};
use crate::task_dir::{RunLog, TaskDir};
use crate::template::{self, TemplateContext};
use crate::workflow::{AgentLibrary, BlockSpec, CustomLogic};

/// Terminal outcome of one block execution.
#[derive(Debug, Clone)]
pub struct RunResult {
    pub status: BlockStatus,
    /// The persisted result envelope.
    pub output: Option<Value>,
    pub output_path: Option<PathBuf>,
    pub usage: Option<UsageStats>,
    pub error: Option<String>,
}

impl RunResult {
    fn done(output: Value, path: PathBuf, usage: Option<UsageStats>) -> Self {
        Self {
            status: BlockStatus::Done,
            output: Some(output),
            output_path: Some(path),
            usage,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: BlockStatus::Failed,
            output: None,
            output_path: None,
            usage: None,
            error: Some(error.into()),
        }
    }
}

/// Per-task dependencies of the runner.
pub struct BlockRunner {
    task_dir: TaskDir,
    workflow_dir: PathBuf,
    task_input: Value,
    team_tone: String,
    library: AgentLibrary,
    provider: Option<Arc<dyn Provider>>,
    hooks: HookRunner,
    log: Arc<RunLog>,
    readable_outputs: bool,
}

impl BlockRunner {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        task_dir: TaskDir,
        workflow_dir: impl Into<PathBuf>,
        task_input: Value,
        team_tone: String,
        library: AgentLibrary,
        provider: Option<Arc<dyn Provider>>,
        hook_timeout: Duration,
        log: Arc<RunLog>,
    ) -> Self {
        let workflow_dir = workflow_dir.into();
        let hooks = HookRunner::new(&workflow_dir, task_dir.root(), hook_timeout, log.clone());
        Self {
            task_dir,
            workflow_dir,
            task_input,
            team_tone,
            library,
            provider,
            hooks,
            log,
            readable_outputs: false,
        }
    }

    /// Also write `outputs/result.md` for every finished block.
    pub fn with_readable_outputs(mut self, enabled: bool) -> Self {
        self.readable_outputs = enabled;
        self
    }

    /// Run `block` for its `run`-th execution.
    pub async fn run(&self, block: &BlockSpec, run: u32) -> RunResult {
        let outcome = match block.timeout {
            Some(secs) => {
                match tokio::time::timeout(Duration::from_secs(secs), self.execute(block, run)).await
                {
                    Ok(result) => result,
                    Err(_) => Err(ReinError::Internal(format!("timed out after {}s", secs))),
                }
            }
            None => self.execute(block, run).await,
        };

        match outcome {
            Ok(result) => result,
            Err(e) => {
                tracing::warn!("[BlockRunner] {} failed: {}", block.name, e);
                RunResult::failed(e.to_string())
            }
        }
    }

    async fn execute(&self, block: &BlockSpec, run: u32) -> Result<RunResult, ReinError> {
        let dirs = BlockDirs::prepare(&self.task_dir, &block.name)?;
        let hooks = block.hooks();

        for dep in &block.depends_on {
            if self.task_dir.result_path(dep).is_file() {
                self.log
                    .write(format!("INPUT DEP | {} <- {}/outputs/result.json", block.name, dep));
            } else {
                self.log.write(format!(
                    "INPUT WARN | {} | dependency has no output: {}",
                    block.name, dep
                ));
            }
        }

        let prompt = self.build_prompt(block)?;
        std::fs::write(&dirs.prompt_file, &prompt)?;

        let context = self.hook_context(block, &dirs)?;

        if let Some(script) = &hooks.pre {
            self.run_hook(HookKind::Pre, script, &context).await?;
        }
        let prompt = std::fs::read_to_string(&dirs.prompt_file)?;

        let mut usage = None;
        match hooks.custom.as_ref() {
            Some(CustomLogic::Skip(true)) => {
                self.log.write(format!("CUSTOM | {} | provider skipped", block.name));
                self.normalize_staged(block, run, &dirs)?;
            }
            Some(CustomLogic::Script(script)) => {
                self.run_hook(HookKind::Custom, script, &context).await?;
                self.normalize_staged(block, run, &dirs)?;
            }
            _ => {
                let provider = self.provider.as_ref().ok_or_else(|| {
                    ReinError::Provider("no provider configured".to_string())
                })?;
                self.log.write(format!(
                    "PROVIDER CALL | {} | {} | prompt_len={}",
                    block.name,
                    provider.name(),
                    prompt.len()
                ));
                let completion = provider.call(&prompt, &block.name).await?;
                let envelope = envelope(block, run, Value::String(completion.text), Some(&completion.usage));
                write_json(&dirs.staged, &envelope)?;
                usage = Some(completion.usage);
            }
        }

        if let Some(script) = &hooks.validate {
            if let Err(e) = self.run_hook(HookKind::Validate, script, &context).await {
                remove_quietly(&dirs.staged);
                return Err(e);
            }
        }
        if let Some(script) = &hooks.post {
            if let Err(e) = self.run_hook(HookKind::Post, script, &context).await {
                remove_quietly(&dirs.staged);
                return Err(e);
            }
        }

        let output = read_json(&dirs.staged).map_err(|e| {
            remove_quietly(&dirs.staged);
            e
        })?;
        std::fs::rename(&dirs.staged, &dirs.result)?;

        self.log.write(format!(
            "BLOCK OUTPUT | {} | {}",
            block.name,
            dirs.result.display()
        ));
        if self.readable_outputs {
            let result = output.get("result").unwrap_or(&Value::Null);
            match crate::output::save_readable_output(&dirs.result, &block.name, result) {
                Ok(path) => self.log.write(format!(
                    "READABLE OUTPUT | {} | saved={}",
                    block.name,
                    path.display()
                )),
                Err(e) => self
                    .log
                    .write(format!("READABLE OUTPUT ERROR | {} | {}", block.name, e)),
            }
        }
        Ok(RunResult::done(output, dirs.result, usage))
    }

    /// Render the block prompt and wrap it with team tone and specialist text.
    fn build_prompt(&self, block: &BlockSpec) -> Result<String, ReinError> {
        let ctx = TemplateContext::new(
            self.task_input.clone(),
            self.task_dir.root(),
            &self.workflow_dir,
        );
        let rendered = template::render(&block.prompt, &ctx)?;
        let Some(specialist) = block.specialist.as_deref() else {
            return Ok(rendered);
        };
        let specialist_text = self.library.specialist_text(specialist);
        let prompt = template::assemble_prompt(&self.team_tone, &specialist_text, &rendered);
        self.log.write(format!(
            "ASSEMBLED PROMPT | {} | len={}",
            block.name,
            prompt.len()
        ));
        Ok(prompt)
    }

    fn hook_context(&self, block: &BlockSpec, dirs: &BlockDirs) -> Result<HookContext, ReinError> {
        Ok(HookContext {
            output_file: dirs.staged.clone(),
            workflow_dir: self.workflow_dir.clone(),
            task_dir: self.task_dir.root().to_path_buf(),
            task_id: self.task_dir.id().to_string(),
            task_input: self.task_input.clone(),
            block_dir: dirs.block.clone(),
            outputs_dir: dirs.outputs.clone(),
            input_dir: dirs.inputs.clone(),
            depends_on: block.depends_on.clone(),
            block_config: serde_json::to_value(block)
                .map_err(|e| ReinError::Internal(format!("block config: {}", e)))?,
            prompt_file: dirs.prompt_file.clone(),
            hook: String::new(),
        })
    }

    async fn run_hook(
        &self,
        kind: HookKind,
        script: &str,
        context: &HookContext,
    ) -> Result<(), ReinError> {
        let outcome = self.hooks.run(kind, script, context).await?;
        if outcome.success() {
            Ok(())
        } else {
            Err(ReinError::Hook(format!(
                "{} hook {} exited with {}",
                kind.as_str(),
                script,
                outcome
                    .exit_code
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "signal".to_string())
            )))
        }
    }

    /// Make sure a custom step left a result envelope in the staged file.
    fn normalize_staged(&self, block: &BlockSpec, run: u32, dirs: &BlockDirs) -> Result<(), ReinError> {
        let raw = std::fs::read_to_string(&dirs.staged).unwrap_or_default();
        if raw.trim().is_empty() {
            return Err(ReinError::Hook(format!(
                "custom step for '{}' produced no output at {}",
                block.name,
                dirs.staged.display()
            )));
        }
        let value = serde_json::from_str::<Value>(&raw).unwrap_or(Value::String(raw));
        if value.get("result").is_some() {
            return Ok(());
        }
        write_json(&dirs.staged, &envelope(block, run, value, None))
    }
}

struct BlockDirs {
    block: PathBuf,
    inputs: PathBuf,
    outputs: PathBuf,
    prompt_file: PathBuf,
    staged: PathBuf,
    result: PathBuf,
}

impl BlockDirs {
    fn prepare(task_dir: &TaskDir, name: &str) -> Result<Self, ReinError> {
        let block = task_dir.block_dir(name);
        let inputs = block.join("inputs");
        let outputs = block.join("outputs");
        for dir in [&inputs, &outputs, &block.join("logs")] {
            std::fs::create_dir_all(dir)?;
        }
        let staged = outputs.join("result.json.pending");
        remove_quietly(&staged);
        Ok(Self {
            prompt_file: inputs.join("prompt.txt"),
            result: outputs.join("result.json"),
            staged,
            block,
            inputs,
            outputs,
        })
    }
}

fn envelope(block: &BlockSpec, run: u32, result: Value, usage: Option<&UsageStats>) -> Value {
    let mut env = json!({
        "stage": block.name,
        "result": result,
        "timestamp": Utc::now().to_rfc3339(),
        "run": run,
    });
    if let Some(usage) = usage {
        env["usage"] = serde_json::to_value(usage).unwrap_or(Value::Null);
    }
    env
}

fn write_json(path: &Path, value: &Value) -> Result<(), ReinError> {
    let text = serde_json::to_string_pretty(value)
        .map_err(|e| ReinError::Internal(format!("serialize output: {}", e)))?;
    std::fs::write(path, text)?;
    Ok(())
}

fn read_json(path: &Path) -> Result<Value, ReinError> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| ReinError::Internal(format!("staged output missing: {}", e)))?;
    serde_json::from_str(&text)
        .map_err(|e| ReinError::Internal(format!("malformed output in {}: {}", path.display(), e)))
}

fn remove_quietly(path: &Path) {
    if path.exists() {
        if let Err(e) = std::fs::remove_file(path) {
            tracing::warn!("[BlockRunner] Could not remove {}: {}", path.display(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::ScriptedProvider;
    use crate::workflow::WorkflowDefinition;
    use tempfile::TempDir;

    struct Fixture {
        _tmp: TempDir,
        workflow_dir: PathBuf,
        task_dir: TaskDir,
        provider: Arc<ScriptedProvider>,
    }

    fn fixture(provider: ScriptedProvider) -> Fixture {
        let tmp = TempDir::new().unwrap();
        let workflow_dir = tmp.path().join("flow");
        let agents = tmp.path().join("agents");
        std::fs::create_dir_all(workflow_dir.join("logic")).unwrap();
        std::fs::create_dir_all(agents.join("specialists")).unwrap();
        std::fs::write(agents.join("specialists/writer.md"), "You write.").unwrap();
        let task_dir = TaskDir::create(&tmp.path().join("tasks"), "task-1", "demo", &json!({})).unwrap();
        Fixture {
            _tmp: tmp,
            workflow_dir,
            task_dir,
            provider: Arc::new(provider),
        }
    }

    fn runner(f: &Fixture) -> BlockRunner {
        let agents = f.workflow_dir.parent().unwrap().join("agents");
        BlockRunner::new(
            f.task_dir.clone(),
            &f.workflow_dir,
            json!({"topic": "owls"}),
            "Be kind.".to_string(),
            AgentLibrary::new(agents),
            Some(f.provider.clone() as Arc<dyn Provider>),
            Duration::from_secs(10),
            Arc::new(RunLog::new(f.task_dir.log_path())),
        )
    }

    fn block(yaml: &str) -> BlockSpec {
        let def = WorkflowDefinition::from_yaml(&format!("name: t\nblocks:\n{}", yaml)).unwrap();
        def.blocks[0].clone()
    }

    #[tokio::test]
    async fn test_provider_output_written_as_envelope() {
        let f = fixture(ScriptedProvider::new().respond("draft", r#"{"title": "Owls"}"#));
        let b = block("  - name: draft\n    specialist: writer\n    prompt: \"About {{ task.input.topic }}\"\n");

        let result = runner(&f).run(&b, 1).await;
        assert_eq!(result.status, BlockStatus::Done, "{:?}", result.error);

        let saved: Value = serde_json::from_str(
            &std::fs::read_to_string(f.task_dir.result_path("draft")).unwrap(),
        )
        .unwrap();
        assert_eq!(saved["stage"], "draft");
        assert_eq!(saved["run"], 1);
        assert_eq!(saved["result"], r#"{"title": "Owls"}"#);
        assert!(saved["usage"].is_object());
        assert!(!f.task_dir.block_dir("draft").join("outputs/result.json.pending").exists());

        let prompt = f.provider.last_prompt("draft").unwrap();
        assert_eq!(prompt, "Be kind.\n\nYou write.\n\n---\n\nAbout owls");
        let on_disk =
            std::fs::read_to_string(f.task_dir.block_dir("draft").join("inputs/prompt.txt")).unwrap();
        assert_eq!(on_disk, prompt);
    }

    #[tokio::test]
    async fn test_readable_output_written_when_enabled() {
        let f = fixture(ScriptedProvider::new().respond("draft", r#"{"key_points": ["owls hoot"]}"#));
        let b = block("  - name: draft\n    prompt: go\n");

        let result = runner(&f).with_readable_outputs(true).run(&b, 1).await;
        assert_eq!(result.status, BlockStatus::Done, "{:?}", result.error);
        let md = std::fs::read_to_string(f.task_dir.block_dir("draft").join("outputs/result.md")).unwrap();
        assert!(md.starts_with("# draft\n"));
        assert!(md.contains("## Key Points\n\n- owls hoot"));
        let log = std::fs::read_to_string(f.task_dir.log_path()).unwrap();
        assert!(log.contains("READABLE OUTPUT | draft | saved="));

        let quiet = fixture(ScriptedProvider::new());
        let result = runner(&quiet).run(&b, 1).await;
        assert_eq!(result.status, BlockStatus::Done);
        assert!(!quiet.task_dir.block_dir("draft").join("outputs/result.md").exists());
    }

    #[tokio::test]
    async fn test_unresolved_placeholder_fails_block() {
        let f = fixture(ScriptedProvider::new());
        let b = block("  - name: draft\n    prompt: \"{{ task.input.missing }}\"\n");
        let result = runner(&f).run(&b, 1).await;
        assert_eq!(result.status, BlockStatus::Failed);
        assert!(result.error.unwrap().contains("task.input.missing"));
        assert_eq!(f.provider.call_count("draft"), 0);
    }

    #[tokio::test]
    async fn test_validate_failure_leaves_no_output() {
        let f = fixture(ScriptedProvider::new());
        std::fs::write(f.workflow_dir.join("logic/reject.sh"), "exit 1\n").unwrap();
        let b = block("  - name: draft\n    prompt: go\n    logic:\n      validate: logic/reject.sh\n");

        let result = runner(&f).run(&b, 1).await;
        assert_eq!(result.status, BlockStatus::Failed);
        assert!(result.error.unwrap().contains("validate hook"));
        let outputs = f.task_dir.block_dir("draft").join("outputs");
        assert!(!outputs.join("result.json").exists());
        assert!(!outputs.join("result.json.pending").exists());
    }

    #[tokio::test]
    async fn test_custom_script_output_is_wrapped() {
        let f = fixture(ScriptedProvider::new());
        std::fs::write(
            f.workflow_dir.join("logic/produce.sh"),
            "cat > /dev/null\necho '{\"count\": 3}' > tally/outputs/result.json.pending\n",
        )
        .unwrap();
        let b = block("  - name: tally\n    logic:\n      custom: logic/produce.sh\n");

        let result = runner(&f).run(&b, 2).await;
        assert_eq!(result.status, BlockStatus::Done, "{:?}", result.error);
        let output = result.output.unwrap();
        assert_eq!(output["result"]["count"], 3);
        assert_eq!(output["run"], 2);
        assert!(result.usage.is_none());
        assert_eq!(f.provider.call_count("tally"), 0);
    }

    #[tokio::test]
    async fn test_custom_skip_without_output_fails() {
        let f = fixture(ScriptedProvider::new());
        let b = block("  - name: noop\n    logic:\n      custom: true\n");
        let result = runner(&f).run(&b, 1).await;
        assert_eq!(result.status, BlockStatus::Failed);
        assert!(result.error.unwrap().contains("produced no output"));
    }

    #[tokio::test]
    async fn test_provider_error_fails_block() {
        let f = fixture(ScriptedProvider::new().fail("draft"));
        let b = block("  - name: draft\n    prompt: go\n");
        let result = runner(&f).run(&b, 1).await;
        assert_eq!(result.status, BlockStatus::Failed);
        assert!(result.error.unwrap().contains("scripted failure"));
    }
}

//! Logic hooks: external scripts around a block's provider call.
//!
//! Contract: the script receives a JSON [`HookContext`] on stdin, runs with
//! the task directory as cwd, and reports pass/fail through its exit code.
//! `.py` scripts run under `python3`, `.sh` under `bash`. The child is killed
//! when the hook times out or the block is aborted.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio::io::AsyncWriteExt;

use crate::error::ReinError;
use crate::task_dir::RunLog;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookKind {
    Pre,
    Post,
    Validate,
    Custom,
}

impl HookKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pre => "pre",
            Self::Post => "post",
            Self::Validate => "validate",
            Self::Custom => "custom",
        }
    }
}

/// JSON document written to the hook's stdin.
#[derive(Debug, Clone, Serialize)]
pub struct HookContext {
    /// Staged output the hook reads or writes (`outputs/result.json.pending`).
    pub output_file: PathBuf,
    pub workflow_dir: PathBuf,
    pub task_dir: PathBuf,
    pub task_id: String,
    pub task_input: Value,
    pub block_dir: PathBuf,
    pub outputs_dir: PathBuf,
    pub input_dir: PathBuf,
    pub depends_on: Vec<String>,
    pub block_config: Value,
    pub prompt_file: PathBuf,
    pub hook: String,
}

/// Result of one hook execution.
#[derive(Debug, Clone)]
pub struct HookOutcome {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl HookOutcome {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

pub struct HookRunner {
    workflow_dir: PathBuf,
    task_dir: PathBuf,
    timeout: Duration,
    log: Arc<RunLog>,
}

impl HookRunner {
    pub fn new(
        workflow_dir: impl Into<PathBuf>,
        task_dir: impl Into<PathBuf>,
        timeout: Duration,
        log: Arc<RunLog>,
    ) -> Self {
        Self {
            workflow_dir: workflow_dir.into(),
            task_dir: task_dir.into(),
            timeout,
            log,
        }
    }

    /// Run `script` (relative to the workflow directory).
    ///
    /// A non-zero exit is returned as an outcome; a missing script, an
    /// unsupported script type, a spawn failure or a timeout is an error.
    pub async fn run(
        &self,
        kind: HookKind,
        script: &str,
        context: &HookContext,
    ) -> Result<HookOutcome, ReinError> {
        let full_path = self.workflow_dir.join(script);
        if !full_path.is_file() {
            self.log
                .write(format!("LOGIC ERROR | script not found: {}", full_path.display()));
            return Err(ReinError::Hook(format!(
                "{} script not found: {}",
                kind.as_str(),
                full_path.display()
            )));
        }
        let interpreter = interpreter_for(&full_path).ok_or_else(|| {
            self.log
                .write(format!("LOGIC ERROR | unknown script type: {}", script));
            ReinError::Hook(format!("unknown script type: {}", script))
        })?;

        let mut ctx = context.clone();
        ctx.hook = kind.as_str().to_string();
        let payload = serde_json::to_vec(&ctx)
            .map_err(|e| ReinError::Internal(format!("hook context: {}", e)))?;

        self.log.write(format!(
            "LOGIC RUN | {} | {} | output={} | task={}",
            kind.as_str(),
            script,
            ctx.output_file.display(),
            ctx.task_id
        ));
        tracing::info!("[Hook] {} {} for {}", kind.as_str(), script, ctx.block_dir.display());

        let mut child = tokio::process::Command::new(interpreter)
            .arg(&full_path)
            .current_dir(&self.task_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ReinError::Hook(format!("failed to start {}: {}", script, e)))?;

        if let Some(mut stdin) = child.stdin.take() {
            // A script that never reads stdin closes the pipe early.
            if let Err(e) = stdin.write_all(&payload).await {
                tracing::debug!("[Hook] stdin closed by {}: {}", script, e);
            }
        }

        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(ReinError::Hook(format!("{} failed: {}", script, e)));
            }
            Err(_) => {
                self.log.write(format!("LOGIC ERROR | timeout: {}", script));
                return Err(ReinError::Hook(format!(
                    "{} timed out after {}s",
                    script,
                    self.timeout.as_secs()
                )));
            }
        };

        let outcome = HookOutcome {
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        };
        self.record(kind, &ctx.block_dir, &outcome);
        Ok(outcome)
    }

    fn record(&self, kind: HookKind, block_dir: &Path, outcome: &HookOutcome) {
        for line in outcome.stdout.lines().filter(|l| !l.trim().is_empty()) {
            self.log.write(format!("LOGIC OUTPUT | {}", line));
        }
        if !outcome.success() {
            for line in outcome.stderr.lines().filter(|l| !l.trim().is_empty()) {
                self.log.write(format!("LOGIC ERROR | {}", line));
            }
        }

        let logs_dir = block_dir.join("logs");
        let text = format!(
            "exit_code: {}\n--- stdout ---\n{}\n--- stderr ---\n{}\n",
            outcome
                .exit_code
                .map(|c| c.to_string())
                .unwrap_or_else(|| "signal".to_string()),
            outcome.stdout,
            outcome.stderr
        );
        let written = std::fs::create_dir_all(&logs_dir)
            .and_then(|_| std::fs::write(logs_dir.join(format!("{}.log", kind.as_str())), text));
        if let Err(e) = written {
            tracing::warn!("[Hook] Could not write hook log: {}", e);
        }
    }
}

fn interpreter_for(path: &Path) -> Option<&'static str> {
    match path.extension().and_then(|e| e.to_str()) {
        Some("py") => Some("python3"),
        Some("sh") => Some("bash"),
        _ => None,
    }
}

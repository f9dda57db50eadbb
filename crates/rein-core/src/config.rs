//! Engine configuration.
//!
//! Precedence, lowest to highest: built-in defaults, the user config file
//! (`<config_dir>/rein/config.yaml`), `REIN_*` environment variables, then
//! whatever the caller (usually the CLI) sets explicitly.

use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use serde::{Deserialize, Serialize};

use crate::error::ReinError;

/// What to do with a block found `running` when a task is resumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ResumePolicy {
    /// Run the block again from scratch.
    #[default]
    Rerun,
    /// Record it as failed; it is not re-run.
    MarkFailed,
    /// Move it to `waiting` and hold it until `resume <block>`.
    Manual,
}

impl ResumePolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Rerun => "rerun",
            Self::MarkFailed => "mark-failed",
            Self::Manual => "manual",
        }
    }
}

impl std::str::FromStr for ResumePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "rerun" => Ok(Self::Rerun),
            "mark-failed" | "mark_failed" | "failed" => Ok(Self::MarkFailed),
            "manual" => Ok(Self::Manual),
            other => Err(format!(
                "unknown resume policy '{}' (expected rerun, mark-failed or manual)",
                other
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReinConfig {
    /// Root holding `specialists/`, `teams/` and (by default) `tasks/`.
    pub agents_dir: PathBuf,
    /// Where task directories are created. `None` means `<agents_dir>/tasks`.
    pub tasks_dir: Option<PathBuf>,
    /// Where control sockets are created. `None` means the OS temp dir.
    pub socket_dir: Option<PathBuf>,
    pub hook_timeout_secs: u64,
    pub poll_interval_ms: u64,
    pub resume_policy: ResumePolicy,
}

impl Default for ReinConfig {
    fn default() -> Self {
        Self {
            agents_dir: PathBuf::from("agents"),
            tasks_dir: None,
            socket_dir: None,
            hook_timeout_secs: 480,
            poll_interval_ms: 500,
            resume_policy: ResumePolicy::Rerun,
        }
    }
}

impl ReinConfig {
    /// Defaults, then the user config file, then the environment.
    pub fn load() -> Result<Self, ReinError> {
        let mut config = match user_config_path() {
            Some(path) if path.is_file() => Self::from_file(&path)?,
            _ => Self::default(),
        };
        config.apply_env();
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ReinError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            ReinError::Config(format!("Failed to read '{}': {}", path.display(), e))
        })?;
        let config = serde_yaml::from_str(&content).map_err(|e| {
            ReinError::Config(format!("Failed to parse '{}': {}", path.display(), e))
        })?;
        tracing::info!("[Config] Loaded {}", path.display());
        Ok(config)
    }

    /// Apply `REIN_AGENTS_DIR`, `REIN_TASKS_DIR`, `REIN_SOCKET_DIR` and
    /// `REIN_HOOK_TIMEOUT`.
    pub fn apply_env(&mut self) {
        if let Some(dir) = non_empty_env("REIN_AGENTS_DIR") {
            self.agents_dir = PathBuf::from(dir);
        }
        if let Some(dir) = non_empty_env("REIN_TASKS_DIR") {
            self.tasks_dir = Some(PathBuf::from(dir));
        }
        if let Some(dir) = non_empty_env("REIN_SOCKET_DIR") {
            self.socket_dir = Some(PathBuf::from(dir));
        }
        if let Some(secs) = non_empty_env("REIN_HOOK_TIMEOUT").and_then(|v| v.parse().ok()) {
            self.hook_timeout_secs = secs;
        }
    }

    pub fn tasks_dir(&self) -> PathBuf {
        self.tasks_dir
            .clone()
            .unwrap_or_else(|| self.agents_dir.join("tasks"))
    }

    pub fn socket_dir(&self) -> PathBuf {
        self.socket_dir.clone().unwrap_or_else(std::env::temp_dir)
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

/// `<config_dir>/rein/config.yaml`, e.g. `~/.config/rein/config.yaml`.
pub fn user_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("rein").join("config.yaml"))
}

/// Load `KEY=VALUE` lines from `<dir>/.env`. Variables already present in the
/// environment win. Returns whether a file was read.
pub fn load_dotenv(dir: &Path) -> bool {
    let path = dir.join(".env");
    let Ok(content) = std::fs::read_to_string(&path) else {
        return false;
    };
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let line = line.strip_prefix("export ").unwrap_or(line);
        if let Some(eq_idx) = line.find('=') {
            let key = line[..eq_idx].trim();
            let mut value = line[eq_idx + 1..].trim().to_string();
            if value.len() >= 2
                && ((value.starts_with('"') && value.ends_with('"'))
                    || (value.starts_with('\'') && value.ends_with('\'')))
            {
                value = value[1..value.len() - 1].to_string();
            }
            if !key.is_empty() && std::env::var(key).is_err() {
                std::env::set_var(key, &value);
            }
        }
    }
    tracing::info!("[Config] Loaded environment from '{}'", path.display());
    true
}

static ENV_REF_RE: LazyLock<regex::Regex> =
    LazyLock::new(|| regex::Regex::new(r"\$\{([^}]+)\}").expect("valid regex"));

/// Resolve `${ENV_VAR}` and `${ENV_VAR:-default}` references.
pub fn resolve_env_vars(input: &str) -> String {
    ENV_REF_RE
        .replace_all(input, |caps: &regex::Captures| {
            let var_expr = &caps[1];
            if let Some(idx) = var_expr.find(":-") {
                let var_name = &var_expr[..idx];
                let default_val = &var_expr[idx + 2..];
                std::env::var(var_name).unwrap_or_else(|_| default_val.to_string())
            } else {
                std::env::var(var_expr).unwrap_or_else(|_| format!("${{{}}}", var_expr))
            }
        })
        .to_string()
}

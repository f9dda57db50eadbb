//! CLI command implementations.
//!
//! Each submodule corresponds to a top-level `rein` command. Commands return
//! `Result<(), String>`; `main` prints the error and exits with status 1.

pub mod control;
pub mod run;
pub mod status;
pub mod workflow;

use std::path::PathBuf;

use rein_core::ReinConfig;

/// Load the layered config and apply the global `--agents-dir` /
/// `--tasks-dir` flags on top.
pub fn load_config(agents_dir: Option<&str>, tasks_dir: Option<&str>) -> Result<ReinConfig, String> {
    let mut config = ReinConfig::load().map_err(|e| e.to_string())?;
    if let Some(dir) = agents_dir {
        config.agents_dir = PathBuf::from(dir);
    }
    if let Some(dir) = tasks_dir {
        config.tasks_dir = Some(PathBuf::from(dir));
    }
    Ok(config)
}

/// Pretty-print a JSON value to stdout.
pub fn print_json(value: &serde_json::Value) {
    println!(
        "{}",
        serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
    );
}

/// Shorten `s` to at most `max` characters for table output.
pub fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max.saturating_sub(1)).collect();
        format!("{}…", kept)
    }
}

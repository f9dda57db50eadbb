//! On-disk layout of one task run.
//!
//! ```text
//! <tasks_dir>/<task_id>/
//!   input/task.json          # id, flow, input, created, status
//!   state/rein.db            # durable block-state store
//!   state/rein.log           # "<rfc3339> | MESSAGE" lines
//!   state/status             # pending | running | completed | failed | cancelled
//!   state/exit_code          # 0 | 1, written at the end
//!   summary.json
//!   <block>/inputs/prompt.txt
//!   <block>/outputs/result.json
//!   <block>/logs/<hook>.log
//! ```

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::ReinError;
use crate::models::TaskStatus;

/// Handle to a task directory.
#[derive(Debug, Clone)]
pub struct TaskDir {
    id: String,
    root: PathBuf,
}

impl TaskDir {
    /// `task-YYYYMMDD-HHMMSS-xxxxxxxx`
    pub fn new_id() -> String {
        let uuid = uuid::Uuid::new_v4().simple().to_string();
        format!("task-{}-{}", Utc::now().format("%Y%m%d-%H%M%S"), &uuid[..8])
    }

    /// Create the directory skeleton and `input/task.json`.
    pub fn create(
        tasks_dir: &Path,
        id: &str,
        workflow: &str,
        input: &Value,
    ) -> Result<Self, ReinError> {
        let dir = Self {
            id: id.to_string(),
            root: tasks_dir.join(id),
        };
        std::fs::create_dir_all(dir.state_dir())?;
        std::fs::create_dir_all(dir.root.join("input"))?;

        let task_json = json!({
            "id": id,
            "flow": workflow,
            "input": input,
            "created": Utc::now().to_rfc3339(),
            "status": TaskStatus::Pending.as_str(),
        });
        write_json(&dir.task_json_path(), &task_json)?;
        dir.write_status(TaskStatus::Pending)?;
        Ok(dir)
    }

    /// Open an existing task directory.
    pub fn open(tasks_dir: &Path, id: &str) -> Result<Self, ReinError> {
        let root = tasks_dir.join(id);
        if !root.join("state").is_dir() {
            return Err(ReinError::NotFound(format!(
                "task directory '{}'",
                root.display()
            )));
        }
        Ok(Self {
            id: id.to_string(),
            root,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn state_dir(&self) -> PathBuf {
        self.root.join("state")
    }

    pub fn db_path(&self) -> PathBuf {
        self.state_dir().join("rein.db")
    }

    pub fn log_path(&self) -> PathBuf {
        self.state_dir().join("rein.log")
    }

    pub fn task_json_path(&self) -> PathBuf {
        self.root.join("input").join("task.json")
    }

    pub fn summary_path(&self) -> PathBuf {
        self.root.join("summary.json")
    }

    pub fn block_dir(&self, block: &str) -> PathBuf {
        self.root.join(block)
    }

    pub fn result_path(&self, block: &str) -> PathBuf {
        self.block_dir(block).join("outputs").join("result.json")
    }

    pub fn write_status(&self, status: TaskStatus) -> Result<(), ReinError> {
        std::fs::write(self.state_dir().join("status"), status.as_str())?;
        Ok(())
    }

    pub fn read_status(&self) -> Option<String> {
        std::fs::read_to_string(self.state_dir().join("status"))
            .ok()
            .map(|s| s.trim().to_string())
    }

    pub fn write_exit_code(&self, code: i32) -> Result<(), ReinError> {
        std::fs::write(self.state_dir().join("exit_code"), code.to_string())?;
        Ok(())
    }

    pub fn read_task_json(&self) -> Result<Value, ReinError> {
        let text = std::fs::read_to_string(self.task_json_path())?;
        serde_json::from_str(&text)
            .map_err(|e| ReinError::Internal(format!("corrupt task.json: {}", e)))
    }

    /// Record the final status in `input/task.json`.
    pub fn update_task_json(&self, status: TaskStatus) -> Result<(), ReinError> {
        let mut task = self.read_task_json().unwrap_or_else(|_| json!({ "id": self.id }));
        if let Some(obj) = task.as_object_mut() {
            obj.insert("status".to_string(), json!(status.as_str()));
            obj.insert("finished".to_string(), json!(Utc::now().to_rfc3339()));
        }
        write_json(&self.task_json_path(), &task)
    }

    pub fn write_summary(&self, summary: &Value) -> Result<(), ReinError> {
        write_json(&self.summary_path(), summary)
    }
}

fn write_json(path: &Path, value: &Value) -> Result<(), ReinError> {
    let text = serde_json::to_string_pretty(value)
        .map_err(|e| ReinError::Internal(format!("serialize {}: {}", path.display(), e)))?;
    std::fs::write(path, text)?;
    Ok(())
}

/// One row of `rein tasks`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskListing {
    pub id: String,
    pub workflow: String,
    pub status: String,
    pub created: String,
}

/// Task directories under `tasks_dir`, newest first.
pub fn list_tasks(tasks_dir: &Path) -> Result<Vec<TaskListing>, ReinError> {
    if !tasks_dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut tasks = Vec::new();
    for entry in std::fs::read_dir(tasks_dir)? {
        let entry = entry?;
        let id = entry.file_name().to_string_lossy().to_string();
        let Ok(dir) = TaskDir::open(tasks_dir, &id) else {
            continue;
        };
        let task_json = dir.read_task_json().unwrap_or(Value::Null);
        tasks.push(TaskListing {
            workflow: task_json["flow"].as_str().unwrap_or("").to_string(),
            created: task_json["created"].as_str().unwrap_or("").to_string(),
            status: dir.read_status().unwrap_or_else(|| "unknown".to_string()),
            id,
        });
    }
    tasks.sort_by(|a, b| b.id.cmp(&a.id));
    Ok(tasks)
}

// ─── Execution log ──────────────────────────────────────────────────────

/// Append-only `state/rein.log`.
#[derive(Debug)]
pub struct RunLog {
    path: PathBuf,
    lock: Mutex<()>,
}

impl RunLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append `"{rfc3339} | {message}"`. Failures are reported through
    /// `tracing` only; the log never stops a run.
    pub fn write(&self, message: impl AsRef<str>) {
        let message = message.as_ref();
        tracing::debug!("[RunLog] {}", message);
        let Ok(_guard) = self.lock.lock() else {
            return;
        };
        let line = format!("{} | {}\n", Utc::now().to_rfc3339(), message);
        let result = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .and_then(|mut f| f.write_all(line.as_bytes()));
        if let Err(e) = result {
            tracing::warn!("[RunLog] Failed to write {}: {}", self.path.display(), e);
        }
    }

    /// Last `n` lines of the log.
    pub fn tail(&self, n: usize) -> Vec<String> {
        let content = std::fs::read_to_string(&self.path).unwrap_or_default();
        let lines: Vec<&str> = content.lines().collect();
        lines[lines.len().saturating_sub(n)..]
            .iter()
            .map(|s| s.to_string())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_task_id_format() {
        let id = TaskDir::new_id();
        let re = regex::Regex::new(r"^task-\d{8}-\d{6}-[0-9a-f]{8}$").unwrap();
        assert!(re.is_match(&id), "bad id {}", id);
    }

    #[test]
    fn test_create_writes_skeleton() {
        let tmp = TempDir::new().unwrap();
        let dir = TaskDir::create(tmp.path(), "task-1", "demo", &json!({"topic": "owls"})).unwrap();

        assert!(dir.state_dir().is_dir());
        assert_eq!(dir.read_status().as_deref(), Some("pending"));
        let task = dir.read_task_json().unwrap();
        assert_eq!(task["flow"], "demo");
        assert_eq!(task["input"]["topic"], "owls");

        dir.write_status(TaskStatus::Completed).unwrap();
        dir.write_exit_code(0).unwrap();
        dir.update_task_json(TaskStatus::Completed).unwrap();
        assert_eq!(dir.read_task_json().unwrap()["status"], "completed");
        assert_eq!(
            std::fs::read_to_string(dir.state_dir().join("exit_code")).unwrap(),
            "0"
        );
    }

    #[test]
    fn test_open_missing_is_not_found() {
        let tmp = TempDir::new().unwrap();
        assert!(matches!(
            TaskDir::open(tmp.path(), "nope"),
            Err(ReinError::NotFound(_))
        ));
    }

    #[test]
    fn test_list_tasks_newest_first() {
        let tmp = TempDir::new().unwrap();
        TaskDir::create(tmp.path(), "task-20250101-000000-aaaaaaaa", "one", &json!({})).unwrap();
        TaskDir::create(tmp.path(), "task-20250102-000000-bbbbbbbb", "two", &json!({})).unwrap();
        std::fs::create_dir_all(tmp.path().join("not-a-task")).unwrap();

        let tasks = list_tasks(tmp.path()).unwrap();
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[0].workflow, "two");
        assert_eq!(tasks[1].status, "pending");
    }

    #[test]
    fn test_run_log_lines() {
        let tmp = TempDir::new().unwrap();
        let log = RunLog::new(tmp.path().join("rein.log"));
        log.write("BLOCK STARTED | a");
        log.write("BLOCK DONE | a");
        let lines = log.tail(10);
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with(" | BLOCK STARTED | a"));
        assert_eq!(log.tail(1).len(), 1);
    }
}

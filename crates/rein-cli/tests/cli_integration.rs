//! Integration tests for the rein-cli commands.
//!
//! These exercise the same code paths as the binary against a throwaway
//! agents/tasks directory. Every workflow here uses custom scripts only, so
//! no provider or API key is involved.

use std::path::PathBuf;

use rein_cli::commands;
use rein_core::task_dir::list_tasks;
use rein_core::{ReinConfig, ResumePolicy};
use tempfile::TempDir;

const PIPELINE: &str = r#"
name: pipeline
blocks:
  - name: gather
    logic:
      custom: logic/gather.sh
  - name: report
    depends_on: [gather]
    logic:
      custom: logic/report.sh
"#;

struct Fixture {
    tmp: TempDir,
    workflow: PathBuf,
}

impl Fixture {
    fn new(yaml: &str) -> Self {
        let tmp = TempDir::new().expect("tempdir");
        let flow_dir = tmp.path().join("flows").join("pipeline");
        std::fs::create_dir_all(flow_dir.join("logic")).unwrap();
        std::fs::create_dir_all(tmp.path().join("agents").join("specialists")).unwrap();
        std::fs::write(
            flow_dir.join("logic").join("gather.sh"),
            "cat > /dev/null\necho '{\"items\": 2}' > gather/outputs/result.json.pending\n",
        )
        .unwrap();
        std::fs::write(
            flow_dir.join("logic").join("report.sh"),
            "cat > /dev/null\necho 'two items' > report/outputs/result.json.pending\n",
        )
        .unwrap();
        let workflow = flow_dir.join("workflow.yaml");
        std::fs::write(&workflow, yaml).unwrap();
        Self { tmp, workflow }
    }

    fn config(&self) -> ReinConfig {
        ReinConfig {
            agents_dir: self.tmp.path().join("agents"),
            tasks_dir: Some(self.tmp.path().join("tasks")),
            socket_dir: Some(self.tmp.path().to_path_buf()),
            hook_timeout_secs: 30,
            poll_interval_ms: 20,
            resume_policy: ResumePolicy::Rerun,
        }
    }

    fn run_options(&self) -> commands::run::RunOptions {
        commands::run::RunOptions {
            workflow: self.workflow.to_string_lossy().to_string(),
            no_socket: true,
            ..Default::default()
        }
    }
}

#[tokio::test]
async fn test_run_custom_workflow() {
    let fixture = Fixture::new(PIPELINE);
    let config = fixture.config();

    commands::run::run(config.clone(), fixture.run_options())
        .await
        .expect("run should complete");

    let tasks = list_tasks(&config.tasks_dir()).unwrap();
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].workflow, "pipeline");
    assert_eq!(tasks[0].status, "completed");

    let task_root = config.tasks_dir().join(&tasks[0].id);
    let report: serde_json::Value = serde_json::from_str(
        &std::fs::read_to_string(task_root.join("report/outputs/result.json")).unwrap(),
    )
    .unwrap();
    assert_eq!(report["result"], "two items");
    assert_eq!(
        std::fs::read_to_string(task_root.join("state/exit_code")).unwrap().trim(),
        "0"
    );
}

#[tokio::test]
async fn test_run_reports_failure() {
    let fixture = Fixture::new(
        r#"
name: broken
blocks:
  - name: gather
    continue_if_failed: false
    logic:
      custom: logic/missing.sh
"#,
    );
    let err = commands::run::run(fixture.config(), fixture.run_options())
        .await
        .unwrap_err();
    assert!(err.contains("failed"), "{}", err);
}

#[tokio::test]
async fn test_run_rejects_missing_required_input() {
    let fixture = Fixture::new(
        r#"
name: needs-topic
inputs:
  topic:
    required: true
blocks:
  - name: gather
    logic:
      custom: logic/gather.sh
"#,
    );
    let err = commands::run::run(fixture.config(), fixture.run_options())
        .await
        .unwrap_err();
    assert!(err.contains("topic"), "{}", err);
    assert!(list_tasks(&fixture.config().tasks_dir()).unwrap().is_empty());
}

#[tokio::test]
async fn test_run_rejects_both_input_sources() {
    let fixture = Fixture::new(PIPELINE);
    let mut opts = fixture.run_options();
    opts.input = Some("{}".to_string());
    opts.input_file = Some("input.json".to_string());
    assert!(commands::run::run(fixture.config(), opts).await.is_err());
}

#[tokio::test]
async fn test_status_after_run() {
    let fixture = Fixture::new(PIPELINE);
    let config = fixture.config();
    commands::run::run(config.clone(), fixture.run_options())
        .await
        .unwrap();
    let task_id = list_tasks(&config.tasks_dir()).unwrap()[0].id.clone();

    commands::status::status(&config, &task_id)
        .await
        .expect("status reads the persisted store");
    commands::status::tasks(&config).expect("tasks lists the run");
    assert!(commands::status::status(&config, "no-such-task").await.is_err());
}

#[test]
fn test_validate_workflow() {
    let fixture = Fixture::new(PIPELINE);
    let path = fixture.workflow.to_string_lossy().to_string();
    commands::workflow::validate(&fixture.config(), &path).expect("valid workflow");
}

#[test]
fn test_validate_rejects_cycle() {
    let fixture = Fixture::new(
        r#"
name: cyclic
blocks:
  - name: a
    depends_on: [b]
  - name: b
    depends_on: [a]
"#,
    );
    let path = fixture.workflow.to_string_lossy().to_string();
    assert!(commands::workflow::validate(&fixture.config(), &path).is_err());
}

#[test]
fn test_specialists_listing() {
    let fixture = Fixture::new(PIPELINE);
    std::fs::write(
        fixture.tmp.path().join("agents/specialists/writer.md"),
        "---\nname: Writer\ndescription: Drafts prose\n---\nYou write clearly.\n",
    )
    .unwrap();
    commands::workflow::specialists(&fixture.config()).expect("specialists listed");
}

#[tokio::test]
async fn test_control_without_running_task() {
    let fixture = Fixture::new(PIPELINE);
    let err = commands::control::control(
        &fixture.config(),
        "task-20260101-000000-abcd1234",
        &["status".to_string()],
    )
    .await
    .unwrap_err();
    assert!(err.contains("No control socket"), "{}", err);
}

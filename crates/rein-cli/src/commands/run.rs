//! `rein run`: execute (or resume) a workflow.

use std::path::Path;

use rein_core::models::{BlockRunState, BlockStatus};
use rein_core::{Orchestrator, ReinConfig, ResumePolicy, RunRequest, TaskReport, TaskStatus};
use serde_json::Value;

use super::{print_json, truncate};

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub workflow: String,
    pub input: Option<String>,
    pub input_file: Option<String>,
    pub max_parallel: Option<usize>,
    pub resume: Option<String>,
    pub resume_policy: Option<String>,
    pub no_socket: bool,
    pub print_final: bool,
}

/// Task input from `--input` or `--input-file`; `{}` when neither is given.
pub fn parse_input(input: Option<&str>, input_file: Option<&str>) -> Result<Value, String> {
    let text = match (input, input_file) {
        (Some(_), Some(_)) => return Err("Use either --input or --input-file, not both".to_string()),
        (Some(json), None) => json.to_string(),
        (None, Some(path)) => std::fs::read_to_string(path)
            .map_err(|e| format!("Failed to read input file '{}': {}", path, e))?,
        (None, None) => return Ok(Value::Object(Default::default())),
    };
    let value: Value =
        serde_json::from_str(&text).map_err(|e| format!("Invalid input JSON: {}", e))?;
    if !value.is_object() {
        return Err("Task input must be a JSON object".to_string());
    }
    Ok(value)
}

pub async fn run(config: ReinConfig, opts: RunOptions) -> Result<(), String> {
    let input = parse_input(opts.input.as_deref(), opts.input_file.as_deref())?;
    let resume_policy = opts
        .resume_policy
        .as_deref()
        .map(str::parse::<ResumePolicy>)
        .transpose()?;

    let workflow_path = Path::new(&opts.workflow);
    let mut request = RunRequest::new(workflow_path, input);
    request.max_parallel = opts.max_parallel;
    request.resume = opts.resume.clone();
    request.resume_policy = resume_policy;
    request.control_socket = !opts.no_socket;

    let orchestrator = Orchestrator::new(config);
    let prepared = orchestrator
        .prepare(request)
        .await
        .map_err(|e| e.to_string())?;

    match &opts.resume {
        Some(_) => println!("Resuming task {}", prepared.task_id),
        None => println!("Task {}", prepared.task_id),
    }
    println!("   Directory: {}", prepared.task_dir.root().display());
    if let Some(socket) = prepared.socket_path() {
        println!("   Control:   rein control {} status  ({})", prepared.task_id, socket.display());
    }
    println!();

    let print_final = opts.print_final || prepared.print_final();
    let report = prepared.run().await.map_err(|e| e.to_string())?;
    tracing::info!(
        "[Run] Task {} finished with status {}",
        report.task_id,
        report.status()
    );
    print_report(&report);

    if print_final {
        if let Some(output) = report.final_output() {
            println!();
            match &output {
                Value::String(text) => println!("{}", text),
                other => print_json(other),
            }
        }
    }

    match report.status() {
        TaskStatus::Completed => Ok(()),
        status => Err(format!(
            "Task {} finished with status {}{}",
            report.task_id,
            status,
            report
                .outcome
                .error
                .as_deref()
                .map(|e| format!(": {}", e))
                .unwrap_or_default()
        )),
    }
}

const REPORT_HEADER: &str = "│ Block                │ Status   │ Runs  │ Note                         │";

fn block_row(block: &BlockRunState) -> String {
    format!(
        "│ {:<20} │ {:<8} │ {:>2}/{:<2} │ {:<28} │",
        truncate(&block.name, 20),
        block.status.as_str(),
        block.run_count,
        block.max_runs,
        truncate(block.last_error.as_deref().unwrap_or(""), 28)
    )
}

fn print_report(report: &TaskReport) {
    println!("┌──────────────────────┬──────────┬───────┬──────────────────────────────┐");
    println!("{}", REPORT_HEADER);
    println!("├──────────────────────┼──────────┼───────┼──────────────────────────────┤");
    for block in &report.outcome.blocks {
        // Emoji widths vary by terminal; keep them outside the box.
        let icon = match block.status {
            BlockStatus::Done => "✅",
            BlockStatus::Failed => "❌",
            BlockStatus::Skipped => "⏭️",
            _ => "⏸️",
        };
        println!("{} {}", block_row(block), icon);
    }
    println!("└──────────────────────┴──────────┴───────┴──────────────────────────────┘");
    let usage = &report.outcome.usage;
    println!(
        "   Tokens: {} (in:{} out:{})  Cost: ${:.4}",
        usage.total_tokens, usage.input_tokens, usage.output_tokens, usage.cost
    );
    println!("   Status: {}", report.status());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_input_sources() {
        assert_eq!(parse_input(None, None).unwrap(), serde_json::json!({}));
        assert_eq!(
            parse_input(Some(r#"{"topic": "owls"}"#), None).unwrap()["topic"],
            "owls"
        );
        assert!(parse_input(Some("[1]"), None).is_err());
        assert!(parse_input(Some("{}"), Some("x.json")).is_err());
        assert!(parse_input(None, Some("/definitely/missing.json")).is_err());
    }

    #[test]
    fn test_block_rows_line_up_with_header() {
        let width = REPORT_HEADER.chars().count();
        let mut block = BlockRunState::new("a_rather_long_block_name_indeed", 10, 1, 0);
        block.status = BlockStatus::Failed;
        block.run_count = 10;
        block.last_error = Some("dependency 'gather' did not succeed".to_string());
        assert_eq!(block_row(&block).chars().count(), width);

        let fresh = BlockRunState::new("draft", 1, 1, 0);
        assert_eq!(block_row(&fresh).chars().count(), width);
    }
}

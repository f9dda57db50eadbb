//! `rein status` and `rein tasks`.

use rein_core::control::status_line;
use rein_core::task_dir::list_tasks;
use rein_core::{Database, ReinConfig, StateStore, TaskDir};

use super::truncate;

/// Print a task's counters and block table straight from its database.
///
/// Works for finished tasks and for tasks whose process is gone; a live task
/// can also be queried through `rein control <id> status`.
pub async fn status(config: &ReinConfig, task_id: &str) -> Result<(), String> {
    let task_dir = TaskDir::open(&config.tasks_dir(), task_id).map_err(|e| e.to_string())?;
    let db = Database::open(task_dir.db_path()).map_err(|e| e.to_string())?;
    let store = StateStore::new(db);

    let task = store.get(task_id).await.map_err(|e| e.to_string())?;
    let line = status_line(&store, task_id)
        .await
        .map_err(|e| e.to_string())?;

    println!("Task {} ({})", task.id, task.workflow);
    println!("   {}", line);
    println!();
    println!("┌──────────────────────┬──────────┬───────┬───────┬──────────────────────────────┐");
    println!("│ Block                │ Status   │ Phase │ Runs  │ Error                        │");
    println!("├──────────────────────┼──────────┼───────┼───────┼──────────────────────────────┤");
    for block in &task.blocks {
        let name = if block.held {
            format!("{} (held)", block.name)
        } else {
            block.name.clone()
        };
        println!(
            "│ {:<20} │ {:<8} │ {:>5} │ {:>2}/{:<2} │ {:<28} │",
            truncate(&name, 20),
            block.status.as_str(),
            block.phase,
            block.run_count,
            block.max_runs,
            truncate(block.last_error.as_deref().unwrap_or(""), 28)
        );
    }
    println!("└──────────────────────┴──────────┴───────┴───────┴──────────────────────────────┘");
    Ok(())
}

pub fn tasks(config: &ReinConfig) -> Result<(), String> {
    let tasks_dir = config.tasks_dir();
    let tasks = list_tasks(&tasks_dir).map_err(|e| e.to_string())?;
    if tasks.is_empty() {
        println!("No tasks in {}", tasks_dir.display());
        return Ok(());
    }

    println!(
        "{:<28} {:<20} {:<10} {}",
        "TASK", "WORKFLOW", "STATUS", "CREATED"
    );
    for task in &tasks {
        println!(
            "{:<28} {:<20} {:<10} {}",
            task.id,
            truncate(&task.workflow, 20),
            task.status,
            short_time(&task.created)
        );
    }
    Ok(())
}

/// `2026-10-16T09:30:12.123+00:00` → `2026-10-16 09:30` in local time.
fn short_time(rfc3339: &str) -> String {
    chrono::DateTime::parse_from_rfc3339(rfc3339)
        .map(|t| {
            t.with_timezone(&chrono::Local)
                .format("%Y-%m-%d %H:%M")
                .to_string()
        })
        .unwrap_or_else(|_| rfc3339.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_time_keeps_unparseable_input() {
        assert_eq!(short_time(""), "");
        assert_eq!(short_time("yesterday"), "yesterday");
        assert_eq!(short_time("2026-10-16T09:30:12+00:00").len(), 16);
    }
}

//! `rein validate` and `rein specialists`.

use std::path::Path;

use rein_core::workflow::{validate as validate_definition, AgentLibrary};
use rein_core::{ReinConfig, WorkflowDefinition, WorkflowGraph};

use super::truncate;

/// Check a workflow file and print its blocks by phase.
pub fn validate(config: &ReinConfig, workflow_path: &str) -> Result<(), String> {
    let path = Path::new(workflow_path);
    let definition = WorkflowDefinition::from_file(path).map_err(|e| e.to_string())?;

    let errors = validate_definition(&definition);
    if !errors.is_empty() {
        println!("❌ {} is invalid:", path.display());
        for error in &errors {
            println!("   - {}", error);
        }
        return Err(format!("{} validation error(s)", errors.len()));
    }

    let graph = WorkflowGraph::load(definition).map_err(|e| e.to_string())?;
    let definition = graph.definition();
    println!("✅ {} is valid", graph.name());
    if let Some(desc) = &definition.description {
        println!("   {}", desc);
    }
    println!(
        "   Blocks: {}  max_parallel: {}{}",
        graph.blocks().len(),
        definition.max_parallel,
        definition
            .timeout
            .map(|t| format!("  timeout: {}s", t))
            .unwrap_or_default()
    );
    println!();

    let library = AgentLibrary::new(&config.agents_dir);
    for (i, phase) in graph.execution_phases().iter().enumerate() {
        println!("  Phase {}:", i + 1);
        for name in phase {
            let Some(block) = graph.block(name) else {
                continue;
            };
            let mut line = format!("    • {}", name);
            if !block.depends_on.is_empty() {
                line.push_str(&format!(" ← {}", block.depends_on.join(", ")));
            }
            if block.is_custom() {
                line.push_str(" [custom]");
            }
            if block.max_runs > 1 {
                line.push_str(&format!(" [max_runs={}]", block.max_runs));
            }
            if let Some(specialist) = &block.specialist {
                if library.specialist(specialist).is_none() {
                    line.push_str(&format!(" ⚠️ specialist '{}' not found", specialist));
                }
            }
            println!("{}", line);
        }
    }
    Ok(())
}

/// List specialists under `<agents_dir>/specialists`.
pub fn specialists(config: &ReinConfig) -> Result<(), String> {
    let library = AgentLibrary::new(&config.agents_dir);
    let specialists = library.list_specialists()?;

    if specialists.is_empty() {
        println!(
            "No specialists found in {}",
            library.agents_dir().join("specialists").display()
        );
        return Ok(());
    }

    println!("┌──────────────────────┬──────────────────────────────────────────────────┐");
    println!("│ Specialist           │ Description                                      │");
    println!("├──────────────────────┼──────────────────────────────────────────────────┤");
    for specialist in &specialists {
        let desc = specialist
            .description
            .as_deref()
            .or(specialist.name.as_deref())
            .unwrap_or("");
        println!(
            "│ {:<20} │ {:<48} │",
            truncate(&specialist.id, 20),
            truncate(desc, 48)
        );
    }
    println!("└──────────────────────┴──────────────────────────────────────────────────┘");
    println!("  {} specialist(s)", specialists.len());
    Ok(())
}

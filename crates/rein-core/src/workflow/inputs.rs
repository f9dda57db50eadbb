//! Task input validation against a workflow's `inputs:` declaration.

use serde_json::{Map, Value};

use super::schema::WorkflowDefinition;
use crate::error::ReinError;

/// Outcome of input resolution: the effective input plus notes worth logging.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedInputs {
    pub input: Value,
    /// Fields that were filled from their declared default.
    pub defaulted: Vec<String>,
    /// Provided fields the workflow does not declare.
    pub undeclared: Vec<String>,
}

/// Check `provided` against the declared inputs, injecting defaults.
///
/// Without an `inputs` section the input is passed through unchanged.
pub fn resolve_inputs(def: &WorkflowDefinition, provided: Value) -> Result<ResolvedInputs, ReinError> {
    let mut input = match provided {
        Value::Object(map) => map,
        Value::Null => Map::new(),
        other => {
            return Err(ReinError::Input(format!(
                "task input must be a JSON object, got {}",
                other
            )))
        }
    };

    let Some(declared) = &def.inputs else {
        return Ok(ResolvedInputs {
            input: Value::Object(input),
            defaulted: Vec::new(),
            undeclared: Vec::new(),
        });
    };

    let mut missing = Vec::new();
    let mut defaulted = Vec::new();
    for (name, field) in declared {
        let present = input.get(name).map(|v| !v.is_null()).unwrap_or(false);
        if present {
            continue;
        }
        if field.required {
            missing.push(match &field.description {
                Some(desc) => format!("  - {}: {}", name, desc),
                None => format!("  - {}", name),
            });
        } else if let Some(default) = &field.default {
            tracing::info!("[Inputs] Using default for '{}'", name);
            input.insert(name.clone(), default.clone());
            defaulted.push(name.clone());
        }
    }

    if !missing.is_empty() {
        return Err(ReinError::Input(format!(
            "missing required input(s):\n{}",
            missing.join("\n")
        )));
    }

    let undeclared: Vec<String> = input
        .keys()
        .filter(|k| !declared.contains_key(*k))
        .cloned()
        .collect();
    for name in &undeclared {
        tracing::warn!("[Inputs] Input '{}' is not declared by workflow '{}'", name, def.name);
    }

    Ok(ResolvedInputs {
        input: Value::Object(input),
        defaulted,
        undeclared,
    })
}

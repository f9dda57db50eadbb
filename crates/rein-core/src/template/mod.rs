//! `{{ … }}` substitution for block prompts.
//!
//! Two reference kinds are resolved:
//!
//! - `{{ task.input.<path> }}`: a dotted lookup in the task input. Strings are
//!   inserted verbatim, other values as compact JSON.
//! - `{{ <block>.json }}`: a completed block's output (or a static JSON file),
//!   inserted as JSON text.
//!
//! Anything else between braces is left alone. Rendering is a single
//! left-to-right pass; substituted text is never rescanned, and text outside
//! placeholders is copied byte for byte. A reference that cannot be resolved
//! fails the render with [`ReinError::Template`] naming every such placeholder.

pub mod condition;

use std::path::{Path, PathBuf};

use serde_json::Value;

use crate::error::ReinError;

pub use condition::{condition_scope, evaluate, is_truthy, lookup};

/// Where placeholders are resolved from.
#[derive(Debug, Clone)]
pub struct TemplateContext {
    pub task_input: Value,
    pub task_dir: PathBuf,
    pub workflow_dir: PathBuf,
}

impl TemplateContext {
    pub fn new(task_input: Value, task_dir: impl Into<PathBuf>, workflow_dir: impl Into<PathBuf>) -> Self {
        Self {
            task_input,
            task_dir: task_dir.into(),
            workflow_dir: workflow_dir.into(),
        }
    }
}

/// Render a template against `ctx`.
pub fn render(template: &str, ctx: &TemplateContext) -> Result<String, ReinError> {
    let mut out = String::with_capacity(template.len());
    let mut unresolved = Vec::new();
    let mut rest = template;

    while let Some(start) = rest.find("{{") {
        let Some(len) = rest[start + 2..].find("}}") else {
            break;
        };
        let end = start + 2 + len + 2;
        let placeholder = &rest[start..end];
        let expr = rest[start + 2..end - 2].trim();

        out.push_str(&rest[..start]);
        match resolve(expr, ctx) {
            Resolution::Value(text) => out.push_str(&text),
            Resolution::Missing => {
                unresolved.push(placeholder.to_string());
                out.push_str(placeholder);
            }
            Resolution::NotAReference => out.push_str(placeholder),
        }
        rest = &rest[end..];
    }
    out.push_str(rest);

    if unresolved.is_empty() {
        Ok(out)
    } else {
        Err(ReinError::Template(format!(
            "unresolved placeholders: {}",
            unresolved.join(", ")
        )))
    }
}

enum Resolution {
    Value(String),
    Missing,
    NotAReference,
}

fn resolve(expr: &str, ctx: &TemplateContext) -> Resolution {
    if let Some(path) = expr.strip_prefix("task.input.") {
        return match lookup(&ctx.task_input, path) {
            Some(Value::String(s)) => Resolution::Value(s.clone()),
            Some(other) => Resolution::Value(other.to_string()),
            None => Resolution::Missing,
        };
    }

    if let Some(name) = expr.strip_suffix(".json") {
        if name.is_empty() || name.chars().any(char::is_whitespace) {
            return Resolution::NotAReference;
        }
        return match load_json_reference(name, ctx) {
            Some(value) => Resolution::Value(value.to_string()),
            None => Resolution::Missing,
        };
    }

    Resolution::NotAReference
}

/// Resolve `{{ <name>.json }}`: the block's `outputs/result.json`, then
/// `<task_dir>/outputs/<name>.json`, then `<workflow_dir>/<name>.json`.
pub fn load_json_reference(name: &str, ctx: &TemplateContext) -> Option<Value> {
    let file = format!("{}.json", name);
    let candidates = [
        ctx.task_dir.join(name).join("outputs").join("result.json"),
        ctx.task_dir.join("outputs").join(&file),
        ctx.workflow_dir.join(&file),
    ];
    candidates
        .iter()
        .find(|p| p.is_file())
        .and_then(|p| read_json(p))
        .map(unwrap_envelope)
}

fn read_json(path: &Path) -> Option<Value> {
    let text = std::fs::read_to_string(path).ok()?;
    match serde_json::from_str(&text) {
        Ok(v) => Some(v),
        Err(e) => {
            tracing::warn!("[Template] {} is not valid JSON: {}", path.display(), e);
            None
        }
    }
}

/// `{"result": …}` envelopes yield their inner result; a string result holding
/// JSON is parsed.
pub fn unwrap_envelope(value: Value) -> Value {
    match value {
        Value::Object(mut map) if map.contains_key("result") => {
            match map.remove("result").unwrap_or(Value::Null) {
                Value::String(s) => serde_json::from_str(&s).unwrap_or(Value::String(s)),
                inner => inner,
            }
        }
        other => other,
    }
}

/// Final prompt sent to the provider.
pub fn assemble_prompt(team_tone: &str, specialist_text: &str, rendered: &str) -> String {
    if team_tone.is_empty() && specialist_text.is_empty() {
        return rendered.to_string();
    }
    format!("{}\n\n{}\n\n---\n\n{}", team_tone, specialist_text, rendered)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn context(dir: &TempDir) -> TemplateContext {
        let task_dir = dir.path().join("task");
        let workflow_dir = dir.path().join("flow");
        std::fs::create_dir_all(task_dir.join("draft").join("outputs")).unwrap();
        std::fs::create_dir_all(&workflow_dir).unwrap();
        std::fs::write(
            task_dir.join("draft").join("outputs").join("result.json"),
            r#"{"stage": "draft", "result": "{\"title\": \"Owls\"}", "run": 1}"#,
        )
        .unwrap();
        std::fs::write(workflow_dir.join("style.json"), r#"{"voice": "dry"}"#).unwrap();
        TemplateContext::new(
            json!({"topic": "owls", "meta": {"words": 300}, "tags": ["x"]}),
            task_dir,
            workflow_dir,
        )
    }

    #[test]
    fn test_task_input_substitution() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir);
        let out = render(
            "About {{ task.input.topic }} in {{task.input.meta.words}} words {{ task.input.tags }}",
            &ctx,
        )
        .unwrap();
        assert_eq!(out, r#"About owls in 300 words ["x"]"#);
    }

    #[test]
    fn test_block_output_and_static_file() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir);
        let out = render("Draft: {{ draft.json }}\nStyle: {{ style.json }}", &ctx).unwrap();
        assert_eq!(out, "Draft: {\"title\":\"Owls\"}\nStyle: {\"voice\":\"dry\"}");
    }

    #[test]
    fn test_whitespace_preserved_and_idempotent() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir);
        let template = "  line one\n\t{{ task.input.topic }}  \n    indented {{ not a ref }}\n";
        let once = render(template, &ctx).unwrap();
        assert_eq!(once, "  line one\n\towls  \n    indented {{ not a ref }}\n");
        assert_eq!(render(&once, &ctx).unwrap(), once);
    }

    #[test]
    fn test_unresolved_references_fail() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir);
        let err = render("{{ task.input.audience }} and {{ missing.json }}", &ctx).unwrap_err();
        let msg = err.to_string();
        assert!(matches!(err, ReinError::Template(_)));
        assert!(msg.contains("{{ task.input.audience }}"));
        assert!(msg.contains("{{ missing.json }}"));
    }

    #[test]
    fn test_substituted_text_is_not_rescanned() {
        let dir = TempDir::new().unwrap();
        let mut ctx = context(&dir);
        ctx.task_input = json!({"raw": "{{ task.input.raw }}"});
        let out = render("{{ task.input.raw }}", &ctx).unwrap();
        assert_eq!(out, "{{ task.input.raw }}");
    }

    #[test]
    fn test_unclosed_braces_copied() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir);
        assert_eq!(render("a {{ b", &ctx).unwrap(), "a {{ b");
    }

    #[test]
    fn test_assemble_prompt_layout() {
        assert_eq!(assemble_prompt("", "", "go"), "go");
        assert_eq!(
            assemble_prompt("Be kind.", "You write.", "go"),
            "Be kind.\n\nYou write.\n\n---\n\ngo"
        );
    }

    #[test]
    fn test_unwrap_envelope_keeps_plain_strings() {
        assert_eq!(unwrap_envelope(json!({"result": "hello"})), json!("hello"));
        assert_eq!(unwrap_envelope(json!({"result": {"a": 1}})), json!({"a": 1}));
        assert_eq!(unwrap_envelope(json!([1, 2])), json!([1, 2]));
    }
}

//! Markdown rendering of block results.
//!
//! With `readable_outputs: true` in the workflow, every finished block also
//! gets `outputs/result.md` next to `result.json`. Object keys become
//! headings (`##`, then `###`, then bold labels), lists become bullets and
//! objects inside lists get their own `###` section titled by their `name`,
//! `id`, `gap` or `idea` field.

use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use chrono::{DateTime, Local};
use regex::Regex;
use serde_json::Value;

use crate::error::ReinError;

static JSON_FENCE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)```json\s*\n(.*?)\n```").expect("valid regex"));

const ITEM_TITLE_KEYS: [&str; 4] = ["name", "id", "gap", "idea"];

/// `outputs/result.json` -> `outputs/result.md`.
pub fn readable_path(result_path: &Path) -> PathBuf {
    result_path.with_extension("md")
}

/// Write the Markdown rendering of `result` beside `result_path`.
pub fn save_readable_output(
    result_path: &Path,
    block: &str,
    result: &Value,
) -> Result<PathBuf, ReinError> {
    let path = readable_path(result_path);
    std::fs::write(&path, render_readable(block, result, Local::now()))?;
    Ok(path)
}

/// Full document: block title, timestamp, then the formatted result.
///
/// String results are searched for a fenced JSON block first; text around
/// the fence is kept. A string that is JSON as a whole is formatted, any
/// other string is copied as-is.
pub fn render_readable(block: &str, result: &Value, at: DateTime<Local>) -> String {
    let mut lines = vec![
        format!("# {}", block),
        String::new(),
        format!("*{}*", at.format("%Y-%m-%d %H:%M:%S")),
        String::new(),
    ];

    match result {
        Value::String(text) => match JSON_FENCE_RE.captures(text) {
            Some(caps) => {
                let (Some(whole), Some(body)) = (caps.get(0), caps.get(1)) else {
                    lines.push(text.clone());
                    return lines.join("\n");
                };
                let before = text[..whole.start()].trim();
                let after = text[whole.end()..].trim();
                if !before.is_empty() {
                    lines.push(before.to_string());
                    lines.push(String::new());
                }
                match serde_json::from_str::<Value>(body.as_str()) {
                    Ok(parsed) => lines.extend(format_json_as_md(&parsed, 0)),
                    Err(_) => lines.push(format!("```json\n{}\n```", body.as_str())),
                }
                if !after.is_empty() {
                    lines.push(String::new());
                    lines.push(after.to_string());
                }
            }
            None => match serde_json::from_str::<Value>(text) {
                Ok(parsed) => lines.extend(format_json_as_md(&parsed, 0)),
                Err(_) => lines.push(text.clone()),
            },
        },
        other => lines.extend(format_json_as_md(other, 0)),
    }
    lines.join("\n")
}

/// Format `data` as Markdown lines; `level` picks the heading depth for keys.
pub fn format_json_as_md(data: &Value, level: usize) -> Vec<String> {
    let Value::Object(map) = data else {
        return vec![display(data)];
    };

    let mut lines = Vec::new();
    for (key, value) in map {
        let title = title_case(key);
        lines.push(match level {
            0 => format!("## {}", title),
            1 => format!("### {}", title),
            _ => format!("**{}:**", title),
        });
        lines.push(String::new());

        match value {
            Value::Array(items) => {
                for (i, item) in items.iter().enumerate() {
                    match item {
                        Value::Object(fields) => {
                            lines.push(format!("### {}", item_title(fields, i)));
                            lines.push(String::new());
                            for (k, v) in fields {
                                if k == "name" || k == "id" {
                                    continue;
                                }
                                let label = title_case(k);
                                match v {
                                    Value::Array(sub) => {
                                        lines.push(format!("**{}:**", label));
                                        lines.extend(sub.iter().map(|s| format!("- {}", display(s))));
                                    }
                                    other => lines.push(format!("**{}:** {}", label, display(other))),
                                }
                            }
                            lines.push(String::new());
                        }
                        other => lines.push(format!("- {}", display(other))),
                    }
                }
                lines.push(String::new());
            }
            Value::Object(_) => lines.extend(format_json_as_md(value, level + 1)),
            other => {
                lines.push(display(other));
                lines.push(String::new());
            }
        }
    }
    lines
}

fn item_title(fields: &serde_json::Map<String, Value>, index: usize) -> String {
    let found = ITEM_TITLE_KEYS
        .iter()
        .filter_map(|key| fields.get(*key))
        .find(|v| is_present(v));
    match found {
        Some(Value::Number(n)) if n.is_i64() || n.is_u64() => format!("#{}", n),
        Some(v) => display(v),
        None => format!("Item {}", index + 1),
    }
}

fn is_present(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::String(s) => !s.is_empty(),
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

fn display(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// `key_name` -> `Key Name`.
fn title_case(key: &str) -> String {
    key.replace('_', " ")
        .split(' ')
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn fixed_time() -> DateTime<Local> {
        Local.with_ymd_and_hms(2026, 3, 4, 5, 6, 7).unwrap()
    }

    #[test]
    fn test_title_case() {
        assert_eq!(title_case("key_findings"), "Key Findings");
        assert_eq!(title_case("URL"), "Url");
        assert_eq!(title_case("summary"), "Summary");
    }

    #[test]
    fn test_nested_objects_use_deeper_headings() {
        let lines = format_json_as_md(&json!({"report": {"detail": {"note": "x"}}}), 0);
        assert_eq!(
            lines,
            vec!["## Report", "", "### Detail", "", "**Note:**", "", "x", ""]
        );
    }

    #[test]
    fn test_list_items_get_titles() {
        let data = json!({
            "ideas": [
                {"name": "Owl cams", "score": 8, "tags": ["live", "cheap"]},
                {"id": 7, "score": 5},
                {"score": 1},
                "plain entry"
            ]
        });
        let text = format_json_as_md(&data, 0).join("\n");
        assert!(text.starts_with("## Ideas\n"));
        assert!(text.contains("### Owl cams\n\n**Score:** 8\n**Tags:**\n- live\n- cheap\n"));
        assert!(text.contains("### #7\n"));
        assert!(text.contains("### Item 3\n"));
        assert!(text.contains("- plain entry"));
        assert!(!text.contains("**Name:**"));
    }

    #[test]
    fn test_fenced_json_keeps_surrounding_text() {
        let result = json!("Here is the plan.\n```json\n{\"steps\": [\"a\", \"b\"]}\n```\nDone.");
        let md = render_readable("plan", &result, fixed_time());
        assert_eq!(
            md,
            "# plan\n\n*2026-03-04 05:06:07*\n\nHere is the plan.\n\n## Steps\n\n- a\n- b\n\n\nDone."
        );
    }

    #[test]
    fn test_plain_text_and_broken_fence() {
        let md = render_readable("note", &json!("just words"), fixed_time());
        assert!(md.ends_with("\n\njust words"));

        let md = render_readable("bad", &json!("```json\n{oops\n```"), fixed_time());
        assert!(md.ends_with("```json\n{oops\n```"));
    }

    #[test]
    fn test_save_writes_beside_result() {
        let tmp = tempfile::TempDir::new().unwrap();
        let result_path = tmp.path().join("result.json");
        let saved = save_readable_output(&result_path, "draft", &json!({"title": "Owls"})).unwrap();
        assert_eq!(saved, tmp.path().join("result.md"));
        let text = std::fs::read_to_string(saved).unwrap();
        assert!(text.starts_with("# draft\n\n*"));
        assert!(text.ends_with("## Title\n\nOwls\n"));
    }
}

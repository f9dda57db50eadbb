//! Branch conditions for `next: [{if: ...}]`.
//!
//! Three forms: truthiness (`{{ result.approved }}`), ordering
//! (`{{ result.score > 0.8 }}`) and equality (`{{ result.status == 'done' }}`).
//! Unknown paths resolve to `null`, which is falsy and compares false.

use std::cmp::Ordering;

use serde_json::{json, Value};

/// Checked in this order so `>=` is never read as `>`.
const OPERATORS: [&str; 6] = ["==", "!=", ">=", "<=", ">", "<"];

/// Scope a block's `next` conditions are evaluated against.
///
/// `result` is the block's own output: parsed JSON when it is JSON,
/// `{"raw": text}` when it is plain text.
pub fn condition_scope(result: &Value, task_input: &Value) -> Value {
    let result = match result {
        Value::String(text) => serde_json::from_str::<Value>(text)
            .ok()
            .filter(|v| v.is_object())
            .unwrap_or_else(|| json!({ "raw": text })),
        Value::Object(_) => result.clone(),
        other => json!({ "value": other }),
    };
    json!({ "result": result, "task": { "input": task_input } })
}

/// Dotted-path lookup. Numeric segments index arrays.
pub fn lookup<'a>(scope: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = scope;
    for segment in path.split('.').map(str::trim) {
        if segment.is_empty() {
            return None;
        }
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

/// Evaluate a condition. Braces are optional.
pub fn evaluate(condition: &str, scope: &Value) -> bool {
    let expr = strip_braces(condition);

    for op in OPERATORS {
        if let Some(idx) = find_unquoted(expr, op) {
            let left = expr[..idx].trim();
            let right = unquote(expr[idx + op.len()..].trim());
            let value = lookup(scope, left).unwrap_or(&Value::Null);
            return compare(value, op, right);
        }
    }

    lookup(scope, expr).map(is_truthy).unwrap_or(false)
}

/// Byte offset of the first `op` outside single or double quotes.
fn find_unquoted(expr: &str, op: &str) -> Option<usize> {
    let mut quote: Option<char> = None;
    for (idx, c) in expr.char_indices() {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => {}
            None if c == '\'' || c == '"' => quote = Some(c),
            None if expr[idx..].starts_with(op) => return Some(idx),
            None => {}
        }
    }
    None
}

fn strip_braces(condition: &str) -> &str {
    let trimmed = condition.trim();
    trimmed
        .strip_prefix("{{")
        .and_then(|s| s.strip_suffix("}}"))
        .unwrap_or(trimmed)
        .trim()
}

fn unquote(s: &str) -> &str {
    for quote in ['\'', '"'] {
        if s.len() >= 2 && s.starts_with(quote) && s.ends_with(quote) {
            return &s[1..s.len() - 1];
        }
    }
    s
}

/// Coerce `right` to the type of `left` and compare. Incomparable → false.
fn compare(left: &Value, op: &str, right: &str) -> bool {
    let ordering = match left {
        Value::Bool(b) => {
            let r = matches!(right.to_ascii_lowercase().as_str(), "true" | "1" | "yes");
            b.cmp(&r)
        }
        Value::Number(n) => match (n.as_f64(), right.parse::<f64>()) {
            (Some(l), Ok(r)) => match l.partial_cmp(&r) {
                Some(ord) => ord,
                None => return false,
            },
            _ => return false,
        },
        Value::String(s) => s.as_str().cmp(right),
        Value::Null | Value::Array(_) | Value::Object(_) => return false,
    };

    match op {
        "==" => ordering == Ordering::Equal,
        "!=" => ordering != Ordering::Equal,
        ">=" => ordering != Ordering::Less,
        "<=" => ordering != Ordering::Greater,
        ">" => ordering == Ordering::Greater,
        "<" => ordering == Ordering::Less,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scope() -> Value {
        condition_scope(
            &json!({"approved": false, "score": 0.91, "status": "done", "tags": ["a"], "count": 0}),
            &json!({"mode": "strict"}),
        )
    }

    #[test]
    fn test_truthiness() {
        let s = scope();
        assert!(!evaluate("{{ result.approved }}", &s));
        assert!(evaluate("{{ result.tags }}", &s));
        assert!(!evaluate("{{ result.count }}", &s));
        assert!(!evaluate("{{ result.missing }}", &s));
        assert!(evaluate("task.input.mode", &s));
    }

    #[test]
    fn test_numeric_comparison() {
        let s = scope();
        assert!(evaluate("{{ result.score > 0.8 }}", &s));
        assert!(evaluate("{{ result.score >= 0.91 }}", &s));
        assert!(!evaluate("{{ result.score < 0.5 }}", &s));
        assert!(evaluate("{{ result.score <= 1 }}", &s));
        assert!(!evaluate("{{ result.score > high }}", &s));
    }

    #[test]
    fn test_equality_with_quotes_and_bools() {
        let s = scope();
        assert!(evaluate("{{ result.status == 'done' }}", &s));
        assert!(evaluate(r#"{{ result.status == "done" }}"#, &s));
        assert!(evaluate("{{ result.status != 'draft' }}", &s));
        assert!(evaluate("{{ result.approved == false }}", &s));
        assert!(evaluate("{{ result.approved != yes }}", &s));
    }

    #[test]
    fn test_operators_inside_quoted_literals_are_ignored() {
        let s = condition_scope(&json!({"expr": "a==b", "op": ">"}), &json!({}));
        assert!(evaluate("{{ result.expr == 'a==b' }}", &s));
        assert!(!evaluate("{{ result.expr != 'a==b' }}", &s));
        assert!(evaluate("{{ result.op == \">\" }}", &s));
        assert_eq!(find_unquoted("x != 'a==b'", "=="), None);
        assert_eq!(find_unquoted("x != 'a==b'", "!="), Some(2));
    }

    #[test]
    fn test_unknown_paths_compare_false() {
        let s = scope();
        assert!(!evaluate("{{ result.nope == 'x' }}", &s));
        assert!(!evaluate("{{ result.nope != 'x' }}", &s));
        assert!(!evaluate("{{ result.status.deeper }}", &s));
    }

    #[test]
    fn test_plain_text_output_is_raw() {
        let s = condition_scope(&json!("looks good"), &json!({}));
        assert!(evaluate("{{ result.raw == 'looks good' }}", &s));

        let s = condition_scope(&json!(r#"{"approved": true}"#), &json!({}));
        assert!(evaluate("{{ result.approved }}", &s));
    }

    #[test]
    fn test_lookup_indexes_arrays() {
        let s = scope();
        assert_eq!(lookup(&s, "result.tags.0"), Some(&json!("a")));
        assert_eq!(lookup(&s, "result.tags.3"), None);
    }
}

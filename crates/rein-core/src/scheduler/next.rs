//! `next` rule evaluation for a block that finished `done`.

use serde_json::Value;

use crate::template::{condition_scope, evaluate, unwrap_envelope};
use crate::workflow::{BlockSpec, NextRule};

/// Where control goes after a block completes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NextDecision {
    /// No `next` rule: ordinary dependents take over.
    Natural,
    /// Conditional rule where no branch matched and no `else` exists.
    NoBranch,
    /// Force `target` into `ready`.
    Goto { target: String, reason: String },
}

/// Decide the transition for `block` given its result envelope.
pub fn decide(block: &BlockSpec, envelope: &Value, task_input: &Value) -> NextDecision {
    match &block.next {
        None => NextDecision::Natural,
        Some(NextRule::Always(target)) => NextDecision::Goto {
            target: target.clone(),
            reason: "next".to_string(),
        },
        Some(NextRule::Branches(branches)) => {
            let result = unwrap_envelope(envelope.clone());
            let scope = condition_scope(&result, task_input);
            for branch in branches {
                if branch.is_else() {
                    if let Some(target) = branch.target() {
                        return NextDecision::Goto {
                            target: target.to_string(),
                            reason: "else".to_string(),
                        };
                    }
                    continue;
                }
                let (Some(condition), Some(target)) = (&branch.condition, &branch.goto) else {
                    continue;
                };
                if evaluate(condition, &scope) {
                    return NextDecision::Goto {
                        target: target.clone(),
                        reason: format!("if {}", condition.trim()),
                    };
                }
            }
            NextDecision::NoBranch
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::WorkflowDefinition;
    use serde_json::json;

    fn gate() -> BlockSpec {
        let yaml = r#"
name: t
blocks:
  - name: gate
    next:
      - if: "{{ result.approved }}"
        goto: publish
      - if: "{{ result.score >= 0.5 }}"
        goto: polish
      - else: revision
  - name: publish
  - name: polish
  - name: revision
"#;
        WorkflowDefinition::from_yaml(yaml).unwrap().blocks[0].clone()
    }

    fn envelope(result: &str) -> Value {
        json!({"stage": "gate", "result": result, "run": 1})
    }

    #[test]
    fn test_first_matching_branch_wins() {
        let decision = decide(&gate(), &envelope(r#"{"approved": true, "score": 0.9}"#), &json!({}));
        assert!(matches!(decision, NextDecision::Goto { ref target, .. } if target == "publish"));

        let decision = decide(&gate(), &envelope(r#"{"approved": false, "score": 0.7}"#), &json!({}));
        assert!(matches!(decision, NextDecision::Goto { ref target, .. } if target == "polish"));
    }

    #[test]
    fn test_else_branch_taken() {
        let decision = decide(&gate(), &envelope(r#"{"approved": false, "score": 0.1}"#), &json!({}));
        assert_eq!(
            decision,
            NextDecision::Goto {
                target: "revision".to_string(),
                reason: "else".to_string()
            }
        );
    }

    #[test]
    fn test_plain_text_output_falls_to_else() {
        let decision = decide(&gate(), &envelope("looks fine to me"), &json!({}));
        assert!(matches!(decision, NextDecision::Goto { ref target, .. } if target == "revision"));
    }

    #[test]
    fn test_no_rule_and_no_match() {
        let mut block = gate();
        block.next = None;
        assert_eq!(decide(&block, &envelope("{}"), &json!({})), NextDecision::Natural);

        let yaml = "name: t\nblocks:\n  - name: a\n    next:\n      - if: \"{{ result.ok }}\"\n        goto: b\n  - name: b\n";
        let block = WorkflowDefinition::from_yaml(yaml).unwrap().blocks[0].clone();
        assert_eq!(
            decide(&block, &envelope(r#"{"ok": false}"#), &json!({})),
            NextDecision::NoBranch
        );
    }

    #[test]
    fn test_condition_can_read_task_input() {
        let yaml = "name: t\nblocks:\n  - name: a\n    next:\n      - if: \"{{ task.input.mode == 'fast' }}\"\n        goto: b\n  - name: b\n";
        let block = WorkflowDefinition::from_yaml(yaml).unwrap().blocks[0].clone();
        assert!(matches!(
            decide(&block, &envelope("{}"), &json!({"mode": "fast"})),
            NextDecision::Goto { .. }
        ));
    }
}

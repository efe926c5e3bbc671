//! Post-execution validation of step outputs.

use stepflow_types::execution::ExecutionState;
use stepflow_types::validation::{ValidationFinding, ValidationRule};

/// Evaluate every rule against a finished execution.
///
/// Failing findings are logged at `warn`. They are informational only.
pub fn evaluate_rules(rules: &[ValidationRule], state: &ExecutionState) -> Vec<ValidationFinding> {
    let findings: Vec<ValidationFinding> = rules.iter().map(|rule| evaluate(rule, state)).collect();

    for finding in findings.iter().filter(|f| !f.passed) {
        tracing::warn!(
            execution_id = %state.execution_id,
            rule = ?finding.rule,
            message = finding.message.as_deref().unwrap_or_default(),
            "validation rule failed"
        );
    }
    findings
}

fn evaluate(rule: &ValidationRule, state: &ExecutionState) -> ValidationFinding {
    let (passed, message) = match rule {
        ValidationRule::RequiredOutputKey { step_id, key } => {
            match state.aggregate_output.get(step_id) {
                Some(output) if output.contains_key(key) => (true, None),
                Some(_) => (false, Some(format!("step '{step_id}' output has no key '{key}'"))),
                None => (false, Some(format!("step '{step_id}' produced no output"))),
            }
        }
        ValidationRule::NonEmptyOutput { step_id } => match state.aggregate_output.get(step_id) {
            Some(output) if !output.is_empty() => (true, None),
            _ => (false, Some(format!("step '{step_id}' output is empty"))),
        },
        // Interpreted by the caller, not the engine.
        ValidationRule::Custom { name, .. } => {
            (true, Some(format!("custom rule '{name}' not evaluated by the engine")))
        }
    };

    ValidationFinding {
        rule: rule.clone(),
        passed,
        message,
    }
}

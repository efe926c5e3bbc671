//! Post-execution validation rule types.
//!
//! Rules are checked against an execution's aggregate output once it reaches a
//! terminal status. Findings are informational and never change that status.

use serde::{Deserialize, Serialize};

/// A single post-execution check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ValidationRule {
    /// The step's output must contain `key`.
    RequiredOutputKey { step_id: String, key: String },
    /// The step must have produced a non-empty output map.
    NonEmptyOutput { step_id: String },
    /// Caller-defined rule; recorded but not interpreted by the engine.
    Custom {
        name: String,
        #[serde(default)]
        config: serde_json::Value,
    },
}

/// Result of evaluating one rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationFinding {
    pub rule: ValidationRule,
    pub passed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn rules_parse_from_tagged_json() {
        let rules: Vec<ValidationRule> = serde_json::from_value(json!([
            {"type": "required_output_key", "step_id": "s1", "key": "summary"},
            {"type": "non_empty_output", "step_id": "s2"},
            {"type": "custom", "name": "lint"}
        ]))
        .unwrap();
        assert_eq!(rules.len(), 3);
        assert!(matches!(
            &rules[2],
            ValidationRule::Custom { name, config } if name == "lint" && config.is_null()
        ));
    }
}

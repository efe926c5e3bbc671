//! Workflow definition parsing and validation.
//!
//! A definition is a YAML document naming an ordered step list, an optional
//! fork-join group, and optional post-execution validation rules. Steps are
//! parsed through `StepDescriptor::from_value` so an unsupported `type` is
//! reported as such instead of as a generic parse failure.

use std::collections::HashSet;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use stepflow_types::step::{ParallelExecutionConfig, StepDescriptor, StepParseError};
use stepflow_types::validation::ValidationRule;
use thiserror::Error;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Errors raised while loading or validating workflow definitions.
#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("parse error: {0}")]
    ParseError(String),

    #[error("validation error: {0}")]
    ValidationError(String),

    #[error("unknown step type '{0}'")]
    UnknownStepType(String),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

impl From<StepParseError> for WorkflowError {
    fn from(err: StepParseError) -> Self {
        match err {
            StepParseError::UnknownStepType(kind) => WorkflowError::UnknownStepType(kind),
            StepParseError::Invalid(msg) => WorkflowError::ParseError(msg),
        }
    }
}

/// A named, reusable workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub steps: Vec<StepDescriptor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parallel: Option<ParallelExecutionConfig>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub validation_rules: Vec<ValidationRule>,
}

/// On-disk shape with steps kept raw until their `type` is checked.
#[derive(Deserialize)]
struct RawDefinition {
    name: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    steps: Vec<Value>,
    #[serde(default)]
    parallel: Option<ParallelExecutionConfig>,
    #[serde(default)]
    validation_rules: Vec<ValidationRule>,
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Parse a YAML string into a validated `WorkflowDefinition`.
pub fn parse_workflow_yaml(yaml: &str) -> Result<WorkflowDefinition, WorkflowError> {
    let raw: RawDefinition =
        serde_yaml_ng::from_str(yaml).map_err(|e| WorkflowError::ParseError(e.to_string()))?;

    let steps = raw
        .steps
        .into_iter()
        .map(StepDescriptor::from_value)
        .collect::<Result<Vec<_>, _>>()?;

    let def = WorkflowDefinition {
        name: raw.name,
        description: raw.description,
        steps,
        parallel: raw.parallel,
        validation_rules: raw.validation_rules,
    };
    validate_definition(&def)?;
    Ok(def)
}

pub fn serialize_workflow_yaml(def: &WorkflowDefinition) -> Result<String, WorkflowError> {
    serde_yaml_ng::to_string(def).map_err(|e| WorkflowError::ParseError(e.to_string()))
}

/// Parse a JSON array of raw step descriptors.
pub fn parse_steps_json(json: &str) -> Result<Vec<StepDescriptor>, WorkflowError> {
    let raw: Vec<Value> =
        serde_json::from_str(json).map_err(|e| WorkflowError::ParseError(e.to_string()))?;
    let steps = raw
        .into_iter()
        .map(StepDescriptor::from_value)
        .collect::<Result<Vec<_>, _>>()?;
    validate_steps(&steps)?;
    Ok(steps)
}

/// Load a workflow definition from a YAML file.
pub fn load_workflow_file(path: &Path) -> Result<WorkflowDefinition, WorkflowError> {
    let content = std::fs::read_to_string(path)?;
    let def = parse_workflow_yaml(&content)?;
    tracing::debug!(path = %path.display(), workflow = def.name.as_str(), "loaded workflow definition");
    Ok(def)
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Check step IDs are non-empty and unique.
///
/// An empty list is valid here: it runs as a workflow with nothing to do.
pub fn validate_steps(steps: &[StepDescriptor]) -> Result<(), WorkflowError> {
    let mut seen = HashSet::new();
    for step in steps {
        if step.id.trim().is_empty() {
            return Err(WorkflowError::ValidationError(format!(
                "step '{}' has an empty ID",
                step.name
            )));
        }
        if !seen.insert(step.id.as_str()) {
            return Err(WorkflowError::ValidationError(format!(
                "duplicate step ID: '{}'",
                step.id
            )));
        }
    }
    Ok(())
}

/// Validate structural constraints on a `WorkflowDefinition`.
///
/// On top of [`validate_steps`], a stored definition needs a name and at
/// least one step.
pub fn validate_definition(def: &WorkflowDefinition) -> Result<(), WorkflowError> {
    if def.name.trim().is_empty() {
        return Err(WorkflowError::ValidationError(
            "workflow name must not be empty".to_string(),
        ));
    }
    if def.steps.is_empty() {
        return Err(WorkflowError::ValidationError(
            "workflow must have at least one step".to_string(),
        ));
    }
    validate_steps(&def.steps)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    use stepflow_types::step::StepKind;

    const REVIEW_YAML: &str = r#"
name: code-review
description: Review a change set
steps:
  - id: fetch
    name: Fetch diff
    type: cli
    command: git diff HEAD~1
  - id: style
    name: Style review
    type: llm
    prompt: Review the style
  - id: security
    name: Security review
    type: llm
    prompt: Review for security issues
  - id: report
    name: Report
    type: custom
parallel:
  enabled: true
  steps: [style, security]
validation_rules:
  - type: non_empty_output
    step_id: report
"#;

    #[test]
    fn parse_full_definition() {
        let def = parse_workflow_yaml(REVIEW_YAML).unwrap();
        assert_eq!(def.name, "code-review");
        assert_eq!(def.steps.len(), 4);
        assert_eq!(def.steps[0].kind, StepKind::Cli);
        assert_eq!(
            def.steps[0].config.get("command").and_then(Value::as_str),
            Some("git diff HEAD~1")
        );
        assert_eq!(def.parallel, Some(ParallelExecutionConfig::new(["style", "security"])));
        assert_eq!(def.validation_rules.len(), 1);
    }

    #[test]
    fn yaml_roundtrip_keeps_config_fields() {
        let def = parse_workflow_yaml(REVIEW_YAML).unwrap();
        let yaml = serialize_workflow_yaml(&def).unwrap();
        let reparsed = parse_workflow_yaml(&yaml).unwrap();
        assert_eq!(reparsed, def);
    }

    #[test]
    fn unknown_step_type_is_specific() {
        let yaml = r#"
name: bad
steps:
  - id: s1
    name: S1
    type: quantum
"#;
        let err = parse_workflow_yaml(yaml).unwrap_err();
        assert!(matches!(err, WorkflowError::UnknownStepType(t) if t == "quantum"));
    }

    #[test]
    fn duplicate_ids_rejected() {
        let yaml = r#"
name: dup
steps:
  - { id: a, name: A, type: custom }
  - { id: a, name: A again, type: custom }
"#;
        let err = parse_workflow_yaml(yaml).unwrap_err();
        assert!(matches!(err, WorkflowError::ValidationError(msg) if msg.contains("duplicate")));
    }

    #[test]
    fn definition_needs_steps_and_name() {
        assert!(matches!(
            parse_workflow_yaml("name: empty\nsteps: []\n"),
            Err(WorkflowError::ValidationError(_))
        ));
        assert!(matches!(
            parse_workflow_yaml("name: ''\nsteps:\n  - { id: a, name: A, type: cli }\n"),
            Err(WorkflowError::ValidationError(_))
        ));
    }

    #[test]
    fn malformed_yaml_is_parse_error() {
        assert!(matches!(
            parse_workflow_yaml("name: [unclosed"),
            Err(WorkflowError::ParseError(_))
        ));
    }

    #[test]
    fn empty_step_list_is_valid_for_runs() {
        assert!(validate_steps(&[]).is_ok());
        let blank = vec![StepDescriptor::new(" ", "Blank", StepKind::Custom)];
        assert!(validate_steps(&blank).is_err());
    }

    #[test]
    fn parse_steps_from_json() {
        let steps = parse_steps_json(
            r#"[{"id": "s1", "name": "S1", "type": "custom", "weight": 3},
                {"id": "s2", "name": "S2", "description": "second", "type": "llm"}]"#,
        )
        .unwrap();
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[1].description, "second");
        assert_eq!(steps[0].config.get("weight"), Some(&serde_json::json!(3)));

        let err = parse_steps_json(r#"[{"id": "s1", "name": "S1", "type": "shell"}]"#).unwrap_err();
        assert!(matches!(err, WorkflowError::UnknownStepType(_)));
    }

    #[test]
    fn load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(REVIEW_YAML.as_bytes()).unwrap();
        let def = load_workflow_file(file.path()).unwrap();
        assert_eq!(def.steps.len(), 4);

        let missing = load_workflow_file(Path::new("/nonexistent/workflow.yaml"));
        assert!(matches!(missing, Err(WorkflowError::IoError(_))));
    }
}

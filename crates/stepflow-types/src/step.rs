//! Step descriptors and parallel (fork-join) configuration.
//!
//! A `StepDescriptor` is the persisted shape of one unit of work:
//! `{id, name, description, type, ...type-specific fields}`. The engine only
//! ever looks at `type`; everything else is carried as an opaque JSON map for
//! the step executor to interpret.

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Opaque, type-specific step payload.
pub type StepConfig = Map<String, Value>;

// ---------------------------------------------------------------------------
// Step kind
// ---------------------------------------------------------------------------

/// The kind of step, used to select a step executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    /// Language-model call.
    Llm,
    /// External command-line invocation.
    Cli,
    /// Caller-defined logic.
    Custom,
}

impl StepKind {
    pub const ALL: [StepKind; 3] = [StepKind::Llm, StepKind::Cli, StepKind::Custom];

    pub fn as_str(&self) -> &'static str {
        match self {
            StepKind::Llm => "llm",
            StepKind::Cli => "cli",
            StepKind::Custom => "custom",
        }
    }
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StepKind {
    type Err = StepParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "llm" => Ok(StepKind::Llm),
            "cli" => Ok(StepKind::Cli),
            "custom" => Ok(StepKind::Custom),
            other => Err(StepParseError::UnknownStepType(other.to_string())),
        }
    }
}

// ---------------------------------------------------------------------------
// Step descriptor
// ---------------------------------------------------------------------------

/// One step of a workflow, in the order the caller declared it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepDescriptor {
    /// Caller-defined step ID. Unique within a workflow.
    pub id: String,
    /// Human-readable step name.
    pub name: String,
    /// Optional longer description.
    #[serde(default)]
    pub description: String,
    /// Step kind discriminator.
    #[serde(rename = "type")]
    pub kind: StepKind,
    /// Every remaining field of the descriptor, untouched.
    #[serde(flatten)]
    pub config: StepConfig,
}

impl StepDescriptor {
    pub fn new(id: impl Into<String>, name: impl Into<String>, kind: StepKind) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: String::new(),
            kind,
            config: StepConfig::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Attach one opaque config field.
    pub fn with_config(mut self, key: impl Into<String>, value: Value) -> Self {
        self.config.insert(key.into(), value);
        self
    }

    /// Parse a raw JSON descriptor.
    ///
    /// Unlike plain deserialization, an unrecognised `type` is reported as
    /// [`StepParseError::UnknownStepType`] so callers can fail before any
    /// execution attempt with a precise error.
    pub fn from_value(value: Value) -> Result<Self, StepParseError> {
        let kind = value
            .get("type")
            .ok_or_else(|| StepParseError::Invalid("step descriptor has no 'type'".to_string()))?
            .as_str()
            .ok_or_else(|| StepParseError::Invalid("step 'type' must be a string".to_string()))?;
        kind.parse::<StepKind>()?;

        serde_json::from_value(value).map_err(|e| StepParseError::Invalid(e.to_string()))
    }
}

/// Errors raised while parsing a raw step descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StepParseError {
    #[error("unknown step type '{0}'")]
    UnknownStepType(String),

    #[error("invalid step descriptor: {0}")]
    Invalid(String),
}

// ---------------------------------------------------------------------------
// Parallel execution config
// ---------------------------------------------------------------------------

/// Marks a contiguous group of steps to run as a fork-join block.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParallelExecutionConfig {
    #[serde(default)]
    pub enabled: bool,
    /// IDs of the steps in the fork-join group.
    #[serde(default)]
    pub steps: Vec<String>,
}

impl ParallelExecutionConfig {
    /// An enabled group over the given step IDs.
    pub fn new<I, S>(steps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            enabled: true,
            steps: steps.into_iter().map(Into::into).collect(),
        }
    }

    /// Whether this config should produce a fork-join graph at all.
    pub fn is_active(&self) -> bool {
        self.enabled && !self.steps.is_empty()
    }

    pub fn contains(&self, step_id: &str) -> bool {
        self.steps.iter().any(|s| s == step_id)
    }

    /// Keep only the group members present in `step_ids`.
    pub fn retain_steps(&self, step_ids: &HashSet<&str>) -> Self {
        Self {
            enabled: self.enabled,
            steps: self
                .steps
                .iter()
                .filter(|s| step_ids.contains(s.as_str()))
                .cloned()
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn descriptor_keeps_extra_fields_as_config() {
        let raw = json!({
            "id": "plan",
            "name": "Plan",
            "description": "Draft a plan",
            "type": "llm",
            "prompt": "write a plan",
            "model": "small"
        });
        let step = StepDescriptor::from_value(raw).unwrap();
        assert_eq!(step.kind, StepKind::Llm);
        assert_eq!(step.config.get("prompt"), Some(&json!("write a plan")));
        assert_eq!(step.config.len(), 2);
    }

    #[test]
    fn descriptor_serializes_type_field() {
        let step = StepDescriptor::new("build", "Build", StepKind::Cli)
            .with_config("command", json!("make"));
        let value = serde_json::to_value(&step).unwrap();
        assert_eq!(value["type"], "cli");
        assert_eq!(value["command"], "make");
        assert!(value.get("config").is_none());
    }

    #[test]
    fn unknown_type_is_reported_precisely() {
        let raw = json!({"id": "x", "name": "X", "type": "teleport"});
        let err = StepDescriptor::from_value(raw).unwrap_err();
        assert_eq!(err, StepParseError::UnknownStepType("teleport".to_string()));
    }

    #[test]
    fn missing_type_is_invalid() {
        let raw = json!({"id": "x", "name": "X"});
        let err = StepDescriptor::from_value(raw).unwrap_err();
        assert!(matches!(err, StepParseError::Invalid(_)));
    }

    #[test]
    fn description_defaults_to_empty() {
        let raw = json!({"id": "x", "name": "X", "type": "custom"});
        let step = StepDescriptor::from_value(raw).unwrap();
        assert!(step.description.is_empty());
    }

    #[test]
    fn step_kind_from_str() {
        assert_eq!("cli".parse::<StepKind>().unwrap(), StepKind::Cli);
        assert!("CLI".parse::<StepKind>().is_err());
        assert_eq!(StepKind::Custom.to_string(), "custom");
    }

    #[test]
    fn parallel_config_activity() {
        assert!(!ParallelExecutionConfig::default().is_active());
        assert!(ParallelExecutionConfig::new(["a"]).is_active());

        let disabled = ParallelExecutionConfig {
            enabled: false,
            steps: vec!["a".to_string()],
        };
        assert!(!disabled.is_active());
    }

    #[test]
    fn parallel_config_retain_steps() {
        let config = ParallelExecutionConfig::new(["s2", "s3", "s4"]);
        let keep: HashSet<&str> = ["s3", "s4", "s9"].into_iter().collect();
        let sliced = config.retain_steps(&keep);
        assert_eq!(sliced.steps, vec!["s3", "s4"]);
        assert!(sliced.enabled);
    }

    #[test]
    fn parallel_config_deserializes_with_defaults() {
        let config: ParallelExecutionConfig = serde_json::from_value(json!({})).unwrap();
        assert!(!config.enabled);
        assert!(config.steps.is_empty());
    }
}

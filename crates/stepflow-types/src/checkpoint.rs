//! Checkpoint snapshot types.
//!
//! A checkpoint is an immutable, versioned snapshot of an `ExecutionState`
//! taken right after a step completed. Its metadata carries what is needed to
//! rebuild the graph on resume (the declared step list and parallel config).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::execution::ExecutionState;
use crate::step::{ParallelExecutionConfig, StepDescriptor};
use crate::validation::ValidationRule;

/// Version of the checkpoint snapshot layout written by this build.
///
/// Bump whenever `Checkpoint`, `ExecutionState`, or `CheckpointMetadata`
/// change shape in a way older readers would misinterpret.
pub const CHECKPOINT_SCHEMA_VERSION: u32 = 1;

/// Graph-rebuild information stored alongside a snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CheckpointMetadata {
    /// The full declared step list of the run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub steps: Option<Vec<StepDescriptor>>,
    /// The fork-join config of the run, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parallel: Option<ParallelExecutionConfig>,
    /// Post-execution checks of the run, evaluated again after a resume.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub validation_rules: Vec<ValidationRule>,
    /// Free-form caller data.
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl CheckpointMetadata {
    pub fn for_run(steps: &[StepDescriptor], parallel: Option<&ParallelExecutionConfig>) -> Self {
        Self {
            steps: Some(steps.to_vec()),
            parallel: parallel.cloned(),
            validation_rules: Vec::new(),
            extra: serde_json::Map::new(),
        }
    }

    pub fn with_validation_rules(mut self, rules: &[ValidationRule]) -> Self {
        self.validation_rules = rules.to_vec();
        self
    }
}

/// Options accepted when writing a checkpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckpointOptions {
    pub can_resume: bool,
    pub metadata: CheckpointMetadata,
}

impl Default for CheckpointOptions {
    fn default() -> Self {
        Self {
            can_resume: true,
            metadata: CheckpointMetadata::default(),
        }
    }
}

/// An immutable execution snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub checkpoint_id: Uuid,
    pub schema_version: u32,
    pub execution_id: Uuid,
    /// The step whose completion triggered this snapshot.
    pub step_id: String,
    pub step_name: String,
    /// Deep copy of the execution at snapshot time.
    pub state: ExecutionState,
    pub can_resume: bool,
    #[serde(default)]
    pub metadata: CheckpointMetadata,
    pub created_at: DateTime<Utc>,
}

impl Checkpoint {
    /// Build a new checkpoint record from a snapshot.
    pub fn new(
        state: ExecutionState,
        step_id: &str,
        step_name: &str,
        options: CheckpointOptions,
    ) -> Self {
        Self {
            checkpoint_id: Uuid::now_v7(),
            schema_version: CHECKPOINT_SCHEMA_VERSION,
            execution_id: state.execution_id,
            step_id: step_id.to_string(),
            step_name: step_name.to_string(),
            state,
            can_resume: options.can_resume,
            metadata: options.metadata,
            created_at: Utc::now(),
        }
    }

    /// Whether this build knows how to read the snapshot.
    pub fn is_current_schema(&self) -> bool {
        self.schema_version == CHECKPOINT_SCHEMA_VERSION
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::NewExecution;
    use crate::step::StepKind;

    fn state() -> ExecutionState {
        ExecutionState::new(NewExecution {
            workflow_id: "wf".to_string(),
            user_prompt: "p".to_string(),
            goal: "g".to_string(),
            project_path: Some("/tmp/project".to_string()),
            total_steps: 1,
        })
    }

    #[test]
    fn new_checkpoint_takes_execution_id_from_snapshot() {
        let snapshot = state();
        let cp = Checkpoint::new(snapshot.clone(), "s1", "Step 1", CheckpointOptions::default());
        assert_eq!(cp.execution_id, snapshot.execution_id);
        assert_eq!(cp.schema_version, CHECKPOINT_SCHEMA_VERSION);
        assert!(cp.can_resume);
        assert!(cp.is_current_schema());
    }

    #[test]
    fn metadata_for_run_copies_steps_and_parallel() {
        let steps = vec![StepDescriptor::new("s1", "S1", StepKind::Custom)];
        let parallel = ParallelExecutionConfig::new(["s1"]);
        let meta = CheckpointMetadata::for_run(&steps, Some(&parallel));
        assert_eq!(meta.steps.as_deref(), Some(steps.as_slice()));
        assert_eq!(meta.parallel, Some(parallel));
    }

    #[test]
    fn future_schema_version_is_not_current() {
        let mut cp = Checkpoint::new(state(), "s1", "S1", CheckpointOptions::default());
        cp.schema_version = CHECKPOINT_SCHEMA_VERSION + 1;
        assert!(!cp.is_current_schema());
    }

    #[test]
    fn metadata_keeps_validation_rules() {
        let rules = vec![ValidationRule::NonEmptyOutput {
            step_id: "s1".to_string(),
        }];
        let meta = CheckpointMetadata::for_run(&[], None).with_validation_rules(&rules);
        let json = serde_json::to_string(&meta).unwrap();
        let back: CheckpointMetadata = serde_json::from_str(&json).unwrap();
        assert_eq!(back.validation_rules, rules);

        // Metadata written without rules still reads back.
        let old: CheckpointMetadata = serde_json::from_str(r#"{"steps":[]}"#).unwrap();
        assert!(old.validation_rules.is_empty());
    }

    #[test]
    fn metadata_omits_empty_fields() {
        let json = serde_json::to_value(CheckpointMetadata::default()).unwrap();
        assert_eq!(json, serde_json::json!({}));
    }
}

//! Event types for the workflow event bus.
//!
//! `WorkflowEvent` is broadcast while an execution progresses. All variants
//! are Clone + Send + Sync for use with tokio broadcast channels.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::step::StepKind;

/// Progress notifications emitted by the orchestrator and graph executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkflowEvent {
    /// A fresh execution has started.
    ExecutionStarted {
        execution_id: Uuid,
        workflow_id: String,
        total_steps: usize,
    },

    /// An execution was resumed from a checkpoint.
    ExecutionResumed {
        execution_id: Uuid,
        checkpoint_id: Uuid,
        remaining_steps: usize,
    },

    /// A step was handed to its executor.
    StepStarted {
        execution_id: Uuid,
        step_id: String,
        step_name: String,
        step_type: StepKind,
    },

    /// A step completed successfully.
    StepCompleted {
        execution_id: Uuid,
        step_id: String,
        step_name: String,
        duration_ms: u64,
    },

    /// A step failed; the execution fails with it.
    StepFailed {
        execution_id: Uuid,
        step_id: String,
        step_name: String,
        error: String,
    },

    /// A checkpoint was written after a step completed.
    CheckpointCreated {
        execution_id: Uuid,
        checkpoint_id: Uuid,
        step_id: String,
    },

    ExecutionCompleted {
        execution_id: Uuid,
        duration_ms: u64,
        steps_completed: usize,
    },

    ExecutionFailed {
        execution_id: Uuid,
        error: String,
    },

    ExecutionCancelled { execution_id: Uuid },
}

impl WorkflowEvent {
    /// The execution every variant belongs to.
    pub fn execution_id(&self) -> Uuid {
        match self {
            WorkflowEvent::ExecutionStarted { execution_id, .. }
            | WorkflowEvent::ExecutionResumed { execution_id, .. }
            | WorkflowEvent::StepStarted { execution_id, .. }
            | WorkflowEvent::StepCompleted { execution_id, .. }
            | WorkflowEvent::StepFailed { execution_id, .. }
            | WorkflowEvent::CheckpointCreated { execution_id, .. }
            | WorkflowEvent::ExecutionCompleted { execution_id, .. }
            | WorkflowEvent::ExecutionFailed { execution_id, .. }
            | WorkflowEvent::ExecutionCancelled { execution_id } => *execution_id,
        }
    }
}

//! Execution tracking types.
//!
//! `ExecutionState` is the record of one run of a workflow; it owns an ordered
//! list of `StepState`s, one per declared step. Both are plain data: all
//! mutation goes through a `StateStore`.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::step::StepDescriptor;

/// Output produced by a single step.
pub type OutputMap = serde_json::Map<String, serde_json::Value>;

// ---------------------------------------------------------------------------
// Status enums
// ---------------------------------------------------------------------------

/// Overall status of an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::Cancelled
        )
    }

    /// Whether moving from `self` to `next` respects the monotonic state machine.
    ///
    /// `Pending -> Running -> {Completed | Failed | Cancelled}`; a pending
    /// execution may also fail or be cancelled before it starts. Terminal
    /// states never move again (a resume restores a snapshot instead).
    pub fn can_transition_to(&self, next: ExecutionStatus) -> bool {
        use ExecutionStatus::*;
        match (self, next) {
            (a, b) if *a == b => true,
            (Pending, Running | Failed | Cancelled) => true,
            (Running, Completed | Failed | Cancelled) => true,
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of an individual step within an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Pending => "pending",
            StepStatus::Running => "running",
            StepStatus::Completed => "completed",
            StepStatus::Failed => "failed",
            StepStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Step state
// ---------------------------------------------------------------------------

/// Usage metrics reported by a step executor. Stored verbatim by the engine.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepMetrics {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost_usd: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_tokens: Option<u64>,
}

/// Progress record for one step of an execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepState {
    pub step_id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<OutputMap>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<StepMetrics>,
}

impl StepState {
    /// A fresh, pending step record for a declared step.
    pub fn pending(step: &StepDescriptor) -> Self {
        Self {
            step_id: step.id.clone(),
            name: step.name.clone(),
            description: step.description.clone(),
            status: StepStatus::Pending,
            output: None,
            error: None,
            started_at: None,
            completed_at: None,
            metrics: None,
        }
    }

    /// Clear everything a previous attempt recorded.
    pub fn reset(&mut self) {
        self.status = StepStatus::Pending;
        self.output = None;
        self.error = None;
        self.started_at = None;
        self.completed_at = None;
        self.metrics = None;
    }
}

// ---------------------------------------------------------------------------
// Execution state
// ---------------------------------------------------------------------------

/// Everything needed to create a new execution record.
#[derive(Debug, Clone)]
pub struct NewExecution {
    pub workflow_id: String,
    pub user_prompt: String,
    pub goal: String,
    pub project_path: Option<String>,
    pub total_steps: usize,
}

/// One run of a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionState {
    /// UUIDv7 execution ID.
    pub execution_id: Uuid,
    pub workflow_id: String,
    pub status: ExecutionStatus,
    pub user_prompt: String,
    pub goal: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_path: Option<String>,
    /// Number of declared steps. Fixed at creation.
    pub total_steps: usize,
    /// Step records in declaration order.
    #[serde(default)]
    pub steps: Vec<StepState>,
    /// Outputs of completed steps keyed by step ID.
    #[serde(default)]
    pub aggregate_output: BTreeMap<String, OutputMap>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_checkpoint_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl ExecutionState {
    /// A new pending execution with no step records yet.
    pub fn new(new: NewExecution) -> Self {
        let now = Utc::now();
        Self {
            execution_id: Uuid::now_v7(),
            workflow_id: new.workflow_id,
            status: ExecutionStatus::Pending,
            user_prompt: new.user_prompt,
            goal: new.goal,
            project_path: new.project_path,
            total_steps: new.total_steps,
            steps: Vec::with_capacity(new.total_steps),
            aggregate_output: BTreeMap::new(),
            error: None,
            current_checkpoint_id: None,
            created_at: now,
            started_at: None,
            completed_at: None,
            updated_at: now,
        }
    }

    pub fn step(&self, step_id: &str) -> Option<&StepState> {
        self.steps.iter().find(|s| s.step_id == step_id)
    }

    pub fn step_mut(&mut self, step_id: &str) -> Option<&mut StepState> {
        self.steps.iter_mut().find(|s| s.step_id == step_id)
    }

    /// IDs of steps that completed successfully, in declaration order.
    pub fn completed_step_ids(&self) -> Vec<&str> {
        self.steps
            .iter()
            .filter(|s| s.status == StepStatus::Completed)
            .map(|s| s.step_id.as_str())
            .collect()
    }

    /// Apply a status change, stamping `started_at` / `completed_at`.
    ///
    /// Callers are expected to have checked `can_transition_to` first.
    pub fn apply_status(&mut self, status: ExecutionStatus) {
        let now = Utc::now();
        if status == ExecutionStatus::Running && self.started_at.is_none() {
            self.started_at = Some(now);
        }
        if status.is_terminal() {
            self.completed_at = Some(now);
        } else {
            self.completed_at = None;
        }
        self.status = status;
        self.updated_at = now;
    }
}

//! Execution state store trait definition.
//!
//! Holds `ExecutionState` / `StepState` records. Every mutation the engine
//! performs on an execution goes through this interface; the infrastructure
//! layer (stepflow-infra) implements it with SQLite persistence.

use chrono::Utc;
use stepflow_types::error::RepositoryError;
use stepflow_types::execution::{
    ExecutionState, ExecutionStatus, NewExecution, OutputMap, StepMetrics, StepState, StepStatus,
};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// StepUpdate
// ---------------------------------------------------------------------------

/// A status change for one step, with whatever the transition carries.
#[derive(Debug, Clone, PartialEq)]
pub struct StepUpdate {
    pub status: StepStatus,
    pub output: Option<OutputMap>,
    pub error: Option<String>,
    pub metrics: Option<StepMetrics>,
}

impl StepUpdate {
    pub fn running() -> Self {
        Self::bare(StepStatus::Running)
    }

    pub fn completed(output: OutputMap, metrics: Option<StepMetrics>) -> Self {
        Self {
            status: StepStatus::Completed,
            output: Some(output),
            error: None,
            metrics,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: StepStatus::Failed,
            output: None,
            error: Some(error.into()),
            metrics: None,
        }
    }

    pub fn cancelled() -> Self {
        Self::bare(StepStatus::Cancelled)
    }

    fn bare(status: StepStatus) -> Self {
        Self {
            status,
            output: None,
            error: None,
            metrics: None,
        }
    }

    /// Apply this update to a step record and, for completions, to the
    /// execution's aggregate output.
    ///
    /// Shared by every `StateStore` implementation so the bookkeeping rules
    /// (timestamps, aggregate output) cannot drift between backends.
    pub fn apply(&self, state: &mut ExecutionState, step_id: &str) -> Result<(), RepositoryError> {
        let now = Utc::now();
        let step = state.step_mut(step_id).ok_or(RepositoryError::NotFound)?;

        match self.status {
            StepStatus::Running => {
                step.started_at = Some(now);
                step.completed_at = None;
            }
            StepStatus::Completed | StepStatus::Failed | StepStatus::Cancelled => {
                step.completed_at = Some(now);
            }
            StepStatus::Pending => {
                step.reset();
            }
        }
        step.status = self.status;
        if let Some(output) = &self.output {
            step.output = Some(output.clone());
        }
        if let Some(error) = &self.error {
            step.error = Some(error.clone());
        }
        if let Some(metrics) = &self.metrics {
            step.metrics = Some(metrics.clone());
        }

        if self.status == StepStatus::Completed {
            let output = self.output.clone().unwrap_or_default();
            state.aggregate_output.insert(step_id.to_string(), output);
        }
        state.updated_at = now;
        Ok(())
    }
}

/// Check a status change against the monotonic execution state machine.
pub fn check_transition(
    from: ExecutionStatus,
    to: ExecutionStatus,
) -> Result<(), RepositoryError> {
    if from.can_transition_to(to) {
        Ok(())
    } else {
        Err(RepositoryError::InvalidTransition { from, to })
    }
}

/// Check that a step can be appended to an execution.
pub fn check_add_step(state: &ExecutionState, step: &StepState) -> Result<(), RepositoryError> {
    if state.step(&step.step_id).is_some() {
        return Err(RepositoryError::Conflict(format!(
            "step '{}' already recorded for execution {}",
            step.step_id, state.execution_id
        )));
    }
    if state.steps.len() >= state.total_steps {
        return Err(RepositoryError::Conflict(format!(
            "execution {} already has all {} steps",
            state.execution_id, state.total_steps
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// StateStore
// ---------------------------------------------------------------------------

/// Store trait for execution state.
///
/// Status changes must respect [`ExecutionStatus::can_transition_to`];
/// implementations reject anything else with
/// [`RepositoryError::InvalidTransition`]. The only way back out of a terminal
/// status is [`StateStore::restore_state`], used by resume.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait StateStore: Send + Sync {
    /// Create a new pending execution with no step records.
    fn create_execution(
        &self,
        new: NewExecution,
    ) -> impl std::future::Future<Output = Result<ExecutionState, RepositoryError>> + Send;

    /// Move an execution to a new status.
    fn update_status(
        &self,
        execution_id: &Uuid,
        status: ExecutionStatus,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Append a step record. Fails once `total_steps` records exist.
    fn add_step(
        &self,
        execution_id: &Uuid,
        step: StepState,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Update one step's status and optionally its output/error/metrics.
    fn update_step_status(
        &self,
        execution_id: &Uuid,
        step_id: &str,
        update: StepUpdate,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Record the execution-level error message.
    fn set_error(
        &self,
        execution_id: &Uuid,
        error: &str,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Point the execution at its most recent checkpoint.
    fn set_checkpoint(
        &self,
        execution_id: &Uuid,
        checkpoint_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Get a full copy of an execution.
    fn get_state(
        &self,
        execution_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<ExecutionState>, RepositoryError>> + Send;

    /// List executions in creation order, optionally filtered by status.
    fn list_executions(
        &self,
        status: Option<ExecutionStatus>,
    ) -> impl std::future::Future<Output = Result<Vec<ExecutionState>, RepositoryError>> + Send;

    /// Overwrite an execution with a checkpoint snapshot (resume only).
    fn restore_state(
        &self,
        state: &ExecutionState,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;
}

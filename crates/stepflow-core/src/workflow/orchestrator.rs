//! Orchestrator: the public entry point for running, resuming, inspecting,
//! and cancelling workflow executions.
//!
//! Execution lifecycle: `Pending -> Running -> {Completed | Failed | Cancelled}`.
//! A resume restores a checkpoint snapshot under the same execution ID and
//! re-runs only the steps the snapshot had not completed.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use stepflow_types::checkpoint::{CHECKPOINT_SCHEMA_VERSION, Checkpoint, CheckpointMetadata};
use stepflow_types::config::{EngineConfig, ResumeBoundary};
use stepflow_types::error::RepositoryError;
use stepflow_types::event::WorkflowEvent;
use stepflow_types::execution::{
    ExecutionState, ExecutionStatus, NewExecution, StepState, StepStatus,
};
use stepflow_types::step::{ParallelExecutionConfig, StepDescriptor};
use stepflow_types::validation::ValidationRule;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

use crate::event::bus::EventBus;
use crate::repository::checkpoint::CheckpointStore;
use crate::repository::state::StateStore;

use super::definition::{WorkflowDefinition, WorkflowError, validate_steps};
use super::executor::{ExecutionOutcome, ExecutorError, GraphExecutor};
use super::graph::{Graph, GraphBuilder};
use super::step_executor::StepDispatcher;
use super::validation::evaluate_rules;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("checkpoint {0} not found")]
    CheckpointNotFound(Uuid),

    #[error("checkpoint {0} is marked as not resumable")]
    CheckpointNotResumable(Uuid),

    #[error("checkpoint schema version {found} is not supported (expected {expected})")]
    CheckpointSchemaMismatch { found: u32, expected: u32 },

    #[error("checkpoint {checkpoint_id} refers to step '{step_id}' which is not in the step list")]
    CheckpointStepNotFound { checkpoint_id: Uuid, step_id: String },

    #[error("no step list given and checkpoint {0} does not record one")]
    MissingStepList(Uuid),

    #[error("step list does not match the steps recorded by checkpoint {0}")]
    StepListMismatch(Uuid),

    #[error("step '{step_id}' has unsupported type '{step_type}'")]
    UnknownStepType { step_id: String, step_type: String },

    #[error("execution {0} is already running")]
    ExecutionInProgress(Uuid),

    #[error(transparent)]
    Workflow(#[from] WorkflowError),

    #[error(transparent)]
    Executor(#[from] ExecutorError),

    #[error("repository error: {0}")]
    Repository(#[from] RepositoryError),
}

// ---------------------------------------------------------------------------
// WorkflowRequest
// ---------------------------------------------------------------------------

/// Everything needed to start a fresh execution.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkflowRequest {
    pub workflow_id: String,
    pub user_prompt: String,
    pub goal: String,
    pub steps: Vec<StepDescriptor>,
    pub project_path: Option<String>,
    pub parallel_config: Option<ParallelExecutionConfig>,
    pub validation_rules: Vec<ValidationRule>,
}

impl WorkflowRequest {
    pub fn new(
        workflow_id: impl Into<String>,
        user_prompt: impl Into<String>,
        goal: impl Into<String>,
        steps: Vec<StepDescriptor>,
    ) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            user_prompt: user_prompt.into(),
            goal: goal.into(),
            steps,
            project_path: None,
            parallel_config: None,
            validation_rules: Vec::new(),
        }
    }

    /// Request for a stored definition; the definition name becomes the workflow ID.
    pub fn from_definition(
        def: WorkflowDefinition,
        user_prompt: impl Into<String>,
        goal: impl Into<String>,
    ) -> Self {
        Self {
            parallel_config: def.parallel,
            validation_rules: def.validation_rules,
            ..Self::new(def.name, user_prompt, goal, def.steps)
        }
    }

    pub fn with_project_path(mut self, path: impl Into<String>) -> Self {
        self.project_path = Some(path.into());
        self
    }

    pub fn with_parallel(mut self, parallel: ParallelExecutionConfig) -> Self {
        self.parallel_config = Some(parallel);
        self
    }

    pub fn with_validation_rules(mut self, rules: Vec<ValidationRule>) -> Self {
        self.validation_rules = rules;
        self
    }
}

/// Steps a resume has to run, in declaration order.
///
/// With [`ResumeBoundary::AfterCheckpoint`] that is every step the snapshot
/// does not record as Completed. [`ResumeBoundary::AtCheckpoint`] also
/// re-runs the step the checkpoint was taken for.
pub fn remaining_steps(
    steps: &[StepDescriptor],
    checkpoint_step_id: &str,
    snapshot: &ExecutionState,
    boundary: ResumeBoundary,
) -> Vec<StepDescriptor> {
    steps
        .iter()
        .filter(|step| {
            let completed = snapshot
                .step(&step.id)
                .is_some_and(|s| s.status == StepStatus::Completed);
            let rerun = boundary == ResumeBoundary::AtCheckpoint && step.id == checkpoint_step_id;
            !completed || rerun
        })
        .cloned()
        .collect()
}

/// Removes an execution's cancellation token when the run ends, on every path.
struct ActiveExecution<'a> {
    tokens: &'a DashMap<Uuid, CancellationToken>,
    execution_id: Uuid,
    token: CancellationToken,
}

impl Drop for ActiveExecution<'_> {
    fn drop(&mut self) {
        self.tokens.remove(&self.execution_id);
    }
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

/// Runs workflows against one pair of stores.
///
/// Stores are injected explicitly; the orchestrator keeps no global state.
pub struct Orchestrator<S, C> {
    state_store: Arc<S>,
    checkpoint_store: Arc<C>,
    dispatcher: Arc<StepDispatcher>,
    executor: GraphExecutor<S, C>,
    event_bus: EventBus,
    config: EngineConfig,
    /// Cancellation tokens of executions running in this orchestrator.
    cancellation_tokens: DashMap<Uuid, CancellationToken>,
}

impl<S: StateStore, C: CheckpointStore> Orchestrator<S, C> {
    pub fn new(
        state_store: Arc<S>,
        checkpoint_store: Arc<C>,
        dispatcher: StepDispatcher,
        config: EngineConfig,
    ) -> Self {
        let dispatcher = Arc::new(dispatcher);
        let event_bus = EventBus::new(config.event_bus_capacity);
        let executor = GraphExecutor::new(
            Arc::clone(&state_store),
            Arc::clone(&checkpoint_store),
            Arc::clone(&dispatcher),
            event_bus.clone(),
        );
        Self {
            state_store,
            checkpoint_store,
            dispatcher,
            executor,
            event_bus,
            config,
            cancellation_tokens: DashMap::new(),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Receive every `WorkflowEvent` published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<WorkflowEvent> {
        self.event_bus.subscribe()
    }

    /// Whether the execution is currently being driven by this orchestrator.
    pub fn is_active(&self, execution_id: &Uuid) -> bool {
        self.cancellation_tokens.contains_key(execution_id)
    }

    // -----------------------------------------------------------------------
    // Fresh execution
    // -----------------------------------------------------------------------

    /// Run a workflow to a terminal status and return the final state.
    ///
    /// A failing step is not an `Err`: the returned state has status Failed
    /// and an error message. `Err` means the request was rejected before
    /// anything ran, or a store failed mid-run.
    pub async fn execute_workflow(
        &self,
        request: WorkflowRequest,
    ) -> Result<ExecutionState, OrchestratorError> {
        validate_steps(&request.steps)?;
        self.ensure_supported(&request.steps)?;

        let state = self
            .state_store
            .create_execution(NewExecution {
                workflow_id: request.workflow_id.clone(),
                user_prompt: request.user_prompt.clone(),
                goal: request.goal.clone(),
                project_path: request.project_path.clone(),
                total_steps: request.steps.len(),
            })
            .await?;
        let execution_id = state.execution_id;

        for step in &request.steps {
            self.state_store
                .add_step(&execution_id, StepState::pending(step))
                .await?;
        }

        let active = self.activate(execution_id)?;
        self.state_store
            .update_status(&execution_id, ExecutionStatus::Running)
            .await?;

        self.event_bus.publish(WorkflowEvent::ExecutionStarted {
            execution_id,
            workflow_id: request.workflow_id.clone(),
            total_steps: request.steps.len(),
        });
        tracing::info!(
            execution_id = %execution_id,
            workflow_id = request.workflow_id.as_str(),
            steps = request.steps.len(),
            parallel = request.parallel_config.as_ref().is_some_and(|p| p.is_active()),
            "starting workflow execution"
        );

        let parallel = request.parallel_config.as_ref();
        let graph = GraphBuilder::build(&request.steps, parallel);
        let metadata = CheckpointMetadata::for_run(&request.steps, parallel)
            .with_validation_rules(&request.validation_rules);

        let state = self
            .drive(execution_id, &request.workflow_id, &graph, &metadata, &active.token)
            .await?;
        drop(active);

        evaluate_rules(&request.validation_rules, &state);
        Ok(state)
    }

    // -----------------------------------------------------------------------
    // Resume
    // -----------------------------------------------------------------------

    /// Continue an execution from one of its checkpoints.
    ///
    /// `steps` and `parallel_config` default to what the checkpoint recorded.
    /// The run's validation rules are carried by the checkpoint and evaluated
    /// again once the resumed run ends.
    /// Every check runs before the stored state is touched, so a rejected
    /// resume leaves the execution exactly as it was.
    pub async fn resume_from_checkpoint(
        &self,
        checkpoint_id: Uuid,
        steps: Option<Vec<StepDescriptor>>,
        parallel_config: Option<ParallelExecutionConfig>,
    ) -> Result<ExecutionState, OrchestratorError> {
        let checkpoint = self
            .checkpoint_store
            .load_checkpoint(&checkpoint_id)
            .await?
            .ok_or(OrchestratorError::CheckpointNotFound(checkpoint_id))?;

        if !checkpoint.is_current_schema() {
            return Err(OrchestratorError::CheckpointSchemaMismatch {
                found: checkpoint.schema_version,
                expected: CHECKPOINT_SCHEMA_VERSION,
            });
        }
        if !checkpoint.can_resume {
            return Err(OrchestratorError::CheckpointNotResumable(checkpoint_id));
        }

        let steps = steps
            .or_else(|| checkpoint.metadata.steps.clone())
            .ok_or(OrchestratorError::MissingStepList(checkpoint_id))?;
        let parallel = parallel_config.or_else(|| checkpoint.metadata.parallel.clone());
        self.check_resumable_steps(&checkpoint, &steps)?;

        let remaining = remaining_steps(
            &steps,
            &checkpoint.step_id,
            &checkpoint.state,
            self.config.resume_boundary,
        );
        // Completed steps never run again, so only the rest need an executor.
        self.ensure_supported(&remaining)?;

        let execution_id = checkpoint.execution_id;
        let active = self.activate(execution_id)?;

        let restored = restore_snapshot(&checkpoint, &remaining);
        self.state_store.restore_state(&restored).await?;

        self.event_bus.publish(WorkflowEvent::ExecutionResumed {
            execution_id,
            checkpoint_id,
            remaining_steps: remaining.len(),
        });
        tracing::info!(
            execution_id = %execution_id,
            checkpoint_id = %checkpoint_id,
            step_id = checkpoint.step_id.as_str(),
            remaining = remaining.len(),
            boundary = ?self.config.resume_boundary,
            "resuming workflow execution"
        );

        let remaining_ids: HashSet<&str> = remaining.iter().map(|s| s.id.as_str()).collect();
        let sliced = parallel
            .as_ref()
            .map(|p| p.retain_steps(&remaining_ids))
            .filter(|p| !p.steps.is_empty());
        let graph = GraphBuilder::build(&remaining, sliced.as_ref());
        let rules = checkpoint.metadata.validation_rules.clone();
        let metadata =
            CheckpointMetadata::for_run(&steps, parallel.as_ref()).with_validation_rules(&rules);

        // With nothing left the empty graph completes without invoking any executor.
        let state = self
            .drive(execution_id, &checkpoint.state.workflow_id, &graph, &metadata, &active.token)
            .await?;
        drop(active);

        evaluate_rules(&rules, &state);
        Ok(state)
    }

    fn check_resumable_steps(
        &self,
        checkpoint: &Checkpoint,
        steps: &[StepDescriptor],
    ) -> Result<(), OrchestratorError> {
        validate_steps(steps)?;

        if !steps.iter().any(|s| s.id == checkpoint.step_id) {
            return Err(OrchestratorError::CheckpointStepNotFound {
                checkpoint_id: checkpoint.checkpoint_id,
                step_id: checkpoint.step_id.clone(),
            });
        }

        let declared = steps.iter().map(|s| s.id.as_str());
        let recorded = checkpoint.state.steps.iter().map(|s| s.step_id.as_str());
        if !declared.eq(recorded) {
            return Err(OrchestratorError::StepListMismatch(checkpoint.checkpoint_id));
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Inspection / cancellation
    // -----------------------------------------------------------------------

    pub async fn get_execution_status(
        &self,
        execution_id: &Uuid,
    ) -> Result<Option<ExecutionState>, OrchestratorError> {
        Ok(self.state_store.get_state(execution_id).await?)
    }

    pub async fn list_executions(
        &self,
        status: Option<ExecutionStatus>,
    ) -> Result<Vec<ExecutionState>, OrchestratorError> {
        Ok(self.state_store.list_executions(status).await?)
    }

    /// The most recent checkpoint of an execution, for resuming.
    pub async fn latest_checkpoint(
        &self,
        execution_id: &Uuid,
    ) -> Result<Option<Checkpoint>, OrchestratorError> {
        Ok(self.checkpoint_store.latest_checkpoint(execution_id).await?)
    }

    /// Request cancellation of a running execution.
    ///
    /// Returns `false` without touching anything unless the execution is
    /// Running. Cancellation is advisory: steps already in flight finish,
    /// steps not yet started are skipped.
    pub async fn cancel_execution(&self, execution_id: &Uuid) -> Result<bool, OrchestratorError> {
        let Some(state) = self.state_store.get_state(execution_id).await? else {
            return Ok(false);
        };
        if state.status != ExecutionStatus::Running {
            return Ok(false);
        }

        match self
            .state_store
            .update_status(execution_id, ExecutionStatus::Cancelled)
            .await
        {
            Ok(()) => {}
            // Finished between the read and the write.
            Err(RepositoryError::InvalidTransition { .. }) => return Ok(false),
            Err(e) => return Err(e.into()),
        }

        if let Some(token) = self.cancellation_tokens.get(execution_id) {
            token.cancel();
        }
        self.event_bus.publish(WorkflowEvent::ExecutionCancelled {
            execution_id: *execution_id,
        });
        tracing::info!(execution_id = %execution_id, "execution cancelled");
        Ok(true)
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn ensure_supported(&self, steps: &[StepDescriptor]) -> Result<(), OrchestratorError> {
        match self.dispatcher.first_unsupported(steps) {
            Some(step) => Err(OrchestratorError::UnknownStepType {
                step_id: step.id.clone(),
                step_type: step.kind.to_string(),
            }),
            None => Ok(()),
        }
    }

    fn activate(&self, execution_id: Uuid) -> Result<ActiveExecution<'_>, OrchestratorError> {
        let token = CancellationToken::new();
        match self.cancellation_tokens.entry(execution_id) {
            Entry::Occupied(_) => return Err(OrchestratorError::ExecutionInProgress(execution_id)),
            Entry::Vacant(slot) => {
                slot.insert(token.clone());
            }
        }
        Ok(ActiveExecution {
            tokens: &self.cancellation_tokens,
            execution_id,
            token,
        })
    }

    /// Run the graph and settle the terminal status, inside a
    /// `workflow.execute` span.
    async fn drive(
        &self,
        execution_id: Uuid,
        workflow_id: &str,
        graph: &Graph,
        metadata: &CheckpointMetadata,
        cancel: &CancellationToken,
    ) -> Result<ExecutionState, OrchestratorError> {
        let span = tracing::info_span!(
            "workflow.execute",
            execution_id = %execution_id,
            workflow_id,
            steps = graph.step_count(),
        );
        self.run_and_settle(execution_id, graph, metadata, cancel)
            .instrument(span)
            .await
    }

    async fn run_and_settle(
        &self,
        execution_id: Uuid,
        graph: &Graph,
        metadata: &CheckpointMetadata,
        cancel: &CancellationToken,
    ) -> Result<ExecutionState, OrchestratorError> {
        let started = Instant::now();
        let outcome = match self.executor.run(execution_id, graph, metadata, cancel).await {
            Ok(outcome) => outcome,
            Err(e) => {
                self.mark_failed(execution_id, &e.to_string()).await;
                return Err(e.into());
            }
        };

        match self
            .state_store
            .update_status(&execution_id, outcome.status())
            .await
        {
            Ok(()) => {}
            // Cancelled while the last steps were finishing.
            Err(RepositoryError::InvalidTransition { from, to }) => {
                tracing::debug!(
                    execution_id = %execution_id,
                    status = %from,
                    outcome = %to,
                    "execution already terminal, keeping status"
                );
            }
            Err(e) => return Err(e.into()),
        }

        let state = self
            .state_store
            .get_state(&execution_id)
            .await?
            .ok_or(OrchestratorError::Repository(RepositoryError::NotFound))?;
        let duration_ms = started.elapsed().as_millis() as u64;

        match (&outcome, state.status) {
            (_, ExecutionStatus::Completed) => {
                self.event_bus.publish(WorkflowEvent::ExecutionCompleted {
                    execution_id,
                    duration_ms,
                    steps_completed: state.completed_step_ids().len(),
                });
            }
            (ExecutionOutcome::Failed { error, .. }, ExecutionStatus::Failed) => {
                self.event_bus.publish(WorkflowEvent::ExecutionFailed {
                    execution_id,
                    error: state.error.clone().unwrap_or_else(|| error.clone()),
                });
            }
            // Cancellation was announced by `cancel_execution`.
            _ => {}
        }

        tracing::info!(
            execution_id = %execution_id,
            status = %state.status,
            duration_ms,
            steps_completed = state.completed_step_ids().len(),
            "workflow execution finished"
        );
        Ok(state)
    }

    /// Best effort: the run is already failing with a more relevant error,
    /// so store errors here are only logged.
    async fn mark_failed(&self, execution_id: Uuid, error: &str) {
        if let Err(e) = self.state_store.set_error(&execution_id, error).await {
            tracing::warn!(execution_id = %execution_id, error = %e, "failed to record execution error");
        }
        match self
            .state_store
            .update_status(&execution_id, ExecutionStatus::Failed)
            .await
        {
            Ok(()) | Err(RepositoryError::InvalidTransition { .. }) => {}
            Err(e) => {
                tracing::warn!(execution_id = %execution_id, error = %e, "failed to mark execution failed");
            }
        }
        self.event_bus.publish(WorkflowEvent::ExecutionFailed {
            execution_id,
            error: error.to_string(),
        });
        tracing::warn!(execution_id = %execution_id, error, "workflow execution aborted");
    }
}

/// The snapshot as it should be stored when a resume starts.
fn restore_snapshot(checkpoint: &Checkpoint, remaining: &[StepDescriptor]) -> ExecutionState {
    let mut restored = checkpoint.state.clone();
    for step in remaining {
        if let Some(record) = restored.step_mut(&step.id) {
            record.reset();
        }
        restored.aggregate_output.remove(&step.id);
    }
    restored.error = None;
    restored.current_checkpoint_id = Some(checkpoint.checkpoint_id);
    restored.apply_status(ExecutionStatus::Running);
    restored
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use stepflow_types::checkpoint::CheckpointOptions;
    use stepflow_types::step::StepKind;

    use crate::workflow::definition::parse_workflow_yaml;

    fn steps(ids: &[&str]) -> Vec<StepDescriptor> {
        ids.iter()
            .map(|id| StepDescriptor::new(*id, *id, StepKind::Custom))
            .collect()
    }

    fn snapshot(ids: &[&str], completed: &[&str]) -> ExecutionState {
        let mut state = ExecutionState::new(NewExecution {
            workflow_id: "wf".to_string(),
            user_prompt: String::new(),
            goal: String::new(),
            project_path: None,
            total_steps: ids.len(),
        });
        for step in steps(ids) {
            let mut record = StepState::pending(&step);
            if completed.contains(&step.id.as_str()) {
                record.status = StepStatus::Completed;
                let mut output = serde_json::Map::new();
                output.insert("done".to_string(), json!(true));
                state.aggregate_output.insert(step.id.clone(), output);
            }
            state.steps.push(record);
        }
        state.status = ExecutionStatus::Running;
        state
    }

    fn ids(steps: &[StepDescriptor]) -> Vec<&str> {
        steps.iter().map(|s| s.id.as_str()).collect()
    }

    #[test]
    fn remaining_after_checkpoint_skips_completed() {
        let all = steps(&["s1", "s2", "s3", "s4"]);
        let snap = snapshot(&["s1", "s2", "s3", "s4"], &["s1", "s2"]);
        let rest = remaining_steps(&all, "s2", &snap, ResumeBoundary::AfterCheckpoint);
        assert_eq!(ids(&rest), vec!["s3", "s4"]);
    }

    #[test]
    fn remaining_at_checkpoint_reruns_its_step() {
        let all = steps(&["s1", "s2", "s3"]);
        let snap = snapshot(&["s1", "s2", "s3"], &["s1", "s2"]);
        let rest = remaining_steps(&all, "s2", &snap, ResumeBoundary::AtCheckpoint);
        assert_eq!(ids(&rest), vec!["s2", "s3"]);
    }

    #[test]
    fn remaining_picks_up_unfinished_sibling() {
        // Snapshot taken after s3 finished while its sibling s2 was still running.
        let all = steps(&["s1", "s2", "s3", "s4"]);
        let snap = snapshot(&["s1", "s2", "s3", "s4"], &["s1", "s3"]);
        let rest = remaining_steps(&all, "s3", &snap, ResumeBoundary::AfterCheckpoint);
        assert_eq!(ids(&rest), vec!["s2", "s4"]);
    }

    #[test]
    fn restore_resets_remaining_and_points_at_checkpoint() {
        let snap = snapshot(&["s1", "s2"], &["s1", "s2"]);
        let checkpoint = Checkpoint::new(snap, "s2", "s2", CheckpointOptions::default());
        let rest = steps(&["s2"]);

        let restored = restore_snapshot(&checkpoint, &rest);
        assert_eq!(restored.step("s2").unwrap().status, StepStatus::Pending);
        assert_eq!(restored.step("s1").unwrap().status, StepStatus::Completed);
        assert!(!restored.aggregate_output.contains_key("s2"));
        assert!(restored.aggregate_output.contains_key("s1"));
        assert_eq!(restored.current_checkpoint_id, Some(checkpoint.checkpoint_id));
        assert_eq!(restored.status, ExecutionStatus::Running);
        assert!(restored.completed_at.is_none());
    }

    #[test]
    fn request_from_definition() {
        let def = parse_workflow_yaml(
            r#"
name: nightly
steps:
  - { id: a, name: A, type: cli, command: "make test" }
  - { id: b, name: B, type: custom }
parallel: { enabled: true, steps: [a, b] }
"#,
        )
        .unwrap();
        let request = WorkflowRequest::from_definition(def, "run it", "green build")
            .with_project_path("/work/repo");
        assert_eq!(request.workflow_id, "nightly");
        assert_eq!(request.steps.len(), 2);
        assert!(request.parallel_config.unwrap().is_active());
        assert_eq!(request.project_path.as_deref(), Some("/work/repo"));
    }
}

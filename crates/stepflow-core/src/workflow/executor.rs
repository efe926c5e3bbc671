//! Graph executor: dependency-ordered step execution with a checkpoint after
//! every successful step.
//!
//! # Execution flow
//!
//! 1. Every node waits for all of its predecessors (in-degree countdown).
//! 2. Ready steps are marked Running and spawned on a `JoinSet`; fork-join
//!    branches become ready together and run concurrently.
//! 3. Each success is recorded, snapshotted into the `CheckpointStore`, and
//!    releases its successors.
//! 4. The first failure (an error or a panic in the step) is recorded,
//!    in-flight siblings are detached and marked Cancelled, and nothing
//!    downstream runs.
//!
//! Only this coordinating loop touches the stores; spawned tasks only run the
//! step executor and hand back its result.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use petgraph::graph::NodeIndex;
use stepflow_types::checkpoint::{CheckpointMetadata, CheckpointOptions};
use stepflow_types::error::RepositoryError;
use stepflow_types::event::WorkflowEvent;
use stepflow_types::execution::{ExecutionStatus, OutputMap};
use stepflow_types::step::{StepDescriptor, StepKind};
use tokio::task::{self, JoinError, JoinSet};
use tracing::Instrument;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::event::bus::EventBus;
use crate::repository::checkpoint::CheckpointStore;
use crate::repository::state::{StateStore, StepUpdate};

use super::graph::{Graph, GraphNode};
use super::step_executor::{StepContext, StepDispatcher, StepExecutionError, StepOutput};

// ---------------------------------------------------------------------------
// ExecutionOutcome / ExecutorError
// ---------------------------------------------------------------------------

/// How a graph run ended. Step failures are an outcome, not an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionOutcome {
    Completed,
    Failed { step_id: String, error: String },
    Cancelled,
}

impl ExecutionOutcome {
    pub fn status(&self) -> ExecutionStatus {
        match self {
            ExecutionOutcome::Completed => ExecutionStatus::Completed,
            ExecutionOutcome::Failed { .. } => ExecutionStatus::Failed,
            ExecutionOutcome::Cancelled => ExecutionStatus::Cancelled,
        }
    }
}

/// Errors that abort a graph run outright.
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error("repository error: {0}")]
    Repository(#[from] RepositoryError),

    #[error("no executor registered for step '{step_id}' of type '{kind}'")]
    MissingExecutor { step_id: String, kind: StepKind },

    #[error("execution {0} not found")]
    ExecutionNotFound(Uuid),

    #[error("step task failed to join: {0}")]
    TaskJoin(String),
}

type StepResult = (Result<StepOutput, StepExecutionError>, Duration);

// ---------------------------------------------------------------------------
// GraphExecutor
// ---------------------------------------------------------------------------

/// Runs a built `Graph` against the stores of one orchestrator.
pub struct GraphExecutor<S, C> {
    state_store: Arc<S>,
    checkpoint_store: Arc<C>,
    dispatcher: Arc<StepDispatcher>,
    event_bus: EventBus,
}

impl<S: StateStore, C: CheckpointStore> GraphExecutor<S, C> {
    pub fn new(
        state_store: Arc<S>,
        checkpoint_store: Arc<C>,
        dispatcher: Arc<StepDispatcher>,
        event_bus: EventBus,
    ) -> Self {
        Self {
            state_store,
            checkpoint_store,
            dispatcher,
            event_bus,
        }
    }

    /// Execute every step of `graph` for an existing execution.
    ///
    /// Step records for all graph steps must already exist in the state
    /// store. `metadata` is attached to every checkpoint written. Prior
    /// outputs are seeded from the stored `aggregate_output`, so a resumed
    /// run sees what the snapshot recorded.
    pub async fn run(
        &self,
        execution_id: Uuid,
        graph: &Graph,
        metadata: &CheckpointMetadata,
        cancel: &CancellationToken,
    ) -> Result<ExecutionOutcome, ExecutorError> {
        let state = self
            .state_store
            .get_state(&execution_id)
            .await?
            .ok_or(ExecutorError::ExecutionNotFound(execution_id))?;

        let unsupported = graph
            .node_indices()
            .filter_map(|idx| graph.step(idx))
            .find(|step| !self.dispatcher.supports(step.kind));
        if let Some(step) = unsupported {
            return Err(ExecutorError::MissingExecutor {
                step_id: step.id.clone(),
                kind: step.kind,
            });
        }

        let mut prior_outputs: BTreeMap<String, OutputMap> = state.aggregate_output.clone();
        let mut remaining: HashMap<NodeIndex, usize> = graph
            .node_indices()
            .map(|idx| (idx, graph.predecessors(idx).len()))
            .collect();
        let mut ready: VecDeque<NodeIndex> = VecDeque::from([graph.entry()]);
        let mut in_flight: HashSet<NodeIndex> = HashSet::new();
        let mut tasks: HashMap<task::Id, NodeIndex> = HashMap::new();
        let mut join_set: JoinSet<StepResult> = JoinSet::new();

        loop {
            while let Some(idx) = ready.pop_front() {
                let step = match graph.node(idx) {
                    GraphNode::Start | GraphNode::End => {
                        release(graph, idx, &mut remaining, &mut ready);
                        continue;
                    }
                    GraphNode::Step(step) => step,
                };

                if cancel.is_cancelled() {
                    tracing::debug!(
                        execution_id = %execution_id,
                        step_id = step.id.as_str(),
                        "execution cancelled, not starting step"
                    );
                    continue;
                }

                let executor = self.dispatcher.resolve(step.kind).cloned().ok_or_else(|| {
                    ExecutorError::MissingExecutor {
                        step_id: step.id.clone(),
                        kind: step.kind,
                    }
                })?;

                self.state_store
                    .update_step_status(&execution_id, &step.id, StepUpdate::running())
                    .await?;
                self.event_bus.publish(WorkflowEvent::StepStarted {
                    execution_id,
                    step_id: step.id.clone(),
                    step_name: step.name.clone(),
                    step_type: step.kind,
                });
                tracing::debug!(
                    execution_id = %execution_id,
                    step_id = step.id.as_str(),
                    step_type = %step.kind,
                    "step started"
                );

                let ctx = StepContext::new(&state, step, prior_outputs.clone());
                let config = step.config.clone();
                let span = tracing::info_span!(
                    "workflow.step",
                    execution_id = %execution_id,
                    step_id = step.id.as_str(),
                    step_type = %step.kind,
                );
                let handle = join_set.spawn(
                    async move {
                        let started = Instant::now();
                        let result = executor.execute(&ctx, &config).await;
                        (result, started.elapsed())
                    }
                    .instrument(span),
                );
                tasks.insert(handle.id(), idx);
                in_flight.insert(idx);
            }

            let Some(joined) = join_set.join_next_with_id().await else {
                break;
            };
            let (idx, result, elapsed) = match joined {
                Ok((id, (result, elapsed))) => match tasks.remove(&id) {
                    Some(idx) => (idx, result, elapsed),
                    None => continue,
                },
                // A panicking step fails like any other step.
                Err(e) if e.is_panic() => match tasks.remove(&e.id()) {
                    Some(idx) => (idx, Err(panic_error(e)), Duration::ZERO),
                    None => continue,
                },
                Err(e) => return Err(ExecutorError::TaskJoin(e.to_string())),
            };
            in_flight.remove(&idx);
            let Some(step) = graph.step(idx) else {
                continue;
            };

            match result {
                Ok(output) => {
                    self.record_success(execution_id, step, &output, elapsed, metadata)
                        .await?;
                    prior_outputs.insert(step.id.clone(), output.values);
                    release(graph, idx, &mut remaining, &mut ready);
                }
                Err(e) => {
                    // Fail fast: siblings keep running detached, their results are dropped.
                    join_set.detach_all();
                    let error = e.to_string();
                    self.record_failure(execution_id, step, &error, graph, &in_flight)
                        .await?;
                    return Ok(ExecutionOutcome::Failed {
                        step_id: step.id.clone(),
                        error,
                    });
                }
            }
        }

        if cancel.is_cancelled() {
            Ok(ExecutionOutcome::Cancelled)
        } else {
            Ok(ExecutionOutcome::Completed)
        }
    }

    async fn record_success(
        &self,
        execution_id: Uuid,
        step: &StepDescriptor,
        output: &StepOutput,
        elapsed: Duration,
        metadata: &CheckpointMetadata,
    ) -> Result<(), ExecutorError> {
        self.state_store
            .update_step_status(
                &execution_id,
                &step.id,
                StepUpdate::completed(output.values.clone(), output.metrics.clone()),
            )
            .await?;
        self.event_bus.publish(WorkflowEvent::StepCompleted {
            execution_id,
            step_id: step.id.clone(),
            step_name: step.name.clone(),
            duration_ms: elapsed.as_millis() as u64,
        });

        let snapshot = self
            .state_store
            .get_state(&execution_id)
            .await?
            .ok_or(ExecutorError::ExecutionNotFound(execution_id))?;
        let checkpoint_id = self
            .checkpoint_store
            .create_checkpoint(
                &snapshot,
                &step.id,
                &step.name,
                CheckpointOptions {
                    can_resume: true,
                    metadata: metadata.clone(),
                },
            )
            .await?;
        self.state_store
            .set_checkpoint(&execution_id, &checkpoint_id)
            .await?;
        self.event_bus.publish(WorkflowEvent::CheckpointCreated {
            execution_id,
            checkpoint_id,
            step_id: step.id.clone(),
        });

        tracing::debug!(
            execution_id = %execution_id,
            step_id = step.id.as_str(),
            checkpoint_id = %checkpoint_id,
            duration_ms = elapsed.as_millis() as u64,
            "step completed"
        );
        Ok(())
    }

    async fn record_failure(
        &self,
        execution_id: Uuid,
        step: &StepDescriptor,
        error: &str,
        graph: &Graph,
        in_flight: &HashSet<NodeIndex>,
    ) -> Result<(), ExecutorError> {
        self.state_store
            .update_step_status(&execution_id, &step.id, StepUpdate::failed(error))
            .await?;
        self.state_store
            .set_error(&execution_id, &format!("step '{}' failed: {error}", step.id))
            .await?;
        match self
            .state_store
            .update_status(&execution_id, ExecutionStatus::Failed)
            .await
        {
            // Already cancelled by the caller: keep that status.
            Ok(()) | Err(RepositoryError::InvalidTransition { .. }) => {}
            Err(e) => return Err(e.into()),
        }

        for sibling in in_flight.iter().filter_map(|idx| graph.step(*idx)) {
            self.state_store
                .update_step_status(&execution_id, &sibling.id, StepUpdate::cancelled())
                .await?;
        }

        self.event_bus.publish(WorkflowEvent::StepFailed {
            execution_id,
            step_id: step.id.clone(),
            step_name: step.name.clone(),
            error: error.to_string(),
        });
        tracing::warn!(
            execution_id = %execution_id,
            step_id = step.id.as_str(),
            error,
            detached = in_flight.len(),
            "step failed"
        );
        Ok(())
    }
}

fn panic_error(e: JoinError) -> StepExecutionError {
    let payload = e.into_panic();
    let message = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic payload".to_string());
    StepExecutionError::Failed(format!("step panicked: {message}"))
}

/// Count down the in-degree of every successor of `idx`, queueing the ones
/// that became ready.
fn release(
    graph: &Graph,
    idx: NodeIndex,
    remaining: &mut HashMap<NodeIndex, usize>,
    ready: &mut VecDeque<NodeIndex>,
) {
    for next in graph.successors(idx) {
        if let Some(count) = remaining.get_mut(&next) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                ready.push_back(next);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

//! Step executor seam and kind-based dispatch.
//!
//! The engine never runs step logic itself. Callers plug one `StepExecutor`
//! per `StepKind` into a `StepDispatcher`; the graph executor resolves the
//! executor for each step with a `match` on its kind.
//!
//! `StepExecutor` uses RPITIT and so cannot be a trait object. The same
//! blanket-impl pattern as the LLM provider wrapper applies:
//! 1. `StepExecutorDyn` is the object-safe twin with boxed futures
//! 2. every `T: StepExecutor` implements it
//! 3. `BoxStepExecutor` holds an `Arc<dyn StepExecutorDyn>` and delegates

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use stepflow_types::execution::{ExecutionState, OutputMap, StepMetrics};
use stepflow_types::step::{StepConfig, StepDescriptor, StepKind};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Context / output / error
// ---------------------------------------------------------------------------

/// Everything a step executor gets to see about the running execution.
#[derive(Debug, Clone, PartialEq)]
pub struct StepContext {
    pub execution_id: Uuid,
    pub step_id: String,
    pub step_name: String,
    pub step_kind: StepKind,
    pub user_prompt: String,
    pub goal: String,
    pub project_path: Option<String>,
    /// Outputs of every step that completed before this one started.
    pub prior_outputs: BTreeMap<String, OutputMap>,
}

impl StepContext {
    pub fn new(
        state: &ExecutionState,
        step: &StepDescriptor,
        prior_outputs: BTreeMap<String, OutputMap>,
    ) -> Self {
        Self {
            execution_id: state.execution_id,
            step_id: step.id.clone(),
            step_name: step.name.clone(),
            step_kind: step.kind,
            user_prompt: state.user_prompt.clone(),
            goal: state.goal.clone(),
            project_path: state.project_path.clone(),
            prior_outputs,
        }
    }

    /// Output of an earlier step, if it completed.
    pub fn output_of(&self, step_id: &str) -> Option<&OutputMap> {
        self.prior_outputs.get(step_id)
    }
}

/// What a successful step hands back.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StepOutput {
    pub values: OutputMap,
    pub metrics: Option<StepMetrics>,
}

impl StepOutput {
    /// A step that produced nothing. Still a success.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn new(values: OutputMap) -> Self {
        Self {
            values,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: StepMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }
}

/// Errors a step executor may report. Any of them fails the execution.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StepExecutionError {
    #[error("{0}")]
    Failed(String),

    #[error("invalid step config: {0}")]
    InvalidConfig(String),
}

// ---------------------------------------------------------------------------
// StepExecutor
// ---------------------------------------------------------------------------

/// Runs one kind of step.
///
/// `config` is the step descriptor's opaque payload (every field besides
/// `id`, `name`, `description`, and `type`).
pub trait StepExecutor: Send + Sync {
    fn execute(
        &self,
        ctx: &StepContext,
        config: &StepConfig,
    ) -> impl Future<Output = Result<StepOutput, StepExecutionError>> + Send;
}

/// Object-safe version of [`StepExecutor`] with boxed futures.
pub trait StepExecutorDyn: Send + Sync {
    fn execute_boxed<'a>(
        &'a self,
        ctx: &'a StepContext,
        config: &'a StepConfig,
    ) -> Pin<Box<dyn Future<Output = Result<StepOutput, StepExecutionError>> + Send + 'a>>;
}

impl<T: StepExecutor> StepExecutorDyn for T {
    fn execute_boxed<'a>(
        &'a self,
        ctx: &'a StepContext,
        config: &'a StepConfig,
    ) -> Pin<Box<dyn Future<Output = Result<StepOutput, StepExecutionError>> + Send + 'a>> {
        Box::pin(self.execute(ctx, config))
    }
}

/// Type-erased, cheaply clonable step executor.
///
/// Clones share the same executor, so one can be moved into each spawned
/// branch task.
#[derive(Clone)]
pub struct BoxStepExecutor {
    inner: Arc<dyn StepExecutorDyn>,
}

impl BoxStepExecutor {
    pub fn new<T: StepExecutor + 'static>(executor: T) -> Self {
        Self {
            inner: Arc::new(executor),
        }
    }

    pub async fn execute(
        &self,
        ctx: &StepContext,
        config: &StepConfig,
    ) -> Result<StepOutput, StepExecutionError> {
        self.inner.execute_boxed(ctx, config).await
    }
}

impl std::fmt::Debug for BoxStepExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoxStepExecutor").finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// StepDispatcher
// ---------------------------------------------------------------------------

/// One optional executor per step kind.
#[derive(Clone, Default)]
pub struct StepDispatcher {
    llm: Option<BoxStepExecutor>,
    cli: Option<BoxStepExecutor>,
    custom: Option<BoxStepExecutor>,
}

impl StepDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_llm<T: StepExecutor + 'static>(mut self, executor: T) -> Self {
        self.register(StepKind::Llm, BoxStepExecutor::new(executor));
        self
    }

    pub fn with_cli<T: StepExecutor + 'static>(mut self, executor: T) -> Self {
        self.register(StepKind::Cli, BoxStepExecutor::new(executor));
        self
    }

    pub fn with_custom<T: StepExecutor + 'static>(mut self, executor: T) -> Self {
        self.register(StepKind::Custom, BoxStepExecutor::new(executor));
        self
    }

    /// Install (or replace) the executor for `kind`.
    pub fn register(&mut self, kind: StepKind, executor: BoxStepExecutor) {
        let slot = match kind {
            StepKind::Llm => &mut self.llm,
            StepKind::Cli => &mut self.cli,
            StepKind::Custom => &mut self.custom,
        };
        *slot = Some(executor);
    }

    pub fn resolve(&self, kind: StepKind) -> Option<&BoxStepExecutor> {
        match kind {
            StepKind::Llm => self.llm.as_ref(),
            StepKind::Cli => self.cli.as_ref(),
            StepKind::Custom => self.custom.as_ref(),
        }
    }

    pub fn supports(&self, kind: StepKind) -> bool {
        self.resolve(kind).is_some()
    }

    /// The first step whose kind has no executor, if any.
    pub fn first_unsupported<'a>(&self, steps: &'a [StepDescriptor]) -> Option<&'a StepDescriptor> {
        steps.iter().find(|s| !self.supports(s.kind))
    }
}

impl std::fmt::Debug for StepDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kinds: Vec<&str> = StepKind::ALL
            .iter()
            .filter(|k| self.supports(**k))
            .map(|k| k.as_str())
            .collect();
        f.debug_struct("StepDispatcher")
            .field("registered", &kinds)
            .finish()
    }
}

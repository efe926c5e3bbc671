//! In-memory store adapters backed by `DashMap`.
//!
//! Each execution and checkpoint lives in its own map entry, so distinct
//! executions never contend on a shared lock. Reads hand out clones: callers
//! never alias the stored record.

use dashmap::DashMap;
use stepflow_types::checkpoint::{Checkpoint, CheckpointOptions};
use stepflow_types::error::RepositoryError;
use stepflow_types::execution::{ExecutionState, ExecutionStatus, NewExecution, StepState};
use uuid::Uuid;

use super::checkpoint::CheckpointStore;
use super::state::{StateStore, StepUpdate, check_add_step, check_transition};

// ---------------------------------------------------------------------------
// InMemoryStateStore
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct InMemoryStateStore {
    executions: DashMap<Uuid, ExecutionState>,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_execution<T>(
        &self,
        execution_id: &Uuid,
        f: impl FnOnce(&mut ExecutionState) -> Result<T, RepositoryError>,
    ) -> Result<T, RepositoryError> {
        let mut entry = self
            .executions
            .get_mut(execution_id)
            .ok_or(RepositoryError::NotFound)?;
        f(entry.value_mut())
    }
}

impl StateStore for InMemoryStateStore {
    async fn create_execution(&self, new: NewExecution) -> Result<ExecutionState, RepositoryError> {
        let state = ExecutionState::new(new);
        self.executions.insert(state.execution_id, state.clone());
        Ok(state)
    }

    async fn update_status(
        &self,
        execution_id: &Uuid,
        status: ExecutionStatus,
    ) -> Result<(), RepositoryError> {
        self.with_execution(execution_id, |state| {
            check_transition(state.status, status)?;
            state.apply_status(status);
            Ok(())
        })
    }

    async fn add_step(&self, execution_id: &Uuid, step: StepState) -> Result<(), RepositoryError> {
        self.with_execution(execution_id, |state| {
            check_add_step(state, &step)?;
            state.steps.push(step);
            state.updated_at = chrono::Utc::now();
            Ok(())
        })
    }

    async fn update_step_status(
        &self,
        execution_id: &Uuid,
        step_id: &str,
        update: StepUpdate,
    ) -> Result<(), RepositoryError> {
        self.with_execution(execution_id, |state| update.apply(state, step_id))
    }

    async fn set_error(&self, execution_id: &Uuid, error: &str) -> Result<(), RepositoryError> {
        self.with_execution(execution_id, |state| {
            state.error = Some(error.to_string());
            state.updated_at = chrono::Utc::now();
            Ok(())
        })
    }

    async fn set_checkpoint(
        &self,
        execution_id: &Uuid,
        checkpoint_id: &Uuid,
    ) -> Result<(), RepositoryError> {
        self.with_execution(execution_id, |state| {
            state.current_checkpoint_id = Some(*checkpoint_id);
            state.updated_at = chrono::Utc::now();
            Ok(())
        })
    }

    async fn get_state(&self, execution_id: &Uuid) -> Result<Option<ExecutionState>, RepositoryError> {
        Ok(self.executions.get(execution_id).map(|e| e.value().clone()))
    }

    async fn list_executions(
        &self,
        status: Option<ExecutionStatus>,
    ) -> Result<Vec<ExecutionState>, RepositoryError> {
        let mut states: Vec<ExecutionState> = self
            .executions
            .iter()
            .filter(|e| status.is_none_or(|s| e.status == s))
            .map(|e| e.value().clone())
            .collect();
        states.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.execution_id.cmp(&b.execution_id))
        });
        Ok(states)
    }

    async fn restore_state(&self, state: &ExecutionState) -> Result<(), RepositoryError> {
        self.executions.insert(state.execution_id, state.clone());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// InMemoryCheckpointStore
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct InMemoryCheckpointStore {
    checkpoints: DashMap<Uuid, Checkpoint>,
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of checkpoints held across all executions.
    pub fn len(&self) -> usize {
        self.checkpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.checkpoints.is_empty()
    }
}

impl CheckpointStore for InMemoryCheckpointStore {
    async fn create_checkpoint(
        &self,
        state: &ExecutionState,
        step_id: &str,
        step_name: &str,
        options: CheckpointOptions,
    ) -> Result<Uuid, RepositoryError> {
        let checkpoint = Checkpoint::new(state.clone(), step_id, step_name, options);
        let checkpoint_id = checkpoint.checkpoint_id;
        if self.checkpoints.contains_key(&checkpoint_id) {
            return Err(RepositoryError::Conflict(format!(
                "checkpoint {checkpoint_id} already exists"
            )));
        }
        self.checkpoints.insert(checkpoint_id, checkpoint);
        Ok(checkpoint_id)
    }

    async fn load_checkpoint(&self, checkpoint_id: &Uuid) -> Result<Option<Checkpoint>, RepositoryError> {
        Ok(self.checkpoints.get(checkpoint_id).map(|c| c.value().clone()))
    }

    async fn list_checkpoints(&self, execution_id: &Uuid) -> Result<Vec<Checkpoint>, RepositoryError> {
        let mut checkpoints: Vec<Checkpoint> = self
            .checkpoints
            .iter()
            .filter(|c| c.execution_id == *execution_id)
            .map(|c| c.value().clone())
            .collect();
        checkpoints.sort_by_key(|c| c.checkpoint_id);
        Ok(checkpoints)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use stepflow_types::checkpoint::CheckpointMetadata;
    use stepflow_types::execution::{OutputMap, StepStatus};
    use stepflow_types::step::{StepDescriptor, StepKind};

    fn new_execution(total_steps: usize) -> NewExecution {
        NewExecution {
            workflow_id: "wf-1".to_string(),
            user_prompt: "summarize the repo".to_string(),
            goal: "a summary".to_string(),
            project_path: Some("/src/project".to_string()),
            total_steps,
        }
    }

    fn pending(id: &str) -> StepState {
        StepState::pending(&StepDescriptor::new(id, id.to_uppercase(), StepKind::Custom))
    }

    #[tokio::test]
    async fn create_and_get_execution() {
        let store = InMemoryStateStore::new();
        let created = store.create_execution(new_execution(2)).await.unwrap();
        assert_eq!(created.status, ExecutionStatus::Pending);

        let loaded = store.get_state(&created.execution_id).await.unwrap().unwrap();
        assert_eq!(loaded, created);
    }

    #[tokio::test]
    async fn get_state_is_idempotent() {
        let store = InMemoryStateStore::new();
        let created = store.create_execution(new_execution(1)).await.unwrap();
        store.add_step(&created.execution_id, pending("a")).await.unwrap();

        let first = store.get_state(&created.execution_id).await.unwrap();
        let second = store.get_state(&created.execution_id).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn status_transitions_are_enforced() {
        let store = InMemoryStateStore::new();
        let id = store.create_execution(new_execution(0)).await.unwrap().execution_id;

        store.update_status(&id, ExecutionStatus::Running).await.unwrap();
        store.update_status(&id, ExecutionStatus::Completed).await.unwrap();

        let err = store
            .update_status(&id, ExecutionStatus::Running)
            .await
            .unwrap_err();
        assert!(matches!(err, RepositoryError::InvalidTransition { .. }));

        let state = store.get_state(&id).await.unwrap().unwrap();
        assert_eq!(state.status, ExecutionStatus::Completed);
        assert!(state.completed_at.is_some());
    }

    #[tokio::test]
    async fn step_updates_flow_into_state() {
        let store = InMemoryStateStore::new();
        let id = store.create_execution(new_execution(2)).await.unwrap().execution_id;
        store.add_step(&id, pending("a")).await.unwrap();
        store.add_step(&id, pending("b")).await.unwrap();

        let mut output = OutputMap::new();
        output.insert("answer".to_string(), json!(42));
        store
            .update_step_status(&id, "a", StepUpdate::completed(output.clone(), None))
            .await
            .unwrap();
        store
            .update_step_status(&id, "b", StepUpdate::failed("exit 1"))
            .await
            .unwrap();
        store.set_error(&id, "step 'b' failed").await.unwrap();

        let state = store.get_state(&id).await.unwrap().unwrap();
        assert_eq!(state.step("a").unwrap().status, StepStatus::Completed);
        assert_eq!(state.step("b").unwrap().error.as_deref(), Some("exit 1"));
        assert_eq!(state.aggregate_output.get("a"), Some(&output));
        assert_eq!(state.error.as_deref(), Some("step 'b' failed"));
    }

    #[tokio::test]
    async fn add_step_beyond_total_is_rejected() {
        let store = InMemoryStateStore::new();
        let id = store.create_execution(new_execution(1)).await.unwrap().execution_id;
        store.add_step(&id, pending("a")).await.unwrap();
        let err = store.add_step(&id, pending("b")).await.unwrap_err();
        assert!(matches!(err, RepositoryError::Conflict(_)));
    }

    #[tokio::test]
    async fn missing_execution_is_not_found() {
        let store = InMemoryStateStore::new();
        let err = store
            .set_error(&Uuid::now_v7(), "nope")
            .await
            .unwrap_err();
        assert!(matches!(err, RepositoryError::NotFound));
        assert!(store.get_state(&Uuid::now_v7()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn list_executions_filters_by_status() {
        let store = InMemoryStateStore::new();
        let a = store.create_execution(new_execution(0)).await.unwrap().execution_id;
        let b = store.create_execution(new_execution(0)).await.unwrap().execution_id;
        store.update_status(&b, ExecutionStatus::Running).await.unwrap();

        let all = store.list_executions(None).await.unwrap();
        assert_eq!(
            all.iter().map(|s| s.execution_id).collect::<Vec<_>>(),
            vec![a, b]
        );

        let running = store
            .list_executions(Some(ExecutionStatus::Running))
            .await
            .unwrap();
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].execution_id, b);
    }

    #[tokio::test]
    async fn restore_state_overwrites_terminal_record() {
        let store = InMemoryStateStore::new();
        let id = store.create_execution(new_execution(0)).await.unwrap().execution_id;
        store.update_status(&id, ExecutionStatus::Running).await.unwrap();
        let snapshot = store.get_state(&id).await.unwrap().unwrap();
        store.update_status(&id, ExecutionStatus::Failed).await.unwrap();

        store.restore_state(&snapshot).await.unwrap();
        let state = store.get_state(&id).await.unwrap().unwrap();
        assert_eq!(state.status, ExecutionStatus::Running);
    }

    #[tokio::test]
    async fn checkpoint_roundtrip_is_deep_copy() {
        let states = InMemoryStateStore::new();
        let checkpoints = InMemoryCheckpointStore::new();
        let id = states.create_execution(new_execution(1)).await.unwrap().execution_id;
        states.add_step(&id, pending("a")).await.unwrap();
        let snapshot = states.get_state(&id).await.unwrap().unwrap();

        let checkpoint_id = checkpoints
            .create_checkpoint(&snapshot, "a", "A", CheckpointOptions::default())
            .await
            .unwrap();

        // Mutating the live state must not leak into the stored snapshot.
        states
            .update_step_status(&id, "a", StepUpdate::failed("later"))
            .await
            .unwrap();

        let loaded = checkpoints.load_checkpoint(&checkpoint_id).await.unwrap().unwrap();
        assert_eq!(loaded.state, snapshot);
        assert_eq!(loaded.step_id, "a");
        assert_eq!(loaded.execution_id, id);
        assert!(loaded.can_resume);
    }

    #[tokio::test]
    async fn list_and_latest_checkpoints() {
        let states = InMemoryStateStore::new();
        let checkpoints = InMemoryCheckpointStore::new();
        let id = states.create_execution(new_execution(0)).await.unwrap().execution_id;
        let snapshot = states.get_state(&id).await.unwrap().unwrap();

        let first = checkpoints
            .create_checkpoint(&snapshot, "a", "A", CheckpointOptions::default())
            .await
            .unwrap();
        let second = checkpoints
            .create_checkpoint(
                &snapshot,
                "b",
                "B",
                CheckpointOptions {
                    can_resume: false,
                    metadata: CheckpointMetadata::default(),
                },
            )
            .await
            .unwrap();

        let listed = checkpoints.list_checkpoints(&id).await.unwrap();
        assert_eq!(
            listed.iter().map(|c| c.checkpoint_id).collect::<Vec<_>>(),
            vec![first, second]
        );
        let latest = checkpoints.latest_checkpoint(&id).await.unwrap().unwrap();
        assert_eq!(latest.checkpoint_id, second);
        assert!(!latest.can_resume);

        assert!(checkpoints.list_checkpoints(&Uuid::now_v7()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unknown_checkpoint_is_none() {
        let checkpoints = InMemoryCheckpointStore::new();
        assert!(checkpoints.load_checkpoint(&Uuid::now_v7()).await.unwrap().is_none());
    }
}

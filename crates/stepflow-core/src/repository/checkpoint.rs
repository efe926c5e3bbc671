//! Checkpoint store trait definition.
//!
//! Checkpoints are write-once snapshots of an execution, recorded after every
//! successfully completed step. There is deliberately no update or delete.

use stepflow_types::checkpoint::{Checkpoint, CheckpointOptions};
use stepflow_types::error::RepositoryError;
use stepflow_types::execution::ExecutionState;
use uuid::Uuid;

/// Append-only store for execution snapshots.
pub trait CheckpointStore: Send + Sync {
    /// Persist a deep copy of `state` and return the new checkpoint ID.
    ///
    /// The execution ID is taken from the snapshot itself.
    fn create_checkpoint(
        &self,
        state: &ExecutionState,
        step_id: &str,
        step_name: &str,
        options: CheckpointOptions,
    ) -> impl std::future::Future<Output = Result<Uuid, RepositoryError>> + Send;

    /// Load a checkpoint by ID.
    fn load_checkpoint(
        &self,
        checkpoint_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<Checkpoint>, RepositoryError>> + Send;

    /// All checkpoints of an execution, oldest first.
    fn list_checkpoints(
        &self,
        execution_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Vec<Checkpoint>, RepositoryError>> + Send;

    /// The most recent checkpoint of an execution.
    fn latest_checkpoint(
        &self,
        execution_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<Checkpoint>, RepositoryError>> + Send {
        async move { Ok(self.list_checkpoints(execution_id).await?.pop()) }
    }
}

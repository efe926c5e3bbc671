//! SQLite checkpoint store.
//!
//! Checkpoints are insert-only rows; the execution snapshot and the
//! graph-rebuild metadata are stored as JSON.

use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use stepflow_core::repository::checkpoint::CheckpointStore;
use stepflow_types::checkpoint::{Checkpoint, CheckpointOptions};
use stepflow_types::error::RepositoryError;
use stepflow_types::execution::ExecutionState;
use uuid::Uuid;

use super::pool::DatabasePool;
use super::{format_datetime, from_json, parse_datetime, parse_uuid, query_err, to_json};

pub struct SqliteCheckpointStore {
    pool: DatabasePool,
}

impl SqliteCheckpointStore {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

const CHECKPOINT_COLUMNS: &str =
    "id, execution_id, schema_version, step_id, step_name, state, can_resume, metadata, created_at";

struct CheckpointRow {
    id: String,
    execution_id: String,
    schema_version: i64,
    step_id: String,
    step_name: String,
    state: String,
    can_resume: bool,
    metadata: String,
    created_at: String,
}

impl CheckpointRow {
    fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            execution_id: row.try_get("execution_id")?,
            schema_version: row.try_get("schema_version")?,
            step_id: row.try_get("step_id")?,
            step_name: row.try_get("step_name")?,
            state: row.try_get("state")?,
            can_resume: row.try_get("can_resume")?,
            metadata: row.try_get("metadata")?,
            created_at: row.try_get("created_at")?,
        })
    }

    fn into_checkpoint(self) -> Result<Checkpoint, RepositoryError> {
        Ok(Checkpoint {
            checkpoint_id: parse_uuid(&self.id)?,
            schema_version: u32::try_from(self.schema_version).map_err(|_| {
                RepositoryError::Query(format!("invalid schema_version: {}", self.schema_version))
            })?,
            execution_id: parse_uuid(&self.execution_id)?,
            step_id: self.step_id,
            step_name: self.step_name,
            state: from_json(&self.state, "checkpoint state")?,
            can_resume: self.can_resume,
            metadata: from_json(&self.metadata, "checkpoint metadata")?,
            created_at: parse_datetime(&self.created_at)?,
        })
    }
}

impl CheckpointStore for SqliteCheckpointStore {
    async fn create_checkpoint(
        &self,
        state: &ExecutionState,
        step_id: &str,
        step_name: &str,
        options: CheckpointOptions,
    ) -> Result<Uuid, RepositoryError> {
        let checkpoint = Checkpoint::new(state.clone(), step_id, step_name, options);

        let result = sqlx::query(
            r#"INSERT INTO checkpoints
               (id, execution_id, schema_version, step_id, step_name, state, can_resume,
                metadata, created_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(checkpoint.checkpoint_id.to_string())
        .bind(checkpoint.execution_id.to_string())
        .bind(i64::from(checkpoint.schema_version))
        .bind(&checkpoint.step_id)
        .bind(&checkpoint.step_name)
        .bind(to_json(&checkpoint.state, "checkpoint state")?)
        .bind(checkpoint.can_resume)
        .bind(to_json(&checkpoint.metadata, "checkpoint metadata")?)
        .bind(format_datetime(&checkpoint.created_at))
        .execute(&self.pool.writer)
        .await;

        match result {
            Ok(_) => {
                tracing::debug!(
                    checkpoint_id = %checkpoint.checkpoint_id,
                    execution_id = %checkpoint.execution_id,
                    step_id,
                    "checkpoint written"
                );
                Ok(checkpoint.checkpoint_id)
            }
            Err(sqlx::Error::Database(e)) if e.message().contains("UNIQUE") => Err(
                RepositoryError::Conflict(format!("checkpoint {} already exists", checkpoint.checkpoint_id)),
            ),
            Err(e) => Err(query_err(e)),
        }
    }

    async fn load_checkpoint(&self, checkpoint_id: &Uuid) -> Result<Option<Checkpoint>, RepositoryError> {
        let row = sqlx::query(&format!("SELECT {CHECKPOINT_COLUMNS} FROM checkpoints WHERE id = ?"))
            .bind(checkpoint_id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_err)?;

        match row {
            Some(ref r) => Ok(Some(
                CheckpointRow::from_row(r).map_err(query_err)?.into_checkpoint()?,
            )),
            None => Ok(None),
        }
    }

    async fn list_checkpoints(&self, execution_id: &Uuid) -> Result<Vec<Checkpoint>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {CHECKPOINT_COLUMNS} FROM checkpoints WHERE execution_id = ? \
             ORDER BY created_at ASC, id ASC"
        ))
        .bind(execution_id.to_string())
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_err)?;

        rows.iter()
            .map(|row| {
                CheckpointRow::from_row(row)
                    .map_err(query_err)?
                    .into_checkpoint()
            })
            .collect()
    }
}

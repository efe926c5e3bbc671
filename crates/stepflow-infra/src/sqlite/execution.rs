//! SQLite execution state store.
//!
//! Implements `StateStore` from `stepflow-core`. Each execution is one row in
//! `executions` plus one row per step in `execution_steps`; output and
//! metrics maps are JSON columns. Mutations run as read-modify-write
//! transactions on the single-connection writer pool and reuse the core's
//! transition and bookkeeping rules.

use sqlx::sqlite::{SqliteConnection, SqliteRow};
use sqlx::Row;
use stepflow_core::repository::state::{StateStore, StepUpdate, check_add_step, check_transition};
use stepflow_types::error::RepositoryError;
use stepflow_types::execution::{
    ExecutionState, ExecutionStatus, NewExecution, StepState, StepStatus,
};
use uuid::Uuid;

use super::pool::DatabasePool;
use super::{format_datetime, from_json, parse_datetime, parse_uuid, query_err, to_json};

pub struct SqliteStateStore {
    pool: DatabasePool,
}

impl SqliteStateStore {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }

    /// Run `mutate` against the stored execution inside one write transaction.
    ///
    /// `mutate` returns which step row (if any) it changed; the execution row
    /// is always written back.
    async fn modify<F>(&self, execution_id: &Uuid, mutate: F) -> Result<(), RepositoryError>
    where
        F: FnOnce(&mut ExecutionState) -> Result<Option<usize>, RepositoryError> + Send,
    {
        let mut tx = self.pool.writer.begin().await.map_err(query_err)?;

        let mut state = fetch_state(&mut tx, execution_id)
            .await?
            .ok_or(RepositoryError::NotFound)?;
        let touched = mutate(&mut state)?;

        write_execution(&mut tx, &state).await?;
        if let Some(position) = touched {
            write_step(&mut tx, &state.execution_id, position, &state.steps[position]).await?;
        }

        tx.commit().await.map_err(query_err)?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Internal row types
// ---------------------------------------------------------------------------

const EXECUTION_COLUMNS: &str = "id, workflow_id, status, user_prompt, goal, project_path, \
     total_steps, aggregate_output, error, current_checkpoint_id, created_at, started_at, \
     completed_at, updated_at";

const STEP_COLUMNS: &str = "step_id, name, description, status, output, error, started_at, \
     completed_at, metrics";

struct ExecutionRow {
    id: String,
    workflow_id: String,
    status: String,
    user_prompt: String,
    goal: String,
    project_path: Option<String>,
    total_steps: i64,
    aggregate_output: String,
    error: Option<String>,
    current_checkpoint_id: Option<String>,
    created_at: String,
    started_at: Option<String>,
    completed_at: Option<String>,
    updated_at: String,
}

impl ExecutionRow {
    fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            workflow_id: row.try_get("workflow_id")?,
            status: row.try_get("status")?,
            user_prompt: row.try_get("user_prompt")?,
            goal: row.try_get("goal")?,
            project_path: row.try_get("project_path")?,
            total_steps: row.try_get("total_steps")?,
            aggregate_output: row.try_get("aggregate_output")?,
            error: row.try_get("error")?,
            current_checkpoint_id: row.try_get("current_checkpoint_id")?,
            created_at: row.try_get("created_at")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn into_state(self, steps: Vec<StepState>) -> Result<ExecutionState, RepositoryError> {
        let status: ExecutionStatus = parse_status(&self.status)?;
        Ok(ExecutionState {
            execution_id: parse_uuid(&self.id)?,
            workflow_id: self.workflow_id,
            status,
            user_prompt: self.user_prompt,
            goal: self.goal,
            project_path: self.project_path,
            total_steps: usize::try_from(self.total_steps)
                .map_err(|_| RepositoryError::Query(format!("invalid total_steps: {}", self.total_steps)))?,
            steps,
            aggregate_output: from_json(&self.aggregate_output, "aggregate_output")?,
            error: self.error,
            current_checkpoint_id: self
                .current_checkpoint_id
                .as_deref()
                .map(parse_uuid)
                .transpose()?,
            created_at: parse_datetime(&self.created_at)?,
            started_at: self.started_at.as_deref().map(parse_datetime).transpose()?,
            completed_at: self.completed_at.as_deref().map(parse_datetime).transpose()?,
            updated_at: parse_datetime(&self.updated_at)?,
        })
    }
}

struct StepRow {
    step_id: String,
    name: String,
    description: String,
    status: String,
    output: Option<String>,
    error: Option<String>,
    started_at: Option<String>,
    completed_at: Option<String>,
    metrics: Option<String>,
}

impl StepRow {
    fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            step_id: row.try_get("step_id")?,
            name: row.try_get("name")?,
            description: row.try_get("description")?,
            status: row.try_get("status")?,
            output: row.try_get("output")?,
            error: row.try_get("error")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
            metrics: row.try_get("metrics")?,
        })
    }

    fn into_step_state(self) -> Result<StepState, RepositoryError> {
        let status: StepStatus = parse_status(&self.status)?;
        Ok(StepState {
            step_id: self.step_id,
            name: self.name,
            description: self.description,
            status,
            output: self
                .output
                .as_deref()
                .map(|s| from_json(s, "step output"))
                .transpose()?,
            error: self.error,
            started_at: self.started_at.as_deref().map(parse_datetime).transpose()?,
            completed_at: self.completed_at.as_deref().map(parse_datetime).transpose()?,
            metrics: self
                .metrics
                .as_deref()
                .map(|s| from_json(s, "step metrics"))
                .transpose()?,
        })
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Statuses are stored as their snake_case serde names.
fn parse_status<T: serde::de::DeserializeOwned>(s: &str) -> Result<T, RepositoryError> {
    serde_json::from_value(serde_json::Value::String(s.to_string()))
        .map_err(|_| RepositoryError::Query(format!("invalid status: {s}")))
}

async fn fetch_state(
    conn: &mut SqliteConnection,
    execution_id: &Uuid,
) -> Result<Option<ExecutionState>, RepositoryError> {
    let row = sqlx::query(&format!("SELECT {EXECUTION_COLUMNS} FROM executions WHERE id = ?"))
        .bind(execution_id.to_string())
        .fetch_optional(&mut *conn)
        .await
        .map_err(query_err)?;
    let Some(row) = row else {
        return Ok(None);
    };
    let execution = ExecutionRow::from_row(&row).map_err(query_err)?;

    let step_rows = sqlx::query(&format!(
        "SELECT {STEP_COLUMNS} FROM execution_steps WHERE execution_id = ? ORDER BY position ASC"
    ))
    .bind(execution_id.to_string())
    .fetch_all(&mut *conn)
    .await
    .map_err(query_err)?;

    let mut steps = Vec::with_capacity(step_rows.len());
    for row in &step_rows {
        steps.push(StepRow::from_row(row).map_err(query_err)?.into_step_state()?);
    }
    Ok(Some(execution.into_state(steps)?))
}

/// Insert or overwrite the execution row.
async fn write_execution(
    conn: &mut SqliteConnection,
    state: &ExecutionState,
) -> Result<(), RepositoryError> {
    sqlx::query(
        r#"INSERT INTO executions
           (id, workflow_id, status, user_prompt, goal, project_path, total_steps,
            aggregate_output, error, current_checkpoint_id, created_at, started_at,
            completed_at, updated_at)
           VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
           ON CONFLICT(id) DO UPDATE SET
             workflow_id = excluded.workflow_id,
             status = excluded.status,
             user_prompt = excluded.user_prompt,
             goal = excluded.goal,
             project_path = excluded.project_path,
             total_steps = excluded.total_steps,
             aggregate_output = excluded.aggregate_output,
             error = excluded.error,
             current_checkpoint_id = excluded.current_checkpoint_id,
             created_at = excluded.created_at,
             started_at = excluded.started_at,
             completed_at = excluded.completed_at,
             updated_at = excluded.updated_at"#,
    )
    .bind(state.execution_id.to_string())
    .bind(&state.workflow_id)
    .bind(state.status.as_str())
    .bind(&state.user_prompt)
    .bind(&state.goal)
    .bind(&state.project_path)
    .bind(state.total_steps as i64)
    .bind(to_json(&state.aggregate_output, "aggregate_output")?)
    .bind(&state.error)
    .bind(state.current_checkpoint_id.map(|id| id.to_string()))
    .bind(format_datetime(&state.created_at))
    .bind(state.started_at.as_ref().map(format_datetime))
    .bind(state.completed_at.as_ref().map(format_datetime))
    .bind(format_datetime(&state.updated_at))
    .execute(&mut *conn)
    .await
    .map_err(query_err)?;
    Ok(())
}

/// Insert or overwrite one step row.
async fn write_step(
    conn: &mut SqliteConnection,
    execution_id: &Uuid,
    position: usize,
    step: &StepState,
) -> Result<(), RepositoryError> {
    let output = step
        .output
        .as_ref()
        .map(|o| to_json(o, "step output"))
        .transpose()?;
    let metrics = step
        .metrics
        .as_ref()
        .map(|m| to_json(m, "step metrics"))
        .transpose()?;

    sqlx::query(
        r#"INSERT INTO execution_steps
           (execution_id, step_id, position, name, description, status, output, error,
            started_at, completed_at, metrics)
           VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
           ON CONFLICT(execution_id, step_id) DO UPDATE SET
             position = excluded.position,
             name = excluded.name,
             description = excluded.description,
             status = excluded.status,
             output = excluded.output,
             error = excluded.error,
             started_at = excluded.started_at,
             completed_at = excluded.completed_at,
             metrics = excluded.metrics"#,
    )
    .bind(execution_id.to_string())
    .bind(&step.step_id)
    .bind(position as i64)
    .bind(&step.name)
    .bind(&step.description)
    .bind(step.status.as_str())
    .bind(&output)
    .bind(&step.error)
    .bind(step.started_at.as_ref().map(format_datetime))
    .bind(step.completed_at.as_ref().map(format_datetime))
    .bind(&metrics)
    .execute(&mut *conn)
    .await
    .map_err(query_err)?;
    Ok(())
}

// ---------------------------------------------------------------------------
// StateStore impl
// ---------------------------------------------------------------------------

impl StateStore for SqliteStateStore {
    async fn create_execution(&self, new: NewExecution) -> Result<ExecutionState, RepositoryError> {
        let state = ExecutionState::new(new);
        let mut conn = self.pool.writer.acquire().await.map_err(query_err)?;
        write_execution(&mut conn, &state).await?;

        tracing::debug!(
            execution_id = %state.execution_id,
            workflow_id = state.workflow_id.as_str(),
            "created execution"
        );
        Ok(state)
    }

    async fn update_status(
        &self,
        execution_id: &Uuid,
        status: ExecutionStatus,
    ) -> Result<(), RepositoryError> {
        self.modify(execution_id, |state| {
            check_transition(state.status, status)?;
            state.apply_status(status);
            Ok(None)
        })
        .await
    }

    async fn add_step(&self, execution_id: &Uuid, step: StepState) -> Result<(), RepositoryError> {
        self.modify(execution_id, move |state| {
            check_add_step(state, &step)?;
            state.steps.push(step);
            state.updated_at = chrono::Utc::now();
            Ok(Some(state.steps.len() - 1))
        })
        .await
    }

    async fn update_step_status(
        &self,
        execution_id: &Uuid,
        step_id: &str,
        update: StepUpdate,
    ) -> Result<(), RepositoryError> {
        self.modify(execution_id, |state| {
            update.apply(state, step_id)?;
            Ok(state.steps.iter().position(|s| s.step_id == step_id))
        })
        .await
    }

    async fn set_error(&self, execution_id: &Uuid, error: &str) -> Result<(), RepositoryError> {
        let result = sqlx::query("UPDATE executions SET error = ?, updated_at = ? WHERE id = ?")
            .bind(error)
            .bind(format_datetime(&chrono::Utc::now()))
            .bind(execution_id.to_string())
            .execute(&self.pool.writer)
            .await
            .map_err(query_err)?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }

    async fn set_checkpoint(
        &self,
        execution_id: &Uuid,
        checkpoint_id: &Uuid,
    ) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            "UPDATE executions SET current_checkpoint_id = ?, updated_at = ? WHERE id = ?",
        )
        .bind(checkpoint_id.to_string())
        .bind(format_datetime(&chrono::Utc::now()))
        .bind(execution_id.to_string())
        .execute(&self.pool.writer)
        .await
        .map_err(query_err)?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }

    async fn get_state(&self, execution_id: &Uuid) -> Result<Option<ExecutionState>, RepositoryError> {
        let mut conn = self.pool.reader.acquire().await.map_err(query_err)?;
        fetch_state(&mut conn, execution_id).await
    }

    async fn list_executions(
        &self,
        status: Option<ExecutionStatus>,
    ) -> Result<Vec<ExecutionState>, RepositoryError> {
        let mut conn = self.pool.reader.acquire().await.map_err(query_err)?;

        let ids: Vec<String> = match status {
            Some(s) => {
                sqlx::query_scalar(
                    "SELECT id FROM executions WHERE status = ? ORDER BY created_at ASC, id ASC",
                )
                .bind(s.as_str())
                .fetch_all(&mut *conn)
                .await
            }
            None => {
                sqlx::query_scalar("SELECT id FROM executions ORDER BY created_at ASC, id ASC")
                    .fetch_all(&mut *conn)
                    .await
            }
        }
        .map_err(query_err)?;

        let mut states = Vec::with_capacity(ids.len());
        for id in &ids {
            if let Some(state) = fetch_state(&mut conn, &parse_uuid(id)?).await? {
                states.push(state);
            }
        }
        Ok(states)
    }

    async fn restore_state(&self, state: &ExecutionState) -> Result<(), RepositoryError> {
        let mut tx = self.pool.writer.begin().await.map_err(query_err)?;

        write_execution(&mut tx, state).await?;
        sqlx::query("DELETE FROM execution_steps WHERE execution_id = ?")
            .bind(state.execution_id.to_string())
            .execute(&mut *tx)
            .await
            .map_err(query_err)?;
        for (position, step) in state.steps.iter().enumerate() {
            write_step(&mut tx, &state.execution_id, position, step).await?;
        }

        tx.commit().await.map_err(query_err)?;
        tracing::debug!(execution_id = %state.execution_id, status = %state.status, "restored execution state");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use stepflow_types::execution::{OutputMap, StepMetrics};
    use stepflow_types::step::{StepDescriptor, StepKind};

    async fn test_pool() -> DatabasePool {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("test.db");
        let url = format!("sqlite://{}?mode=rwc", db_path.display());
        std::mem::forget(dir);
        DatabasePool::new(&url).await.unwrap()
    }

    fn new_execution(total_steps: usize) -> NewExecution {
        NewExecution {
            workflow_id: "release".to_string(),
            user_prompt: "cut a release".to_string(),
            goal: "tagged build".to_string(),
            project_path: Some("/srv/app".to_string()),
            total_steps,
        }
    }

    fn pending(id: &str) -> StepState {
        StepState::pending(
            &StepDescriptor::new(id, format!("Step {id}"), StepKind::Cli).with_description("desc"),
        )
    }

    #[tokio::test]
    async fn create_then_get_roundtrips() {
        let store = SqliteStateStore::new(test_pool().await);
        let created = store.create_execution(new_execution(2)).await.unwrap();
        store.add_step(&created.execution_id, pending("a")).await.unwrap();
        store.add_step(&created.execution_id, pending("b")).await.unwrap();

        let loaded = store.get_state(&created.execution_id).await.unwrap().unwrap();
        assert_eq!(loaded.execution_id, created.execution_id);
        assert_eq!(loaded.created_at, created.created_at);
        assert_eq!(loaded.project_path.as_deref(), Some("/srv/app"));
        assert_eq!(
            loaded.steps.iter().map(|s| s.step_id.as_str()).collect::<Vec<_>>(),
            vec!["a", "b"]
        );
        assert_eq!(loaded.steps[0].description, "desc");

        // Reads are idempotent.
        assert_eq!(
            store.get_state(&created.execution_id).await.unwrap(),
            Some(loaded)
        );
    }

    #[tokio::test]
    async fn step_updates_persist_output_and_metrics() {
        let store = SqliteStateStore::new(test_pool().await);
        let id = store.create_execution(new_execution(1)).await.unwrap().execution_id;
        store.add_step(&id, pending("a")).await.unwrap();
        store.update_status(&id, ExecutionStatus::Running).await.unwrap();

        let mut output = OutputMap::new();
        output.insert("exit_code".to_string(), json!(0));
        let metrics = StepMetrics {
            provider: Some("shell".to_string()),
            input_tokens: Some(3),
            ..Default::default()
        };
        store
            .update_step_status(&id, "a", StepUpdate::running())
            .await
            .unwrap();
        store
            .update_step_status(&id, "a", StepUpdate::completed(output.clone(), Some(metrics.clone())))
            .await
            .unwrap();

        let state = store.get_state(&id).await.unwrap().unwrap();
        let step = state.step("a").unwrap();
        assert_eq!(step.status, StepStatus::Completed);
        assert_eq!(step.output.as_ref(), Some(&output));
        assert_eq!(step.metrics.as_ref(), Some(&metrics));
        assert!(step.started_at.is_some() && step.completed_at.is_some());
        assert_eq!(state.aggregate_output.get("a"), Some(&output));
        assert_eq!(state.status, ExecutionStatus::Running);
        assert!(state.started_at.is_some());
    }

    #[tokio::test]
    async fn invalid_transition_rejected() {
        let store = SqliteStateStore::new(test_pool().await);
        let id = store.create_execution(new_execution(0)).await.unwrap().execution_id;
        store.update_status(&id, ExecutionStatus::Running).await.unwrap();
        store.update_status(&id, ExecutionStatus::Failed).await.unwrap();

        let err = store
            .update_status(&id, ExecutionStatus::Completed)
            .await
            .unwrap_err();
        assert!(matches!(err, RepositoryError::InvalidTransition { .. }));
        let state = store.get_state(&id).await.unwrap().unwrap();
        assert_eq!(state.status, ExecutionStatus::Failed);
    }

    #[tokio::test]
    async fn add_step_conflicts() {
        let store = SqliteStateStore::new(test_pool().await);
        let id = store.create_execution(new_execution(1)).await.unwrap().execution_id;
        store.add_step(&id, pending("a")).await.unwrap();
        assert!(matches!(
            store.add_step(&id, pending("b")).await,
            Err(RepositoryError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn error_and_checkpoint_pointers() {
        let store = SqliteStateStore::new(test_pool().await);
        let id = store.create_execution(new_execution(0)).await.unwrap().execution_id;
        let checkpoint_id = Uuid::now_v7();

        store.set_error(&id, "step 'x' failed: boom").await.unwrap();
        store.set_checkpoint(&id, &checkpoint_id).await.unwrap();

        let state = store.get_state(&id).await.unwrap().unwrap();
        assert_eq!(state.error.as_deref(), Some("step 'x' failed: boom"));
        assert_eq!(state.current_checkpoint_id, Some(checkpoint_id));

        assert!(matches!(
            store.set_error(&Uuid::now_v7(), "x").await,
            Err(RepositoryError::NotFound)
        ));
        assert!(matches!(
            store
                .update_step_status(&Uuid::now_v7(), "a", StepUpdate::running())
                .await,
            Err(RepositoryError::NotFound)
        ));
    }

    #[tokio::test]
    async fn list_in_creation_order_with_filter() {
        let store = SqliteStateStore::new(test_pool().await);
        let first = store.create_execution(new_execution(0)).await.unwrap().execution_id;
        let second = store.create_execution(new_execution(0)).await.unwrap().execution_id;
        let third = store.create_execution(new_execution(0)).await.unwrap().execution_id;
        store.update_status(&second, ExecutionStatus::Running).await.unwrap();

        let all: Vec<Uuid> = store
            .list_executions(None)
            .await
            .unwrap()
            .iter()
            .map(|s| s.execution_id)
            .collect();
        assert_eq!(all, vec![first, second, third]);

        let pending: Vec<Uuid> = store
            .list_executions(Some(ExecutionStatus::Pending))
            .await
            .unwrap()
            .iter()
            .map(|s| s.execution_id)
            .collect();
        assert_eq!(pending, vec![first, third]);
    }

    #[tokio::test]
    async fn restore_replaces_record_and_steps() {
        let store = SqliteStateStore::new(test_pool().await);
        let id = store.create_execution(new_execution(2)).await.unwrap().execution_id;
        store.add_step(&id, pending("a")).await.unwrap();
        store.add_step(&id, pending("b")).await.unwrap();
        store.update_status(&id, ExecutionStatus::Running).await.unwrap();
        let snapshot = store.get_state(&id).await.unwrap().unwrap();

        store
            .update_step_status(&id, "a", StepUpdate::failed("bad"))
            .await
            .unwrap();
        store.update_status(&id, ExecutionStatus::Failed).await.unwrap();

        store.restore_state(&snapshot).await.unwrap();
        let restored = store.get_state(&id).await.unwrap().unwrap();
        assert_eq!(restored, snapshot);
    }
}

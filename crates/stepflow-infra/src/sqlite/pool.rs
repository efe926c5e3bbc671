//! Connection pools for the execution and checkpoint stores.
//!
//! Store mutations are read-modify-write transactions, so they all go through
//! a single writer connection. Reads use a separate read-only pool, which WAL
//! mode lets run alongside the writer.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};

/// Database file name inside a data directory.
pub const DATABASE_FILE: &str = "stepflow.db";

const MAX_READERS: u32 = 4;
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone)]
pub struct DatabasePool {
    pub reader: SqlitePool,
    pub writer: SqlitePool,
}

impl DatabasePool {
    /// Connect to `database_url`, creating the file and applying migrations
    /// as needed.
    pub async fn new(database_url: &str) -> Result<Self, sqlx::Error> {
        let options = SqliteConnectOptions::from_str(database_url)?;
        Self::connect(options).await
    }

    /// Open `{data_dir}/stepflow.db`, creating the directory first.
    pub async fn open_in(data_dir: &Path) -> Result<Self, sqlx::Error> {
        tokio::fs::create_dir_all(data_dir).await?;
        let options = SqliteConnectOptions::new().filename(data_dir.join(DATABASE_FILE));
        Self::connect(options).await
    }

    async fn connect(options: SqliteConnectOptions) -> Result<Self, sqlx::Error> {
        let options = options
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true)
            .busy_timeout(BUSY_TIMEOUT);

        let writer = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options.clone())
            .await?;
        sqlx::migrate!("../../migrations").run(&writer).await?;

        let reader = SqlitePoolOptions::new()
            .max_connections(MAX_READERS)
            .connect_with(options.read_only(true))
            .await?;

        tracing::debug!(readers = MAX_READERS, "stepflow database ready");
        Ok(Self { reader, writer })
    }
}

/// `sqlite://` URL of the database under `STEPFLOW_DATA_DIR`, or under
/// `~/.stepflow` when unset.
pub fn default_database_url() -> String {
    let data_dir = std::env::var("STEPFLOW_DATA_DIR").unwrap_or_else(|_| {
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
        format!("{home}/.stepflow")
    });
    format!("sqlite://{data_dir}/{DATABASE_FILE}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn open_in_creates_directory_and_schema() {
        let dir = tempfile::tempdir().unwrap();
        let data_dir = dir.path().join("nested").join("data");

        let pool = DatabasePool::open_in(&data_dir).await.unwrap();
        assert!(data_dir.join(DATABASE_FILE).exists());

        let tables: Vec<String> = sqlx::query_scalar(
            "SELECT name FROM sqlite_master WHERE type = 'table' \
             AND name NOT LIKE 'sqlite_%' AND name != '_sqlx_migrations' ORDER BY name",
        )
        .fetch_all(&pool.reader)
        .await
        .unwrap();
        assert_eq!(tables, vec!["checkpoints", "execution_steps", "executions"]);

        let mode: String = sqlx::query_scalar("PRAGMA journal_mode")
            .fetch_one(&pool.writer)
            .await
            .unwrap();
        assert_eq!(mode.to_lowercase(), "wal");
    }

    #[tokio::test]
    async fn reopening_keeps_data() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("flows.db").display());

        let first = DatabasePool::new(&url).await.unwrap();
        sqlx::query(
            "INSERT INTO checkpoints (id, execution_id, schema_version, step_id, step_name, state, created_at) \
             VALUES ('c1', 'e1', 1, 's1', 'S1', '{}', '2026-03-01T00:00:00Z')",
        )
        .execute(&first.writer)
        .await
        .unwrap();
        first.writer.close().await;
        first.reader.close().await;

        // Migrations are already applied; the second open must not fail or wipe rows.
        let second = DatabasePool::new(&url).await.unwrap();
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM checkpoints")
            .fetch_one(&second.reader)
            .await
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn reader_rejects_writes() {
        let dir = tempfile::tempdir().unwrap();
        let pool = DatabasePool::open_in(dir.path()).await.unwrap();

        let result = sqlx::query("DELETE FROM executions")
            .execute(&pool.reader)
            .await;
        assert!(result.is_err());
    }

    #[test]
    fn default_url_points_at_database_file() {
        let url = default_database_url();
        assert!(url.starts_with("sqlite://"));
        assert!(url.ends_with("/stepflow.db"));
    }
}

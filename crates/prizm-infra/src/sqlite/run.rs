//! SQLite run repository implementation.
//!
//! Each save writes the whole run as a JSON snapshot. Scope, status, name,
//! and resume token are copied into columns so lookups and listing stay on
//! indexes.

use prizm_core::repository::run::RunRepository;
use prizm_types::error::RepositoryError;
use prizm_types::workflow::{RunFilter, RunStatus, WorkflowRun};
use sqlx::{QueryBuilder, Row, Sqlite};
use uuid::Uuid;

use super::pool::DatabasePool;
use super::{format_datetime, parse_uuid};

/// SQLite-backed workflow run storage.
pub struct SqliteRunRepository {
    pool: DatabasePool,
}

impl SqliteRunRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

fn decode_snapshot(row: &sqlx::sqlite::SqliteRow) -> Result<WorkflowRun, RepositoryError> {
    let id: String = row
        .try_get("id")
        .map_err(|e| RepositoryError::Query(e.to_string()))?;
    let snapshot: String = row
        .try_get("snapshot")
        .map_err(|e| RepositoryError::Query(e.to_string()))?;
    let run: WorkflowRun = serde_json::from_str(&snapshot)
        .map_err(|e| RepositoryError::Serialization(format!("run {id}: {e}")))?;
    if run.id != parse_uuid(&id)? {
        return Err(RepositoryError::Query(format!(
            "run {id} snapshot carries id {}",
            run.id
        )));
    }
    Ok(run)
}

fn decode_all(rows: &[sqlx::sqlite::SqliteRow]) -> Result<Vec<WorkflowRun>, RepositoryError> {
    rows.iter().map(decode_snapshot).collect()
}

impl RunRepository for SqliteRunRepository {
    async fn save_run(&self, run: &WorkflowRun) -> Result<(), RepositoryError> {
        let snapshot = serde_json::to_string(run)?;

        sqlx::query(
            r#"INSERT INTO workflow_runs
               (id, scope, workflow_name, status, resume_token, trigger_type, snapshot, created_at, updated_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT(id) DO UPDATE SET
                 status = excluded.status,
                 resume_token = excluded.resume_token,
                 snapshot = excluded.snapshot,
                 updated_at = excluded.updated_at"#,
        )
        .bind(run.id.to_string())
        .bind(&run.scope)
        .bind(&run.workflow_name)
        .bind(run.status.as_str())
        .bind(&run.resume_token)
        .bind(&run.trigger_type)
        .bind(&snapshot)
        .bind(format_datetime(&run.created_at))
        .bind(format_datetime(&run.updated_at))
        .execute(&self.pool.writer)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        tracing::trace!(run_id = %run.id, status = run.status.as_str(), "saved run snapshot");
        Ok(())
    }

    async fn get_run(&self, id: &Uuid) -> Result<Option<WorkflowRun>, RepositoryError> {
        let row = sqlx::query("SELECT id, snapshot FROM workflow_runs WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        row.as_ref().map(decode_snapshot).transpose()
    }

    async fn get_run_by_token(&self, token: &str) -> Result<Option<WorkflowRun>, RepositoryError> {
        let row = sqlx::query("SELECT id, snapshot FROM workflow_runs WHERE resume_token = ?")
            .bind(token)
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        row.as_ref().map(decode_snapshot).transpose()
    }

    async fn list_runs(
        &self,
        scope: &str,
        filter: &RunFilter,
        limit: u32,
    ) -> Result<Vec<WorkflowRun>, RepositoryError> {
        let mut query: QueryBuilder<Sqlite> =
            QueryBuilder::new("SELECT id, snapshot FROM workflow_runs WHERE scope = ");
        query.push_bind(scope);
        if let Some(name) = &filter.workflow_name {
            query.push(" AND workflow_name = ").push_bind(name.as_str());
        }
        if let Some(status) = filter.status {
            query.push(" AND status = ").push_bind(status.as_str());
        }
        query
            .push(" ORDER BY created_at DESC, id DESC LIMIT ")
            .push_bind(i64::from(limit));

        let rows = query
            .build()
            .fetch_all(&self.pool.reader)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        decode_all(&rows)
    }

    async fn list_unfinished_runs(&self) -> Result<Vec<WorkflowRun>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT id, snapshot FROM workflow_runs WHERE status IN (?, ?) ORDER BY id ASC",
        )
        .bind(RunStatus::Pending.as_str())
        .bind(RunStatus::Running.as_str())
        .fetch_all(&self.pool.reader)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        decode_all(&rows)
    }
}

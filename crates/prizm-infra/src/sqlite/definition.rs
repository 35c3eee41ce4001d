//! SQLite definition repository implementation.

use prizm_core::repository::definition::DefinitionRepository;
use prizm_types::error::RepositoryError;
use prizm_types::workflow::WorkflowDefRecord;
use sqlx::Row;
use uuid::Uuid;

use super::pool::DatabasePool;
use super::{format_datetime, parse_datetime, parse_uuid};

/// SQLite-backed registry storage, unique per `(scope, name)`.
pub struct SqliteDefinitionRepository {
    pool: DatabasePool,
}

impl SqliteDefinitionRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

const COLUMNS: &str = "id, scope, name, yaml_content, description, triggers, created_at, updated_at";

struct DefinitionRow {
    id: String,
    scope: String,
    name: String,
    yaml_content: String,
    description: Option<String>,
    triggers: String,
    created_at: String,
    updated_at: String,
}

impl DefinitionRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            scope: row.try_get("scope")?,
            name: row.try_get("name")?,
            yaml_content: row.try_get("yaml_content")?,
            description: row.try_get("description")?,
            triggers: row.try_get("triggers")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn into_record(self) -> Result<WorkflowDefRecord, RepositoryError> {
        let triggers = serde_json::from_str(&self.triggers)
            .map_err(|e| RepositoryError::Serialization(format!("invalid triggers JSON: {e}")))?;
        Ok(WorkflowDefRecord {
            id: parse_uuid(&self.id)?,
            name: self.name,
            scope: self.scope,
            yaml_content: self.yaml_content,
            description: self.description,
            triggers,
            created_at: parse_datetime(&self.created_at)?,
            updated_at: parse_datetime(&self.updated_at)?,
        })
    }
}

fn decode(row: &sqlx::sqlite::SqliteRow) -> Result<WorkflowDefRecord, RepositoryError> {
    DefinitionRow::from_row(row)
        .map_err(|e| RepositoryError::Query(e.to_string()))?
        .into_record()
}

impl DefinitionRepository for SqliteDefinitionRepository {
    async fn upsert_definition(
        &self,
        record: &WorkflowDefRecord,
    ) -> Result<WorkflowDefRecord, RepositoryError> {
        let triggers = serde_json::to_string(&record.triggers)?;

        // On conflict the original id and created_at survive; RETURNING
        // hands back whatever is stored now.
        let row = sqlx::query(&format!(
            r#"INSERT INTO workflow_definitions ({COLUMNS})
               VALUES (?, ?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT(scope, name) DO UPDATE SET
                 yaml_content = excluded.yaml_content,
                 description = excluded.description,
                 triggers = excluded.triggers,
                 updated_at = excluded.updated_at
               RETURNING {COLUMNS}"#
        ))
        .bind(record.id.to_string())
        .bind(&record.scope)
        .bind(&record.name)
        .bind(&record.yaml_content)
        .bind(&record.description)
        .bind(&triggers)
        .bind(format_datetime(&record.created_at))
        .bind(format_datetime(&record.updated_at))
        .fetch_one(&self.pool.writer)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        decode(&row)
    }

    async fn get_definition(&self, id: &Uuid) -> Result<Option<WorkflowDefRecord>, RepositoryError> {
        let row = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM workflow_definitions WHERE id = ?"
        ))
        .bind(id.to_string())
        .fetch_optional(&self.pool.reader)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        row.as_ref().map(decode).transpose()
    }

    async fn get_definition_by_name(
        &self,
        scope: &str,
        name: &str,
    ) -> Result<Option<WorkflowDefRecord>, RepositoryError> {
        let row = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM workflow_definitions WHERE scope = ? AND name = ?"
        ))
        .bind(scope)
        .bind(name)
        .fetch_optional(&self.pool.reader)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        row.as_ref().map(decode).transpose()
    }

    async fn list_definitions(&self, scope: &str) -> Result<Vec<WorkflowDefRecord>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM workflow_definitions WHERE scope = ? ORDER BY name ASC"
        ))
        .bind(scope)
        .fetch_all(&self.pool.reader)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        rows.iter().map(decode).collect()
    }

    async fn delete_definition(&self, scope: &str, name: &str) -> Result<bool, RepositoryError> {
        let result = sqlx::query("DELETE FROM workflow_definitions WHERE scope = ? AND name = ?")
            .bind(scope)
            .bind(name)
            .execute(&self.pool.writer)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        Ok(result.rows_affected() > 0)
    }
}

//! In-memory repository implementations.
//!
//! Backed by `DashMap`; nothing survives the process. Used by tests and by
//! engines embedded without a database.

use dashmap::DashMap;
use prizm_types::error::RepositoryError;
use prizm_types::workflow::{RunFilter, RunStatus, WorkflowDefRecord, WorkflowRun};
use uuid::Uuid;

use super::definition::DefinitionRepository;
use super::run::RunRepository;

// ---------------------------------------------------------------------------
// Runs
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct InMemoryRunRepository {
    runs: DashMap<Uuid, WorkflowRun>,
}

impl InMemoryRunRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RunRepository for InMemoryRunRepository {
    async fn save_run(&self, run: &WorkflowRun) -> Result<(), RepositoryError> {
        self.runs.insert(run.id, run.clone());
        Ok(())
    }

    async fn get_run(&self, id: &Uuid) -> Result<Option<WorkflowRun>, RepositoryError> {
        Ok(self.runs.get(id).map(|r| r.clone()))
    }

    async fn get_run_by_token(&self, token: &str) -> Result<Option<WorkflowRun>, RepositoryError> {
        Ok(self
            .runs
            .iter()
            .find(|r| r.resume_token.as_deref() == Some(token))
            .map(|r| r.clone()))
    }

    async fn list_runs(
        &self,
        scope: &str,
        filter: &RunFilter,
        limit: u32,
    ) -> Result<Vec<WorkflowRun>, RepositoryError> {
        let mut runs: Vec<WorkflowRun> = self
            .runs
            .iter()
            .filter(|r| r.scope == scope)
            .filter(|r| {
                filter
                    .workflow_name
                    .as_deref()
                    .is_none_or(|name| r.workflow_name == name)
            })
            .filter(|r| filter.status.is_none_or(|s| r.status == s))
            .map(|r| r.clone())
            .collect();
        // UUID v7 ids are time-ordered; use them to break created_at ties.
        runs.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        runs.truncate(limit as usize);
        Ok(runs)
    }

    async fn list_unfinished_runs(&self) -> Result<Vec<WorkflowRun>, RepositoryError> {
        let mut runs: Vec<WorkflowRun> = self
            .runs
            .iter()
            .filter(|r| matches!(r.status, RunStatus::Pending | RunStatus::Running))
            .map(|r| r.clone())
            .collect();
        runs.sort_by_key(|r| r.id);
        Ok(runs)
    }
}

// ---------------------------------------------------------------------------
// Definitions
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct InMemoryDefinitionRepository {
    records: DashMap<(String, String), WorkflowDefRecord>,
}

impl InMemoryDefinitionRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DefinitionRepository for InMemoryDefinitionRepository {
    async fn upsert_definition(
        &self,
        record: &WorkflowDefRecord,
    ) -> Result<WorkflowDefRecord, RepositoryError> {
        let key = (record.scope.clone(), record.name.clone());
        let mut stored = record.clone();
        if let Some(existing) = self.records.get(&key) {
            stored.id = existing.id;
            stored.created_at = existing.created_at;
        }
        self.records.insert(key, stored.clone());
        Ok(stored)
    }

    async fn get_definition(&self, id: &Uuid) -> Result<Option<WorkflowDefRecord>, RepositoryError> {
        Ok(self
            .records
            .iter()
            .find(|r| r.id == *id)
            .map(|r| r.clone()))
    }

    async fn get_definition_by_name(
        &self,
        scope: &str,
        name: &str,
    ) -> Result<Option<WorkflowDefRecord>, RepositoryError> {
        Ok(self
            .records
            .get(&(scope.to_string(), name.to_string()))
            .map(|r| r.clone()))
    }

    async fn list_definitions(&self, scope: &str) -> Result<Vec<WorkflowDefRecord>, RepositoryError> {
        let mut records: Vec<WorkflowDefRecord> = self
            .records
            .iter()
            .filter(|r| r.scope == scope)
            .map(|r| r.clone())
            .collect();
        records.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(records)
    }

    async fn delete_definition(&self, scope: &str, name: &str) -> Result<bool, RepositoryError> {
        Ok(self
            .records
            .remove(&(scope.to_string(), name.to_string()))
            .is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use prizm_types::workflow::WorkflowDef;

    fn def(name: &str) -> WorkflowDef {
        serde_json::from_value(serde_json::json!({
            "name": name,
            "steps": [{"id": "a", "type": "transform", "transform": "1"}]
        }))
        .unwrap()
    }

    fn record(scope: &str, name: &str) -> WorkflowDefRecord {
        let now = Utc::now();
        WorkflowDefRecord {
            id: Uuid::now_v7(),
            name: name.to_string(),
            scope: scope.to_string(),
            yaml_content: format!("name: {name}\n"),
            description: None,
            triggers: vec![],
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn test_run_save_get_and_token_lookup() {
        let repo = InMemoryRunRepository::new();
        let mut run = WorkflowRun::new("notes", def("w"), Default::default(), "manual");
        run.resume_token = Some("tok-1".to_string());
        repo.save_run(&run).await.unwrap();

        assert_eq!(repo.get_run(&run.id).await.unwrap(), Some(run.clone()));
        assert_eq!(
            repo.get_run_by_token("tok-1").await.unwrap().map(|r| r.id),
            Some(run.id)
        );
        assert!(repo.get_run_by_token("tok-2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_run_list_filters_and_orders_newest_first() {
        let repo = InMemoryRunRepository::new();
        let first = WorkflowRun::new("notes", def("alpha"), Default::default(), "manual");
        let mut second = WorkflowRun::new("notes", def("beta"), Default::default(), "manual");
        second.status = RunStatus::Completed;
        let other_scope = WorkflowRun::new("other", def("alpha"), Default::default(), "manual");
        for run in [&first, &second, &other_scope] {
            repo.save_run(run).await.unwrap();
        }

        let all = repo.list_runs("notes", &RunFilter::default(), 10).await.unwrap();
        assert_eq!(all.iter().map(|r| r.id).collect::<Vec<_>>(), vec![second.id, first.id]);

        let alpha = RunFilter {
            workflow_name: Some("alpha".to_string()),
            status: None,
        };
        assert_eq!(repo.list_runs("notes", &alpha, 10).await.unwrap().len(), 1);

        let limited = repo.list_runs("notes", &RunFilter::default(), 1).await.unwrap();
        assert_eq!(limited.len(), 1);

        let unfinished = repo.list_unfinished_runs().await.unwrap();
        assert_eq!(unfinished.len(), 2);
    }

    #[tokio::test]
    async fn test_definition_upsert_keeps_id() {
        let repo = InMemoryDefinitionRepository::new();
        let first = repo.upsert_definition(&record("notes", "digest")).await.unwrap();
        let mut replacement = record("notes", "digest");
        replacement.yaml_content = "name: digest\n# v2\n".to_string();
        let second = repo.upsert_definition(&replacement).await.unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(first.created_at, second.created_at);
        assert!(second.yaml_content.contains("v2"));
        assert_eq!(repo.list_definitions("notes").await.unwrap().len(), 1);
        assert!(repo.get_definition(&first.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_definition_scoped_by_scope() {
        let repo = InMemoryDefinitionRepository::new();
        repo.upsert_definition(&record("a", "digest")).await.unwrap();
        repo.upsert_definition(&record("b", "digest")).await.unwrap();

        assert_eq!(repo.list_definitions("a").await.unwrap().len(), 1);
        assert!(repo.delete_definition("a", "digest").await.unwrap());
        assert!(!repo.delete_definition("a", "digest").await.unwrap());
        assert!(repo.get_definition_by_name("b", "digest").await.unwrap().is_some());
    }
}

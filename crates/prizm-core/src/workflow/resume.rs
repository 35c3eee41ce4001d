//! Durable run persistence for the runner.
//!
//! Wraps a `RunRepository` with the operations the runner needs: save a
//! snapshot after every transition, look up paused runs by resume token,
//! and find runs to restart after a crash.

use chrono::Utc;
use prizm_types::workflow::{RunFilter, WorkflowRun};
use uuid::Uuid;

use crate::repository::run::RunRepository;

/// Hard cap on list sizes.
pub const MAX_LIST_LIMIT: u32 = 100;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("repository error: {0}")]
    Repository(String),
}

/// Run snapshot store, generic over the storage backend.
pub struct ResumeStore<R: RunRepository> {
    repo: R,
}

impl<R: RunRepository> ResumeStore<R> {
    pub fn new(repo: R) -> Self {
        Self { repo }
    }

    /// Access the underlying repository.
    pub fn repo(&self) -> &R {
        &self.repo
    }

    /// Persist a snapshot, stamping `updated_at`.
    pub async fn save(&self, run: &mut WorkflowRun) -> Result<(), StoreError> {
        run.updated_at = Utc::now();
        self.repo
            .save_run(run)
            .await
            .map_err(|e| StoreError::Repository(e.to_string()))?;
        tracing::debug!(
            run_id = %run.id,
            status = %run.status,
            step_index = run.current_step_index,
            "checkpointed run"
        );
        Ok(())
    }

    pub async fn get(&self, run_id: &Uuid) -> Result<Option<WorkflowRun>, StoreError> {
        self.repo
            .get_run(run_id)
            .await
            .map_err(|e| StoreError::Repository(e.to_string()))
    }

    pub async fn find_by_token(&self, token: &str) -> Result<Option<WorkflowRun>, StoreError> {
        self.repo
            .get_run_by_token(token)
            .await
            .map_err(|e| StoreError::Repository(e.to_string()))
    }

    /// Most-recent-first listing; `limit` is clamped to `1..=MAX_LIST_LIMIT`.
    pub async fn list(
        &self,
        scope: &str,
        filter: &RunFilter,
        limit: u32,
    ) -> Result<Vec<WorkflowRun>, StoreError> {
        self.repo
            .list_runs(scope, filter, limit.clamp(1, MAX_LIST_LIMIT))
            .await
            .map_err(|e| StoreError::Repository(e.to_string()))
    }

    /// Runs that were in flight when the process stopped.
    pub async fn unfinished(&self) -> Result<Vec<WorkflowRun>, StoreError> {
        self.repo
            .list_unfinished_runs()
            .await
            .map_err(|e| StoreError::Repository(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::memory::InMemoryRunRepository;
    use prizm_types::workflow::WorkflowDef;

    fn run(name: &str) -> WorkflowRun {
        let def: WorkflowDef = serde_json::from_value(serde_json::json!({
            "name": name,
            "steps": [{"id": "a", "type": "approve", "approve_prompt": "ok?"}]
        }))
        .unwrap();
        WorkflowRun::new("notes", def, Default::default(), "manual")
    }

    #[tokio::test]
    async fn test_save_stamps_updated_at() {
        let store = ResumeStore::new(InMemoryRunRepository::new());
        let mut r = run("w");
        let before = r.updated_at;
        tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        store.save(&mut r).await.unwrap();
        assert!(r.updated_at > before);
        assert_eq!(store.get(&r.id).await.unwrap().unwrap().updated_at, r.updated_at);
    }

    #[tokio::test]
    async fn test_token_lookup_and_list_clamp() {
        let store = ResumeStore::new(InMemoryRunRepository::new());
        for _ in 0..3 {
            store.save(&mut run("w")).await.unwrap();
        }
        let mut paused = run("w");
        paused.resume_token = Some("tok".to_string());
        store.save(&mut paused).await.unwrap();

        assert_eq!(store.find_by_token("tok").await.unwrap().unwrap().id, paused.id);
        assert_eq!(store.list("notes", &RunFilter::default(), 0).await.unwrap().len(), 1);
        assert_eq!(store.list("notes", &RunFilter::default(), 500).await.unwrap().len(), 4);
        assert_eq!(store.unfinished().await.unwrap().len(), 4);
    }
}

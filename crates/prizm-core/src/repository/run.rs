//! Run persistence trait.
//!
//! The runner saves a full run snapshot after every state transition, so a
//! crash between steps loses at most the in-flight step's partial work.

use prizm_types::error::RepositoryError;
use prizm_types::workflow::{RunFilter, WorkflowRun};
use uuid::Uuid;

/// Storage for workflow run snapshots.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait RunRepository: Send + Sync {
    /// Insert or replace a run snapshot by id.
    fn save_run(
        &self,
        run: &WorkflowRun,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Get a run by its UUID.
    fn get_run(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<WorkflowRun>, RepositoryError>> + Send;

    /// Find the paused run holding `token`.
    fn get_run_by_token(
        &self,
        token: &str,
    ) -> impl std::future::Future<Output = Result<Option<WorkflowRun>, RepositoryError>> + Send;

    /// List runs in a scope, most recent first.
    fn list_runs(
        &self,
        scope: &str,
        filter: &RunFilter,
        limit: u32,
    ) -> impl std::future::Future<Output = Result<Vec<WorkflowRun>, RepositoryError>> + Send;

    /// Runs left in `pending` or `running` (crash recovery).
    fn list_unfinished_runs(
        &self,
    ) -> impl std::future::Future<Output = Result<Vec<WorkflowRun>, RepositoryError>> + Send;
}

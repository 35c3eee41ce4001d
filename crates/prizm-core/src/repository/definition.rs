//! Workflow definition registry storage trait.

use prizm_types::error::RepositoryError;
use prizm_types::workflow::WorkflowDefRecord;
use uuid::Uuid;

/// Storage for registered workflow definitions, unique per `(scope, name)`.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait DefinitionRepository: Send + Sync {
    /// Insert, or replace the record with the same `(scope, name)`.
    ///
    /// On replace the stored id and `created_at` are kept; the returned
    /// record reflects what was stored.
    fn upsert_definition(
        &self,
        record: &WorkflowDefRecord,
    ) -> impl std::future::Future<Output = Result<WorkflowDefRecord, RepositoryError>> + Send;

    fn get_definition(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<WorkflowDefRecord>, RepositoryError>> + Send;

    fn get_definition_by_name(
        &self,
        scope: &str,
        name: &str,
    ) -> impl std::future::Future<Output = Result<Option<WorkflowDefRecord>, RepositoryError>> + Send;

    /// List definitions in a scope, ordered by name.
    fn list_definitions(
        &self,
        scope: &str,
    ) -> impl std::future::Future<Output = Result<Vec<WorkflowDefRecord>, RepositoryError>> + Send;

    /// Delete by `(scope, name)`. Returns `true` if it existed.
    fn delete_definition(
        &self,
        scope: &str,
        name: &str,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;
}

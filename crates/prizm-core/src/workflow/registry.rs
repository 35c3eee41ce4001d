//! Workflow definition registry.
//!
//! An explicit object handed to the runner at construction. Definitions are
//! keyed by `(scope, name)`; registering the same name again replaces the
//! content but keeps the record id. Runs snapshot the parsed definition at
//! start, so replacing a definition never touches runs already underway.

use std::collections::BTreeMap;

use chrono::Utc;
use prizm_types::workflow::{TriggerDef, WorkflowDef, WorkflowDefRecord};
use serde::Serialize;
use serde_json::{Map, Value};
use uuid::Uuid;

use super::definition::{args_schema, parse_workflow_yaml, ArgSchema, ParseError};
use super::trigger::{trigger_matches, TriggerEvent};
use crate::repository::definition::DefinitionRepository;

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error("definition is named '{found}' but was registered as '{expected}'")]
    NameMismatch { expected: String, found: String },

    #[error("workflow '{0}' not found")]
    NotFound(String),

    #[error("repository error: {0}")]
    Repository(String),
}

/// How to find a definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DefLookup {
    Id(Uuid),
    Name(String),
}

/// A registry record together with its parsed definition and args schema.
#[derive(Debug, Clone, Serialize)]
pub struct DefWithSchema {
    pub record: WorkflowDefRecord,
    pub definition: WorkflowDef,
    pub args_schema: BTreeMap<String, ArgSchema>,
}

/// A registered workflow whose trigger fired for an event.
#[derive(Debug, Clone)]
pub struct TriggeredWorkflow {
    pub record: WorkflowDefRecord,
    pub definition: WorkflowDef,
    pub args: Map<String, Value>,
}

pub struct WorkflowRegistry<D: DefinitionRepository> {
    repo: D,
}

impl<D: DefinitionRepository> WorkflowRegistry<D> {
    pub fn new(repo: D) -> Self {
        Self { repo }
    }

    pub fn repo(&self) -> &D {
        &self.repo
    }

    /// Parse, validate, and upsert a definition by `(scope, name)`.
    ///
    /// `description` and `triggers` default to the ones in `content`.
    pub async fn register_def(
        &self,
        scope: &str,
        name: &str,
        content: &str,
        description: Option<String>,
        triggers: Option<Vec<TriggerDef>>,
    ) -> Result<WorkflowDefRecord, RegistryError> {
        let def = parse_workflow_yaml(content)?;
        if def.name != name {
            return Err(RegistryError::NameMismatch {
                expected: name.to_string(),
                found: def.name,
            });
        }

        let now = Utc::now();
        let record = WorkflowDefRecord {
            id: Uuid::now_v7(),
            name: name.to_string(),
            scope: scope.to_string(),
            yaml_content: content.to_string(),
            description: description.or(def.description),
            triggers: triggers.unwrap_or(def.triggers),
            created_at: now,
            updated_at: now,
        };
        let stored = self
            .repo
            .upsert_definition(&record)
            .await
            .map_err(|e| RegistryError::Repository(e.to_string()))?;

        tracing::info!(
            scope,
            workflow = name,
            def_id = %stored.id,
            replaced = stored.id != record.id,
            "registered workflow definition"
        );
        Ok(stored)
    }

    pub async fn get_def_by_name(
        &self,
        scope: &str,
        name: &str,
    ) -> Result<Option<WorkflowDefRecord>, RegistryError> {
        self.repo
            .get_definition_by_name(scope, name)
            .await
            .map_err(|e| RegistryError::Repository(e.to_string()))
    }

    pub async fn get_def_by_id(&self, id: &Uuid) -> Result<Option<WorkflowDefRecord>, RegistryError> {
        self.repo
            .get_definition(id)
            .await
            .map_err(|e| RegistryError::Repository(e.to_string()))
    }

    pub async fn list_defs(&self, scope: &str) -> Result<Vec<WorkflowDefRecord>, RegistryError> {
        self.repo
            .list_definitions(scope)
            .await
            .map_err(|e| RegistryError::Repository(e.to_string()))
    }

    pub async fn delete_def(&self, scope: &str, name: &str) -> Result<bool, RegistryError> {
        let deleted = self
            .repo
            .delete_definition(scope, name)
            .await
            .map_err(|e| RegistryError::Repository(e.to_string()))?;
        if deleted {
            tracing::info!(scope, workflow = name, "deleted workflow definition");
        }
        Ok(deleted)
    }

    /// The parsed definition registered under `(scope, name)`.
    pub async fn load_def(&self, scope: &str, name: &str) -> Result<WorkflowDef, RegistryError> {
        let record = self
            .get_def_by_name(scope, name)
            .await?
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))?;
        Ok(parse_workflow_yaml(&record.yaml_content)?)
    }

    /// Record, parsed definition, and derived args schema.
    pub async fn get_def_with_schema(
        &self,
        scope: &str,
        lookup: &DefLookup,
    ) -> Result<Option<DefWithSchema>, RegistryError> {
        let record = match lookup {
            DefLookup::Id(id) => self
                .get_def_by_id(id)
                .await?
                .filter(|record| record.scope == scope),
            DefLookup::Name(name) => self.get_def_by_name(scope, name).await?,
        };
        let Some(record) = record else {
            return Ok(None);
        };
        let definition = parse_workflow_yaml(&record.yaml_content)?;
        let args_schema = args_schema(&definition);
        Ok(Some(DefWithSchema {
            record,
            definition,
            args_schema,
        }))
    }

    /// Registered workflows in `scope` with a trigger that fires for `event`.
    ///
    /// Each match carries the trigger's `args`. A workflow matches at most
    /// once, on its first matching trigger.
    pub async fn match_event(
        &self,
        scope: &str,
        event: &TriggerEvent,
    ) -> Result<Vec<TriggeredWorkflow>, RegistryError> {
        let mut matched = Vec::new();
        for record in self.list_defs(scope).await? {
            let hit = record.triggers.iter().find(|t| match trigger_matches(t, event) {
                Ok(hit) => hit,
                Err(e) => {
                    tracing::warn!(scope, workflow = %record.name, error = %e, "trigger evaluation failed");
                    false
                }
            });
            let Some(trigger) = hit else {
                continue;
            };
            let args: Map<String, Value> = trigger
                .args
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            match parse_workflow_yaml(&record.yaml_content) {
                Ok(definition) => matched.push(TriggeredWorkflow {
                    record,
                    definition,
                    args,
                }),
                Err(e) => {
                    tracing::warn!(scope, workflow = %record.name, error = %e, "stored definition no longer parses");
                }
            }
        }
        Ok(matched)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

//! JSON tool-call surface over the runner, registry, and task runner.
//!
//! Agents call the engine with a tagged JSON request
//! (`{"tool": "run", "name": "digest", "args": {...}}`) and get a JSON value
//! back. [`WorkflowTools::call_json`] never fails: errors come back as
//! `{"ok": false, "error": "..."}` so the calling agent can react.

use prizm_types::task::TaskMeta;
use prizm_types::workflow::{RunFilter, RunStatus, WorkflowRun};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use uuid::Uuid;

use super::definition::{args_schema, parse_workflow_yaml, ParseError};
use super::registry::{DefLookup, RegistryError};
use super::runner::{RunnerError, StartOptions, WorkflowRunner};
use crate::repository::definition::DefinitionRepository;
use crate::repository::run::RunRepository;
use crate::task::{TaskError, TaskRunner};

fn default_limit() -> u32 {
    20
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "tool", rename_all = "snake_case")]
pub enum ToolRequest {
    /// Start a registered workflow by `name`, or an inline YAML `definition`.
    Run {
        #[serde(default)]
        name: Option<String>,
        #[serde(default)]
        definition: Option<String>,
        #[serde(default)]
        args: Map<String, Value>,
        /// Wait up to this long for the run to pause or finish.
        #[serde(default)]
        wait_ms: Option<u64>,
    },
    Resume {
        token: String,
        approved: bool,
    },
    List {
        #[serde(default)]
        workflow_name: Option<String>,
        #[serde(default)]
        status: Option<RunStatus>,
        #[serde(default = "default_limit")]
        limit: u32,
    },
    Status {
        run_id: Uuid,
    },
    Cancel {
        run_id: Uuid,
    },
    Register {
        name: String,
        content: String,
        #[serde(default)]
        description: Option<String>,
    },
    ListDefs,
    GetDef {
        #[serde(default)]
        name: Option<String>,
        #[serde(default)]
        id: Option<Uuid>,
    },
    Validate {
        content: String,
    },
    SpawnTask {
        input: String,
        #[serde(default)]
        meta: TaskMeta,
        #[serde(default)]
        wait: bool,
        #[serde(default)]
        timeout_ms: Option<u64>,
    },
    TaskStatus {
        task_id: Uuid,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error(transparent)]
    Runner(#[from] RunnerError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Task(#[from] TaskError),

    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Compact run view for tool results: status plus completed outputs.
fn run_view(run: &WorkflowRun) -> Value {
    let outputs: Map<String, Value> = run
        .step_results
        .iter()
        .filter_map(|r| r.output.clone().map(|o| (r.step_id.clone(), o)))
        .collect();
    json!({
        "run_id": run.id,
        "workflow_name": run.workflow_name,
        "status": run.status,
        "current_step_index": run.current_step_index,
        "resume_token": run.resume_token,
        "error": run.error,
        "outputs": outputs,
    })
}

pub struct WorkflowTools<R: RunRepository, D: DefinitionRepository> {
    runner: WorkflowRunner<R, D>,
    tasks: TaskRunner,
}

impl<R, D> WorkflowTools<R, D>
where
    R: RunRepository + 'static,
    D: DefinitionRepository + 'static,
{
    pub fn new(runner: WorkflowRunner<R, D>, tasks: TaskRunner) -> Self {
        Self { runner, tasks }
    }

    /// Parse and dispatch a raw JSON request, folding errors into the result.
    pub async fn call_json(&self, scope: &str, request: Value) -> Value {
        let outcome = match serde_json::from_value::<ToolRequest>(request) {
            Ok(request) => self.call(scope, request).await,
            Err(e) => Err(ToolError::InvalidRequest(e.to_string())),
        };
        match outcome {
            Ok(result) => json!({ "ok": true, "result": result }),
            Err(e) => {
                tracing::debug!(scope, error = %e, "tool call failed");
                json!({ "ok": false, "error": e.to_string() })
            }
        }
    }

    pub async fn call(&self, scope: &str, request: ToolRequest) -> Result<Value, ToolError> {
        match request {
            ToolRequest::Run {
                name,
                definition,
                args,
                wait_ms,
            } => {
                let options = StartOptions::with_args(args);
                let run_id = match (definition, name) {
                    (Some(content), _) => {
                        let def = parse_workflow_yaml(&content)?;
                        self.runner.start(scope, def, options).await?
                    }
                    (None, Some(name)) => self.runner.start_by_name(scope, &name, options).await?,
                    (None, None) => {
                        return Err(ToolError::InvalidRequest(
                            "run needs either 'name' or 'definition'".to_string(),
                        ));
                    }
                };
                match wait_ms {
                    Some(ms) => {
                        let run = self
                            .runner
                            .wait_settled(run_id, std::time::Duration::from_millis(ms))
                            .await?;
                        Ok(run_view(&run))
                    }
                    None => Ok(json!({ "run_id": run_id, "status": RunStatus::Pending })),
                }
            }
            ToolRequest::Resume { token, approved } => {
                let run = self.runner.resume(&token, approved).await?;
                Ok(run_view(&run))
            }
            ToolRequest::List {
                workflow_name,
                status,
                limit,
            } => {
                let filter = RunFilter {
                    workflow_name,
                    status,
                };
                let runs = self.runner.list_runs(scope, &filter, limit).await?;
                Ok(serde_json::to_value(runs)?)
            }
            ToolRequest::Status { run_id } => {
                let run = self.runner.get_run(run_id).await?;
                if run.scope != scope {
                    return Err(ToolError::NotFound(format!("run {run_id}")));
                }
                Ok(run_view(&run))
            }
            ToolRequest::Cancel { run_id } => {
                let cancelled = self.runner.cancel(run_id).await?;
                Ok(json!({ "run_id": run_id, "cancelled": cancelled }))
            }
            ToolRequest::Register {
                name,
                content,
                description,
            } => {
                let record = self
                    .runner
                    .registry()
                    .register_def(scope, &name, &content, description, None)
                    .await?;
                Ok(serde_json::to_value(record)?)
            }
            ToolRequest::ListDefs => {
                let defs = self.runner.registry().list_defs(scope).await?;
                let listed: Vec<Value> = defs
                    .iter()
                    .map(|d| {
                        json!({
                            "id": d.id,
                            "name": d.name,
                            "description": d.description,
                            "triggers": d.triggers.len(),
                            "updated_at": d.updated_at,
                        })
                    })
                    .collect();
                Ok(Value::Array(listed))
            }
            ToolRequest::GetDef { name, id } => {
                let lookup = match (id, name) {
                    (Some(id), _) => DefLookup::Id(id),
                    (None, Some(name)) => DefLookup::Name(name),
                    (None, None) => {
                        return Err(ToolError::InvalidRequest(
                            "get_def needs either 'name' or 'id'".to_string(),
                        ));
                    }
                };
                let found = self
                    .runner
                    .registry()
                    .get_def_with_schema(scope, &lookup)
                    .await?
                    .ok_or_else(|| ToolError::NotFound("workflow definition".to_string()))?;
                Ok(serde_json::to_value(found)?)
            }
            ToolRequest::Validate { content } => Ok(match parse_workflow_yaml(&content) {
                Ok(def) => json!({
                    "valid": true,
                    "name": def.name,
                    "steps": def.steps.len(),
                    "args_schema": args_schema(&def),
                }),
                Err(e) => json!({ "valid": false, "error": e.to_string() }),
            }),
            ToolRequest::SpawnTask {
                input,
                meta,
                wait,
                timeout_ms,
            } => {
                if wait {
                    let task = self.tasks.trigger_sync(scope, &input, meta, timeout_ms).await?;
                    Ok(serde_json::to_value(task)?)
                } else {
                    let task_id = self.tasks.trigger(scope, &input, meta)?;
                    Ok(json!({ "task_id": task_id }))
                }
            }
            ToolRequest::TaskStatus { task_id } => {
                let task = self.tasks.get_status(task_id)?;
                Ok(serde_json::to_value(task)?)
            }
        }
    }
}

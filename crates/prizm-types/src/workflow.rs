//! Workflow domain types for the Prizm workflow engine.
//!
//! `WorkflowDef` is the immutable template parsed from YAML. `WorkflowRun` is
//! the mutable execution record owned by the runner, and `WorkflowDefRecord`
//! is the registry entry stored per `(scope, name)`.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// WorkflowDef
// ---------------------------------------------------------------------------

/// A workflow template: named args, ordered steps, triggers, and run policy.
///
/// Steps execute strictly in declaration order. Every `$stepId` reference in a
/// step body must point at an earlier step (checked by the definition
/// validator in prizm-core).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDef {
    /// Name, unique within a scope.
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Named input parameters.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub args: BTreeMap<String, ArgDef>,
    /// Named output schema.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub outputs: BTreeMap<String, OutputDef>,
    #[serde(default)]
    pub steps: Vec<StepDef>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub triggers: Vec<TriggerDef>,
    #[serde(default, skip_serializing_if = "RunConfig::is_default")]
    pub config: RunConfig,
}

impl WorkflowDef {
    /// Find a step by id.
    pub fn step(&self, id: &str) -> Option<&StepDef> {
        self.steps.iter().find(|s| s.id == id)
    }

    /// Position of a step in the execution order.
    pub fn step_index(&self, id: &str) -> Option<usize> {
        self.steps.iter().position(|s| s.id == id)
    }
}

/// A declared workflow input. A present `default` makes the arg optional.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ArgDef {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl ArgDef {
    pub fn is_required(&self) -> bool {
        self.default.is_none()
    }
}

/// A declared workflow output.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OutputDef {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub output_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

// ---------------------------------------------------------------------------
// Run-level policy
// ---------------------------------------------------------------------------

/// What the runner does when a step exhausts its retries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorStrategy {
    /// The run fails with the step's error attached.
    #[default]
    FailFast,
    /// The step is marked failed and execution moves on.
    Continue,
}

/// Run-level configuration attached to a definition.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    #[serde(default)]
    pub error_strategy: ErrorStrategy,
    /// Budget for the whole run, measured in active execution time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_total_timeout_ms: Option<u64>,
}

impl RunConfig {
    pub fn is_default(&self) -> bool {
        *self == RunConfig::default()
    }
}

// ---------------------------------------------------------------------------
// StepDef
// ---------------------------------------------------------------------------

/// A single step. The variant-specific fields live in `kind`, flattened
/// next to the shared fields and discriminated by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepDef {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(flatten)]
    pub kind: StepKind,
    /// Expression or template producing the step's argument payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<String>,
    /// When present and falsy, the step is skipped.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_config: Option<RetryConfig>,
    /// Side effects fired after the step succeeds.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub linked_actions: Vec<LinkedAction>,
}

impl StepDef {
    /// Per-step timeout, if the variant carries one.
    pub fn timeout_ms(&self) -> Option<u64> {
        match &self.kind {
            StepKind::Agent { timeout_ms, .. } | StepKind::Transform { timeout_ms, .. } => {
                *timeout_ms
            }
            StepKind::Approve { .. } => None,
        }
    }
}

/// Step variants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepKind {
    /// Hand a prompt to the agent executor.
    Agent {
        prompt: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        model: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout_ms: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_config: Option<SessionConfig>,
    },
    /// Suspend the run until a human approves or denies.
    Approve { approve_prompt: String },
    /// Reshape prior outputs with a pure expression.
    Transform {
        transform: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout_ms: Option<u64>,
    },
}

impl StepKind {
    /// The `type` discriminator as written in YAML.
    pub fn type_name(&self) -> &'static str {
        match self {
            StepKind::Agent { .. } => "agent",
            StepKind::Approve { .. } => "approve",
            StepKind::Transform { .. } => "transform",
        }
    }

    /// All accepted `type` values.
    pub const TYPE_NAMES: [&'static str; 3] = ["agent", "approve", "transform"];
}

/// Agent session settings forwarded to the agent executor.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allowed_tools: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allowed_skills: Vec<String>,
    #[serde(default)]
    pub memory: MemoryPolicy,
    /// JSON schema the agent's final output must conform to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_schema: Option<Value>,
    /// How many times the agent may retry to satisfy `output_schema`.
    #[serde(default)]
    pub schema_retries: u32,
}

/// Memory access granted to an agent step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryPolicy {
    #[default]
    None,
    Read,
    ReadWrite,
}

// ---------------------------------------------------------------------------
// Retry
// ---------------------------------------------------------------------------

/// Failure classification used to match `retry_on`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Failed,
    Timeout,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureKind::Failed => write!(f, "failed"),
            FailureKind::Timeout => write!(f, "timeout"),
        }
    }
}

/// Per-step retry policy. A step is attempted at most `max_retries + 1` times.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default)]
    pub max_retries: u32,
    #[serde(default)]
    pub retry_delay_ms: u64,
    #[serde(default = "default_retry_on")]
    pub retry_on: Vec<FailureKind>,
}

fn default_retry_on() -> Vec<FailureKind> {
    vec![FailureKind::Failed, FailureKind::Timeout]
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 0,
            retry_delay_ms: 0,
            retry_on: default_retry_on(),
        }
    }
}

// ---------------------------------------------------------------------------
// Linked actions
// ---------------------------------------------------------------------------

/// Side effect fired after a step succeeds. String fields are templates
/// rendered with `$prev` bound to the step's own output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LinkedAction {
    CreateTodo {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        list: Option<String>,
        title: String,
    },
    Notify {
        message: String,
    },
    AppendDocument {
        document_id: String,
        content: String,
    },
}

impl LinkedAction {
    pub fn type_name(&self) -> &'static str {
        match self {
            LinkedAction::CreateTodo { .. } => "create_todo",
            LinkedAction::Notify { .. } => "notify",
            LinkedAction::AppendDocument { .. } => "append_document",
        }
    }

    /// Template strings carried by the action, in a stable order.
    pub fn templates(&self) -> Vec<&str> {
        match self {
            LinkedAction::CreateTodo { list, title } => {
                let mut out = vec![title.as_str()];
                if let Some(list) = list {
                    out.push(list.as_str());
                }
                out
            }
            LinkedAction::Notify { message } => vec![message.as_str()],
            LinkedAction::AppendDocument {
                document_id,
                content,
            } => vec![document_id.as_str(), content.as_str()],
        }
    }
}

// ---------------------------------------------------------------------------
// Triggers
// ---------------------------------------------------------------------------

/// Event sources that can start a workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    Cron,
    ScheduleRemind,
    TodoCompleted,
    DocumentSaved,
}

impl TriggerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerType::Cron => "cron",
            TriggerType::ScheduleRemind => "schedule_remind",
            TriggerType::TodoCompleted => "todo_completed",
            TriggerType::DocumentSaved => "document_saved",
        }
    }
}

impl fmt::Display for TriggerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Trigger metadata. Matching against incoming events happens in the trigger
/// matcher; scheduling is owned by an external collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerDef {
    #[serde(rename = "type")]
    pub trigger_type: TriggerType,
    /// Cron expression (required for `cron`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<String>,
    /// Key/value equality filter over the event payload.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub filter: BTreeMap<String, Value>,
    /// Optional JEXL predicate over the event payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub when: Option<String>,
    /// Args passed to runs started by this trigger.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub args: BTreeMap<String, Value>,
}

// ---------------------------------------------------------------------------
// Run status
// ---------------------------------------------------------------------------

/// Lifecycle status of a workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Waiting for a scope concurrency permit.
    Pending,
    Running,
    /// Suspended at an approve step.
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Cancelled
        )
    }

    /// Paused or terminal: no driver task is working on the run.
    pub fn is_settled(&self) -> bool {
        self.is_terminal() || *self == RunStatus::Paused
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Paused => "paused",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(RunStatus::Pending),
            "running" => Ok(RunStatus::Running),
            "paused" => Ok(RunStatus::Paused),
            "completed" => Ok(RunStatus::Completed),
            "failed" => Ok(RunStatus::Failed),
            "cancelled" => Ok(RunStatus::Cancelled),
            other => Err(format!("invalid run status: '{other}'")),
        }
    }
}

/// Status of an individual step within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
    WaitingApproval,
}

// ---------------------------------------------------------------------------
// Errors surfaced on runs and tasks
// ---------------------------------------------------------------------------

/// Classification of a terminal failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    StepFailed,
    StepTimeout,
    RunTimeout,
    /// An approve step was rejected.
    Denied,
    Cancelled,
    /// A synchronous task wait ran out of time.
    Timeout,
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::StepFailed => "step_failed",
            ErrorKind::StepTimeout => "step_timeout",
            ErrorKind::RunTimeout => "run_timeout",
            ErrorKind::Denied => "denied",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Internal => "internal",
        };
        f.write_str(s)
    }
}

/// Structured error attached to runs, steps, and tasks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunError {
    pub kind: ErrorKind,
    pub message: String,
}

impl RunError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for RunError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

// ---------------------------------------------------------------------------
// WorkflowRun
// ---------------------------------------------------------------------------

/// Outcome of one step within a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub step_id: String,
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RunError>,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl StepResult {
    pub fn pending(step_id: impl Into<String>) -> Self {
        Self {
            step_id: step_id.into(),
            status: StepStatus::Pending,
            output: None,
            error: None,
            attempts: 0,
            started_at: None,
            finished_at: None,
        }
    }
}

/// Mutable execution record of a workflow.
///
/// Persisted after every state transition. `definition` is the snapshot
/// taken at start time, so re-registering a definition never changes a run
/// that is already underway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowRun {
    pub id: Uuid,
    pub workflow_name: String,
    pub scope: String,
    pub status: RunStatus,
    pub current_step_index: usize,
    pub step_results: Vec<StepResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RunError>,
    pub trigger_type: String,
    /// Present only while the run is paused.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_token: Option<String>,
    #[serde(default)]
    pub args: serde_json::Map<String, Value>,
    pub definition: WorkflowDef,
    /// Execution time consumed against `max_total_timeout_ms`.
    #[serde(default)]
    pub active_ms: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowRun {
    /// Build a fresh run record for `definition`, one pending result per step.
    pub fn new(
        scope: impl Into<String>,
        definition: WorkflowDef,
        args: serde_json::Map<String, Value>,
        trigger_type: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        let step_results = definition
            .steps
            .iter()
            .map(|s| StepResult::pending(s.id.clone()))
            .collect();
        Self {
            id: Uuid::now_v7(),
            workflow_name: definition.name.clone(),
            scope: scope.into(),
            status: RunStatus::Pending,
            current_step_index: 0,
            step_results,
            error: None,
            trigger_type: trigger_type.into(),
            resume_token: None,
            args,
            definition,
            active_ms: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Output of a step, if it completed.
    pub fn step_output(&self, step_id: &str) -> Option<&Value> {
        self.step_results
            .iter()
            .find(|r| r.step_id == step_id)
            .and_then(|r| r.output.as_ref())
    }

    /// Compact view for list endpoints.
    pub fn summary(&self) -> RunSummary {
        RunSummary {
            id: self.id,
            workflow_name: self.workflow_name.clone(),
            scope: self.scope.clone(),
            status: self.status,
            current_step_index: self.current_step_index,
            total_steps: self.step_results.len(),
            trigger_type: self.trigger_type.clone(),
            error: self.error.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

/// List-view projection of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub id: Uuid,
    pub workflow_name: String,
    pub scope: String,
    pub status: RunStatus,
    pub current_step_index: usize,
    pub total_steps: usize,
    pub trigger_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RunError>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Optional filters for listing runs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunFilter {
    pub workflow_name: Option<String>,
    pub status: Option<RunStatus>,
}

// ---------------------------------------------------------------------------
// Registry record
// ---------------------------------------------------------------------------

/// A registered workflow definition. Unique per `(scope, name)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefRecord {
    pub id: Uuid,
    pub name: String,
    pub scope: String,
    pub yaml_content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub triggers: Vec<TriggerDef>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const SAMPLE_YAML: &str = r#"
name: daily-digest
description: Summarize the day's notes
args:
  topic:
    description: What to focus on
  limit:
    default: 5
outputs:
  summary:
    type: string
steps:
  - id: fetch
    type: agent
    prompt: "Collect notes about {{ $args.topic }}"
    timeout_ms: 30000
    retry_config:
      max_retries: 2
      retry_delay_ms: 100
      retry_on: [timeout]
  - id: format
    type: transform
    transform: "{ title: $fetch.title, count: $fetch.items|length }"
  - id: confirm
    type: approve
    approve_prompt: "Publish {{ $format.title }}?"
    linked_actions:
      - type: notify
        message: "digest approved"
triggers:
  - type: cron
    schedule: "0 9 * * *"
  - type: document_saved
    filter:
      folder: journal
config:
  error_strategy: continue
  max_total_timeout_ms: 600000
"#;

    #[test]
    fn test_workflow_def_yaml_deserialize() {
        let def: WorkflowDef = serde_yaml_ng::from_str(SAMPLE_YAML).unwrap();
        assert_eq!(def.name, "daily-digest");
        assert_eq!(def.args.len(), 2);
        assert!(def.args["topic"].is_required());
        assert_eq!(def.args["limit"].default, Some(json!(5)));
        assert_eq!(def.steps.len(), 3);
        assert_eq!(def.steps[0].kind.type_name(), "agent");
        assert_eq!(def.steps[0].timeout_ms(), Some(30000));
        let retry = def.steps[0].retry_config.as_ref().unwrap();
        assert_eq!(retry.max_retries, 2);
        assert_eq!(retry.retry_on, vec![FailureKind::Timeout]);
        assert!(matches!(def.steps[2].kind, StepKind::Approve { .. }));
        assert_eq!(def.steps[2].linked_actions.len(), 1);
        assert_eq!(def.triggers[0].trigger_type, TriggerType::Cron);
        assert_eq!(def.triggers[1].filter["folder"], json!("journal"));
        assert_eq!(def.config.error_strategy, ErrorStrategy::Continue);
    }

    #[test]
    fn test_workflow_def_yaml_roundtrip_is_field_equal() {
        let def: WorkflowDef = serde_yaml_ng::from_str(SAMPLE_YAML).unwrap();
        let yaml = serde_yaml_ng::to_string(&def).unwrap();
        let back: WorkflowDef = serde_yaml_ng::from_str(&yaml).unwrap();
        assert_eq!(def, back);
    }

    #[test]
    fn test_step_def_json_is_flat() {
        let step = StepDef {
            id: "shape".to_string(),
            description: None,
            kind: StepKind::Transform {
                transform: "$prev".to_string(),
                timeout_ms: None,
            },
            input: None,
            condition: Some("$prev.ok".to_string()),
            retry_config: None,
            linked_actions: vec![],
        };
        let value = serde_json::to_value(&step).unwrap();
        assert_eq!(value["type"], "transform");
        assert_eq!(value["transform"], "$prev");
        assert_eq!(value["condition"], "$prev.ok");
        assert!(value.get("kind").is_none());
    }

    #[test]
    fn test_retry_config_defaults() {
        let cfg: RetryConfig = serde_json::from_value(json!({"max_retries": 3})).unwrap();
        assert_eq!(cfg.max_retries, 3);
        assert_eq!(cfg.retry_delay_ms, 0);
        assert_eq!(cfg.retry_on, vec![FailureKind::Failed, FailureKind::Timeout]);
    }

    #[test]
    fn test_unknown_step_type_rejected() {
        let yaml = r#"
name: bad
steps:
  - id: a
    type: teleport
"#;
        let result: Result<WorkflowDef, _> = serde_yaml_ng::from_str(yaml);
        assert!(result.is_err());
    }

    #[test]
    fn test_run_status_terminal_and_settled() {
        assert!(RunStatus::Completed.is_terminal());
        assert!(RunStatus::Failed.is_terminal());
        assert!(RunStatus::Cancelled.is_terminal());
        assert!(!RunStatus::Paused.is_terminal());
        assert!(RunStatus::Paused.is_settled());
        assert!(!RunStatus::Running.is_settled());
    }

    #[test]
    fn test_run_status_string_roundtrip() {
        for status in [
            RunStatus::Pending,
            RunStatus::Running,
            RunStatus::Paused,
            RunStatus::Completed,
            RunStatus::Failed,
            RunStatus::Cancelled,
        ] {
            assert_eq!(status.as_str().parse::<RunStatus>().unwrap(), status);
            let json = serde_json::to_value(status).unwrap();
            assert_eq!(json, json!(status.as_str()));
        }
        assert!("crashed".parse::<RunStatus>().is_err());
    }

    #[test]
    fn test_new_run_has_pending_result_per_step() {
        let def: WorkflowDef = serde_yaml_ng::from_str(SAMPLE_YAML).unwrap();
        let run = WorkflowRun::new("notes", def, serde_json::Map::new(), "manual");
        assert_eq!(run.status, RunStatus::Pending);
        assert_eq!(run.step_results.len(), 3);
        assert!(run
            .step_results
            .iter()
            .all(|r| r.status == StepStatus::Pending));
        assert_eq!(run.summary().total_steps, 3);
    }

    #[test]
    fn test_run_error_display() {
        let err = RunError::new(ErrorKind::Denied, "approval rejected");
        assert_eq!(err.to_string(), "denied: approval rejected");
    }
}

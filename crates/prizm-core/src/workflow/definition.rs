//! Workflow definition parsing, validation, compilation, and filesystem
//! operations.
//!
//! `parse_workflow_yaml` turns YAML into a `WorkflowDef` and rejects anything
//! the runner could not execute. `compile` lowers a definition into a
//! [`CompiledWorkflow`] whose expressions are already parsed, so the runner
//! never touches expression source text.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use prizm_types::workflow::{
    LinkedAction, StepDef, StepKind, TriggerType, WorkflowDef,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use super::expression::{
    self, Expr, ExpressionError, Payload, RefRoot, Reference, Scope, Template,
};
use super::trigger::validate_schedule;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Reasons a workflow definition is rejected.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("malformed definition: {0}")]
    Syntax(String),

    #[error("step '{step}' has unknown type '{step_type}' (expected one of: agent, approve, transform)")]
    UnknownStepType { step: String, step_type: String },

    #[error("workflow must have at least one step")]
    EmptySteps,

    #[error("invalid workflow name '{0}' (only letters, digits, '-' and '_' allowed)")]
    InvalidName(String),

    #[error("invalid step id '{0}' (must start with a letter or '_', and may not be 'args' or 'prev')")]
    InvalidStepId(String),

    #[error("duplicate step id '{0}'")]
    DuplicateStepId(String),

    #[error("step '{step}' references unknown step '{reference}'")]
    UnknownStepReference { step: String, reference: String },

    #[error("step '{step}' references '{reference}', which does not run before it")]
    ForwardReference { step: String, reference: String },

    #[error("step '{step}' references undeclared arg '{arg}'")]
    UnknownArg { step: String, arg: String },

    #[error("step '{step}' has an invalid {field}: {source}")]
    InvalidExpression {
        step: String,
        field: &'static str,
        source: ExpressionError,
    },

    #[error("trigger #{index} ({trigger_type}) has an invalid schedule: {message}")]
    InvalidSchedule {
        index: usize,
        trigger_type: TriggerType,
        message: String,
    },

    #[error("step '{0}' has a zero timeout")]
    ZeroTimeout(String),

    #[error("max_total_timeout_ms must be greater than zero")]
    ZeroRunTimeout,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Parse a YAML string into a validated `WorkflowDef`.
pub fn parse_workflow_yaml(yaml: &str) -> Result<WorkflowDef, ParseError> {
    check_step_types(yaml)?;
    let def: WorkflowDef =
        serde_yaml_ng::from_str(yaml).map_err(|e| ParseError::Syntax(e.to_string()))?;
    validate_definition(&def)?;
    Ok(def)
}

/// Serialize a `WorkflowDef` to a YAML string.
pub fn serialize_workflow_yaml(def: &WorkflowDef) -> Result<String, ParseError> {
    serde_yaml_ng::to_string(def).map_err(|e| ParseError::Syntax(e.to_string()))
}

/// Report an unknown step `type` by name instead of a generic serde error.
fn check_step_types(yaml: &str) -> Result<(), ParseError> {
    let doc: serde_yaml_ng::Value =
        serde_yaml_ng::from_str(yaml).map_err(|e| ParseError::Syntax(e.to_string()))?;
    let Some(steps) = doc.get("steps").and_then(|s| s.as_sequence()) else {
        return Ok(());
    };
    for (index, step) in steps.iter().enumerate() {
        let Some(step_type) = step.get("type").and_then(|t| t.as_str()) else {
            continue;
        };
        if !StepKind::TYPE_NAMES.contains(&step_type) {
            let step_id = step
                .get("id")
                .and_then(|id| id.as_str())
                .map(String::from)
                .unwrap_or_else(|| format!("#{index}"));
            return Err(ParseError::UnknownStepType {
                step: step_id,
                step_type: step_type.to_string(),
            });
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Compiled form
// ---------------------------------------------------------------------------

/// A definition with every expression parsed.
#[derive(Debug, Clone)]
pub struct CompiledWorkflow {
    pub steps: Vec<CompiledStep>,
}

/// Parsed expressions for one step.
#[derive(Debug, Clone)]
pub struct CompiledStep {
    pub id: String,
    pub condition: Option<Expr>,
    pub input: Option<Payload>,
    pub body: CompiledBody,
    pub actions: Vec<CompiledAction>,
}

#[derive(Debug, Clone)]
pub enum CompiledBody {
    Agent { prompt: Template },
    Approve { prompt: Template },
    Transform { expr: Expr },
}

/// A linked action whose string fields are parsed templates.
#[derive(Debug, Clone)]
pub enum CompiledAction {
    CreateTodo {
        list: Option<Template>,
        title: Template,
    },
    Notify {
        message: Template,
    },
    AppendDocument {
        document_id: Template,
        content: Template,
    },
}

impl CompiledAction {
    /// Render every template, producing the concrete action to hand off.
    pub fn render(&self, scope: &Scope<'_>) -> Result<LinkedAction, ExpressionError> {
        Ok(match self {
            CompiledAction::CreateTodo { list, title } => LinkedAction::CreateTodo {
                list: list
                    .as_ref()
                    .map(|t| expression::render(t, scope))
                    .transpose()?,
                title: expression::render(title, scope)?,
            },
            CompiledAction::Notify { message } => LinkedAction::Notify {
                message: expression::render(message, scope)?,
            },
            CompiledAction::AppendDocument {
                document_id,
                content,
            } => LinkedAction::AppendDocument {
                document_id: expression::render(document_id, scope)?,
                content: expression::render(content, scope)?,
            },
        })
    }

    fn collect_refs<'a>(&'a self, out: &mut Vec<&'a Reference>) {
        match self {
            CompiledAction::CreateTodo { list, title } => {
                title.collect_refs(out);
                if let Some(list) = list {
                    list.collect_refs(out);
                }
            }
            CompiledAction::Notify { message } => message.collect_refs(out),
            CompiledAction::AppendDocument {
                document_id,
                content,
            } => {
                document_id.collect_refs(out);
                content.collect_refs(out);
            }
        }
    }
}

impl CompiledStep {
    /// References that feed data into the step: condition, input, then body.
    pub fn data_references(&self) -> Vec<&Reference> {
        let mut refs = Vec::new();
        if let Some(condition) = &self.condition {
            condition.collect_refs(&mut refs);
        }
        if let Some(input) = &self.input {
            input.collect_refs(&mut refs);
        }
        match &self.body {
            CompiledBody::Agent { prompt } | CompiledBody::Approve { prompt } => {
                prompt.collect_refs(&mut refs)
            }
            CompiledBody::Transform { expr } => expr.collect_refs(&mut refs),
        }
        refs
    }
}

pub(crate) fn compile_step(step: &StepDef) -> Result<CompiledStep, ParseError> {
    let invalid = |field: &'static str| {
        let step = step.id.clone();
        move |source: ExpressionError| ParseError::InvalidExpression {
            step,
            field,
            source,
        }
    };

    let condition = step
        .condition
        .as_deref()
        .map(expression::parse_expression)
        .transpose()
        .map_err(invalid("condition"))?;
    let input = step
        .input
        .as_deref()
        .map(expression::parse_payload)
        .transpose()
        .map_err(invalid("input"))?;
    let body = match &step.kind {
        StepKind::Agent { prompt, .. } => CompiledBody::Agent {
            prompt: expression::parse_template(prompt).map_err(invalid("prompt"))?,
        },
        StepKind::Approve { approve_prompt } => CompiledBody::Approve {
            prompt: expression::parse_template(approve_prompt).map_err(invalid("approve_prompt"))?,
        },
        StepKind::Transform { transform, .. } => CompiledBody::Transform {
            expr: expression::parse_expression(transform).map_err(invalid("transform"))?,
        },
    };

    let mut actions = Vec::with_capacity(step.linked_actions.len());
    for action in &step.linked_actions {
        let template = |s: &str| expression::parse_template(s).map_err(invalid("linked action"));
        actions.push(match action {
            LinkedAction::CreateTodo { list, title } => CompiledAction::CreateTodo {
                list: list.as_deref().map(template).transpose()?,
                title: template(title)?,
            },
            LinkedAction::Notify { message } => CompiledAction::Notify {
                message: template(message)?,
            },
            LinkedAction::AppendDocument {
                document_id,
                content,
            } => CompiledAction::AppendDocument {
                document_id: template(document_id)?,
                content: template(content)?,
            },
        });
    }

    Ok(CompiledStep {
        id: step.id.clone(),
        condition,
        input,
        body,
        actions,
    })
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

fn is_valid_step_id(id: &str) -> bool {
    let mut chars = id.chars();
    let starts_ok = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    starts_ok
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        && id != "args"
        && id != "prev"
}

/// Validate and compile a definition.
///
/// Checks, in order:
/// - name format
/// - at least one step
/// - step id format and uniqueness
/// - timeouts are non-zero
/// - every expression parses
/// - `$step` references point at earlier steps, `$args.x` at declared args
/// - `cron` triggers carry a valid schedule
pub fn compile(def: &WorkflowDef) -> Result<CompiledWorkflow, ParseError> {
    if !is_valid_name(&def.name) {
        return Err(ParseError::InvalidName(def.name.clone()));
    }
    if def.steps.is_empty() {
        return Err(ParseError::EmptySteps);
    }
    if def.config.max_total_timeout_ms == Some(0) {
        return Err(ParseError::ZeroRunTimeout);
    }

    let mut positions: HashMap<&str, usize> = HashMap::new();
    for (index, step) in def.steps.iter().enumerate() {
        if !is_valid_step_id(&step.id) {
            return Err(ParseError::InvalidStepId(step.id.clone()));
        }
        if positions.insert(step.id.as_str(), index).is_some() {
            return Err(ParseError::DuplicateStepId(step.id.clone()));
        }
    }

    let mut steps = Vec::with_capacity(def.steps.len());
    for (index, step) in def.steps.iter().enumerate() {
        if step.timeout_ms() == Some(0) {
            return Err(ParseError::ZeroTimeout(step.id.clone()));
        }
        let compiled = compile_step(step)?;

        let mut refs = compiled.data_references();
        for action in &compiled.actions {
            action.collect_refs(&mut refs);
        }
        for reference in refs {
            match &reference.root {
                RefRoot::Prev => {}
                RefRoot::Args => {
                    if let Some(arg) = reference.first_field() {
                        if !def.args.contains_key(arg) {
                            return Err(ParseError::UnknownArg {
                                step: step.id.clone(),
                                arg: arg.to_string(),
                            });
                        }
                    }
                }
                RefRoot::Step(target) => match positions.get(target.as_str()) {
                    None => {
                        return Err(ParseError::UnknownStepReference {
                            step: step.id.clone(),
                            reference: target.clone(),
                        });
                    }
                    Some(&target_index) if target_index >= index => {
                        return Err(ParseError::ForwardReference {
                            step: step.id.clone(),
                            reference: target.clone(),
                        });
                    }
                    Some(_) => {}
                },
            }
        }
        steps.push(compiled);
    }

    for (index, trigger) in def.triggers.iter().enumerate() {
        let schedule = trigger.schedule.as_deref();
        let result = match (trigger.trigger_type, schedule) {
            (TriggerType::Cron, None) => Err("cron triggers require a schedule".to_string()),
            (_, Some(schedule)) => validate_schedule(schedule),
            (_, None) => Ok(()),
        };
        if let Err(message) = result {
            return Err(ParseError::InvalidSchedule {
                index,
                trigger_type: trigger.trigger_type,
                message,
            });
        }
    }

    Ok(CompiledWorkflow { steps })
}

/// Validate structural constraints on a `WorkflowDef`.
pub fn validate_definition(def: &WorkflowDef) -> Result<(), ParseError> {
    compile(def).map(|_| ())
}

// ---------------------------------------------------------------------------
// Args schema
// ---------------------------------------------------------------------------

/// One entry of a derived args schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArgSchema {
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// False when the arg is only known from a `$args.x` reference.
    pub declared: bool,
}

/// Derive the args schema: declared args merged with every `$args.x`
/// referenced in step bodies.
///
/// Works on definitions that have not been validated; expressions that fail
/// to parse are ignored.
pub fn args_schema(def: &WorkflowDef) -> BTreeMap<String, ArgSchema> {
    let mut schema: BTreeMap<String, ArgSchema> = def
        .args
        .iter()
        .map(|(name, arg)| {
            (
                name.clone(),
                ArgSchema {
                    required: arg.is_required(),
                    default: arg.default.clone(),
                    description: arg.description.clone(),
                    declared: true,
                },
            )
        })
        .collect();

    for step in &def.steps {
        let Ok(compiled) = compile_step(step) else {
            continue;
        };
        let mut refs = compiled.data_references();
        for action in &compiled.actions {
            action.collect_refs(&mut refs);
        }
        for reference in refs {
            if reference.root != RefRoot::Args {
                continue;
            }
            if let Some(name) = reference.first_field() {
                schema.entry(name.to_string()).or_insert(ArgSchema {
                    required: true,
                    default: None,
                    description: None,
                    declared: false,
                });
            }
        }
    }
    schema
}

// ---------------------------------------------------------------------------
// Filesystem operations
// ---------------------------------------------------------------------------

/// Load a workflow definition from a YAML file.
pub fn load_workflow_file(path: &Path) -> Result<WorkflowDef, ParseError> {
    let content = std::fs::read_to_string(path)?;
    parse_workflow_yaml(&content)
}

/// Save a workflow definition to a YAML file.
///
/// Creates parent directories if they don't exist.
pub fn save_workflow_file(path: &Path, def: &WorkflowDef) -> Result<(), ParseError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let yaml = serialize_workflow_yaml(def)?;
    std::fs::write(path, yaml)?;
    Ok(())
}

/// Discover all workflow YAML files under `base_dir`, recursively.
///
/// Files that fail to parse are skipped with a warning.
pub fn discover_workflows(base_dir: &Path) -> Result<Vec<(PathBuf, WorkflowDef)>, ParseError> {
    let mut results = Vec::new();
    if !base_dir.exists() {
        return Ok(results);
    }
    discover_recursive(base_dir, &mut results)?;
    results.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(results)
}

fn discover_recursive(
    dir: &Path,
    results: &mut Vec<(PathBuf, WorkflowDef)>,
) -> Result<(), ParseError> {
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            discover_recursive(&path, results)?;
        } else if path
            .extension()
            .is_some_and(|ext| ext == "yaml" || ext == "yml")
        {
            match load_workflow_file(&path) {
                Ok(def) => results.push((path, def)),
                Err(e) => tracing::warn!(?path, error = %e, "skipping unparseable workflow file"),
            }
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const DIGEST_YAML: &str = r#"
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
    prompt: "Collect {{ $args.limit }} notes about $args.topic"
    timeout_ms: 30000
    retry_config:
      max_retries: 2
  - id: format
    type: transform
    transform: "{ title: $fetch.title, count: $fetch.items|length }"
  - id: confirm
    type: approve
    approve_prompt: "Publish {{ $format.title }}?"
    condition: "$format.count > 0"
    linked_actions:
      - type: create_todo
        list: inbox
        title: "Review $format.title"
triggers:
  - type: cron
    schedule: "0 9 * * *"
config:
  error_strategy: fail_fast
"#;

    fn yaml_with_steps(steps: &str) -> String {
        format!("name: wf\nargs:\n  topic: {{}}\nsteps:\n{steps}")
    }

    #[test]
    fn test_parse_and_roundtrip() {
        let def = parse_workflow_yaml(DIGEST_YAML).expect("should parse");
        assert_eq!(def.name, "daily-digest");
        assert_eq!(def.steps.len(), 3);

        let yaml = serialize_workflow_yaml(&def).expect("should serialize");
        let back = parse_workflow_yaml(&yaml).expect("should re-parse");
        assert_eq!(def, back);
    }

    #[test]
    fn test_compile_collects_references() {
        let def = parse_workflow_yaml(DIGEST_YAML).unwrap();
        let compiled = compile(&def).unwrap();
        let confirm_refs: Vec<&RefRoot> = compiled.steps[2]
            .data_references()
            .into_iter()
            .map(|r| &r.root)
            .collect();
        assert_eq!(
            confirm_refs,
            vec![
                &RefRoot::Step("format".to_string()),
                &RefRoot::Step("format".to_string())
            ]
        );
        assert!(matches!(compiled.steps[1].body, CompiledBody::Transform { .. }));
        assert_eq!(compiled.steps[2].actions.len(), 1);
    }

    #[test]
    fn test_unknown_step_type_is_named() {
        let yaml = yaml_with_steps("  - id: a\n    type: teleport\n");
        match parse_workflow_yaml(&yaml).unwrap_err() {
            ParseError::UnknownStepType { step, step_type } => {
                assert_eq!(step, "a");
                assert_eq!(step_type, "teleport");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_rejects_malformed_yaml() {
        let err = parse_workflow_yaml("name: [unclosed").unwrap_err();
        assert!(matches!(err, ParseError::Syntax(_)), "got: {err}");
    }

    #[test]
    fn test_rejects_empty_steps() {
        let err = parse_workflow_yaml("name: wf\nsteps: []\n").unwrap_err();
        assert!(matches!(err, ParseError::EmptySteps), "got: {err}");
        let err = parse_workflow_yaml("name: wf\n").unwrap_err();
        assert!(matches!(err, ParseError::EmptySteps), "got: {err}");
    }

    #[test]
    fn test_rejects_duplicate_step_ids() {
        let yaml = yaml_with_steps(
            "  - id: a\n    type: transform\n    transform: '1'\n  - id: a\n    type: transform\n    transform: '2'\n",
        );
        let err = parse_workflow_yaml(&yaml).unwrap_err();
        assert!(matches!(err, ParseError::DuplicateStepId(ref id) if id == "a"), "got: {err}");
    }

    #[test]
    fn test_rejects_forward_and_unknown_references() {
        let forward = yaml_with_steps(
            "  - id: a\n    type: transform\n    transform: '$b.x'\n  - id: b\n    type: transform\n    transform: '1'\n",
        );
        let err = parse_workflow_yaml(&forward).unwrap_err();
        assert!(matches!(err, ParseError::ForwardReference { .. }), "got: {err}");

        let self_ref = yaml_with_steps("  - id: a\n    type: transform\n    transform: '$a'\n");
        let err = parse_workflow_yaml(&self_ref).unwrap_err();
        assert!(matches!(err, ParseError::ForwardReference { .. }), "got: {err}");

        let unknown = yaml_with_steps(
            "  - id: a\n    type: transform\n    transform: '1'\n    condition: '$ghost.ok'\n",
        );
        let err = parse_workflow_yaml(&unknown).unwrap_err();
        assert!(
            matches!(err, ParseError::UnknownStepReference { ref reference, .. } if reference == "ghost"),
            "got: {err}"
        );
    }

    #[test]
    fn test_rejects_undeclared_args() {
        let yaml = yaml_with_steps("  - id: a\n    type: agent\n    prompt: 'about $args.subject'\n");
        let err = parse_workflow_yaml(&yaml).unwrap_err();
        assert!(
            matches!(err, ParseError::UnknownArg { ref arg, .. } if arg == "subject"),
            "got: {err}"
        );
    }

    #[test]
    fn test_rejects_invalid_expression() {
        let yaml = yaml_with_steps("  - id: a\n    type: transform\n    transform: '{ a: '\n");
        let err = parse_workflow_yaml(&yaml).unwrap_err();
        assert!(
            matches!(err, ParseError::InvalidExpression { field: "transform", .. }),
            "got: {err}"
        );
    }

    #[test]
    fn test_rejects_deeply_nested_expression() {
        let transform = format!("{}1{}", "(".repeat(200_000), ")".repeat(200_000));
        let yaml = yaml_with_steps(&format!("  - id: a\n    type: transform\n    transform: '{transform}'\n"));
        let err = parse_workflow_yaml(&yaml).unwrap_err();
        assert!(
            matches!(err, ParseError::InvalidExpression { field: "transform", .. }),
            "got: {err}"
        );
        assert!(err.to_string().contains("nested too deeply"), "got: {err}");
    }

    #[test]
    fn test_rejects_invalid_names() {
        let err = parse_workflow_yaml("name: 'bad name'\nsteps:\n  - id: a\n    type: transform\n    transform: '1'\n")
            .unwrap_err();
        assert!(matches!(err, ParseError::InvalidName(_)), "got: {err}");

        let yaml = yaml_with_steps("  - id: prev\n    type: transform\n    transform: '1'\n");
        let err = parse_workflow_yaml(&yaml).unwrap_err();
        assert!(matches!(err, ParseError::InvalidStepId(_)), "got: {err}");
    }

    #[test]
    fn test_rejects_zero_timeouts() {
        let yaml = yaml_with_steps("  - id: a\n    type: agent\n    prompt: hi\n    timeout_ms: 0\n");
        let err = parse_workflow_yaml(&yaml).unwrap_err();
        assert!(matches!(err, ParseError::ZeroTimeout(_)), "got: {err}");

        let yaml = format!(
            "{}config:\n  max_total_timeout_ms: 0\n",
            yaml_with_steps("  - id: a\n    type: agent\n    prompt: hi\n")
        );
        let err = parse_workflow_yaml(&yaml).unwrap_err();
        assert!(matches!(err, ParseError::ZeroRunTimeout), "got: {err}");
    }

    #[test]
    fn test_rejects_cron_without_valid_schedule() {
        let base = yaml_with_steps("  - id: a\n    type: transform\n    transform: '1'\n");
        let missing = format!("{base}triggers:\n  - type: cron\n");
        let err = parse_workflow_yaml(&missing).unwrap_err();
        assert!(matches!(err, ParseError::InvalidSchedule { index: 0, .. }), "got: {err}");

        let bad = format!("{base}triggers:\n  - type: cron\n    schedule: 'not a schedule'\n");
        assert!(parse_workflow_yaml(&bad).is_err());

        let event = format!("{base}triggers:\n  - type: todo_completed\n    filter:\n      list: inbox\n");
        assert!(parse_workflow_yaml(&event).is_ok());
    }

    #[test]
    fn test_args_schema_merges_references() {
        let mut def = parse_workflow_yaml(DIGEST_YAML).unwrap();
        def.steps[0].input = Some("$args.extra".to_string());
        let schema = args_schema(&def);

        assert!(schema["topic"].required);
        assert!(schema["topic"].declared);
        assert!(!schema["limit"].required);
        assert_eq!(schema["limit"].default, Some(json!(5)));
        let extra = &schema["extra"];
        assert!(extra.required);
        assert!(!extra.declared);
        assert!(extra.description.is_none());
    }

    #[test]
    fn test_save_load_and_discover() {
        let dir = tempfile::tempdir().unwrap();
        let def = parse_workflow_yaml(DIGEST_YAML).unwrap();
        let path = dir.path().join("nested").join("digest.yaml");
        save_workflow_file(&path, &def).unwrap();
        assert_eq!(load_workflow_file(&path).unwrap(), def);

        std::fs::write(dir.path().join("broken.yml"), "name: [").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let found = discover_workflows(dir.path()).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].1.name, "daily-digest");

        assert!(discover_workflows(&dir.path().join("missing")).unwrap().is_empty());
    }
}

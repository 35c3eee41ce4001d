//! Per-step evaluation context.
//!
//! `RunContext` is rebuilt from the run record before each step: the run's
//! args, every completed step's output, and `prev` (the output of the step
//! immediately before, if it completed). Skipped and failed steps contribute
//! nothing, so references to them evaluate to `null`.

use std::collections::HashMap;

use prizm_types::workflow::{StepStatus, WorkflowRun};
use serde_json::{json, Map, Value};

use super::expression::Scope;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Maximum size of a single step output (1 MB).
pub const MAX_STEP_OUTPUT_SIZE: usize = 1_048_576;

// ---------------------------------------------------------------------------
// RunContext
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct RunContext {
    args: Map<String, Value>,
    outputs: HashMap<String, Value>,
    prev: Option<Value>,
}

impl RunContext {
    /// Context visible to the step at `index`.
    pub fn for_step(run: &WorkflowRun, index: usize) -> Self {
        let outputs = run.step_results[..index.min(run.step_results.len())]
            .iter()
            .filter(|r| r.status == StepStatus::Completed)
            .filter_map(|r| r.output.clone().map(|o| (r.step_id.clone(), o)))
            .collect();
        let prev = index
            .checked_sub(1)
            .and_then(|i| run.step_results.get(i))
            .filter(|r| r.status == StepStatus::Completed)
            .and_then(|r| r.output.clone());
        Self {
            args: run.args.clone(),
            outputs,
            prev,
        }
    }

    /// Context for a standalone agent invocation (no prior steps).
    pub fn with_args(args: Map<String, Value>) -> Self {
        Self {
            args,
            ..Self::default()
        }
    }

    pub fn scope(&self) -> Scope<'_> {
        Scope {
            args: &self.args,
            prev: self.prev.as_ref(),
            steps: &self.outputs,
        }
    }

    /// Same view, with `$prev` rebound to `prev`.
    pub fn scope_with_prev<'a>(&'a self, prev: &'a Value) -> Scope<'a> {
        Scope {
            args: &self.args,
            prev: Some(prev),
            steps: &self.outputs,
        }
    }
}

/// Enforce `MAX_STEP_OUTPUT_SIZE` on a step output.
///
/// Oversized outputs are replaced with a marker object describing the
/// overflow.
pub fn cap_output(step_id: &str, output: Value) -> Value {
    let size = serde_json::to_string(&output).map(|s| s.len()).unwrap_or(0);
    if size <= MAX_STEP_OUTPUT_SIZE {
        return output;
    }
    tracing::warn!(
        step_id,
        size,
        max = MAX_STEP_OUTPUT_SIZE,
        "step output exceeds size limit, truncating"
    );
    json!({
        "_truncated": true,
        "_original_size": size,
        "_message": format!("output exceeded {MAX_STEP_OUTPUT_SIZE} byte limit and was truncated"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use prizm_types::workflow::WorkflowDef;

    fn run_with_results() -> WorkflowRun {
        let def: WorkflowDef = serde_json::from_value(json!({
            "name": "ctx",
            "steps": [
                {"id": "a", "type": "transform", "transform": "1"},
                {"id": "b", "type": "transform", "transform": "2"},
                {"id": "c", "type": "transform", "transform": "3"},
                {"id": "d", "type": "transform", "transform": "4"}
            ]
        }))
        .unwrap();
        let args = json!({"topic": "rust"}).as_object().cloned().unwrap();
        let mut run = WorkflowRun::new("s", def, args, "manual");
        run.step_results[0].status = StepStatus::Completed;
        run.step_results[0].output = Some(json!({"n": 1}));
        run.step_results[1].status = StepStatus::Skipped;
        run.step_results[2].status = StepStatus::Completed;
        run.step_results[2].output = Some(json!("three"));
        run
    }

    #[test]
    fn test_for_step_collects_completed_outputs() {
        let run = run_with_results();
        let ctx = RunContext::for_step(&run, 3);
        let scope = ctx.scope();
        assert_eq!(scope.steps.get("a"), Some(&json!({"n": 1})));
        assert!(scope.steps.get("b").is_none());
        assert_eq!(scope.prev, Some(&json!("three")));
        assert_eq!(scope.args.get("topic"), Some(&json!("rust")));
    }

    #[test]
    fn test_prev_is_absent_after_skipped_step() {
        let run = run_with_results();
        let ctx = RunContext::for_step(&run, 2);
        assert!(ctx.scope().prev.is_none());
        assert!(RunContext::for_step(&run, 0).scope().prev.is_none());
    }

    #[test]
    fn test_for_step_only_sees_earlier_steps() {
        let run = run_with_results();
        let ctx = RunContext::for_step(&run, 1);
        assert!(ctx.scope().steps.get("c").is_none());
    }

    #[test]
    fn test_scope_with_prev_rebinds() {
        let ctx = RunContext::with_args(Map::new());
        let own = json!({"id": 7});
        assert_eq!(ctx.scope_with_prev(&own).prev, Some(&own));
    }

    #[test]
    fn test_cap_output_truncates_oversized() {
        let small = json!({"ok": true});
        assert_eq!(cap_output("s", small.clone()), small);

        let big = Value::String("x".repeat(MAX_STEP_OUTPUT_SIZE + 1));
        let capped = cap_output("s", big);
        assert_eq!(capped["_truncated"], json!(true));
    }
}

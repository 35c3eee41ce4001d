//! Trigger matching and cron schedule handling.
//!
//! Scheduling itself belongs to an external collaborator. This module only
//! answers two questions: is a schedule valid (and when does it fire next),
//! and whether a trigger matches an incoming event.
//!
//! `when` clauses are JEXL expressions evaluated against
//! `{ "trigger": {...}, "event": <payload> }`. Payloads are always passed as
//! context objects, never interpolated into expression strings.

use chrono::{DateTime, Utc};
use prizm_types::workflow::{TriggerDef, TriggerType};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

// ---------------------------------------------------------------------------
// Schedules
// ---------------------------------------------------------------------------

/// Normalize a schedule into a 6-field (seconds-first) cron expression.
///
/// Accepts standard 5-field cron, 6-field cron, and a few aliases
/// (`hourly`, `daily`, `weekly`, `every minute`).
pub fn normalize_schedule(input: &str) -> Result<String, String> {
    let trimmed = input.trim();
    let fields = trimmed.split_whitespace().count();
    match fields {
        5 => return Ok(format!("0 {trimmed}")),
        6 => return Ok(trimmed.to_string()),
        _ => {}
    }
    match trimmed.to_lowercase().as_str() {
        "every minute" | "minutely" => Ok("0 * * * * *".to_string()),
        "hourly" | "every hour" => Ok("0 0 * * * *".to_string()),
        "daily" | "every day" => Ok("0 0 0 * * *".to_string()),
        "weekly" | "every week" => Ok("0 0 0 * * 0".to_string()),
        _ => Err(format!("'{trimmed}' is not a cron expression")),
    }
}

fn parse_cron(schedule: &str) -> Result<croner::Cron, String> {
    let expr = normalize_schedule(schedule)?;
    expr.parse::<croner::Cron>().map_err(|e| e.to_string())
}

/// Check that `schedule` is a usable cron expression.
pub fn validate_schedule(schedule: &str) -> Result<(), String> {
    parse_cron(schedule).map(|_| ())
}

/// The next `count` fire times strictly after `after`.
pub fn next_fire_times(
    schedule: &str,
    after: DateTime<Utc>,
    count: usize,
) -> Result<Vec<DateTime<Utc>>, String> {
    let cron = parse_cron(schedule)?;
    Ok(cron
        .iter_after(after)
        .filter(|t| *t > after)
        .take(count)
        .collect())
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// An event delivered by a trigger source (scheduler, todo list, documents).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerEvent {
    pub trigger_type: TriggerType,
    #[serde(default)]
    pub payload: Value,
    pub fired_at: DateTime<Utc>,
}

impl TriggerEvent {
    pub fn new(trigger_type: TriggerType, payload: Value) -> Self {
        Self {
            trigger_type,
            payload,
            fired_at: Utc::now(),
        }
    }

    /// Shape: `{ "trigger": { "type": "...", "fired_at": "..." }, "event": <payload> }`
    pub fn to_eval_context(&self) -> Value {
        json!({
            "trigger": {
                "type": self.trigger_type.as_str(),
                "fired_at": self.fired_at.to_rfc3339(),
            },
            "event": self.payload,
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TriggerError {
    #[error("when clause evaluation failed: {0}")]
    WhenClause(String),
}

// ---------------------------------------------------------------------------
// Matching
// ---------------------------------------------------------------------------

fn lookup<'a>(payload: &'a Value, dotted: &str) -> Option<&'a Value> {
    dotted
        .split('.')
        .try_fold(payload, |current, key| current.get(key))
}

/// JEXL evaluator with the transforms `when` clauses may use.
fn evaluator() -> jexl_eval::Evaluator<'static> {
    jexl_eval::Evaluator::new()
        .with_transform("lower", |args: &[Value]| {
            let s = args.first().and_then(|v| v.as_str()).unwrap_or("");
            Ok(json!(s.to_lowercase()))
        })
        .with_transform("upper", |args: &[Value]| {
            let s = args.first().and_then(|v| v.as_str()).unwrap_or("");
            Ok(json!(s.to_uppercase()))
        })
        .with_transform("contains", |args: &[Value]| {
            let subject = args.first().and_then(|v| v.as_str()).unwrap_or("");
            let search = args.get(1).and_then(|v| v.as_str()).unwrap_or("");
            Ok(json!(subject.contains(search)))
        })
        .with_transform("startsWith", |args: &[Value]| {
            let subject = args.first().and_then(|v| v.as_str()).unwrap_or("");
            let prefix = args.get(1).and_then(|v| v.as_str()).unwrap_or("");
            Ok(json!(subject.starts_with(prefix)))
        })
        .with_transform("length", |args: &[Value]| {
            let len = match args.first() {
                Some(Value::String(s)) => s.len(),
                Some(Value::Array(a)) => a.len(),
                Some(Value::Object(o)) => o.len(),
                _ => 0,
            };
            Ok(json!(len as f64))
        })
}

/// Evaluate a `when` clause against an event.
pub fn evaluate_when(expression: &str, event: &TriggerEvent) -> Result<bool, TriggerError> {
    let result = evaluator()
        .eval_in_context(expression, event.to_eval_context())
        .map_err(|e| TriggerError::WhenClause(e.to_string()))?;
    Ok(super::expression::is_truthy(&result))
}

/// Whether `trigger` fires for `event`: same type, every filter key equal,
/// and the `when` clause (if any) truthy.
pub fn trigger_matches(trigger: &TriggerDef, event: &TriggerEvent) -> Result<bool, TriggerError> {
    if trigger.trigger_type != event.trigger_type {
        return Ok(false);
    }
    let filter_ok = trigger
        .filter
        .iter()
        .all(|(key, expected)| lookup(&event.payload, key) == Some(expected));
    if !filter_ok {
        return Ok(false);
    }
    match &trigger.when {
        Some(expression) => evaluate_when(expression, event),
        None => Ok(true),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

//! Ad-hoc task types.
//!
//! A `TaskRun` is the reduced run shape for single units of agent work
//! spawned outside a registered workflow (e.g. an agent session delegating a
//! sub-task).

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::workflow::RunError;

/// Lifecycle status of a spawned task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Caller-supplied metadata for a spawn request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    /// Session that requested the spawn.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_session_id: Option<String>,
    /// Depth of the requesting session (0 for a top-level session).
    #[serde(default)]
    pub parent_depth: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

/// Execution record of a spawned task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRun {
    pub id: Uuid,
    pub scope: String,
    pub status: TaskStatus,
    pub input: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RunError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    /// Child session created by the agent executor, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_session_id: Option<String>,
    /// Nesting level relative to the originating session.
    pub depth: u8,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl TaskRun {
    pub fn new(scope: impl Into<String>, input: impl Into<String>, meta: &TaskMeta, depth: u8) -> Self {
        Self {
            id: Uuid::now_v7(),
            scope: scope.into(),
            status: TaskStatus::Pending,
            input: input.into(),
            output: None,
            error: None,
            duration_ms: None,
            session_id: None,
            label: meta.label.clone(),
            parent_session_id: meta.parent_session_id.clone(),
            depth,
            created_at: Utc::now(),
            finished_at: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::ErrorKind;

    #[test]
    fn test_task_status_terminal() {
        assert!(!TaskStatus::Pending.is_terminal());
        assert!(!TaskStatus::Running.is_terminal());
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(TaskStatus::Cancelled.is_terminal());
    }

    #[test]
    fn test_task_run_serde_skips_empty_fields() {
        let meta = TaskMeta {
            label: Some("summarize".to_string()),
            parent_session_id: Some("sess-1".to_string()),
            parent_depth: 1,
            model: None,
        };
        let mut task = TaskRun::new("notes", "summarize the inbox", &meta, 2);
        task.status = TaskStatus::Failed;
        task.error = Some(RunError::new(ErrorKind::Timeout, "no result within 50ms"));

        let json = serde_json::to_value(&task).unwrap();
        assert_eq!(json["status"], "failed");
        assert_eq!(json["depth"], 2);
        assert_eq!(json["label"], "summarize");
        assert_eq!(json["error"]["kind"], "timeout");
        assert!(json.get("output").is_none());

        let back: TaskRun = serde_json::from_value(json).unwrap();
        assert_eq!(back, task);
    }
}

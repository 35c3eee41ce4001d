//! Event types for the Prizm engine event bus.
//!
//! `EngineEvent` is the unified audit event broadcast while runs and tasks
//! execute. All variants are Clone + Send + Sync for use with tokio broadcast
//! channels.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Events emitted during workflow and task execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    // -- Workflow runs --
    RunStarted {
        run_id: Uuid,
        workflow_name: String,
        scope: String,
        trigger_type: String,
    },

    StepStarted {
        run_id: Uuid,
        step_id: String,
        step_type: String,
        attempt: u32,
    },

    StepCompleted {
        run_id: Uuid,
        step_id: String,
        duration_ms: u64,
    },

    /// Condition evaluated falsy.
    StepSkipped { run_id: Uuid, step_id: String },

    StepFailed {
        run_id: Uuid,
        step_id: String,
        error: String,
        will_retry: bool,
    },

    /// Suspended at an approve step.
    RunPaused {
        run_id: Uuid,
        step_id: String,
        prompt: String,
    },

    RunResumed { run_id: Uuid, approved: bool },

    RunCompleted {
        run_id: Uuid,
        workflow_name: String,
        steps_completed: u32,
    },

    RunFailed {
        run_id: Uuid,
        workflow_name: String,
        error: String,
    },

    RunCancelled { run_id: Uuid, reason: String },

    /// A linked action failed. The step still counts as successful.
    LinkedActionFailed {
        run_id: Uuid,
        step_id: String,
        action: String,
        error: String,
    },

    // -- Spawned tasks --
    TaskSpawned {
        task_id: Uuid,
        scope: String,
        depth: u8,
        parent_session_id: Option<String>,
    },

    TaskCompleted { task_id: Uuid, duration_ms: u64 },

    TaskFailed { task_id: Uuid, error: String },

    TaskCancelled { task_id: Uuid },

    /// A spawn request was refused by the depth bound.
    DepthLimitReached {
        scope: String,
        attempted_depth: u8,
        max_depth: u8,
    },
}

impl EngineEvent {
    /// Stable event name, matching the serde tag.
    pub fn name(&self) -> &'static str {
        match self {
            EngineEvent::RunStarted { .. } => "run_started",
            EngineEvent::StepStarted { .. } => "step_started",
            EngineEvent::StepCompleted { .. } => "step_completed",
            EngineEvent::StepSkipped { .. } => "step_skipped",
            EngineEvent::StepFailed { .. } => "step_failed",
            EngineEvent::RunPaused { .. } => "run_paused",
            EngineEvent::RunResumed { .. } => "run_resumed",
            EngineEvent::RunCompleted { .. } => "run_completed",
            EngineEvent::RunFailed { .. } => "run_failed",
            EngineEvent::RunCancelled { .. } => "run_cancelled",
            EngineEvent::LinkedActionFailed { .. } => "linked_action_failed",
            EngineEvent::TaskSpawned { .. } => "task_spawned",
            EngineEvent::TaskCompleted { .. } => "task_completed",
            EngineEvent::TaskFailed { .. } => "task_failed",
            EngineEvent::TaskCancelled { .. } => "task_cancelled",
            EngineEvent::DepthLimitReached { .. } => "depth_limit_reached",
        }
    }

    /// Run id for workflow-scoped variants.
    pub fn run_id(&self) -> Option<Uuid> {
        match self {
            EngineEvent::RunStarted { run_id, .. }
            | EngineEvent::StepStarted { run_id, .. }
            | EngineEvent::StepCompleted { run_id, .. }
            | EngineEvent::StepSkipped { run_id, .. }
            | EngineEvent::StepFailed { run_id, .. }
            | EngineEvent::RunPaused { run_id, .. }
            | EngineEvent::RunResumed { run_id, .. }
            | EngineEvent::RunCompleted { run_id, .. }
            | EngineEvent::RunFailed { run_id, .. }
            | EngineEvent::RunCancelled { run_id, .. }
            | EngineEvent::LinkedActionFailed { run_id, .. } => Some(*run_id),
            EngineEvent::TaskSpawned { .. }
            | EngineEvent::TaskCompleted { .. }
            | EngineEvent::TaskFailed { .. }
            | EngineEvent::TaskCancelled { .. }
            | EngineEvent::DepthLimitReached { .. } => None,
        }
    }
}

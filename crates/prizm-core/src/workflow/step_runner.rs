//! Step execution for the three step types.
//!
//! `StepRunner` dispatches on the compiled step body in a single `match`:
//! - **agent**: render the prompt and hand it to the [`AgentExecutor`]
//! - **approve**: render the prompt and ask the runner to suspend
//! - **transform**: evaluate the expression over prior outputs
//!
//! Timeouts, retries, and cancellation are the runner's job; this module
//! only turns one attempt into an outcome or a [`StepError`].

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use prizm_types::workflow::{FailureKind, SessionConfig, StepKind};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::context::RunContext;
use super::definition::{CompiledBody, CompiledStep};
use super::expression;

// ---------------------------------------------------------------------------
// StepError
// ---------------------------------------------------------------------------

/// A failed step attempt, classified for `retry_on` matching.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct StepError {
    pub kind: FailureKind,
    pub message: String,
}

impl StepError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Failed,
            message: message.into(),
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Timeout,
            message: message.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Agent executor contract
// ---------------------------------------------------------------------------

/// Identity and cancellation signal handed to every step execution.
#[derive(Debug, Clone)]
pub struct StepContext {
    pub scope: String,
    /// Agent session the step runs in, if any.
    pub session_id: Option<String>,
    /// Owning run; `None` for ad-hoc tasks.
    pub run_id: Option<Uuid>,
    pub step_id: String,
    pub cancel: CancellationToken,
}

/// Everything an agent needs for one step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentInvocation {
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_config: Option<SessionConfig>,
}

/// What an agent returns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentOutput {
    pub output: Value,
    /// Session the agent ran in, reported back for task records.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

/// The LLM/tool loop behind an `agent` step.
///
/// Object-safe with boxed futures so the runner can hold it as
/// `Arc<dyn AgentExecutor>`. Implementations should watch `ctx.cancel` and
/// stop early when it fires.
pub trait AgentExecutor: Send + Sync {
    fn execute<'a>(
        &'a self,
        invocation: AgentInvocation,
        ctx: &'a StepContext,
    ) -> Pin<Box<dyn Future<Output = Result<AgentOutput, StepError>> + Send + 'a>>;
}

/// Executor used when no agent backend is configured: every call fails.
#[derive(Debug, Default)]
pub struct UnconfiguredAgentExecutor;

impl AgentExecutor for UnconfiguredAgentExecutor {
    fn execute<'a>(
        &'a self,
        _invocation: AgentInvocation,
        _ctx: &'a StepContext,
    ) -> Pin<Box<dyn Future<Output = Result<AgentOutput, StepError>> + Send + 'a>> {
        Box::pin(async { Err(StepError::failed("no agent executor configured")) })
    }
}

// ---------------------------------------------------------------------------
// StepRunner
// ---------------------------------------------------------------------------

/// Result of a successful step attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    Completed(Value),
    /// An approve step: the run must pause with this prompt.
    Suspend { prompt: String },
}

/// Executes individual workflow steps by dispatching on the step type.
#[derive(Clone)]
pub struct StepRunner {
    agent: Arc<dyn AgentExecutor>,
}

impl StepRunner {
    pub fn new(agent: Arc<dyn AgentExecutor>) -> Self {
        Self { agent }
    }

    /// Run one attempt of a step.
    ///
    /// For transform steps with an `input`, `$prev` is bound to the resolved
    /// input while evaluating the transform.
    pub async fn run(
        &self,
        kind: &StepKind,
        compiled: &CompiledStep,
        ctx: &RunContext,
        step_ctx: &StepContext,
    ) -> Result<StepOutcome, StepError> {
        let scope = ctx.scope();
        let input = compiled
            .input
            .as_ref()
            .map(|payload| expression::evaluate_payload(payload, &scope))
            .transpose()
            .map_err(|e| StepError::failed(format!("input: {e}")))?;

        match (&compiled.body, kind) {
            (
                CompiledBody::Agent { prompt },
                StepKind::Agent {
                    model,
                    session_config,
                    ..
                },
            ) => {
                let prompt = expression::render(prompt, &scope)
                    .map_err(|e| StepError::failed(format!("prompt: {e}")))?;
                let invocation = AgentInvocation {
                    prompt,
                    input,
                    model: model.clone(),
                    session_config: session_config.clone(),
                };
                let output = self.invoke_agent(invocation, step_ctx).await?;
                Ok(StepOutcome::Completed(output.output))
            }
            (CompiledBody::Approve { prompt }, _) => {
                let prompt = expression::render(prompt, &scope)
                    .map_err(|e| StepError::failed(format!("approve_prompt: {e}")))?;
                Ok(StepOutcome::Suspend { prompt })
            }
            (CompiledBody::Transform { expr }, _) => {
                let value = match &input {
                    Some(bound) => expression::evaluate(expr, &ctx.scope_with_prev(bound)),
                    None => expression::evaluate(expr, &scope),
                }
                .map_err(|e| StepError::failed(format!("transform: {e}")))?;
                Ok(StepOutcome::Completed(value))
            }
            (CompiledBody::Agent { .. }, _) => Err(StepError::failed(format!(
                "step '{}' compiled as agent but declared as {}",
                compiled.id,
                kind.type_name()
            ))),
        }
    }

    /// Hand one invocation to the agent executor.
    ///
    /// Shared by agent steps and ad-hoc tasks.
    pub async fn invoke_agent(
        &self,
        invocation: AgentInvocation,
        ctx: &StepContext,
    ) -> Result<AgentOutput, StepError> {
        tracing::debug!(
            scope = %ctx.scope,
            step_id = %ctx.step_id,
            model = invocation.model.as_deref().unwrap_or("default"),
            "invoking agent"
        );
        self.agent.execute(invocation, ctx).await
    }
}

impl std::fmt::Debug for StepRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepRunner").finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

//! HttpAgentExecutor -- [`AgentExecutor`] that posts agent steps to an HTTP
//! endpoint.
//!
//! Request body: the [`AgentInvocation`] fields plus `scope`, `session_id`,
//! `run_id`, and `step_id`. The endpoint answers with
//! `{"output": <any>, "session_id": "..."}`; a bare JSON value without an
//! `output` key is taken as the output itself.
//!
//! The bearer token is held as a [`SecretString`] and only exposed when the
//! request header is built.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use prizm_core::workflow::step_runner::{
    AgentExecutor, AgentInvocation, AgentOutput, StepContext, StepError,
};
use prizm_types::config::AgentEndpointConfig;
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum AgentClientError {
    #[error("no agent endpoint configured")]
    NoEndpoint,

    #[error("failed to build HTTP client: {0}")]
    Client(#[from] reqwest::Error),
}

#[derive(Serialize)]
struct AgentRequest<'a> {
    #[serde(flatten)]
    invocation: &'a AgentInvocation,
    scope: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    session_id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    run_id: Option<Uuid>,
    step_id: &'a str,
}

pub struct HttpAgentExecutor {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<SecretString>,
}

impl HttpAgentExecutor {
    pub fn new(
        endpoint: impl Into<String>,
        api_key: Option<SecretString>,
        timeout: Duration,
    ) -> Result<Self, AgentClientError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            api_key,
        })
    }

    /// Build from config; the token is read from `api_key_env` if set.
    pub fn from_config(config: &AgentEndpointConfig) -> Result<Self, AgentClientError> {
        let endpoint = config.endpoint.clone().ok_or(AgentClientError::NoEndpoint)?;
        let api_key = std::env::var(&config.api_key_env)
            .ok()
            .filter(|k| !k.is_empty())
            .map(SecretString::from);
        Self::new(
            endpoint,
            api_key,
            Duration::from_secs(config.request_timeout_secs),
        )
    }

    async fn post(
        &self,
        invocation: &AgentInvocation,
        ctx: &StepContext,
    ) -> Result<AgentOutput, StepError> {
        let body = AgentRequest {
            invocation,
            scope: &ctx.scope,
            session_id: ctx.session_id.as_deref(),
            run_id: ctx.run_id,
            step_id: &ctx.step_id,
        };

        let mut request = self.client.post(&self.endpoint).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key.expose_secret());
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                StepError::timeout(format!("agent request timed out: {e}"))
            } else {
                StepError::failed(format!("agent request failed: {e}"))
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let error_body = response.text().await.unwrap_or_default();
            return Err(StepError::failed(format!("agent HTTP {status}: {error_body}")));
        }

        let payload: Value = response
            .json()
            .await
            .map_err(|e| StepError::failed(format!("agent returned invalid JSON: {e}")))?;
        Ok(into_agent_output(payload))
    }
}

fn into_agent_output(payload: Value) -> AgentOutput {
    match payload {
        Value::Object(mut map) if map.contains_key("output") => {
            let session_id = map
                .remove("session_id")
                .and_then(|v| v.as_str().map(str::to_string));
            AgentOutput {
                output: map.remove("output").unwrap_or(Value::Null),
                session_id,
            }
        }
        other => AgentOutput {
            output: other,
            session_id: None,
        },
    }
}

impl AgentExecutor for HttpAgentExecutor {
    fn execute<'a>(
        &'a self,
        invocation: AgentInvocation,
        ctx: &'a StepContext,
    ) -> Pin<Box<dyn Future<Output = Result<AgentOutput, StepError>> + Send + 'a>> {
        Box::pin(async move {
            tracing::debug!(
                scope = %ctx.scope,
                step_id = %ctx.step_id,
                endpoint = %self.endpoint,
                "posting agent step"
            );
            tokio::select! {
                biased;
                _ = ctx.cancel.cancelled() => Err(StepError::failed("cancelled")),
                result = self.post(&invocation, ctx) => result,
            }
        })
    }
}

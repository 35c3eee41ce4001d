//! Engine configuration types.
//!
//! `EngineConfig` represents the `config.toml` in the Prizm data directory.
//! All fields have defaults, so an empty file is a valid config.

use serde::{Deserialize, Serialize};

/// Top-level engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Hard cap on spawned-task nesting.
    #[serde(default = "default_max_task_depth")]
    pub max_task_depth: u8,

    /// Concurrent runs (and, separately, tasks) allowed per scope.
    #[serde(default = "default_max_concurrent_per_scope")]
    pub max_concurrent_per_scope: usize,

    /// Wait budget for `trigger_sync` when the caller gives none.
    #[serde(default = "default_task_timeout_ms")]
    pub default_task_timeout_ms: u64,

    /// Upper bound on `limit` for list operations.
    #[serde(default = "default_list_limit_max")]
    pub list_limit_max: u32,

    /// Capacity of the broadcast event bus.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,

    /// Finished tasks kept in memory for status queries. The oldest are
    /// dropped once more than this many have finished.
    #[serde(default = "default_retain_finished_tasks")]
    pub retain_finished_tasks: usize,

    #[serde(default)]
    pub agent: AgentEndpointConfig,
}

fn default_max_task_depth() -> u8 {
    3
}

fn default_max_concurrent_per_scope() -> usize {
    8
}

fn default_task_timeout_ms() -> u64 {
    300_000
}

fn default_list_limit_max() -> u32 {
    100
}

fn default_event_capacity() -> usize {
    1024
}

fn default_retain_finished_tasks() -> usize {
    1000
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_task_depth: default_max_task_depth(),
            max_concurrent_per_scope: default_max_concurrent_per_scope(),
            default_task_timeout_ms: default_task_timeout_ms(),
            list_limit_max: default_list_limit_max(),
            event_capacity: default_event_capacity(),
            retain_finished_tasks: default_retain_finished_tasks(),
            agent: AgentEndpointConfig::default(),
        }
    }
}

/// Where agent steps are sent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentEndpointConfig {
    /// Full URL of the agent run endpoint. Agent steps fail when unset.
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Environment variable holding the bearer token.
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_api_key_env() -> String {
    "PRIZM_API_KEY".to_string()
}

fn default_request_timeout_secs() -> u64 {
    120
}

impl Default for AgentEndpointConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            api_key_env: default_api_key_env(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

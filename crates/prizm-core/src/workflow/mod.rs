//! Workflow engine: definition parsing, sequential execution, and resumable
//! approval gates.
//!
//! - `definition` -- YAML parsing, validation, compilation, args schema
//! - `expression` -- reference expressions and prompt templates
//! - `context` -- per-step evaluation scope built from the run record
//! - `step_runner` -- agent / approve / transform dispatch
//! - `retry` -- retry decisions and backoff
//! - `actions` -- linked actions fired after a step succeeds
//! - `resume` -- durable run snapshots and resume-token lookup
//! - `registry` -- named definitions per scope
//! - `trigger` -- schedule validation and event matching
//! - `runner` -- the run state machine
//! - `tools` -- JSON tool-call surface for agents

pub mod actions;
pub mod context;
pub mod definition;
pub mod expression;
pub mod registry;
pub mod resume;
pub mod retry;
pub mod runner;
pub mod step_runner;
pub mod tools;
pub mod trigger;

pub use registry::WorkflowRegistry;
pub use runner::{RunnerError, StartOptions, WorkflowRunner};
pub use tools::{ToolRequest, WorkflowTools};

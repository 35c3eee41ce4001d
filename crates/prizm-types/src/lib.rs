//! Shared domain types for the Prizm workflow engine.
//!
//! Workflow definitions, run and task records, the editor flow graph, engine
//! events, configuration, and repository errors.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror.

pub mod config;
pub mod error;
pub mod event;
pub mod flow;
pub mod task;
pub mod workflow;

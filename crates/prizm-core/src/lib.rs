//! Engine logic and repository trait definitions for Prizm.
//!
//! This crate defines the "ports" (repository traits, agent executor, event
//! sink, lock manager) that the infrastructure layer implements. It depends
//! only on `prizm-types` -- never on `prizm-infra` or any database/IO crate.

pub mod event;
pub mod flow;
pub mod lock;
pub mod repository;
pub mod task;
pub mod workflow;

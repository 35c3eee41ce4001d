//! Infrastructure implementations for Prizm.
//!
//! Concrete implementations of the repository traits and collaborator
//! contracts defined in `prizm-core`: SQLite persistence, the HTTP agent
//! executor, and configuration loading.

pub mod agent;
pub mod config;
pub mod sqlite;

//! Ad-hoc agent tasks spawned outside registered workflows.

pub mod runner;

pub use runner::{TaskError, TaskRunner};

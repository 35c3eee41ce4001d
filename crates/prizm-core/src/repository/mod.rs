//! Repository trait definitions (ports).
//!
//! These traits define the storage interface that the infrastructure layer
//! (prizm-infra) implements. The core crate never depends on any specific
//! storage technology; [`memory`] holds in-process implementations used by
//! tests and ephemeral engines.

pub mod definition;
pub mod memory;
pub mod run;

pub use definition::DefinitionRepository;
pub use memory::{InMemoryDefinitionRepository, InMemoryRunRepository};
pub use run::RunRepository;

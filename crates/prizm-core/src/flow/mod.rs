//! Editor graph support: convert definitions to node/edge graphs and back,
//! and check that a graph is exportable.

pub mod convert;
pub mod layout;
pub mod validate;

pub use convert::{def_to_flow, export_flow_yaml, flow_document, flow_meta, flow_to_def, FlowError};
pub use validate::{validate_flow_for_export, FlowValidationError};

//! Visual-editor graph representation of a workflow.
//!
//! Step nodes carry the full `StepDef`; the synthetic input/output nodes only
//! exist for display and are ignored on export.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::workflow::{ArgDef, OutputDef, RunConfig, StepDef, TriggerDef};

/// Id of the synthetic node representing workflow args.
pub const INPUT_NODE_ID: &str = "__input__";

/// Id of the synthetic node representing workflow outputs.
pub const OUTPUT_NODE_ID: &str = "__output__";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowNodeKind {
    Step,
    Input,
    Output,
}

/// Canvas coordinates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowNode {
    pub id: String,
    pub kind: FlowNodeKind,
    pub position: Position,
    pub label: String,
    /// Present on step nodes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<StepDef>,
}

impl FlowNode {
    pub fn is_step(&self) -> bool {
        self.kind == FlowNodeKind::Step
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowEdge {
    pub id: String,
    pub source: String,
    pub target: String,
}

impl FlowEdge {
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        let source = source.into();
        let target = target.into();
        Self {
            id: format!("{source}->{target}"),
            source,
            target,
        }
    }
}

/// Nodes and edges as exchanged with the editor.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FlowGraph {
    pub nodes: Vec<FlowNode>,
    pub edges: Vec<FlowEdge>,
}

/// Definition-level fields that have no node representation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FlowMeta {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub args: BTreeMap<String, ArgDef>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub outputs: BTreeMap<String, OutputDef>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub triggers: Vec<TriggerDef>,
    #[serde(default)]
    pub config: RunConfig,
}

/// Serialized editor document: graph plus meta.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FlowDocument {
    pub meta: FlowMeta,
    #[serde(flatten)]
    pub graph: FlowGraph,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flow_edge_id_from_endpoints() {
        let edge = FlowEdge::new("fetch", "format");
        assert_eq!(edge.id, "fetch->format");
        assert_eq!(edge.source, "fetch");
        assert_eq!(edge.target, "format");
    }

    #[test]
    fn test_flow_document_json_shape() {
        let doc = FlowDocument {
            meta: FlowMeta {
                name: "digest".to_string(),
                ..Default::default()
            },
            graph: FlowGraph {
                nodes: vec![FlowNode {
                    id: INPUT_NODE_ID.to_string(),
                    kind: FlowNodeKind::Input,
                    position: Position { x: 0.0, y: 0.0 },
                    label: "Input".to_string(),
                    step: None,
                }],
                edges: vec![],
            },
        };
        let json = serde_json::to_value(&doc).unwrap();
        assert_eq!(json["meta"]["name"], "digest");
        assert_eq!(json["nodes"][0]["kind"], "input");
        assert!(json["edges"].as_array().unwrap().is_empty());
    }
}

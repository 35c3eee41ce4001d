//! Serial-chain check for exporting an editor graph.
//!
//! Only strict chains export: one head, one tail, every other step node with
//! exactly one edge in and one edge out. Synthetic input/output nodes and
//! any edge touching them are ignored.

use std::collections::{HashMap, HashSet};

use petgraph::algo::{connected_components, toposort};
use petgraph::graph::{DiGraph, NodeIndex};
use prizm_types::flow::{FlowEdge, FlowNode, INPUT_NODE_ID, OUTPUT_NODE_ID};

/// Why a graph cannot be exported. Checked in declaration order; the first
/// violation found is reported.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FlowValidationError {
    #[error("the workflow has no steps; add at least one step")]
    Empty,

    #[error("more than one step is named '{id}'; step names must be unique")]
    DuplicateNode { id: String },

    #[error("edge '{edge_id}' points at '{missing}', which is not a node in the graph")]
    DanglingEdge { edge_id: String, missing: String },

    #[error("steps '{from}' and '{to}' are connected more than once; remove the duplicate edge")]
    DuplicateEdge { from: String, to: String },

    #[error("step '{node}' is connected to itself; remove that edge")]
    SelfLoop { node: String },

    #[error("the steps form a loop through '{node}'; workflows must run start to finish")]
    Cycle { node: String },

    #[error("the graph has {components} separate pieces; connect them into one chain")]
    Disconnected { components: usize },

    #[error("step '{node}' branches to {targets:?}; each step may lead to only one next step")]
    Branch { node: String, targets: Vec<String> },

    #[error("steps {sources:?} all lead into '{node}'; each step may follow only one step")]
    Merge { node: String, sources: Vec<String> },

    #[error("steps {heads:?} have nothing before them; only one step may start the chain")]
    MultipleHeads { heads: Vec<String> },

    #[error("steps {tails:?} have nothing after them; only one step may end the chain")]
    MultipleTails { tails: Vec<String> },
}

pub(crate) fn is_synthetic(id: &str) -> bool {
    id == INPUT_NODE_ID || id == OUTPUT_NODE_ID
}

/// Step nodes and step-to-step edges, with endpoints checked.
pub(crate) struct StepGraph<'a> {
    pub graph: DiGraph<&'a str, ()>,
    pub index: HashMap<&'a str, NodeIndex>,
    pub edges: Vec<(&'a str, &'a str, &'a str)>,
}

impl<'a> StepGraph<'a> {
    /// Build from editor nodes/edges. Fails on two step nodes sharing an id
    /// and on an edge naming a node that does not exist.
    pub fn build(nodes: &'a [FlowNode], edges: &'a [FlowEdge]) -> Result<Self, FlowValidationError> {
        let synthetic: HashSet<&str> = nodes
            .iter()
            .filter(|n| !n.is_step())
            .map(|n| n.id.as_str())
            .collect();

        let mut graph = DiGraph::new();
        let mut index = HashMap::new();
        for node in nodes.iter().filter(|n| n.is_step()) {
            let id = node.id.as_str();
            if index.contains_key(id) {
                return Err(FlowValidationError::DuplicateNode { id: id.to_string() });
            }
            index.insert(id, graph.add_node(id));
        }

        let mut step_edges = Vec::new();
        for edge in edges {
            let touches_synthetic = [edge.source.as_str(), edge.target.as_str()]
                .iter()
                .any(|id| is_synthetic(id) || synthetic.contains(id));
            if touches_synthetic {
                continue;
            }
            for endpoint in [&edge.source, &edge.target] {
                if !index.contains_key(endpoint.as_str()) {
                    return Err(FlowValidationError::DanglingEdge {
                        edge_id: edge.id.clone(),
                        missing: endpoint.clone(),
                    });
                }
            }
            step_edges.push((edge.id.as_str(), edge.source.as_str(), edge.target.as_str()));
        }

        Ok(Self {
            graph,
            index,
            edges: step_edges,
        })
    }

    fn add_edges(&mut self) {
        for (_, source, target) in &self.edges {
            self.graph.add_edge(self.index[source], self.index[target], ());
        }
    }
}

/// Check that `nodes`/`edges` form a strict serial chain.
pub fn validate_flow_for_export(
    nodes: &[FlowNode],
    edges: &[FlowEdge],
) -> Result<(), FlowValidationError> {
    let mut steps = StepGraph::build(nodes, edges)?;
    if steps.index.is_empty() {
        return Err(FlowValidationError::Empty);
    }

    let mut seen = HashSet::new();
    for (_, source, target) in &steps.edges {
        if !seen.insert((*source, *target)) {
            return Err(FlowValidationError::DuplicateEdge {
                from: source.to_string(),
                to: target.to_string(),
            });
        }
    }
    if let Some((_, node, _)) = steps.edges.iter().find(|(_, s, t)| s == t) {
        return Err(FlowValidationError::SelfLoop {
            node: node.to_string(),
        });
    }

    steps.add_edges();
    let graph = &steps.graph;
    if let Err(cycle) = toposort(graph, None) {
        return Err(FlowValidationError::Cycle {
            node: graph[cycle.node_id()].to_string(),
        });
    }

    let components = connected_components(graph);
    if components > 1 {
        return Err(FlowValidationError::Disconnected { components });
    }

    let mut outgoing: HashMap<&str, Vec<String>> = HashMap::new();
    let mut incoming: HashMap<&str, Vec<String>> = HashMap::new();
    for (_, source, target) in &steps.edges {
        outgoing.entry(*source).or_default().push(target.to_string());
        incoming.entry(*target).or_default().push(source.to_string());
    }
    let mut ids: Vec<&str> = steps.index.keys().copied().collect();
    ids.sort_unstable();

    for id in &ids {
        if let Some(targets) = outgoing.get(id).filter(|t| t.len() > 1) {
            let mut targets = targets.clone();
            targets.sort();
            return Err(FlowValidationError::Branch {
                node: id.to_string(),
                targets,
            });
        }
    }
    for id in &ids {
        if let Some(sources) = incoming.get(id).filter(|s| s.len() > 1) {
            let mut sources = sources.clone();
            sources.sort();
            return Err(FlowValidationError::Merge {
                node: id.to_string(),
                sources,
            });
        }
    }

    let heads: Vec<String> = ids
        .iter()
        .filter(|id| !incoming.contains_key(*id))
        .map(|id| id.to_string())
        .collect();
    if heads.len() > 1 {
        return Err(FlowValidationError::MultipleHeads { heads });
    }
    let tails: Vec<String> = ids
        .iter()
        .filter(|id| !outgoing.contains_key(*id))
        .map(|id| id.to_string())
        .collect();
    if tails.len() > 1 {
        return Err(FlowValidationError::MultipleTails { tails });
    }
    Ok(())
}

//! Conversion between workflow definitions and editor graphs.

use std::collections::{BTreeSet, HashMap};

use prizm_types::flow::{
    FlowDocument, FlowEdge, FlowGraph, FlowMeta, FlowNode, FlowNodeKind, Position, INPUT_NODE_ID,
    OUTPUT_NODE_ID,
};
use prizm_types::workflow::WorkflowDef;

use super::layout::{layered_layout, RANK_SPACING_Y};
use super::validate::{validate_flow_for_export, FlowValidationError, StepGraph};
use crate::workflow::definition::{compile_step, serialize_workflow_yaml, validate_definition, ParseError};
use crate::workflow::expression::RefRoot;

#[derive(Debug, thiserror::Error)]
pub enum FlowError {
    #[error(transparent)]
    Invalid(#[from] FlowValidationError),

    #[error("steps form a cycle through '{0}'")]
    Cycle(String),

    #[error("node '{0}' has no step definition")]
    MissingStep(String),

    #[error("exported definition is invalid: {0}")]
    Definition(#[from] ParseError),
}

// ---------------------------------------------------------------------------
// Definition -> graph
// ---------------------------------------------------------------------------

/// Step-to-step edges implied by a definition, in step order.
///
/// A step gets an edge from every earlier step it references (`$prev`
/// means the step right before it). A step with no step reference is
/// linked to its predecessor.
fn step_edges(def: &WorkflowDef) -> (Vec<(&str, &str)>, BTreeSet<usize>) {
    let ids: Vec<&str> = def.steps.iter().map(|s| s.id.as_str()).collect();
    let position_of: HashMap<&str, usize> = ids.iter().enumerate().map(|(i, id)| (*id, i)).collect();

    let mut edges: Vec<(&str, &str)> = Vec::new();
    let mut arg_consumers = BTreeSet::new();
    for (index, step) in def.steps.iter().enumerate() {
        let mut sources: Vec<usize> = Vec::new();
        // Steps that fail to compile still get their sequential link.
        if let Ok(compiled) = compile_step(step) {
            for reference in compiled.data_references() {
                match &reference.root {
                    RefRoot::Args => {
                        arg_consumers.insert(index);
                    }
                    RefRoot::Prev => {
                        if let Some(previous) = index.checked_sub(1) {
                            sources.push(previous);
                        }
                    }
                    RefRoot::Step(target) => {
                        if let Some(&source) = position_of.get(target.as_str()) {
                            if source < index {
                                sources.push(source);
                            }
                        }
                    }
                }
            }
        }
        if sources.is_empty() {
            if let Some(previous) = index.checked_sub(1) {
                sources.push(previous);
            }
        }
        for source in sources {
            let edge = (ids[source], ids[index]);
            if !edges.contains(&edge) {
                edges.push(edge);
            }
        }
    }
    (edges, arg_consumers)
}

/// Build the editor graph for a definition.
///
/// Node ids equal step ids. `__input__` exists when the definition has
/// args and feeds every step reading `$args` (or the first step when none
/// does); `__output__` exists when it declares outputs and follows the last
/// step.
pub fn def_to_flow(def: &WorkflowDef) -> FlowGraph {
    let ids: Vec<&str> = def.steps.iter().map(|s| s.id.as_str()).collect();
    let (edges, arg_consumers) = step_edges(def);
    let positions = layered_layout(&ids, &edges);

    let has_input = !def.args.is_empty();
    let has_output = !def.outputs.is_empty();
    let shift = if has_input { RANK_SPACING_Y } else { 0.0 };

    let mut nodes = Vec::with_capacity(def.steps.len() + 2);
    if has_input {
        nodes.push(FlowNode {
            id: INPUT_NODE_ID.to_string(),
            kind: FlowNodeKind::Input,
            position: Position { x: 0.0, y: 0.0 },
            label: "Input".to_string(),
            step: None,
        });
    }
    let mut lowest = 0.0f64;
    for step in &def.steps {
        let mut position = positions.get(&step.id).copied().unwrap_or_default();
        position.y += shift;
        lowest = lowest.max(position.y);
        nodes.push(FlowNode {
            id: step.id.clone(),
            kind: FlowNodeKind::Step,
            position,
            label: step.description.clone().unwrap_or_else(|| step.id.clone()),
            step: Some(step.clone()),
        });
    }
    if has_output {
        nodes.push(FlowNode {
            id: OUTPUT_NODE_ID.to_string(),
            kind: FlowNodeKind::Output,
            position: Position {
                x: 0.0,
                y: lowest + RANK_SPACING_Y,
            },
            label: "Output".to_string(),
            step: None,
        });
    }

    let mut flow_edges = Vec::new();
    if has_input && !ids.is_empty() {
        if arg_consumers.is_empty() {
            flow_edges.push(FlowEdge::new(INPUT_NODE_ID, ids[0]));
        }
        for index in &arg_consumers {
            flow_edges.push(FlowEdge::new(INPUT_NODE_ID, ids[*index]));
        }
    }
    flow_edges.extend(edges.iter().map(|(s, t)| FlowEdge::new(*s, *t)));
    if let (true, Some(last)) = (has_output, ids.last()) {
        flow_edges.push(FlowEdge::new(*last, OUTPUT_NODE_ID));
    }

    FlowGraph {
        nodes,
        edges: flow_edges,
    }
}

/// Definition-level fields carried next to the graph.
pub fn flow_meta(def: &WorkflowDef) -> FlowMeta {
    FlowMeta {
        name: def.name.clone(),
        description: def.description.clone(),
        args: def.args.clone(),
        outputs: def.outputs.clone(),
        triggers: def.triggers.clone(),
        config: def.config.clone(),
    }
}

/// Graph and meta together, as saved by the editor.
pub fn flow_document(def: &WorkflowDef) -> FlowDocument {
    FlowDocument {
        meta: flow_meta(def),
        graph: def_to_flow(def),
    }
}

// ---------------------------------------------------------------------------
// Graph -> definition
// ---------------------------------------------------------------------------

/// Order step nodes topologically and rebuild the definition.
///
/// Kahn's algorithm over step nodes; among ready nodes the smallest id goes
/// first, then the smaller `y`. Input array order and edge order do not
/// affect the result.
pub fn flow_to_def(
    nodes: &[FlowNode],
    edges: &[FlowEdge],
    meta: &FlowMeta,
) -> Result<WorkflowDef, FlowError> {
    let graph = StepGraph::build(nodes, edges)?;

    // `build` has already rejected duplicate step ids.
    let by_id: HashMap<&str, &FlowNode> = nodes
        .iter()
        .filter(|n| n.is_step())
        .map(|n| (n.id.as_str(), n))
        .collect();

    let mut in_degree: HashMap<&str, usize> = by_id.keys().map(|id| (*id, 0)).collect();
    let mut successors: HashMap<&str, Vec<&str>> = HashMap::new();
    let mut unique = BTreeSet::new();
    for (_, source, target) in &graph.edges {
        if unique.insert((*source, *target)) {
            successors.entry(*source).or_default().push(*target);
            if let Some(degree) = in_degree.get_mut(*target) {
                *degree += 1;
            }
        }
    }

    let mut ready: Vec<&FlowNode> = by_id
        .iter()
        .filter(|(id, _)| in_degree.get(*id) == Some(&0))
        .map(|(_, node)| *node)
        .collect();
    let mut ordered: Vec<&FlowNode> = Vec::with_capacity(by_id.len());
    while !ready.is_empty() {
        let next = ready
            .iter()
            .enumerate()
            .min_by(|(_, a), (_, b)| {
                a.id.cmp(&b.id)
                    .then_with(|| a.position.y.total_cmp(&b.position.y))
            })
            .map(|(i, _)| i)
            .unwrap_or(0);
        let node = ready.swap_remove(next);
        ordered.push(node);
        for target in successors.get(node.id.as_str()).into_iter().flatten() {
            if let Some(degree) = in_degree.get_mut(target) {
                *degree -= 1;
                if *degree == 0 {
                    if let Some(found) = by_id.get(target) {
                        ready.push(*found);
                    }
                }
            }
        }
    }

    if ordered.len() < by_id.len() {
        let mut stuck: Vec<&str> = in_degree
            .iter()
            .filter(|(_, degree)| **degree > 0)
            .map(|(id, _)| *id)
            .collect();
        stuck.sort_unstable();
        let node = stuck.first().map(|id| id.to_string()).unwrap_or_default();
        return Err(FlowError::Cycle(node));
    }

    let steps = ordered
        .into_iter()
        .map(|node| {
            let mut step = node
                .step
                .clone()
                .ok_or_else(|| FlowError::MissingStep(node.id.clone()))?;
            step.id = node.id.clone();
            Ok(step)
        })
        .collect::<Result<Vec<_>, FlowError>>()?;

    Ok(WorkflowDef {
        name: meta.name.clone(),
        description: meta.description.clone(),
        args: meta.args.clone(),
        outputs: meta.outputs.clone(),
        steps,
        triggers: meta.triggers.clone(),
        config: meta.config.clone(),
    })
}

/// Validate a graph as a serial chain, convert it, check the resulting
/// definition, and serialize it to YAML.
pub fn export_flow_yaml(
    nodes: &[FlowNode],
    edges: &[FlowEdge],
    meta: &FlowMeta,
) -> Result<String, FlowError> {
    validate_flow_for_export(nodes, edges)?;
    let def = flow_to_def(nodes, edges, meta)?;
    validate_definition(&def)?;
    Ok(serialize_workflow_yaml(&def)?)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

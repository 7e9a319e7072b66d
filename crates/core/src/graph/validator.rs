//! Graph validation. Every graph — whether it comes from the visual
//! editor or the generation service — passes through [`validate`] before
//! it can be stored as active, scheduled, or executed. Validation is
//! pure: it never touches a step executor.

use crate::error::{GraphError, GraphWarning};
use crate::registry::StepRegistry;
use crate::types::{NodeId, WorkflowGraph};
use std::collections::{HashMap, HashSet, VecDeque};

/// A graph that passed every hard check. Warnings (e.g. unreachable
/// nodes) ride along without blocking activation.
#[derive(Debug, Clone)]
pub struct ValidatedGraph {
    pub graph: WorkflowGraph,
    pub warnings: Vec<GraphWarning>,
    pub digest: String,
}

/// Validate a candidate graph against the step registry.
///
/// Checks run in a fixed order: edge references, duplicate node ids,
/// cycles (three-color depth-first search, reporting the nodes on the
/// cycle), reachability from an entry node, and per-node required-input
/// coverage. All findings are collected; any hard error rejects the
/// graph as a whole.
pub fn validate(
    graph: &WorkflowGraph,
    registry: &StepRegistry,
) -> Result<ValidatedGraph, Vec<GraphError>> {
    let mut errors = Vec::new();

    let node_ids: HashSet<&NodeId> = graph.nodes.iter().map(|n| &n.id).collect();

    // (1) every edge references existing node ids
    for edge in &graph.edges {
        for end in [&edge.from, &edge.to] {
            if !node_ids.contains(end) {
                errors.push(GraphError::UnknownEdgeNode { node: end.clone() });
            }
        }
    }

    // (2) duplicate node ids
    let mut seen = HashSet::new();
    for node in &graph.nodes {
        if !seen.insert(&node.id) {
            errors.push(GraphError::DuplicateNode {
                node: node.id.clone(),
            });
        }
    }

    // Adjacency over well-formed edges only; dangling edges were already
    // reported above
    let mut successors: HashMap<&NodeId, Vec<&NodeId>> = HashMap::new();
    let mut in_degree: HashMap<&NodeId, usize> = graph.nodes.iter().map(|n| (&n.id, 0)).collect();
    for edge in &graph.edges {
        if node_ids.contains(&edge.from) && node_ids.contains(&edge.to) {
            successors.entry(&edge.from).or_default().push(&edge.to);
            *in_degree.entry(&edge.to).or_default() += 1;
        }
    }

    // (3) cycle detection, three-color DFS
    errors.extend(find_cycles(graph, &successors));

    // (4) reachability from entry nodes
    let entries: Vec<&NodeId> = graph
        .nodes
        .iter()
        .map(|n| &n.id)
        .filter(|id| in_degree.get(*id).copied().unwrap_or(0) == 0)
        .collect();

    let mut warnings = Vec::new();
    if entries.is_empty() {
        errors.push(GraphError::NoEntryNode);
    } else {
        let mut reached: HashSet<&NodeId> = HashSet::new();
        let mut queue: VecDeque<&NodeId> = entries.iter().copied().collect();
        while let Some(id) = queue.pop_front() {
            if !reached.insert(id) {
                continue;
            }
            for next in successors.get(id).into_iter().flatten() {
                queue.push_back(next);
            }
        }
        for node in &graph.nodes {
            if !reached.contains(&node.id) {
                warnings.push(GraphWarning::Unreachable {
                    node: node.id.clone(),
                });
            }
        }
    }

    // (5) required inputs, against the registry's declared contract
    for node in &graph.nodes {
        let Some(descriptor) = registry.get(&node.step_type) else {
            errors.push(GraphError::UnknownStepType {
                node: node.id.clone(),
                step_type: node.step_type.clone(),
            });
            continue;
        };

        let has_incoming = graph
            .edges
            .iter()
            .any(|e| e.to == node.id && node_ids.contains(&e.from));

        let mut required: Vec<&str> = Vec::new();
        for name in descriptor
            .required_inputs
            .iter()
            .map(|i| i.name.as_str())
            .chain(node.required_inputs.iter().map(String::as_str))
        {
            if !required.contains(&name) {
                required.push(name);
            }
        }

        for input in required {
            let configured = node
                .config
                .get(input)
                .map(|v| !v.is_null())
                .unwrap_or(false);
            // An incoming edge can supply the input through working data
            if !configured && !has_incoming {
                errors.push(GraphError::MissingRequiredInput {
                    node: node.id.clone(),
                    input: input.to_string(),
                });
            }
        }
    }

    if errors.is_empty() {
        Ok(ValidatedGraph {
            graph: graph.clone(),
            warnings,
            digest: graph.digest(),
        })
    } else {
        Err(errors)
    }
}

#[derive(Clone, Copy, PartialEq)]
enum Color {
    White,
    Gray,
    Black,
}

/// Depth-first search with a three-color mark. An edge into a gray node
/// is a back edge; the gray stack from that node onward is the cycle.
fn find_cycles(
    graph: &WorkflowGraph,
    successors: &HashMap<&NodeId, Vec<&NodeId>>,
) -> Vec<GraphError> {
    let mut colors: HashMap<&NodeId, Color> =
        graph.nodes.iter().map(|n| (&n.id, Color::White)).collect();
    let mut errors = Vec::new();

    for node in &graph.nodes {
        if colors.get(&node.id) == Some(&Color::White) {
            let mut path = Vec::new();
            visit(&node.id, successors, &mut colors, &mut path, &mut errors);
        }
    }

    errors
}

fn visit<'a>(
    node: &'a NodeId,
    successors: &HashMap<&NodeId, Vec<&'a NodeId>>,
    colors: &mut HashMap<&'a NodeId, Color>,
    path: &mut Vec<&'a NodeId>,
    errors: &mut Vec<GraphError>,
) {
    colors.insert(node, Color::Gray);
    path.push(node);

    for &next in successors.get(node).into_iter().flatten() {
        match colors.get(next).copied().unwrap_or(Color::White) {
            Color::White => visit(next, successors, colors, path, errors),
            Color::Gray => {
                let start = path.iter().position(|&n| n == next).unwrap_or(0);
                let mut nodes: Vec<NodeId> = path[start..].iter().map(|&n| n.clone()).collect();
                nodes.push(next.clone());
                errors.push(GraphError::Cycle { nodes });
            }
            Color::Black => {}
        }
    }

    path.pop();
    colors.insert(node, Color::Black);
}

use crate::types::{NodeId, WorkflowGraph};
use anyhow::{anyhow, Result};
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::HashMap;

/// Dependency DAG built from a validated workflow graph.
///
/// Node weights are node ids; ordering decisions always go back to the
/// graph document's insertion order, not petgraph iteration order.
pub struct GraphDag {
    graph: DiGraph<NodeId, ()>,
    indices: HashMap<NodeId, NodeIndex>,
}

impl GraphDag {
    /// Build the DAG. Callers are expected to have validated the graph;
    /// a dangling edge here is a programming error, not user input.
    pub fn from_graph(workflow: &WorkflowGraph) -> Result<Self> {
        let mut graph = DiGraph::new();
        let mut indices = HashMap::new();

        for node in &workflow.nodes {
            let idx = graph.add_node(node.id.clone());
            indices.insert(node.id.clone(), idx);
        }

        for edge in &workflow.edges {
            let from = indices
                .get(&edge.from)
                .ok_or_else(|| anyhow!("edge references unknown node {}", edge.from))?;
            let to = indices
                .get(&edge.to)
                .ok_or_else(|| anyhow!("edge references unknown node {}", edge.to))?;
            graph.add_edge(*from, *to, ());
        }

        Ok(Self { graph, indices })
    }

    /// Direct dependencies (upstream nodes) of a node
    pub fn dependencies(&self, node_id: &NodeId) -> Vec<NodeId> {
        self.neighbors(node_id, petgraph::Direction::Incoming)
    }

    /// Direct dependents (downstream nodes) of a node
    pub fn dependents(&self, node_id: &NodeId) -> Vec<NodeId> {
        self.neighbors(node_id, petgraph::Direction::Outgoing)
    }

    /// Nodes with in-degree zero; execution starts here
    pub fn entry_nodes(&self) -> Vec<NodeId> {
        self.graph
            .node_indices()
            .filter(|&n| {
                self.graph
                    .neighbors_directed(n, petgraph::Direction::Incoming)
                    .count()
                    == 0
            })
            .map(|n| self.graph[n].clone())
            .collect()
    }

    pub fn is_entry(&self, node_id: &NodeId) -> bool {
        self.indices
            .get(node_id)
            .map(|&idx| {
                self.graph
                    .neighbors_directed(idx, petgraph::Direction::Incoming)
                    .count()
                    == 0
            })
            .unwrap_or(false)
    }

    fn neighbors(&self, node_id: &NodeId, direction: petgraph::Direction) -> Vec<NodeId> {
        match self.indices.get(node_id) {
            Some(&idx) => self
                .graph
                .neighbors_directed(idx, direction)
                .map(|n| self.graph[n].clone())
                .collect(),
            None => Vec::new(),
        }
    }
}

use std::collections::HashMap;

use petgraph::Direction;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use thiserror::Error;

use crate::graph::analysis::find_cycle;
use crate::graph::node::{EdgeKind, Node};

/// Errors raised while assembling or validating a dependency graph.
///
/// All of these are configuration errors: they are reported before any node
/// executes.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    #[error("dependency cycle: {}", .0.join(" -> "))]
    Cycle(Vec<String>),
    #[error("duplicate node id '{0}'")]
    DuplicateNode(String),
    #[error("unknown node id '{0}'")]
    UnknownNode(String),
}

/// Tests and fixtures plus the "must complete before" edges between them.
///
/// Edges point from prerequisite to dependent. Node indices follow insertion
/// order, which is the discovery order used for tie-breaks.
#[derive(Debug, Default, Clone)]
pub struct DependencyGraph {
    pub graph: DiGraph<Node, EdgeKind>,
    by_id: HashMap<String, NodeIndex>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a node.
    ///
    /// # Errors
    ///
    /// Returns [`GraphError::DuplicateNode`] if the id is already present.
    pub fn add_node(&mut self, node: Node) -> Result<NodeIndex, GraphError> {
        if self.by_id.contains_key(&node.id) {
            return Err(GraphError::DuplicateNode(node.id));
        }
        let id = node.id.clone();
        let idx = self.graph.add_node(node);
        self.by_id.insert(id, idx);
        Ok(idx)
    }

    /// Add a `prereq -> dependent` edge. A repeated edge is merged; it gates if
    /// either declaration gated.
    pub fn add_edge(&mut self, prereq: NodeIndex, dependent: NodeIndex, gate: bool) {
        let kind = EdgeKind::from_gate(gate);
        if let Some(existing) = self.graph.find_edge(prereq, dependent) {
            if kind.is_gating() {
                self.graph[existing] = EdgeKind::Gating;
            }
            return;
        }
        self.graph.add_edge(prereq, dependent, kind);
    }

    /// Add an edge between two nodes named by id.
    ///
    /// # Errors
    ///
    /// Returns [`GraphError::UnknownNode`] if either id is missing.
    pub fn add_edge_by_id(
        &mut self,
        prereq: &str,
        dependent: &str,
        gate: bool,
    ) -> Result<(), GraphError> {
        let from = self.require(prereq)?;
        let to = self.require(dependent)?;
        self.add_edge(from, to, gate);
        Ok(())
    }

    /// Check that the prerequisite relation is acyclic.
    ///
    /// # Errors
    ///
    /// Returns [`GraphError::Cycle`] with the ids along one offending cycle.
    pub fn validate(&self) -> Result<(), GraphError> {
        match find_cycle(self) {
            Some(cycle) => Err(GraphError::Cycle(cycle)),
            None => Ok(()),
        }
    }

    pub fn index_of(&self, id: &str) -> Option<NodeIndex> {
        self.by_id.get(id).copied()
    }

    fn require(&self, id: &str) -> Result<NodeIndex, GraphError> {
        self.index_of(id).ok_or_else(|| GraphError::UnknownNode(id.to_owned()))
    }

    pub fn node(&self, idx: NodeIndex) -> &Node {
        &self.graph[idx]
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    /// All node indices in discovery order.
    pub fn indices(&self) -> impl Iterator<Item = NodeIndex> + '_ {
        self.graph.node_indices()
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> + '_ {
        self.graph.node_weights()
    }

    /// Prerequisites of `idx` with the kind of edge linking them.
    pub fn prerequisites(
        &self,
        idx: NodeIndex,
    ) -> impl Iterator<Item = (NodeIndex, EdgeKind)> + '_ {
        self.graph
            .edges_directed(idx, Direction::Incoming)
            .map(|e| (e.source(), *e.weight()))
    }

    /// Nodes waiting on `idx`. Informational only.
    pub fn dependents(&self, idx: NodeIndex) -> impl Iterator<Item = (NodeIndex, EdgeKind)> + '_ {
        self.graph
            .edges_directed(idx, Direction::Outgoing)
            .map(|e| (e.target(), *e.weight()))
    }

    pub fn prerequisite_count(&self, idx: NodeIndex) -> usize {
        self.graph.edges_directed(idx, Direction::Incoming).count()
    }
}

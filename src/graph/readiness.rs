use std::collections::BTreeSet;

use petgraph::graph::NodeIndex;

use crate::graph::analysis::root_nodes;
use crate::graph::dependency::DependencyGraph;
use crate::runner::status::Status;

/// Run-time readiness state layered over an immutable [`DependencyGraph`].
///
/// Tracks each node's status and how many prerequisites are still
/// outstanding. Resolving a node only touches its out-edges, so the cost of a
/// run is proportional to the number of edges, not to repeated rescans.
#[derive(Debug, Clone)]
pub struct ReadyTracker {
    status: Vec<Status>,
    outstanding: Vec<usize>,
    ready: BTreeSet<NodeIndex>,
    unresolved: usize,
}

impl ReadyTracker {
    /// Seed the tracker: every node pending, roots queued.
    pub fn new(dg: &DependencyGraph) -> Self {
        let outstanding: Vec<usize> = dg.indices().map(|idx| dg.prerequisite_count(idx)).collect();
        Self {
            status: vec![Status::Pending; dg.node_count()],
            outstanding,
            ready: root_nodes(dg).into_iter().collect(),
            unresolved: dg.node_count(),
        }
    }

    pub fn status(&self, idx: NodeIndex) -> Status {
        self.status[idx.index()]
    }

    /// Number of nodes not yet in a terminal state.
    pub fn unresolved(&self) -> usize {
        self.unresolved
    }

    pub fn has_ready(&self) -> bool {
        !self.ready.is_empty()
    }

    /// Lazily drain the ready queue in discovery order.
    pub fn ready_nodes(&mut self) -> impl Iterator<Item = NodeIndex> + '_ {
        std::iter::from_fn(move || self.ready.pop_first())
    }

    /// Take the next ready node, if any.
    pub fn next_ready(&mut self) -> Option<NodeIndex> {
        self.ready.pop_first()
    }

    /// Queue a node whose prerequisites are satisfied.
    pub fn enqueue(&mut self, idx: NodeIndex) {
        self.ready.insert(idx);
    }

    pub fn mark_running(&mut self, idx: NodeIndex) {
        self.status[idx.index()] = Status::Running;
    }

    /// Record a terminal status and return the dependents whose last
    /// outstanding prerequisite this was, in discovery order.
    ///
    /// Resolving an already-terminal node is a no-op.
    pub fn resolve(
        &mut self,
        dg: &DependencyGraph,
        idx: NodeIndex,
        status: Status,
    ) -> Vec<NodeIndex> {
        debug_assert!(status.is_terminal());
        if self.status[idx.index()].is_terminal() {
            return Vec::new();
        }
        self.status[idx.index()] = status;
        self.unresolved -= 1;

        let mut unblocked = Vec::new();
        for (dep, _) in dg.dependents(idx) {
            let count = &mut self.outstanding[dep.index()];
            *count = count.saturating_sub(1);
            if *count == 0 && !self.status[dep.index()].is_terminal() {
                unblocked.push(dep);
            }
        }
        unblocked.sort();
        unblocked
    }

    /// Ids of nodes that never reached a terminal state.
    pub fn stalled(&self, dg: &DependencyGraph) -> Vec<String> {
        dg.indices()
            .filter(|idx| !self.status[idx.index()].is_terminal())
            .map(|idx| dg.node(idx).id.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::node::{Node, body};

    fn chain() -> DependencyGraph {
        let mut g = DependencyGraph::new();
        for id in ["a", "b", "c", "d"] {
            g.add_node(Node::test(id, body(|_| Ok(())))).unwrap();
        }
        // a -> c, b -> c, c -> d
        g.add_edge_by_id("a", "c", true).unwrap();
        g.add_edge_by_id("b", "c", false).unwrap();
        g.add_edge_by_id("c", "d", true).unwrap();
        g
    }

    #[test]
    fn roots_are_ready_in_discovery_order() {
        let g = chain();
        let mut tracker = ReadyTracker::new(&g);
        let ready: Vec<usize> = tracker.ready_nodes().map(|i| i.index()).collect();
        assert_eq!(ready, vec![0, 1]);
        assert!(!tracker.has_ready());
    }

    #[test]
    fn dependent_unblocks_after_last_prerequisite() {
        let g = chain();
        let mut tracker = ReadyTracker::new(&g);
        let a = g.index_of("a").unwrap();
        let b = g.index_of("b").unwrap();
        let c = g.index_of("c").unwrap();
        assert!(tracker.resolve(&g, a, Status::Passed).is_empty());
        assert_eq!(tracker.resolve(&g, b, Status::Failed), vec![c]);
        assert_eq!(tracker.unresolved(), 2);
    }

    #[test]
    fn resolve_is_idempotent() {
        let g = chain();
        let mut tracker = ReadyTracker::new(&g);
        let a = g.index_of("a").unwrap();
        tracker.resolve(&g, a, Status::Passed);
        tracker.resolve(&g, a, Status::Failed);
        assert_eq!(tracker.status(a), Status::Passed);
        assert_eq!(tracker.unresolved(), 3);
    }

    #[test]
    fn stalled_lists_non_terminal_nodes() {
        let g = chain();
        let mut tracker = ReadyTracker::new(&g);
        let a = g.index_of("a").unwrap();
        tracker.mark_running(a);
        assert_eq!(tracker.status(a), Status::Running);
        assert_eq!(tracker.stalled(&g), vec!["a", "b", "c", "d"]);
    }

    #[test]
    fn enqueue_keeps_discovery_order() {
        let g = chain();
        let mut tracker = ReadyTracker::new(&g);
        tracker.ready_nodes().for_each(drop);
        tracker.enqueue(NodeIndex::new(3));
        tracker.enqueue(NodeIndex::new(2));
        assert_eq!(tracker.next_ready(), Some(NodeIndex::new(2)));
        assert_eq!(tracker.next_ready(), Some(NodeIndex::new(3)));
        assert_eq!(tracker.next_ready(), None);
    }
}

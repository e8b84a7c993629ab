use std::collections::HashSet;

use petgraph::Direction;
use petgraph::algo::toposort;
use petgraph::graph::NodeIndex;

use crate::graph::dependency::DependencyGraph;
use crate::graph::node::NodeKind;

/// Find a cycle in the graph, returning the node ids along it.
/// Returns `None` if the graph is acyclic.
///
/// Uses an explicit stack, so path length is bounded by memory rather than
/// by the thread's stack.
pub fn find_cycle(dg: &DependencyGraph) -> Option<Vec<String>> {
    toposort(&dg.graph, None).err()?;

    let mut visited = HashSet::new();
    for start in dg.indices() {
        if !visited.insert(start) {
            continue;
        }
        let mut path = vec![start];
        let mut on_path = HashSet::from([start]);
        let mut frames = vec![dg.graph.neighbors_directed(start, Direction::Outgoing)];

        while let Some(frame) = frames.last_mut() {
            match frame.next() {
                Some(next) if on_path.contains(&next) => {
                    let from = path.iter().position(|&n| n == next)?;
                    let cycle = path[from..].iter().map(|&idx| dg.graph[idx].id.clone());
                    return Some(cycle.collect());
                }
                Some(next) if visited.insert(next) => {
                    path.push(next);
                    on_path.insert(next);
                    frames.push(dg.graph.neighbors_directed(next, Direction::Outgoing));
                }
                Some(_) => {}
                None => {
                    frames.pop();
                    if let Some(done) = path.pop() {
                        on_path.remove(&done);
                    }
                }
            }
        }
    }

    None
}

/// Nodes with no prerequisites, in discovery order.
pub fn root_nodes(dg: &DependencyGraph) -> Vec<NodeIndex> {
    dg.indices()
        .filter(|&idx| dg.prerequisite_count(idx) == 0)
        .collect()
}

/// Extend an initial skip set with fixtures that no longer have work to do.
///
/// A setUp is pruned when every gating dependent is skipped; a tearDown is
/// pruned when every prerequisite is skipped. Fixtures with no such
/// neighbours are never pruned. Iterates to a fixed point so that outer
/// fixtures follow inner ones.
pub fn prune_fixtures(dg: &DependencyGraph, skipped: &mut [bool]) {
    loop {
        let mut changed = false;
        for idx in dg.indices() {
            if skipped[idx.index()] {
                continue;
            }
            let prune = match dg.node(idx).kind {
                NodeKind::Test => false,
                NodeKind::SetUp => {
                    let mut gated =
                        dg.dependents(idx).filter(|(_, kind)| kind.is_gating()).peekable();
                    gated.peek().is_some() && gated.all(|(dep, _)| skipped[dep.index()])
                }
                NodeKind::TearDown => {
                    let mut prereqs = dg.prerequisites(idx).peekable();
                    prereqs.peek().is_some() && prereqs.all(|(pre, _)| skipped[pre.index()])
                }
            };
            if prune {
                skipped[idx.index()] = true;
                changed = true;
            }
        }
        if !changed {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::node::{Node, Scope, body};

    fn fixture(id: &str, kind: NodeKind) -> Node {
        Node::fixture(id, kind, Scope::Module, body(|_| Ok(())))
    }

    fn test_node(id: &str) -> Node {
        Node::test(id, body(|_| Ok(())))
    }

    /// m.setUp -> t1, t2 -> m.tearDown, m.setUp -> m.tearDown
    fn module_graph() -> DependencyGraph {
        let mut g = DependencyGraph::new();
        let su = g.add_node(fixture("m.setUp", NodeKind::SetUp)).unwrap();
        let t1 = g.add_node(test_node("m.t1")).unwrap();
        let t2 = g.add_node(test_node("m.t2")).unwrap();
        let td = g.add_node(fixture("m.tearDown", NodeKind::TearDown)).unwrap();
        g.add_edge(su, t1, true);
        g.add_edge(su, t2, true);
        g.add_edge(t1, td, false);
        g.add_edge(t2, td, false);
        g.add_edge(su, td, false);
        g
    }

    #[test]
    fn find_cycle_none_for_dag() {
        assert!(find_cycle(&module_graph()).is_none());
    }

    #[test]
    fn find_cycle_returns_path() {
        let mut g = DependencyGraph::new();
        g.add_node(test_node("a")).unwrap();
        g.add_node(test_node("b")).unwrap();
        g.add_node(test_node("c")).unwrap();
        g.add_edge_by_id("a", "b", true).unwrap();
        g.add_edge_by_id("b", "c", true).unwrap();
        g.add_edge_by_id("c", "a", true).unwrap();
        let cycle = find_cycle(&g).expect("cycle expected");
        assert_eq!(cycle, vec!["a", "b", "c"]);
    }

    #[test]
    fn long_chains_do_not_exhaust_the_stack() {
        const LEN: usize = 100_000;
        let mut g = DependencyGraph::new();
        let ids: Vec<NodeIndex> =
            (0..LEN).map(|i| g.add_node(test_node(&format!("n{i}"))).unwrap()).collect();
        for pair in ids.windows(2) {
            g.add_edge(pair[0], pair[1], true);
        }
        assert!(find_cycle(&g).is_none());
        assert!(g.validate().is_ok());

        g.add_edge(ids[LEN - 1], ids[0], true);
        let cycle = find_cycle(&g).expect("cycle expected");
        assert_eq!(cycle.len(), LEN);
        assert_eq!(cycle.first().map(String::as_str), Some("n0"));
        assert_eq!(cycle.last().map(String::as_str), Some("n99999"));
    }

    #[test]
    fn roots_are_nodes_without_prerequisites() {
        let g = module_graph();
        let roots = root_nodes(&g);
        assert_eq!(roots.len(), 1);
        assert_eq!(g.node(roots[0]).id, "m.setUp");
    }

    #[test]
    fn prune_skips_fixtures_when_all_tests_skipped() {
        let g = module_graph();
        let mut skipped = vec![false, true, true, false];
        prune_fixtures(&g, &mut skipped);
        assert_eq!(skipped, vec![true, true, true, true]);
    }

    #[test]
    fn prune_keeps_fixtures_with_live_tests() {
        let g = module_graph();
        let mut skipped = vec![false, true, false, false];
        prune_fixtures(&g, &mut skipped);
        assert_eq!(skipped, vec![false, true, false, false]);
    }

    #[test]
    fn prune_ignores_fixtures_without_neighbours() {
        let mut g = DependencyGraph::new();
        g.add_node(fixture("lonely.setUp", NodeKind::SetUp)).unwrap();
        g.add_node(fixture("lonely.tearDown", NodeKind::TearDown)).unwrap();
        let mut skipped = vec![false, false];
        prune_fixtures(&g, &mut skipped);
        assert_eq!(skipped, vec![false, false]);
    }
}

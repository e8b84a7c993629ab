use petgraph::visit::EdgeRef;

use crate::graph::dependency::DependencyGraph;
use crate::graph::node::EdgeKind;
use crate::runner::scheduler::RunReport;
use crate::runner::status::Status;

fn status_color(status: Status) -> &'static str {
    match status {
        Status::Passed | Status::UnexpectedPass => "palegreen",
        Status::ExpectedFailure => "khaki",
        Status::Failed | Status::Error => "salmon",
        Status::FailedDependency => "orange",
        Status::Skipped => "lightgray",
        Status::Pending | Status::Running => "white",
    }
}

/// Emit a dependency graph as a DOT (Graphviz) diagram.
///
/// Fixtures are drawn as boxes, ordering-only edges dashed. With a
/// `report`, nodes are labelled and filled by their terminal status.
pub fn emit_dot(name: &str, graph: &DependencyGraph, report: Option<&RunReport>) -> String {
    let mut out = format!("digraph \"{}\" {{\n", escape(name));
    out.push_str("  rankdir=LR;\n");

    for node in graph.nodes() {
        let id = escape(&node.id);
        let mut attrs = Vec::new();
        let status = report.and_then(|r| r.status(&node.id));
        match status {
            Some(status) => attrs.push(format!("label=\"{id}\\n{status}\"")),
            None => attrs.push(format!("label=\"{id}\"")),
        }
        if node.kind.is_fixture() {
            attrs.push("shape=box".to_owned());
            attrs.push("color=steelblue".to_owned());
        }
        if let Some(status) = status {
            attrs.push(format!("style=filled, fillcolor={}", status_color(status)));
        } else if node.skip {
            attrs.push("style=dotted".to_owned());
        }
        out.push_str(&format!("  \"{id}\" [{}];\n", attrs.join(", ")));
    }

    for edge in graph.graph.edge_references() {
        let src = escape(&graph.node(edge.source()).id);
        let dst = escape(&graph.node(edge.target()).id);
        match edge.weight() {
            EdgeKind::Gating => out.push_str(&format!("  \"{src}\" -> \"{dst}\";\n")),
            EdgeKind::Ordering => {
                out.push_str(&format!("  \"{src}\" -> \"{dst}\" [style=dashed];\n"))
            }
        }
    }

    out.push_str("}\n");
    out
}

fn escape(s: &str) -> String {
    s.replace('\\', "\\\\").replace('"', "\\\"")
}

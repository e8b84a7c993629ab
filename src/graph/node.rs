use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::resource::descriptor::ResourceDescriptor;
use crate::runner::context::NodeContext;
use crate::runner::result::{Failure, Raises};

/// The callable executed when a node runs.
///
/// `Ok(())` means the node passed. See [`Failure`] for how errors map onto
/// terminal statuses.
pub type Body = Arc<dyn Fn(&NodeContext<'_>) -> Result<(), Failure> + Send + Sync>;

/// Wrap a closure as a node [`Body`].
pub fn body<F>(f: F) -> Body
where
    F: Fn(&NodeContext<'_>) -> Result<(), Failure> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// What a node does: run a test, or set up / tear down a fixture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Test,
    SetUp,
    TearDown,
}

impl NodeKind {
    pub fn is_fixture(self) -> bool {
        !matches!(self, Self::Test)
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Test => write!(f, "test"),
            Self::SetUp => write!(f, "setUp"),
            Self::TearDown => write!(f, "tearDown"),
        }
    }
}

/// The nesting level a node belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    Package,
    Module,
    Class,
    Test,
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Package => write!(f, "package"),
            Self::Module => write!(f, "module"),
            Self::Class => write!(f, "class"),
            Self::Test => write!(f, "test"),
        }
    }
}

/// A unit of work in the dependency graph: a test or a fixture.
#[derive(Clone)]
pub struct Node {
    pub id: String,
    pub kind: NodeKind,
    pub scope: Scope,
    /// Explicit skip flag set at discovery.
    pub skip: bool,
    /// Free-form metadata, matched by attribute skip rules.
    pub attrs: BTreeMap<String, String>,
    /// Resources to acquire before the body runs, in declared order.
    pub requires: Vec<(String, ResourceDescriptor)>,
    /// The test is expected to fail: failing ends `expected-failure`,
    /// passing ends `unexpected-pass`.
    pub failing: bool,
    /// Failures that count as a pass.
    pub raises: Option<Raises>,
    pub body: Body,
}

impl Node {
    /// A test node with no resources.
    pub fn test(id: impl Into<String>, body: Body) -> Self {
        Self::new(id, NodeKind::Test, Scope::Test, body)
    }

    /// A fixture node of the given kind and scope.
    pub fn fixture(id: impl Into<String>, kind: NodeKind, scope: Scope, body: Body) -> Self {
        Self::new(id, kind, scope, body)
    }

    fn new(id: impl Into<String>, kind: NodeKind, scope: Scope, body: Body) -> Self {
        Self {
            id: id.into(),
            kind,
            scope,
            skip: false,
            attrs: BTreeMap::new(),
            requires: Vec::new(),
            failing: false,
            raises: None,
            body,
        }
    }

    /// Mark the node as skipped.
    pub fn skipped(mut self) -> Self {
        self.skip = true;
        self
    }

    /// Attach an attribute.
    pub fn with_attr(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attrs.insert(key.into(), value.into());
        self
    }

    /// Declare a resource parameter.
    pub fn with_resource(
        mut self,
        param: impl Into<String>,
        descriptor: ResourceDescriptor,
    ) -> Self {
        self.requires.push((param.into(), descriptor));
        self
    }

    /// Mark the test as expected to fail.
    pub fn failing(mut self) -> Self {
        self.failing = true;
        self
    }

    pub fn raises(mut self, raises: Raises) -> Self {
        self.raises = Some(raises);
        self
    }

    pub fn is_test(&self) -> bool {
        self.kind == NodeKind::Test
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("scope", &self.scope)
            .field("skip", &self.skip)
            .field("attrs", &self.attrs)
            .field("requires", &self.requires)
            .field("failing", &self.failing)
            .field("raises", &self.raises)
            .finish_non_exhaustive()
    }
}

/// Edge payload: whether the prerequisite's outcome gates the dependent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EdgeKind {
    /// The dependent runs only if the prerequisite passed.
    Gating,
    /// The dependent runs once the prerequisite is terminal, whatever its outcome.
    Ordering,
}

impl EdgeKind {
    pub fn from_gate(gate: bool) -> Self {
        if gate { Self::Gating } else { Self::Ordering }
    }

    pub fn is_gating(self) -> bool {
        self == Self::Gating
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop() -> Body {
        body(|_| Ok(()))
    }

    #[test]
    fn test_node_defaults() {
        let node = Node::test("pkg.mod.test_a", noop());
        assert_eq!(node.kind, NodeKind::Test);
        assert_eq!(node.scope, Scope::Test);
        assert!(!node.skip);
        assert!(node.requires.is_empty());
        assert!(node.is_test());
    }

    #[test]
    fn fixture_node_is_not_a_test() {
        let node = Node::fixture("pkg.setUp", NodeKind::SetUp, Scope::Package, noop());
        assert!(!node.is_test());
        assert!(node.kind.is_fixture());
    }

    #[test]
    fn builder_methods_accumulate() {
        let node = Node::test("t", noop())
            .skipped()
            .with_attr("slow", "true")
            .failing()
            .raises(Raises::new(["boom"]));
        assert!(node.skip);
        assert_eq!(node.attrs["slow"], "true");
        assert!(node.failing);
        assert_eq!(node.raises, Some(Raises::new(["boom"])));
    }

    #[test]
    fn kind_and_scope_display() {
        assert_eq!(NodeKind::SetUp.to_string(), "setUp");
        assert_eq!(NodeKind::TearDown.to_string(), "tearDown");
        assert_eq!(Scope::Class.to_string(), "class");
    }

    #[test]
    fn edge_kind_from_gate() {
        assert!(EdgeKind::from_gate(true).is_gating());
        assert!(!EdgeKind::from_gate(false).is_gating());
    }

    #[test]
    fn debug_omits_body() {
        let rendered = format!("{:?}", Node::test("t", noop()));
        assert!(rendered.contains("\"t\""));
        assert!(!rendered.contains("body"));
    }
}

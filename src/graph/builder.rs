use std::collections::BTreeMap;

use petgraph::graph::NodeIndex;

use crate::graph::dependency::{DependencyGraph, GraphError};
use crate::graph::node::{Body, Node, NodeKind, Scope};
use crate::resource::descriptor::ResourceDescriptor;
use crate::runner::result::Raises;

/// Handle to a scope declared on a [`SuiteBuilder`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScopeId(usize);

/// A test as declared at discovery.
#[derive(Clone)]
pub struct TestDecl {
    pub name: String,
    pub body: Body,
    pub skip: bool,
    pub attrs: BTreeMap<String, String>,
    pub requires: Vec<(String, ResourceDescriptor)>,
    /// Replaces the enclosing scope's per-test setUp.
    pub set_up: Option<Body>,
    /// Replaces the enclosing scope's per-test tearDown.
    pub tear_down: Option<Body>,
    /// Tests that must pass first. Ids may be absolute or relative to the
    /// declaring scope.
    pub depends_on: Vec<String>,
    pub failing: bool,
    pub raises: Option<Raises>,
}

impl TestDecl {
    pub fn new(name: impl Into<String>, body: Body) -> Self {
        Self {
            name: name.into(),
            body,
            skip: false,
            attrs: BTreeMap::new(),
            requires: Vec::new(),
            set_up: None,
            tear_down: None,
            depends_on: Vec::new(),
            failing: false,
            raises: None,
        }
    }

    pub fn skipped(mut self) -> Self {
        self.skip = true;
        self
    }

    pub fn attr(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attrs.insert(key.into(), value.into());
        self
    }

    pub fn requires(mut self, param: impl Into<String>, descriptor: ResourceDescriptor) -> Self {
        self.requires.push((param.into(), descriptor));
        self
    }

    pub fn set_up(mut self, body: Body) -> Self {
        self.set_up = Some(body);
        self
    }

    pub fn tear_down(mut self, body: Body) -> Self {
        self.tear_down = Some(body);
        self
    }

    pub fn depends_on(mut self, id: impl Into<String>) -> Self {
        self.depends_on.push(id.into());
        self
    }

    /// Expect the test to fail.
    pub fn failing(mut self) -> Self {
        self.failing = true;
        self
    }

    pub fn raises(mut self, raises: Raises) -> Self {
        self.raises = Some(raises);
        self
    }
}

enum Member {
    Scope(ScopeId),
    Test(TestDecl),
}

struct ScopeDecl {
    name: String,
    scope: Scope,
    parent: Option<ScopeId>,
    skip: bool,
    set_up: Option<Body>,
    tear_down: Option<Body>,
    set_up_each: Option<Body>,
    tear_down_each: Option<Body>,
    members: Vec<Member>,
}

/// Collects scope and test declarations for one run and turns them into a
/// [`DependencyGraph`].
///
/// Edges follow scope nesting:
///
/// - the nearest enclosing setUp gates every member of its scope;
/// - every member precedes the nearest enclosing tearDown (ordering only);
/// - a tearDown is ordered after its own scope's setUp, or the nearest
///   enclosing one;
/// - per-test fixtures wrap their test the same way at test scope;
/// - `depends_on` adds gating edges between tests.
///
/// Nodes are discovered depth first in declaration order: a scope's setUp,
/// then its members, then its tearDown.
#[derive(Default)]
pub struct SuiteBuilder {
    scopes: Vec<ScopeDecl>,
    roots: Vec<ScopeId>,
}

impl SuiteBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a top-level package.
    pub fn package(&mut self, name: impl Into<String>) -> ScopeId {
        self.add_scope(None, Scope::Package, name.into())
    }

    /// Declare a module, inside a package or at top level.
    pub fn module(&mut self, parent: Option<ScopeId>, name: impl Into<String>) -> ScopeId {
        self.add_scope(parent, Scope::Module, name.into())
    }

    pub fn class(&mut self, parent: ScopeId, name: impl Into<String>) -> ScopeId {
        self.add_scope(Some(parent), Scope::Class, name.into())
    }

    fn add_scope(&mut self, parent: Option<ScopeId>, scope: Scope, name: String) -> ScopeId {
        let id = ScopeId(self.scopes.len());
        self.scopes.push(ScopeDecl {
            name,
            scope,
            parent,
            skip: false,
            set_up: None,
            tear_down: None,
            set_up_each: None,
            tear_down_each: None,
            members: Vec::new(),
        });
        match parent {
            Some(p) => self.scopes[p.0].members.push(Member::Scope(id)),
            None => self.roots.push(id),
        }
        id
    }

    pub fn set_up(&mut self, scope: ScopeId, body: Body) -> &mut Self {
        self.scopes[scope.0].set_up = Some(body);
        self
    }

    pub fn tear_down(&mut self, scope: ScopeId, body: Body) -> &mut Self {
        self.scopes[scope.0].tear_down = Some(body);
        self
    }

    /// Fixture run before each test directly inside `scope`.
    pub fn set_up_each(&mut self, scope: ScopeId, body: Body) -> &mut Self {
        self.scopes[scope.0].set_up_each = Some(body);
        self
    }

    /// Fixture run after each test directly inside `scope`.
    pub fn tear_down_each(&mut self, scope: ScopeId, body: Body) -> &mut Self {
        self.scopes[scope.0].tear_down_each = Some(body);
        self
    }

    /// Flag every test inside `scope`, at any depth, as skipped.
    pub fn skip(&mut self, scope: ScopeId) -> &mut Self {
        self.scopes[scope.0].skip = true;
        self
    }

    /// Declare a test. Returns its node id.
    pub fn test(&mut self, scope: ScopeId, decl: TestDecl) -> String {
        let id = format!("{}.{}", self.path(scope), decl.name);
        self.scopes[scope.0].members.push(Member::Test(decl));
        id
    }

    /// Dotted path of a scope, e.g. `pkg.mod.Case`.
    pub fn path(&self, scope: ScopeId) -> String {
        let mut parts = Vec::new();
        let mut cur = Some(scope);
        while let Some(id) = cur {
            parts.push(self.scopes[id.0].name.as_str());
            cur = self.scopes[id.0].parent;
        }
        parts.reverse();
        parts.join(".")
    }

    fn skipped(&self, scope: ScopeId) -> bool {
        let mut cur = Some(scope);
        while let Some(id) = cur {
            if self.scopes[id.0].skip {
                return true;
            }
            cur = self.scopes[id.0].parent;
        }
        false
    }

    /// Build the graph.
    ///
    /// # Errors
    ///
    /// Returns [`GraphError::DuplicateNode`] for colliding ids and
    /// [`GraphError::UnknownNode`] for an unresolvable `depends_on`.
    pub fn build(self) -> Result<DependencyGraph, GraphError> {
        let mut graph = DependencyGraph::new();
        let mut explicit = Vec::new();
        for &root in &self.roots {
            self.emit_scope(root, None, &mut graph, &mut explicit)?;
        }
        for (scope_path, dependent, prereq) in explicit {
            let relative = format!("{scope_path}.{prereq}");
            let target = if graph.index_of(&prereq).is_some() {
                prereq
            } else if graph.index_of(&relative).is_some() {
                relative
            } else {
                return Err(GraphError::UnknownNode(prereq));
            };
            graph.add_edge_by_id(&target, &dependent, true)?;
        }
        Ok(graph)
    }

    /// Emit one scope. Returns the nodes that must precede the nearest
    /// tearDown above it.
    fn emit_scope(
        &self,
        id: ScopeId,
        outer_set_up: Option<NodeIndex>,
        graph: &mut DependencyGraph,
        explicit: &mut Vec<(String, String, String)>,
    ) -> Result<Vec<NodeIndex>, GraphError> {
        let decl = &self.scopes[id.0];
        let path = self.path(id);
        let (set_up_name, tear_down_name) = match decl.scope {
            Scope::Class => ("setUpClass", "tearDownClass"),
            _ => ("setUp", "tearDown"),
        };

        let set_up = match &decl.set_up {
            Some(body) => {
                let node = Node::fixture(
                    format!("{path}.{set_up_name}"),
                    NodeKind::SetUp,
                    decl.scope,
                    body.clone(),
                );
                let idx = graph.add_node(node)?;
                if let Some(outer) = outer_set_up {
                    graph.add_edge(outer, idx, true);
                }
                Some(idx)
            }
            None => None,
        };
        let nearest = set_up.or(outer_set_up);

        let mut exposed: Vec<NodeIndex> = set_up.into_iter().collect();
        for member in &decl.members {
            match member {
                Member::Scope(child) => {
                    exposed.extend(self.emit_scope(*child, nearest, graph, explicit)?)
                }
                Member::Test(test) => {
                    exposed.extend(self.emit_test(id, &path, test, nearest, graph, explicit)?)
                }
            }
        }

        let Some(body) = &decl.tear_down else {
            return Ok(exposed);
        };
        let node = Node::fixture(
            format!("{path}.{tear_down_name}"),
            NodeKind::TearDown,
            decl.scope,
            body.clone(),
        );
        let tear_down = graph.add_node(node)?;
        if let Some(partner) = nearest {
            graph.add_edge(partner, tear_down, false);
        }
        for member in exposed {
            graph.add_edge(member, tear_down, false);
        }
        Ok(vec![tear_down])
    }

    fn emit_test(
        &self,
        scope: ScopeId,
        path: &str,
        test: &TestDecl,
        outer_set_up: Option<NodeIndex>,
        graph: &mut DependencyGraph,
        explicit: &mut Vec<(String, String, String)>,
    ) -> Result<Vec<NodeIndex>, GraphError> {
        let decl = &self.scopes[scope.0];
        let id = format!("{path}.{}", test.name);

        let set_up = match test.set_up.as_ref().or(decl.set_up_each.as_ref()) {
            Some(body) => {
                let node = Node::fixture(
                    format!("{id}.setUp"),
                    NodeKind::SetUp,
                    Scope::Test,
                    body.clone(),
                );
                let idx = graph.add_node(node)?;
                if let Some(outer) = outer_set_up {
                    graph.add_edge(outer, idx, true);
                }
                Some(idx)
            }
            None => None,
        };

        let mut node = Node::test(id.clone(), test.body.clone());
        node.skip = test.skip || self.skipped(scope);
        node.attrs = test.attrs.clone();
        node.requires = test.requires.clone();
        node.failing = test.failing;
        node.raises = test.raises.clone();
        let idx = graph.add_node(node)?;
        if let Some(gate) = set_up.or(outer_set_up) {
            graph.add_edge(gate, idx, true);
        }
        for prereq in &test.depends_on {
            explicit.push((path.to_owned(), id.clone(), prereq.clone()));
        }

        let mut exposed: Vec<NodeIndex> = set_up.into_iter().chain([idx]).collect();
        if let Some(body) = test.tear_down.as_ref().or(decl.tear_down_each.as_ref()) {
            let node = Node::fixture(
                format!("{id}.tearDown"),
                NodeKind::TearDown,
                Scope::Test,
                body.clone(),
            );
            let tear_down = graph.add_node(node)?;
            if let Some(partner) = set_up.or(outer_set_up) {
                graph.add_edge(partner, tear_down, false);
            }
            for member in exposed {
                graph.add_edge(member, tear_down, false);
            }
            exposed = vec![tear_down];
        }
        Ok(exposed)
    }
}

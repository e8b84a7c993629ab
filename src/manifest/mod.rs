//! YAML suite manifests whose bodies and resources are shell scripts.
//!
//! ```yaml
//! name: demo
//! resources:
//!   scratch:
//!     set_up: mktemp -d
//!     tear_down: rm -rf "$DTEST_RESOURCE"
//! modules:
//!   - name: files
//!     set_up: echo ready
//!     tests:
//!       - name: exists
//!         run: test -d "$DTEST_RESOURCE_SCRATCH"
//!         requires:
//!           scratch: scratch
//! ```

pub mod shell;

use std::collections::BTreeMap;
use std::fmt;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::de::{self, Deserializer, MapAccess, Visitor};
use serde::Deserialize;
use thiserror::Error;

use crate::graph::builder::{ScopeId, SuiteBuilder, TestDecl};
use crate::graph::dependency::{DependencyGraph, GraphError};
use crate::resource::descriptor::ResourceDescriptor;
use crate::runner::result::Raises;
use shell::{Shell, ShellResource, shell_body};

/// Errors from loading a manifest.
#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid manifest: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("test '{test}' requires unknown resource '{resource}'")]
    UnknownResource { test: String, resource: String },
    #[error("test '{test}': {message}")]
    InvalidValue { test: String, message: String },
    #[error(transparent)]
    Graph(#[from] GraphError),
}

/// Top-level manifest document.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Manifest {
    pub name: String,
    #[serde(default)]
    pub resources: BTreeMap<String, ResourceSpec>,
    #[serde(default)]
    pub packages: Vec<PackageSpec>,
    /// Modules outside any package.
    #[serde(default)]
    pub modules: Vec<ModuleSpec>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResourceSpec {
    pub set_up: String,
    pub tear_down: Option<String>,
    #[serde(default)]
    pub oneshot: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PackageSpec {
    pub name: String,
    pub set_up: Option<String>,
    pub tear_down: Option<String>,
    #[serde(default)]
    pub skip: bool,
    #[serde(default)]
    pub modules: Vec<ModuleSpec>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModuleSpec {
    pub name: String,
    pub set_up: Option<String>,
    pub tear_down: Option<String>,
    #[serde(default)]
    pub skip: bool,
    #[serde(default)]
    pub tests: Vec<TestSpec>,
    #[serde(default)]
    pub classes: Vec<ClassSpec>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClassSpec {
    pub name: String,
    /// Runs once before the class (setUpClass).
    pub set_up: Option<String>,
    pub tear_down: Option<String>,
    /// Runs before each test of the class.
    pub set_up_each: Option<String>,
    pub tear_down_each: Option<String>,
    #[serde(default)]
    pub skip: bool,
    #[serde(default)]
    pub tests: Vec<TestSpec>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TestSpec {
    pub name: String,
    pub run: String,
    #[serde(default)]
    pub skip: bool,
    #[serde(default)]
    pub attrs: BTreeMap<String, String>,
    /// Parameter → resource, in acquisition order.
    #[serde(default, deserialize_with = "ordered_map")]
    pub requires: Vec<(String, RequireSpec)>,
    #[serde(default)]
    pub dirties: Vec<String>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    pub set_up: Option<String>,
    pub tear_down: Option<String>,
    /// Expected to fail: a failure reports as expected-failure, a pass
    /// as unexpected-pass.
    #[serde(default)]
    pub failing: bool,
    /// Passes only if the test fails with output containing one of these
    /// strings. A null entry also accepts success.
    pub raises: Option<Vec<Option<String>>>,
}

/// A resource request: just the resource name, or name plus options.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum RequireSpec {
    Name(String),
    Full {
        resource: String,
        #[serde(default)]
        args: Vec<serde_yaml::Value>,
        #[serde(default)]
        options: BTreeMap<String, serde_yaml::Value>,
    },
}

/// Deserialize a mapping into a vector, keeping document order.
fn ordered_map<'de, D, V>(deserializer: D) -> Result<Vec<(String, V)>, D::Error>
where
    D: Deserializer<'de>,
    V: Deserialize<'de>,
{
    struct OrderedVisitor<V>(PhantomData<V>);

    impl<'de, V: Deserialize<'de>> Visitor<'de> for OrderedVisitor<V> {
        type Value = Vec<(String, V)>;

        fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("a mapping")
        }

        fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Self::Value, A::Error> {
            let mut entries = Vec::with_capacity(map.size_hint().unwrap_or(0));
            while let Some((key, value)) = map.next_entry::<String, V>()? {
                if entries.iter().any(|(k, _): &(String, V)| *k == key) {
                    return Err(de::Error::custom(format!("duplicate parameter '{key}'")));
                }
                entries.push((key, value));
            }
            Ok(entries)
        }
    }

    deserializer.deserialize_map(OrderedVisitor(PhantomData))
}

/// A loaded suite, ready to run.
pub struct Suite {
    pub name: String,
    pub graph: DependencyGraph,
}

/// Read and build a manifest. Scripts run in the manifest's directory.
///
/// # Errors
///
/// Returns [`ManifestError`] if the file cannot be read, parsed, or turned
/// into a valid graph.
pub fn load(path: &Path) -> Result<Suite, ManifestError> {
    let text = std::fs::read_to_string(path).map_err(|source| ManifestError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let base = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
        _ => PathBuf::from("."),
    };
    parse(&text, &base)
}

/// Parse and build a manifest from text.
///
/// # Errors
///
/// See [`load`].
pub fn parse(text: &str, working_dir: &Path) -> Result<Suite, ManifestError> {
    let manifest: Manifest = serde_yaml::from_str(text)?;
    let shell = Arc::new(Shell::new(working_dir));
    let name = manifest.name.clone();
    let graph = manifest.into_builder(&shell)?.build()?;
    Ok(Suite { name, graph })
}

fn scalar(value: &serde_yaml::Value) -> Option<String> {
    match value {
        serde_yaml::Value::String(s) => Some(s.clone()),
        serde_yaml::Value::Number(n) => Some(n.to_string()),
        serde_yaml::Value::Bool(b) => Some(b.to_string()),
        serde_yaml::Value::Null => Some(String::new()),
        _ => None,
    }
}

struct Lowering<'a> {
    shell: &'a Arc<Shell>,
    resources: BTreeMap<String, Arc<ShellResource>>,
    builder: SuiteBuilder,
}

impl Manifest {
    /// Declare every scope, fixture, and test on a fresh [`SuiteBuilder`].
    ///
    /// # Errors
    ///
    /// Returns [`ManifestError`] for unknown resources or non-scalar options.
    pub fn into_builder(self, shell: &Arc<Shell>) -> Result<SuiteBuilder, ManifestError> {
        let resources = self
            .resources
            .into_iter()
            .map(|(name, spec)| {
                let resource = Arc::new(ShellResource {
                    name: name.clone(),
                    set_up: spec.set_up,
                    tear_down: spec.tear_down,
                    oneshot: spec.oneshot,
                    shell: shell.clone(),
                });
                (name, resource)
            })
            .collect();
        let mut lowering = Lowering {
            shell,
            resources,
            builder: SuiteBuilder::new(),
        };

        for package in &self.packages {
            let scope = lowering.builder.package(&package.name);
            lowering.fixtures(scope, package.set_up.as_ref(), package.tear_down.as_ref());
            if package.skip {
                lowering.builder.skip(scope);
            }
            for module in &package.modules {
                lowering.module(Some(scope), module)?;
            }
        }
        for module in &self.modules {
            lowering.module(None, module)?;
        }
        Ok(lowering.builder)
    }
}

impl Lowering<'_> {
    fn body(&self, script: &str) -> crate::graph::node::Body {
        shell_body(self.shell.clone(), script.to_owned(), Vec::new())
    }

    fn fixtures(&mut self, scope: ScopeId, set_up: Option<&String>, tear_down: Option<&String>) {
        if let Some(script) = set_up {
            let body = self.body(script);
            self.builder.set_up(scope, body);
        }
        if let Some(script) = tear_down {
            let body = self.body(script);
            self.builder.tear_down(scope, body);
        }
    }

    fn module(&mut self, parent: Option<ScopeId>, spec: &ModuleSpec) -> Result<(), ManifestError> {
        let scope = self.builder.module(parent, &spec.name);
        self.fixtures(scope, spec.set_up.as_ref(), spec.tear_down.as_ref());
        if spec.skip {
            self.builder.skip(scope);
        }
        for test in &spec.tests {
            self.test(scope, test)?;
        }
        for class in &spec.classes {
            let cls = self.builder.class(scope, &class.name);
            self.fixtures(cls, class.set_up.as_ref(), class.tear_down.as_ref());
            if let Some(script) = &class.set_up_each {
                let body = self.body(script);
                self.builder.set_up_each(cls, body);
            }
            if let Some(script) = &class.tear_down_each {
                let body = self.body(script);
                self.builder.tear_down_each(cls, body);
            }
            if class.skip {
                self.builder.skip(cls);
            }
            for test in &class.tests {
                self.test(cls, test)?;
            }
        }
        Ok(())
    }

    fn test(&mut self, scope: ScopeId, spec: &TestSpec) -> Result<(), ManifestError> {
        let id = format!("{}.{}", self.builder.path(scope), spec.name);
        let body = shell_body(self.shell.clone(), spec.run.clone(), spec.dirties.clone());
        let mut decl = TestDecl::new(&spec.name, body);
        decl.skip = spec.skip;
        decl.attrs = spec.attrs.clone();
        decl.depends_on = spec.depends_on.clone();
        decl.set_up = spec.set_up.as_deref().map(|s| self.body(s));
        decl.tear_down = spec.tear_down.as_deref().map(|s| self.body(s));
        decl.failing = spec.failing;
        if let Some(entries) = &spec.raises {
            let mut raises = Raises::new(entries.iter().flatten());
            if entries.iter().any(Option::is_none) {
                raises = raises.or_success();
            }
            decl.raises = Some(raises);
        }
        for (param, require) in &spec.requires {
            decl.requires.push((param.clone(), self.descriptor(&id, require)?));
        }
        self.builder.test(scope, decl);
        Ok(())
    }

    fn descriptor(
        &self,
        test: &str,
        require: &RequireSpec,
    ) -> Result<ResourceDescriptor, ManifestError> {
        let (name, args, options) = match require {
            RequireSpec::Name(name) => (name, &[][..], None),
            RequireSpec::Full { resource, args, options } => {
                (resource, args.as_slice(), Some(options))
            }
        };
        let resource = self.resources.get(name).ok_or_else(|| ManifestError::UnknownResource {
            test: test.to_owned(),
            resource: name.clone(),
        })?;
        let invalid = |what: String| ManifestError::InvalidValue {
            test: test.to_owned(),
            message: format!("{what} of resource '{name}' must be a scalar"),
        };

        let mut descriptor = ResourceDescriptor::new(resource.clone());
        for (i, arg) in args.iter().enumerate() {
            let value = scalar(arg).ok_or_else(|| invalid(format!("argument {}", i + 1)))?;
            descriptor = descriptor.arg(value);
        }
        for (key, value) in options.into_iter().flatten() {
            let value = scalar(value).ok_or_else(|| invalid(format!("option '{key}'")))?;
            descriptor = descriptor.option(key.clone(), value);
        }
        Ok(descriptor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::node::{EdgeKind, NodeKind};

    const DEMO: &str = r#"
name: demo
resources:
  scratch:
    set_up: echo "/tmp/$1"
    tear_down: "true"
  counter:
    set_up: echo 0
    oneshot: true
packages:
  - name: pkg
    set_up: echo up
    tear_down: echo down
    modules:
      - name: mod
        tests:
          - name: test_a
            run: "true"
            attrs: { speed: slow }
            requires:
              scratch: { resource: scratch, args: [data, 2], options: { mode: rw } }
              count: counter
        classes:
          - name: Case
            set_up: echo class
            set_up_each: echo each
            tests:
              - name: test_b
                run: "true"
                depends_on: [pkg.mod.test_a]
modules:
  - name: loose
    skip: true
    tests:
      - name: t
        run: "false"
"#;

    fn suite() -> Suite {
        parse(DEMO, Path::new(".")).unwrap()
    }

    #[test]
    fn parses_scopes_in_discovery_order() {
        let ids: Vec<String> = suite().graph.nodes().map(|n| n.id.clone()).collect();
        assert_eq!(
            ids,
            vec![
                "pkg.setUp",
                "pkg.mod.test_a",
                "pkg.mod.Case.setUpClass",
                "pkg.mod.Case.test_b.setUp",
                "pkg.mod.Case.test_b",
                "pkg.tearDown",
                "loose.t",
            ]
        );
    }

    #[test]
    fn requires_keep_order_and_options() {
        let s = suite();
        let node = s.graph.node(s.graph.index_of("pkg.mod.test_a").unwrap());
        let params: Vec<&str> = node.requires.iter().map(|(p, _)| p.as_str()).collect();
        assert_eq!(params, vec!["scratch", "count"]);
        assert_eq!(node.requires[0].1.to_string(), "scratch(data, 2, mode=rw)");
        assert!(node.requires[1].1.oneshot());
        assert_eq!(node.attrs.get("speed").map(String::as_str), Some("slow"));
    }

    #[test]
    fn edges_follow_scopes_and_dependencies() {
        let s = suite();
        let g = &s.graph;
        let edge = |a: &str, b: &str| {
            g.graph
                .find_edge(g.index_of(a).unwrap(), g.index_of(b).unwrap())
                .map(|e| g.graph[e])
        };
        assert_eq!(edge("pkg.setUp", "pkg.mod.test_a"), Some(EdgeKind::Gating));
        assert_eq!(edge("pkg.mod.test_a", "pkg.mod.Case.test_b"), Some(EdgeKind::Gating));
        assert_eq!(edge("pkg.mod.Case.test_b", "pkg.tearDown"), Some(EdgeKind::Ordering));
        let each = g.node(g.index_of("pkg.mod.Case.test_b.setUp").unwrap());
        assert_eq!(each.kind, NodeKind::SetUp);
    }

    #[test]
    fn module_skip_applies_to_tests() {
        let s = suite();
        assert!(s.graph.node(s.graph.index_of("loose.t").unwrap()).skip);
    }

    #[test]
    fn unknown_resource_is_rejected() {
        let text = r#"
name: bad
modules:
  - name: m
    tests:
      - name: t
        run: "true"
        requires: { db: postgres }
"#;
        let err = parse(text, Path::new(".")).err().unwrap();
        assert_eq!(err.to_string(), "test 'm.t' requires unknown resource 'postgres'");
    }

    #[test]
    fn non_scalar_option_is_rejected() {
        let text = r#"
name: bad
resources:
  db: { set_up: echo db }
modules:
  - name: m
    tests:
      - name: t
        run: "true"
        requires:
          db: { resource: db, options: { port: [1, 2] } }
"#;
        let err = parse(text, Path::new(".")).err().unwrap();
        assert!(matches!(err, ManifestError::InvalidValue { .. }));
        assert!(err.to_string().contains("option 'port'"));
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let err = parse("name: x\nbogus: 1\n", Path::new(".")).err().unwrap();
        assert!(matches!(err, ManifestError::Parse(_)));
    }

    #[test]
    fn duplicate_parameters_are_rejected() {
        let text = r#"
name: dup
resources:
  db: { set_up: echo db }
modules:
  - name: m
    tests:
      - name: t
        run: "true"
        requires:
          db: db
          db: db
"#;
        assert!(parse(text, Path::new(".")).is_err());
    }

    #[test]
    fn missing_file_reports_path() {
        let err = load(Path::new("/nonexistent/suite.yaml")).err().unwrap();
        assert!(err.to_string().starts_with("failed to read /nonexistent/suite.yaml"));
    }
}

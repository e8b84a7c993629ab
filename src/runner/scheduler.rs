use std::collections::BTreeMap;
use std::fmt;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use petgraph::graph::NodeIndex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::graph::analysis;
use crate::graph::dependency::{DependencyGraph, GraphError};
use crate::graph::readiness::ReadyTracker;
use crate::resource::descriptor::ResourceDescriptor;
use crate::resource::pool::ResourcePool;
use crate::runner::context::NodeContext;
use crate::runner::observer::RunObserver;
use crate::runner::result::{Failure, NodeError, NodeErrorKind, NodeResult, TeardownError, guarded};
use crate::runner::status::{SkipPropagation, Status, Verdict, evaluate};

/// Skip nodes carrying an attribute, optionally with a specific value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkipRule {
    pub attr: String,
    pub value: Option<String>,
}

impl SkipRule {
    /// Parse `ATTR` or `ATTR=VALUE`.
    pub fn parse(rule: &str) -> Self {
        match rule.split_once('=') {
            Some((attr, value)) => Self {
                attr: attr.trim().to_owned(),
                value: Some(value.trim().to_owned()),
            },
            None => Self {
                attr: rule.trim().to_owned(),
                value: None,
            },
        }
    }

    pub fn matches(&self, attrs: &BTreeMap<String, String>) -> bool {
        match (attrs.get(&self.attr), &self.value) {
            (Some(actual), Some(wanted)) => actual == wanted,
            (Some(_), None) => true,
            (None, _) => false,
        }
    }
}

/// Configuration for a run.
#[derive(Debug, Clone)]
pub struct RunConfig {
    /// Number of worker threads.
    pub workers: usize,
    /// Run nodes flagged skip at discovery.
    pub run_skipped: bool,
    /// How a skipped gating prerequisite affects its dependents.
    pub skip_propagation: SkipPropagation,
    /// Additionally skip nodes whose attributes match.
    pub skip_rule: Option<SkipRule>,
    /// Cap on live instances per resource descriptor. `None` = unlimited.
    pub max_instances_per_descriptor: Option<usize>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            workers: thread::available_parallelism().map_or(1, |n| n.get()),
            run_skipped: false,
            skip_propagation: SkipPropagation::default(),
            skip_rule: None,
            max_instances_per_descriptor: None,
        }
    }
}

/// Lifecycle of the engine itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    Idle,
    Running,
    Completed,
    /// Nothing was ready, nothing was running, and nodes remained pending.
    Deadlocked,
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Deadlocked => write!(f, "deadlocked"),
        }
    }
}

/// The complete result of a run.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub state: EngineState,
    /// Terminal results in discovery order.
    pub results: Vec<NodeResult>,
    pub summary: RunSummary,
    /// Most nodes executing at the same instant.
    pub peak_concurrency: usize,
    pub duration: Duration,
    /// Tear down failures not attributable to a single node.
    pub resource_errors: Vec<TeardownError>,
    /// Nodes left pending by a deadlock.
    pub stalled: Vec<String>,
}

impl RunReport {
    pub fn result(&self, id: &str) -> Option<&NodeResult> {
        self.results.iter().find(|r| r.id == id)
    }

    pub fn status(&self, id: &str) -> Option<Status> {
        self.result(id).map(|r| r.status)
    }

    pub fn success(&self) -> bool {
        self.state == EngineState::Completed && self.summary.success()
    }
}

/// Summary statistics for a run. Counts cover tests; fixture problems are
/// tallied separately.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub errors: usize,
    pub skipped: usize,
    pub failed_dependency: usize,
    /// Tests expected to fail that did. Not counted in `failed`.
    pub expected_failures: usize,
    /// Tests expected to fail that passed. Not counted in `passed`.
    pub unexpected_passes: usize,
    /// Fixtures that ended failed or error.
    pub fixture_failures: usize,
}

impl RunSummary {
    /// Whether no test or fixture failed, errored, or was blocked. Expected
    /// failures and unexpected passes do not fail a run.
    pub fn success(&self) -> bool {
        self.failed == 0
            && self.errors == 0
            && self.failed_dependency == 0
            && self.fixture_failures == 0
    }

    pub fn from_results(results: &[NodeResult]) -> Self {
        let mut summary = Self::default();
        for r in results {
            if !r.is_test() {
                if matches!(r.status, Status::Failed | Status::Error) {
                    summary.fixture_failures += 1;
                }
                continue;
            }
            summary.total += 1;
            match r.status {
                Status::Passed => summary.passed += 1,
                Status::Failed => summary.failed += 1,
                Status::Error => summary.errors += 1,
                Status::Skipped => summary.skipped += 1,
                Status::FailedDependency => summary.failed_dependency += 1,
                Status::ExpectedFailure => summary.expected_failures += 1,
                Status::UnexpectedPass => summary.unexpected_passes += 1,
                Status::Pending | Status::Running => {}
            }
        }
        summary
    }
}

struct RunState {
    tracker: ReadyTracker,
    engine: EngineState,
    /// Dequeued and not yet settled.
    in_flight: usize,
    /// Bodies currently executing.
    executing: usize,
    peak: usize,
    results: Vec<Option<NodeResult>>,
    resource_errors: Vec<TeardownError>,
    stalled: Vec<String>,
}

/// Shared by the workers of one run.
struct Run<'g> {
    graph: &'g DependencyGraph,
    skip: Vec<bool>,
    observer: &'g dyn RunObserver,
    state: Mutex<RunState>,
    wake: Condvar,
}

/// Executes a dependency graph on a fixed pool of worker threads.
pub struct Scheduler {
    config: RunConfig,
    pool: ResourcePool,
}

impl Scheduler {
    pub fn new(config: RunConfig) -> Self {
        let pool = ResourcePool::new(config.max_instances_per_descriptor);
        Self { config, pool }
    }

    /// Create a scheduler over an existing pool (useful for testing).
    pub fn with_pool(config: RunConfig, pool: ResourcePool) -> Self {
        Self { config, pool }
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    pub fn pool(&self) -> &ResourcePool {
        &self.pool
    }

    /// Which nodes the run will mark skipped instead of executing.
    pub fn effective_skips(&self, graph: &DependencyGraph) -> Vec<bool> {
        let mut skip: Vec<bool> = graph
            .nodes()
            .map(|node| {
                (node.skip && !self.config.run_skipped)
                    || self.config.skip_rule.as_ref().is_some_and(|rule| rule.matches(&node.attrs))
            })
            .collect();
        analysis::prune_fixtures(graph, &mut skip);
        skip
    }

    /// Execute every node of `graph`, reporting terminal results to
    /// `observer` as they happen.
    ///
    /// # Errors
    ///
    /// Returns [`GraphError`] if the graph is invalid. Nothing runs in that
    /// case.
    pub fn run(
        &self,
        graph: &DependencyGraph,
        observer: &dyn RunObserver,
    ) -> Result<RunReport, GraphError> {
        graph.validate()?;
        let start = Instant::now();
        let skip = self.effective_skips(graph);

        for idx in graph.indices() {
            if !skip[idx.index()] {
                for (_, descriptor) in &graph.node(idx).requires {
                    self.pool.register_user(descriptor);
                }
            }
        }

        let run = Run {
            graph,
            skip,
            observer,
            state: Mutex::new(RunState {
                tracker: ReadyTracker::new(graph),
                engine: EngineState::Running,
                in_flight: 0,
                executing: 0,
                peak: 0,
                results: vec![None; graph.node_count()],
                resource_errors: Vec::new(),
                stalled: Vec::new(),
            }),
            wake: Condvar::new(),
        };

        let workers = self.config.workers.max(1);
        info!(nodes = graph.node_count(), edges = graph.edge_count(), workers, "starting run");
        thread::scope(|s| {
            for _ in 0..workers {
                s.spawn(|| self.work(&run));
            }
        });

        let state = run.state.into_inner();
        let mut resource_errors = state.resource_errors;
        resource_errors.extend(self.pool.close());
        let results: Vec<NodeResult> = state.results.into_iter().flatten().collect();
        let summary = RunSummary::from_results(&results);
        let duration = start.elapsed();
        info!(
            state = %state.engine,
            passed = summary.passed,
            failed = summary.failed,
            errors = summary.errors,
            skipped = summary.skipped,
            failed_dependency = summary.failed_dependency,
            peak = state.peak,
            "run finished in {:.2}s",
            duration.as_secs_f64()
        );

        Ok(RunReport {
            state: state.engine,
            results,
            summary,
            peak_concurrency: state.peak,
            duration,
            resource_errors,
            stalled: state.stalled,
        })
    }

    /// Worker loop: take ready nodes until the run completes or stalls.
    fn work(&self, run: &Run<'_>) {
        while let Some(idx) = self.next(run) {
            let node = run.graph.node(idx);
            let result = if run.skip[idx.index()] {
                debug!(node = %node.id, "skipping");
                NodeResult::skipped(&node.id, node.kind, node.scope)
            } else {
                self.execute(run, idx)
            };
            self.settle(run, idx, result);
        }
    }

    /// Block until a node is ready, or return `None` when the run is over.
    fn next(&self, run: &Run<'_>) -> Option<NodeIndex> {
        let mut state = run.state.lock();
        loop {
            if state.engine != EngineState::Running {
                return None;
            }
            if let Some(idx) = state.tracker.next_ready() {
                state.in_flight += 1;
                if !run.skip[idx.index()] {
                    state.tracker.mark_running(idx);
                    state.executing += 1;
                    state.peak = state.peak.max(state.executing);
                }
                return Some(idx);
            }
            if state.tracker.unresolved() == 0 {
                state.engine = EngineState::Completed;
                run.wake.notify_all();
                return None;
            }
            if state.in_flight == 0 {
                let stalled = state.tracker.stalled(run.graph);
                warn!(stalled = ?stalled, "no node ready and none running");
                state.stalled = stalled;
                state.engine = EngineState::Deadlocked;
                run.wake.notify_all();
                return None;
            }
            run.wake.wait(&mut state);
        }
    }

    /// Acquire resources, run the body, release resources.
    fn execute(&self, run: &Run<'_>, idx: NodeIndex) -> NodeResult {
        let node = run.graph.node(idx);
        run.observer.node_started(&node.id, node.kind, node.scope);
        debug!(node = %node.id, kind = %node.kind, "running");
        let start = Instant::now();

        // Acquire in key order so that two nodes never wait on each other's
        // instances under a cap. Equal keys keep declared order.
        let mut order: Vec<usize> = (0..node.requires.len()).collect();
        order.sort_by(|&a, &b| node.requires[a].1.key().cmp(node.requires[b].1.key()));
        let mut acquired = Vec::with_capacity(order.len());
        for (step, &pos) in order.iter().enumerate() {
            let (param, descriptor) = &node.requires[pos];
            match self.pool.acquire(descriptor) {
                Ok(handle) => acquired.push((pos, param.clone(), handle)),
                Err(err) => {
                    warn!(node = %node.id, error = %err, "resource acquisition failed");
                    let mut teardown_errors = Vec::new();
                    for (_, _, handle) in acquired {
                        teardown_errors.extend(self.pool.release(handle, Status::Error));
                    }
                    for &rest in &order[step + 1..] {
                        teardown_errors.extend(self.pool.forgo(&node.requires[rest].1));
                    }
                    let error = NodeError::new(NodeErrorKind::ResourceSetUp, err.to_string())
                        .with_detail(format!("parameter '{param}'"));
                    let elapsed = start.elapsed();
                    let mut result =
                        NodeResult::errored(&node.id, node.kind, node.scope, elapsed, error);
                    result.teardown_errors = attributed(teardown_errors, &node.id);
                    return result;
                }
            }
        }
        acquired.sort_by_key(|(pos, _, _)| *pos);
        let handles = acquired.into_iter().map(|(_, param, handle)| (param, handle)).collect();

        let ctx = NodeContext::new(&node.id, node.kind, node.scope, handles);
        let mut outcome = guarded(|| (node.body)(&ctx), Failure::Assertion);
        if let Some(raises) = &node.raises {
            outcome = raises.judge(outcome);
        }
        let duration = start.elapsed();
        let mut result = match &outcome {
            Ok(()) => NodeResult::passed(&node.id, node.kind, node.scope, duration),
            Err(failure) => {
                NodeResult::from_failure(&node.id, node.kind, node.scope, duration, failure)
            }
        };
        if node.failing {
            result = result.expecting_failure();
        }

        let (handles, captured) = ctx.finish();
        result.captured = captured;
        let mut teardown_errors = Vec::new();
        for handle in handles {
            teardown_errors.extend(self.pool.release(handle, result.status));
        }
        result.teardown_errors = attributed(teardown_errors, &node.id);
        result
    }

    /// Record a terminal result and cascade through newly unblocked
    /// dependents, all under one lock. Observer calls and resource
    /// bookkeeping for blocked nodes happen after the lock is dropped.
    fn settle(&self, run: &Run<'_>, idx: NodeIndex, result: NodeResult) {
        let graph = run.graph;
        let policy = self.config.skip_propagation;
        let mut finished = vec![result.clone()];
        let mut forgone: Vec<(&str, &ResourceDescriptor)> = Vec::new();

        {
            let mut state = run.state.lock();
            state.in_flight -= 1;
            if !run.skip[idx.index()] {
                state.executing -= 1;
            }
            debug!(node = %result.id, status = %result.status, "settled");
            let mut work = vec![(idx, result.status)];
            state.results[idx.index()] = Some(result);

            while let Some((done, status)) = work.pop() {
                for dep in state.tracker.resolve(graph, done, status) {
                    if run.skip[dep.index()] {
                        state.tracker.enqueue(dep);
                        continue;
                    }
                    let prerequisites: Vec<_> = graph.prerequisites(dep).collect();
                    let verdict = evaluate(
                        prerequisites.iter().map(|&(p, edge)| (state.tracker.status(p), edge)),
                        policy,
                    );
                    match verdict {
                        Verdict::Ready => state.tracker.enqueue(dep),
                        Verdict::Waiting => {}
                        Verdict::Blocked { status, cause } => {
                            let node = graph.node(dep);
                            let cause = prerequisites[cause].0;
                            let blocked = if status == Status::Skipped {
                                NodeResult::skipped(&node.id, node.kind, node.scope)
                            } else {
                                NodeResult::failed_dependency(
                                    &node.id,
                                    node.kind,
                                    node.scope,
                                    &graph.node(cause).id,
                                    state.tracker.status(cause),
                                )
                            };
                            debug!(
                                node = %node.id,
                                status = %status,
                                cause = %graph.node(cause).id,
                                "blocked"
                            );
                            let id = node.id.as_str();
                            forgone.extend(node.requires.iter().map(|(_, d)| (id, d)));
                            finished.push(blocked.clone());
                            state.results[dep.index()] = Some(blocked);
                            work.push((dep, status));
                        }
                    }
                }
            }
            run.wake.notify_all();
        }

        if !forgone.is_empty() {
            let mut errors = Vec::new();
            for (node, descriptor) in forgone {
                errors.extend(attributed(self.pool.forgo(descriptor), node));
            }
            if !errors.is_empty() {
                run.state.lock().resource_errors.extend(errors);
            }
        }
        for result in &finished {
            run.observer.node_finished(result);
        }
    }
}

fn attributed(errors: Vec<TeardownError>, node: &str) -> Vec<TeardownError> {
    errors
        .into_iter()
        .map(|mut e| {
            e.node.get_or_insert_with(|| node.to_owned());
            e
        })
        .collect()
}

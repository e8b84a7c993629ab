use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use crate::emit::dot::emit_dot;
use crate::emit::run_result::{emit_run_json, emit_run_junit, emit_run_yaml};
use crate::graph::node::{NodeKind, Scope};
use crate::manifest::{self, Suite};
use crate::runner::display::{format_node_result, format_run_header, format_summary};
use crate::runner::observer::RunObserver;
use crate::runner::report::to_report;
use crate::runner::result::NodeResult;
use crate::runner::scheduler::{RunConfig, Scheduler, SkipRule};
use crate::runner::status::SkipPropagation;

/// Options for the `run` command.
pub struct RunOptions {
    pub manifest: PathBuf,
    /// Worker threads; `None` uses available parallelism.
    pub workers: Option<usize>,
    pub run_skipped: bool,
    pub skip: Option<String>,
    pub skip_propagation: String,
    pub max_instances: Option<usize>,
    pub format: String,
    pub output: Option<PathBuf>,
    pub verbose: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            manifest: PathBuf::new(),
            workers: None,
            run_skipped: false,
            skip: None,
            skip_propagation: "fail".to_owned(),
            max_instances: None,
            format: "text".to_owned(),
            output: None,
            verbose: false,
        }
    }
}

impl RunOptions {
    fn parse_propagation(&self) -> Result<SkipPropagation, String> {
        match self.skip_propagation.as_str() {
            "fail" => Ok(SkipPropagation::FailDependents),
            "skip" => Ok(SkipPropagation::SkipDependents),
            "ignore" => Ok(SkipPropagation::Ignore),
            other => Err(format!(
                "unknown skip propagation '{other}' (expected: fail, skip, ignore)"
            )),
        }
    }

    fn config(&self) -> Result<RunConfig, String> {
        let defaults = RunConfig::default();
        Ok(RunConfig {
            workers: self.workers.unwrap_or(defaults.workers),
            run_skipped: self.run_skipped,
            skip_propagation: self.parse_propagation()?,
            skip_rule: self.skip.as_deref().map(SkipRule::parse),
            max_instances_per_descriptor: self.max_instances,
        })
    }
}

/// Prints text results as nodes finish, or buffers them when the report
/// goes to a file.
struct TextProgress {
    verbose: bool,
    stream: bool,
    lines: Mutex<Vec<String>>,
}

impl TextProgress {
    fn emit(&self, line: String) {
        if self.stream {
            println!("{line}");
        } else {
            self.lines.lock().push(line);
        }
    }
}

impl RunObserver for TextProgress {
    fn node_finished(&self, result: &NodeResult) {
        self.emit(format_node_result(result, self.verbose));
    }
}

fn load(path: &Path) -> Result<Suite, String> {
    manifest::load(path).map_err(|e| format!("{}: {e}", path.display()))
}

fn write_or_return(
    output: Option<&PathBuf>,
    content: String,
    what: &str,
) -> Result<String, String> {
    match output {
        Some(out_path) => {
            std::fs::write(out_path, &content)
                .map_err(|e| format!("failed to write {}: {e}", out_path.display()))?;
            Ok(format!("{what} written to {}", out_path.display()))
        }
        None => Ok(content),
    }
}

/// Run the `run` command: load a manifest, execute it, and emit results.
///
/// Returns `Ok(true)` if the run succeeded, `Ok(false)` if anything failed.
///
/// # Errors
///
/// Returns an error string if the manifest is invalid or the report cannot
/// be written.
pub fn run_run(options: &RunOptions) -> Result<bool, String> {
    if !matches!(options.format.as_str(), "text" | "json" | "yaml" | "junit" | "xml") {
        return Err(format!(
            "unknown format '{}' (expected: text, json, yaml, junit)",
            options.format
        ));
    }
    let config = options.config()?;
    let suite = load(&options.manifest)?;
    let workers = config.workers.max(1);
    let scheduler = Scheduler::new(config);

    let text = options.format == "text";
    let progress = TextProgress {
        verbose: options.verbose,
        stream: text && options.output.is_none(),
        lines: Mutex::new(Vec::new()),
    };
    if text {
        progress.emit(format_run_header(&suite.name, suite.graph.node_count(), workers));
    }

    let result = scheduler
        .run(&suite.graph, &progress)
        .map_err(|e| format!("{}: {e}", options.manifest.display()))?;

    let output_str = match options.format.as_str() {
        "text" => {
            progress.emit(format_summary(&result));
            progress.lines.lock().join("\n") + "\n"
        }
        "json" => emit_run_json(&to_report(&suite.name, &result, workers)),
        "yaml" => emit_run_yaml(&to_report(&suite.name, &result, workers)),
        _ => emit_run_junit(&to_report(&suite.name, &result, workers)),
    };

    match &options.output {
        Some(out_path) => {
            std::fs::write(out_path, &output_str)
                .map_err(|e| format!("failed to write {}: {e}", out_path.display()))?;
            eprintln!("results written to {}", out_path.display());
        }
        None if !progress.stream => print!("{output_str}"),
        None => {}
    }

    Ok(result.success())
}

/// Run the `list` command: print node ids in discovery order without
/// executing anything.
///
/// # Errors
///
/// Returns an error string if the manifest is invalid.
pub fn run_list(manifest: &Path) -> Result<String, String> {
    let suite = load(manifest)?;
    suite
        .graph
        .validate()
        .map_err(|e| format!("{}: {e}", manifest.display()))?;

    let mut lines = Vec::new();
    for node in suite.graph.nodes() {
        let mut line = match (node.kind, node.scope) {
            (NodeKind::Test, Scope::Test) => node.id.clone(),
            (kind, scope) => format!("{} [{scope} {kind}]", node.id),
        };
        if node.skip {
            line.push_str(" (skip)");
        }
        lines.push(line);
    }
    Ok(lines.join("\n") + "\n")
}

/// Run the `dot` command: render the dependency graph for Graphviz.
///
/// # Errors
///
/// Returns an error string if the manifest is invalid or the file cannot be
/// written.
pub fn run_dot(manifest: &Path, output: Option<&PathBuf>) -> Result<String, String> {
    let suite = load(manifest)?;
    write_or_return(output, emit_dot(&suite.name, &suite.graph, None), "diagram")
}

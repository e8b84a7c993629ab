use crate::runner::result::NodeResult;
use crate::runner::scheduler::{EngineState, RunReport};
use crate::runner::status::Status;

/// Format a status label for terminal output.
fn status_label(status: Status) -> &'static str {
    match status {
        Status::Pending => "PENDING",
        Status::Running => "RUNNING",
        Status::Passed => "PASSED",
        Status::Failed => "FAILED",
        Status::Error => "ERROR",
        Status::Skipped => "SKIPPED",
        Status::FailedDependency => "BLOCKED",
        Status::ExpectedFailure => "XFAIL",
        Status::UnexpectedPass => "UOK",
    }
}

/// Format a node result as it completes.
///
/// Tear down errors are shown only for nodes that otherwise passed; a
/// failing node's own error is the one reported.
pub fn format_node_result(result: &NodeResult, verbose: bool) -> String {
    let status = status_label(result.status);
    let mut line = format!("  [{status}] {}", result.id);
    if result.kind.is_fixture() {
        line.push_str(&format!(" <{} {}>", result.scope, result.kind));
    }
    if result.status != Status::Skipped && result.status != Status::FailedDependency {
        line.push_str(&format!(" ({:.1}s)", result.duration.as_secs_f64()));
    }

    if let Some(err) = &result.error {
        line.push_str(&format!("\n         → {}", err.message));
        if verbose && let Some(detail) = &err.detail {
            line.push_str(&format!("\n           {detail}"));
        }
    }

    if result.status.is_pass() {
        for err in &result.teardown_errors {
            line.push_str(&format!("\n         → {err}"));
        }
    }

    if verbose {
        for (stream, text) in &result.captured {
            for captured in text.lines() {
                line.push_str(&format!("\n         {stream}| {captured}"));
            }
        }
    }

    line
}

/// Format the final summary after all nodes complete.
pub fn format_summary(report: &RunReport) -> String {
    let summary = &report.summary;
    let mut parts = Vec::new();

    if summary.passed > 0 {
        parts.push(format!("{} passed", summary.passed));
    }
    if summary.failed > 0 {
        parts.push(format!("{} failed", summary.failed));
    }
    if summary.errors > 0 {
        parts.push(format!("{} errors", summary.errors));
    }
    if summary.skipped > 0 {
        parts.push(format!("{} skipped", summary.skipped));
    }
    if summary.failed_dependency > 0 {
        parts.push(format!("{} blocked", summary.failed_dependency));
    }
    if summary.expected_failures > 0 {
        parts.push(format!("{} expected failures", summary.expected_failures));
    }
    if summary.unexpected_passes > 0 {
        parts.push(format!("{} unexpected passes", summary.unexpected_passes));
    }
    if summary.fixture_failures > 0 {
        parts.push(format!("{} fixture failures", summary.fixture_failures));
    }

    if parts.is_empty() {
        parts.push("0 tests".into());
    }

    let mut out = format!(
        "\nResults: {} ({:.1}s, peak concurrency {})",
        parts.join(", "),
        report.duration.as_secs_f64(),
        report.peak_concurrency
    );
    for err in &report.resource_errors {
        out.push_str(&format!("\n  warning: {err}"));
    }
    if report.state == EngineState::Deadlocked {
        out.push_str(&format!("\n  deadlocked; stalled nodes: {}", report.stalled.join(", ")));
    }
    out
}

/// Format the run header line.
pub fn format_run_header(suite: &str, nodes: usize, workers: usize) -> String {
    format!("Running {suite} ({nodes} nodes, {workers} workers)...\n")
}

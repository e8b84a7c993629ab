use serde::{Deserialize, Serialize};

use crate::runner::result::TeardownError;
use crate::runner::scheduler::RunReport;

/// Serializable run result for emitter output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuiteReport {
    pub suite: String,
    pub run: RunMetadata,
    pub results: Vec<NodeReport>,
    pub summary: SummaryReport,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resource_errors: Vec<TeardownError>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stalled: Vec<String>,
}

/// Metadata about the run execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunMetadata {
    pub state: String,
    pub workers: usize,
    pub peak_concurrency: usize,
    pub duration_ms: u64,
}

/// One node's terminal result in the report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeReport {
    pub order: usize,
    pub id: String,
    pub kind: String,
    pub scope: String,
    pub status: String,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorReport>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub teardown_errors: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdout: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,
}

/// Error detail in the report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorReport {
    pub kind: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Summary statistics in the report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SummaryReport {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub errors: usize,
    pub skipped: usize,
    pub failed_dependency: usize,
    #[serde(default)]
    pub expected_failures: usize,
    #[serde(default)]
    pub unexpected_passes: usize,
    pub fixture_failures: usize,
    pub success: bool,
}

/// Convert a [`RunReport`] into a serializable [`SuiteReport`].
pub fn to_report(suite: &str, report: &RunReport, workers: usize) -> SuiteReport {
    let results = report
        .results
        .iter()
        .enumerate()
        .map(|(i, r)| {
            let stream = |name: &str| {
                let text: String = r
                    .captured
                    .iter()
                    .filter(|(s, _)| s == name)
                    .map(|(_, t)| t.as_str())
                    .collect();
                (!text.is_empty()).then_some(text)
            };
            NodeReport {
                order: i + 1,
                id: r.id.clone(),
                kind: r.kind.to_string(),
                scope: r.scope.to_string(),
                status: r.status.to_string(),
                duration_ms: r.duration.as_millis() as u64,
                error: r.error.as_ref().map(|e| ErrorReport {
                    kind: e.kind.to_string(),
                    message: e.message.clone(),
                    detail: e.detail.clone(),
                }),
                teardown_errors: r.teardown_errors.iter().map(ToString::to_string).collect(),
                stdout: stream("stdout"),
                stderr: stream("stderr"),
            }
        })
        .collect();

    SuiteReport {
        suite: suite.to_owned(),
        run: RunMetadata {
            state: report.state.to_string(),
            workers,
            peak_concurrency: report.peak_concurrency,
            duration_ms: report.duration.as_millis() as u64,
        },
        results,
        summary: SummaryReport {
            total: report.summary.total,
            passed: report.summary.passed,
            failed: report.summary.failed,
            errors: report.summary.errors,
            skipped: report.summary.skipped,
            failed_dependency: report.summary.failed_dependency,
            expected_failures: report.summary.expected_failures,
            unexpected_passes: report.summary.unexpected_passes,
            fixture_failures: report.summary.fixture_failures,
            success: report.success(),
        },
        resource_errors: report.resource_errors.clone(),
        stalled: report.stalled.clone(),
    }
}

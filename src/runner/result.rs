use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::graph::node::{NodeKind, Scope};
use crate::runner::status::Status;

/// Why a node body or resource routine did not succeed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Failure {
    /// The code's own check did not hold. The node ends `failed`.
    #[error("{0}")]
    Assertion(String),
    /// Anything else went wrong. The node ends `error`.
    #[error("{0}")]
    Error(String),
}

impl Failure {
    pub fn assertion(message: impl Into<String>) -> Self {
        Self::Assertion(message.into())
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error(message.into())
    }

    /// `Ok(())` when `condition` holds, else an assertion failure.
    ///
    /// # Errors
    ///
    /// Returns [`Failure::Assertion`] carrying `message`.
    pub fn ensure(condition: bool, message: impl Into<String>) -> Result<(), Self> {
        if condition {
            Ok(())
        } else {
            Err(Self::assertion(message))
        }
    }

    pub fn message(&self) -> &str {
        match self {
            Self::Assertion(m) | Self::Error(m) => m,
        }
    }
}

impl From<std::io::Error> for Failure {
    fn from(e: std::io::Error) -> Self {
        Self::Error(e.to_string())
    }
}

/// Run user code, converting a panic into `Err(on_panic(message))`.
pub fn guarded<T>(
    f: impl FnOnce() -> Result<T, Failure>,
    on_panic: fn(String) -> Failure,
) -> Result<T, Failure> {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => result,
        Err(payload) => Err(on_panic(panic_message(payload.as_ref()))),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panicked".to_owned()
    }
}

/// Failures a test declares as its expected outcome.
///
/// A failure whose message contains one of `patterns` counts as a pass.
/// Any other failure keeps its own classification. Completing without a
/// failure is itself a failure unless `or_success` is set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Raises {
    pub patterns: Vec<String>,
    pub or_success: bool,
}

impl Raises {
    pub fn new<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            patterns: patterns.into_iter().map(Into::into).collect(),
            or_success: false,
        }
    }

    /// Also accept a body that completes normally.
    pub fn or_success(mut self) -> Self {
        self.or_success = true;
        self
    }

    pub fn matches(&self, failure: &Failure) -> bool {
        self.patterns.iter().any(|p| failure.message().contains(p.as_str()))
    }

    /// Reinterpret a body's outcome against the declared failures.
    ///
    /// # Errors
    ///
    /// Returns the original failure when it matches no pattern, or an
    /// assertion failure when the body completed but was required to fail.
    pub fn judge(&self, outcome: Result<(), Failure>) -> Result<(), Failure> {
        match outcome {
            Ok(()) if self.or_success => Ok(()),
            Ok(()) => {
                let expected: Vec<String> =
                    self.patterns.iter().map(|p| format!("'{p}'")).collect();
                Err(Failure::assertion(format!(
                    "completed, but expected a failure matching {}",
                    expected.join(" or ")
                )))
            }
            Err(failure) if self.matches(&failure) => Ok(()),
            Err(failure) => Err(failure),
        }
    }
}

/// Error detail for a node that did not pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{kind}: {message}")]
pub struct NodeError {
    pub kind: NodeErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl NodeError {
    pub fn new(kind: NodeErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// Classification of node errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeErrorKind {
    /// The body's own check failed.
    AssertionFailure,
    /// An unexpected error escaped the body.
    UnhandledError,
    /// A required resource could not be set up.
    ResourceSetUp,
    /// A gating prerequisite did not pass.
    FailedDependency,
}

impl fmt::Display for NodeErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AssertionFailure => write!(f, "assertion failed"),
            Self::UnhandledError => write!(f, "unhandled error"),
            Self::ResourceSetUp => write!(f, "resource set up failed"),
            Self::FailedDependency => write!(f, "failed dependency"),
        }
    }
}

/// A resource tear down that raised. Logged and attributed, never fatal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("tear down of {resource} failed: {message}")]
pub struct TeardownError {
    /// Display form of the resource descriptor.
    pub resource: String,
    /// The node whose release triggered the tear down, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node: Option<String>,
    pub message: String,
}

/// Terminal outcome of one node, emitted as the node finishes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeResult {
    pub id: String,
    pub kind: NodeKind,
    pub scope: Scope,
    pub status: Status,
    pub duration: Duration,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<NodeError>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub teardown_errors: Vec<TeardownError>,
    /// Output captured by the body, as `(stream, text)` pairs.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub captured: Vec<(String, String)>,
}

impl NodeResult {
    fn new(id: &str, kind: NodeKind, scope: Scope, status: Status) -> Self {
        Self {
            id: id.to_owned(),
            kind,
            scope,
            status,
            duration: Duration::ZERO,
            error: None,
            teardown_errors: Vec::new(),
            captured: Vec::new(),
        }
    }

    /// Create a passing result.
    pub fn passed(id: &str, kind: NodeKind, scope: Scope, duration: Duration) -> Self {
        Self {
            duration,
            ..Self::new(id, kind, scope, Status::Passed)
        }
    }

    /// Create a result for a body that returned an error.
    pub fn from_failure(
        id: &str,
        kind: NodeKind,
        scope: Scope,
        duration: Duration,
        failure: &Failure,
    ) -> Self {
        let (status, error_kind) = match failure {
            Failure::Assertion(_) => (Status::Failed, NodeErrorKind::AssertionFailure),
            Failure::Error(_) => (Status::Error, NodeErrorKind::UnhandledError),
        };
        Self {
            duration,
            error: Some(NodeError::new(error_kind, failure.message())),
            ..Self::new(id, kind, scope, status)
        }
    }

    /// Create an errored result with an explicit error.
    pub fn errored(
        id: &str,
        kind: NodeKind,
        scope: Scope,
        duration: Duration,
        error: NodeError,
    ) -> Self {
        Self {
            duration,
            error: Some(error),
            ..Self::new(id, kind, scope, Status::Error)
        }
    }

    /// Create a skipped result with zero duration.
    pub fn skipped(id: &str, kind: NodeKind, scope: Scope) -> Self {
        Self::new(id, kind, scope, Status::Skipped)
    }

    /// Create a result for a node blocked by `prerequisite`.
    pub fn failed_dependency(
        id: &str,
        kind: NodeKind,
        scope: Scope,
        prerequisite: &str,
        status: Status,
    ) -> Self {
        Self {
            error: Some(NodeError::new(
                NodeErrorKind::FailedDependency,
                format!("prerequisite '{prerequisite}' ended {status}"),
            )),
            ..Self::new(id, kind, scope, Status::FailedDependency)
        }
    }

    /// Reclassify the result of a test that is expected to fail: a failure
    /// becomes `expected-failure`, a pass becomes `unexpected-pass`.
    pub fn expecting_failure(mut self) -> Self {
        self.status = match self.status {
            Status::Passed => Status::UnexpectedPass,
            Status::Failed => Status::ExpectedFailure,
            other => other,
        };
        self
    }

    pub fn is_test(&self) -> bool {
        self.kind == NodeKind::Test
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn passed_constructor() {
        let r = NodeResult::passed("m.t", NodeKind::Test, Scope::Test, Duration::from_millis(120));
        assert_eq!(r.status, Status::Passed);
        assert_eq!(r.duration, Duration::from_millis(120));
        assert!(r.error.is_none());
        assert!(r.is_test());
    }

    #[test]
    fn assertion_failure_maps_to_failed() {
        let r = NodeResult::from_failure(
            "m.t",
            NodeKind::Test,
            Scope::Test,
            Duration::ZERO,
            &Failure::assertion("expected 2, got 3"),
        );
        assert_eq!(r.status, Status::Failed);
        let err = r.error.unwrap();
        assert_eq!(err.kind, NodeErrorKind::AssertionFailure);
        assert_eq!(err.to_string(), "assertion failed: expected 2, got 3");
    }

    #[test]
    fn error_maps_to_error() {
        let r = NodeResult::from_failure(
            "m.setUp",
            NodeKind::SetUp,
            Scope::Module,
            Duration::ZERO,
            &Failure::error("connection refused"),
        );
        assert_eq!(r.status, Status::Error);
        assert_eq!(r.error.unwrap().kind, NodeErrorKind::UnhandledError);
    }

    #[test]
    fn failed_dependency_names_prerequisite() {
        let r = NodeResult::failed_dependency(
            "m.t",
            NodeKind::Test,
            Scope::Test,
            "m.setUp",
            Status::Error,
        );
        assert_eq!(r.status, Status::FailedDependency);
        assert_eq!(r.duration, Duration::ZERO);
        assert_eq!(r.error.unwrap().message, "prerequisite 'm.setUp' ended error");
    }

    #[test]
    fn skipped_has_zero_duration() {
        let r = NodeResult::skipped("m.t", NodeKind::Test, Scope::Test);
        assert_eq!(r.status, Status::Skipped);
        assert_eq!(r.duration, Duration::ZERO);
    }

    #[test]
    fn ensure_helper() {
        assert!(Failure::ensure(true, "never").is_ok());
        assert_eq!(
            Failure::ensure(false, "value mismatch"),
            Err(Failure::Assertion("value mismatch".into()))
        );
    }

    #[test]
    fn guarded_catches_panics() {
        let outcome: Result<(), Failure> = guarded(|| panic!("boom"), Failure::Assertion);
        assert_eq!(outcome, Err(Failure::Assertion("boom".into())));

        let formatted: Result<(), Failure> = guarded(|| panic!("code {}", 7), Failure::Error);
        assert_eq!(formatted, Err(Failure::Error("code 7".into())));
    }

    #[test]
    fn guarded_passes_through_results() {
        assert_eq!(guarded(|| Ok(5), Failure::Error), Ok(5));
        assert_eq!(
            guarded::<()>(|| Err(Failure::error("x")), Failure::Assertion),
            Err(Failure::Error("x".into()))
        );
    }

    #[test]
    fn io_errors_become_unhandled() {
        let io = std::io::Error::other("disk full");
        assert_eq!(Failure::from(io), Failure::Error("disk full".into()));
    }

    #[test]
    fn teardown_error_display() {
        let err = TeardownError {
            resource: "db()".into(),
            node: Some("m.t".into()),
            message: "socket closed".into(),
        };
        assert_eq!(err.to_string(), "tear down of db() failed: socket closed");
    }

    #[test]
    fn raises_accepts_matching_failures() {
        let raises = Raises::new(["connection refused", "timed out"]);
        assert_eq!(raises.judge(Err(Failure::error("dial: connection refused"))), Ok(()));
        assert_eq!(raises.judge(Err(Failure::assertion("read timed out"))), Ok(()));
    }

    #[test]
    fn raises_keeps_unmatched_classification() {
        let raises = Raises::new(["connection refused"]);
        assert_eq!(
            raises.judge(Err(Failure::error("disk full"))),
            Err(Failure::error("disk full"))
        );
        assert_eq!(
            raises.judge(Err(Failure::assertion("1 != 2"))),
            Err(Failure::assertion("1 != 2"))
        );
    }

    #[test]
    fn raises_requires_a_failure_unless_success_allowed() {
        let raises = Raises::new(["boom"]);
        let err = raises.judge(Ok(())).unwrap_err();
        assert_eq!(
            err,
            Failure::assertion("completed, but expected a failure matching 'boom'")
        );
        assert_eq!(raises.or_success().judge(Ok(())), Ok(()));
    }

    #[test]
    fn expected_failure_reclassifies_outcomes() {
        let d = Duration::from_millis(5);
        let passed = NodeResult::passed("m.t", NodeKind::Test, Scope::Test, d);
        assert_eq!(passed.expecting_failure().status, Status::UnexpectedPass);

        let failed = NodeResult::from_failure(
            "m.t",
            NodeKind::Test,
            Scope::Test,
            d,
            &Failure::assertion("known bug"),
        );
        let xfail = failed.expecting_failure();
        assert_eq!(xfail.status, Status::ExpectedFailure);
        assert_eq!(xfail.error.unwrap().message, "known bug");

        let errored = NodeResult::from_failure(
            "m.t",
            NodeKind::Test,
            Scope::Test,
            d,
            &Failure::error("crash"),
        );
        assert_eq!(errored.expecting_failure().status, Status::Error);
    }
}

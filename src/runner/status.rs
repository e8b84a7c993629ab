//! Node statuses and the rules that derive a dependent's eligibility from
//! its prerequisites.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::graph::node::EdgeKind;

/// Lifecycle state of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Status {
    Pending,
    Running,
    Passed,
    Failed,
    Error,
    Skipped,
    FailedDependency,
    /// A test expected to fail did fail. Gates like `failed`.
    ExpectedFailure,
    /// A test expected to fail passed. Gates like `passed`.
    UnexpectedPass,
}

impl Status {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending | Self::Running)
    }

    /// Failed, errored, or blocked by a failed prerequisite. Expected
    /// failures do not count.
    pub fn is_failure(self) -> bool {
        matches!(self, Self::Failed | Self::Error | Self::FailedDependency)
    }

    /// Whether a gating edge from a node with this status satisfies its
    /// dependent.
    pub fn is_pass(self) -> bool {
        matches!(self, Self::Passed | Self::UnexpectedPass)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Passed => write!(f, "passed"),
            Self::Failed => write!(f, "failed"),
            Self::Error => write!(f, "error"),
            Self::Skipped => write!(f, "skipped"),
            Self::FailedDependency => write!(f, "failed-dependency"),
            Self::ExpectedFailure => write!(f, "expected-failure"),
            Self::UnexpectedPass => write!(f, "unexpected-pass"),
        }
    }
}

/// How a skipped prerequisite affects nodes gated on it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipPropagation {
    /// Gated dependents end `failed-dependency`.
    #[default]
    FailDependents,
    /// Gated dependents end `skipped`.
    SkipDependents,
    /// A skipped prerequisite counts as satisfied.
    Ignore,
}

/// What to do with a node once its prerequisites are known.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// At least one prerequisite is not terminal yet.
    Waiting,
    Ready,
    /// Terminate without running, naming the prerequisite responsible.
    Blocked { status: Status, cause: usize },
}

/// Derive a node's eligibility from `(status, edge)` pairs for each of its
/// prerequisites. `cause` in [`Verdict::Blocked`] is the position of the
/// blocking prerequisite in the input.
///
/// A failing gate takes precedence over a skipped one.
pub fn evaluate<I>(prerequisites: I, policy: SkipPropagation) -> Verdict
where
    I: IntoIterator<Item = (Status, EdgeKind)>,
{
    let mut skipped_gate = None;
    let mut failed_gate = None;

    for (pos, (status, edge)) in prerequisites.into_iter().enumerate() {
        if !status.is_terminal() {
            return Verdict::Waiting;
        }
        if !edge.is_gating() {
            continue;
        }
        match status {
            Status::Skipped => {
                skipped_gate.get_or_insert(pos);
            }
            status if !status.is_pass() => {
                failed_gate.get_or_insert(pos);
            }
            _ => {}
        }
    }

    if let Some(cause) = failed_gate {
        return Verdict::Blocked {
            status: Status::FailedDependency,
            cause,
        };
    }
    match (skipped_gate, policy) {
        (Some(cause), SkipPropagation::FailDependents) => Verdict::Blocked {
            status: Status::FailedDependency,
            cause,
        },
        (Some(cause), SkipPropagation::SkipDependents) => Verdict::Blocked {
            status: Status::Skipped,
            cause,
        },
        _ => Verdict::Ready,
    }
}

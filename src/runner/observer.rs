use parking_lot::Mutex;

use crate::graph::node::{NodeKind, Scope};
use crate::runner::result::NodeResult;
use crate::runner::status::Status;

/// Receives node events as a run progresses.
///
/// Callbacks arrive from worker threads, never while the scheduler lock is
/// held. `node_finished` is called exactly once per node that reaches a
/// terminal state, including nodes that never ran.
pub trait RunObserver: Send + Sync {
    fn node_started(&self, _id: &str, _kind: NodeKind, _scope: Scope) {}

    fn node_finished(&self, result: &NodeResult);
}

/// Ignores every event.
pub struct NoopObserver;

impl RunObserver for NoopObserver {
    fn node_finished(&self, _result: &NodeResult) {}
}

/// A recorded observer event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Started(String),
    Finished(String, Status),
}

/// Records events in arrival order.
#[derive(Default)]
pub struct RecordingObserver {
    events: Mutex<Vec<Event>>,
}

impl RecordingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    /// Position of the first event matching `event`.
    pub fn position(&self, event: &Event) -> Option<usize> {
        self.events.lock().iter().position(|e| e == event)
    }

    pub fn started(&self, id: &str) -> Option<usize> {
        self.position(&Event::Started(id.to_owned()))
    }

    /// Position of the finish event for `id`, whatever its status.
    pub fn finished(&self, id: &str) -> Option<usize> {
        self.events
            .lock()
            .iter()
            .position(|e| matches!(e, Event::Finished(other, _) if other == id))
    }
}

impl RunObserver for RecordingObserver {
    fn node_started(&self, id: &str, _kind: NodeKind, _scope: Scope) {
        self.events.lock().push(Event::Started(id.to_owned()));
    }

    fn node_finished(&self, result: &NodeResult) {
        self.events.lock().push(Event::Finished(result.id.clone(), result.status));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn recording_keeps_order() {
        let obs = RecordingObserver::new();
        obs.node_started("a", NodeKind::Test, Scope::Test);
        obs.node_finished(&NodeResult::passed("a", NodeKind::Test, Scope::Test, Duration::ZERO));
        obs.node_finished(&NodeResult::skipped("b", NodeKind::Test, Scope::Test));

        assert_eq!(obs.started("a"), Some(0));
        assert_eq!(obs.finished("a"), Some(1));
        assert_eq!(obs.finished("b"), Some(2));
        assert_eq!(obs.started("b"), None);
        assert_eq!(obs.events()[2], Event::Finished("b".into(), Status::Skipped));
    }
}

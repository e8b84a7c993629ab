use std::cell::RefCell;

use crate::graph::node::{NodeKind, Scope};
use crate::resource::ResourceError;
use crate::resource::handle::ResourceHandle;

/// What a node body sees while it runs.
///
/// Holds the handles of the node's declared resources, bound to their
/// parameter names, and any output the body chooses to capture.
pub struct NodeContext<'a> {
    pub id: &'a str,
    pub kind: NodeKind,
    pub scope: Scope,
    resources: Vec<(String, ResourceHandle)>,
    captured: RefCell<Vec<(String, String)>>,
}

impl<'a> NodeContext<'a> {
    /// Create a context with resources bound in declaration order.
    pub fn new(
        id: &'a str,
        kind: NodeKind,
        scope: Scope,
        resources: Vec<(String, ResourceHandle)>,
    ) -> Self {
        Self {
            id,
            kind,
            scope,
            resources,
            captured: RefCell::new(Vec::new()),
        }
    }

    /// Look up the handle bound to `param`.
    ///
    /// # Errors
    ///
    /// Returns [`ResourceError::Unbound`] if the node declared no such
    /// parameter.
    pub fn resource(&self, param: &str) -> Result<&ResourceHandle, ResourceError> {
        self.resources
            .iter()
            .find(|(name, _)| name == param)
            .map(|(_, handle)| handle)
            .ok_or_else(|| ResourceError::Unbound(param.to_owned()))
    }

    /// Bound parameters and their handles, in declaration order.
    pub fn resources(&self) -> impl Iterator<Item = (&str, &ResourceHandle)> {
        self.resources.iter().map(|(name, handle)| (name.as_str(), handle))
    }

    /// Attach output to the node's result, e.g. `("stdout", text)`.
    pub fn capture(&self, stream: impl Into<String>, text: impl Into<String>) {
        let text = text.into();
        if !text.is_empty() {
            self.captured.borrow_mut().push((stream.into(), text));
        }
    }

    /// Give back the handles for release, plus the captured output.
    pub(crate) fn finish(self) -> (Vec<ResourceHandle>, Vec<(String, String)>) {
        let handles = self.resources.into_iter().map(|(_, handle)| handle).collect();
        (handles, self.captured.into_inner())
    }
}

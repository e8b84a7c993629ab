//! Shared, possibly stateful objects that tests request by declaration.
//!
//! A [`Resource`] describes how to build and dispose of an object; the
//! [`pool::ResourcePool`] caches built objects per
//! [`descriptor::ResourceDescriptor`] and hands each to one test at a time
//! through a [`handle::ResourceHandle`].

pub mod descriptor;
pub mod handle;
pub mod pool;

use std::any::Any;
use std::collections::BTreeMap;

use thiserror::Error;

use crate::runner::result::Failure;
use crate::runner::status::Status;

/// A live resource object. Concrete types are recovered by downcasting
/// through the handle accessors.
pub type ResourceObject = Box<dyn Any + Send>;

/// A kind of resource: the set up / tear down contract plus reuse policy.
pub trait Resource: Send + Sync {
    /// Class name. Descriptors share cached instances only when they agree
    /// on the name, the implementing type, and the options, so two
    /// differently typed resources may reuse a name without colliding.
    fn name(&self) -> &str;

    /// Build a new object from the descriptor's options.
    ///
    /// # Errors
    ///
    /// Any failure makes the acquiring node end `error`.
    fn set_up(
        &self,
        args: &[String],
        options: &BTreeMap<String, String>,
    ) -> Result<ResourceObject, Failure>;

    /// Dispose of an object. `status` is the terminal status of the test that
    /// used it last, or `None` when the object is reclaimed after demand ran
    /// out.
    ///
    /// # Errors
    ///
    /// Failures are logged and attributed, never fatal.
    fn tear_down(&self, object: ResourceObject, status: Option<Status>) -> Result<(), Failure> {
        let _ = (object, status);
        Ok(())
    }

    /// Discard every instance after a single use.
    fn oneshot(&self) -> bool {
        false
    }

    /// Methods that dirty the object when invoked through the handle.
    fn dirty_methods(&self) -> &[&str] {
        &[]
    }
}

/// Errors from acquiring or using a resource.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResourceError {
    #[error("set up of {resource} failed: {message}")]
    SetUp { resource: String, message: String },
    #[error("resource {resource} does not hold a {expected}")]
    TypeMismatch { resource: String, expected: &'static str },
    #[error("no resource bound to parameter '{0}'")]
    Unbound(String),
}

impl From<ResourceError> for Failure {
    fn from(e: ResourceError) -> Self {
        Self::Error(e.to_string())
    }
}

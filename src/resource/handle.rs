use std::any::type_name;
use std::cell::{Cell, RefCell};

use crate::resource::descriptor::ResourceDescriptor;
use crate::resource::{ResourceError, ResourceObject};

/// The view of a pooled resource object that a node receives.
///
/// The handle owns the object for the duration of one node and forwards
/// access to it while tracking whether the access may have changed it:
///
/// - [`read`](Self::read) never dirties;
/// - [`write`](Self::write) dirties unless inside [`clean_access`](Self::clean_access);
/// - [`invoke`](Self::invoke) dirties when the named method is one of the
///   resource's `dirty_methods`, again unless inside a clean-access scope;
/// - [`raw`](Self::raw) is never tracked. It exists for operator-style use
///   and anything else the accessors cannot express; callers using it take
///   responsibility for calling [`mark_dirty`](Self::mark_dirty).
///
/// Accessor closures must not re-enter accessors on the same handle.
pub struct ResourceHandle {
    descriptor: ResourceDescriptor,
    instance: u64,
    object: RefCell<ResourceObject>,
    dirty: Cell<bool>,
    clean_depth: Cell<usize>,
}

impl ResourceHandle {
    pub(crate) fn new(
        descriptor: ResourceDescriptor,
        instance: u64,
        object: ResourceObject,
    ) -> Self {
        Self {
            descriptor,
            instance,
            object: RefCell::new(object),
            dirty: Cell::new(false),
            clean_depth: Cell::new(0),
        }
    }

    pub fn descriptor(&self) -> &ResourceDescriptor {
        &self.descriptor
    }

    /// Pool-assigned identity of the underlying instance.
    pub fn instance_id(&self) -> u64 {
        self.instance
    }

    /// Read the object without affecting its dirty flag.
    ///
    /// # Errors
    ///
    /// Returns [`ResourceError::TypeMismatch`] if the object is not a `T`.
    pub fn read<T: 'static, R>(&self, f: impl FnOnce(&T) -> R) -> Result<R, ResourceError> {
        let object = self.object.borrow();
        let value = object.downcast_ref::<T>().ok_or_else(|| self.mismatch::<T>())?;
        Ok(f(value))
    }

    /// Mutate the object. Marks it dirty unless a clean-access scope is open.
    ///
    /// # Errors
    ///
    /// Returns [`ResourceError::TypeMismatch`] if the object is not a `T`.
    pub fn write<T: 'static, R>(&self, f: impl FnOnce(&mut T) -> R) -> Result<R, ResourceError> {
        let result = self.raw(f)?;
        self.touch();
        Ok(result)
    }

    /// Call `method` on the object. Marks it dirty if the resource lists
    /// `method` among its dirtying methods and no clean-access scope is open.
    ///
    /// # Errors
    ///
    /// Returns [`ResourceError::TypeMismatch`] if the object is not a `T`.
    pub fn invoke<T: 'static, R>(
        &self,
        method: &str,
        f: impl FnOnce(&mut T) -> R,
    ) -> Result<R, ResourceError> {
        let result = self.raw(f)?;
        if self.descriptor.resource().dirty_methods().contains(&method) {
            self.touch();
        }
        Ok(result)
    }

    /// Untracked mutable access to the underlying object.
    ///
    /// # Errors
    ///
    /// Returns [`ResourceError::TypeMismatch`] if the object is not a `T`.
    pub fn raw<T: 'static, R>(&self, f: impl FnOnce(&mut T) -> R) -> Result<R, ResourceError> {
        let mut object = self.object.borrow_mut();
        let value = object.downcast_mut::<T>().ok_or_else(|| self.mismatch::<T>())?;
        Ok(f(value))
    }

    /// Force the object to be discarded on release.
    pub fn mark_dirty(&self) {
        self.dirty.set(true);
    }

    /// Declare the object reusable again.
    pub fn mark_clean(&self) {
        self.dirty.set(false);
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.get()
    }

    /// Suspend dirty tracking until the returned guard drops. Scopes nest.
    pub fn clean_access(&self) -> CleanAccess<'_> {
        self.clean_depth.set(self.clean_depth.get() + 1);
        CleanAccess { handle: self }
    }

    pub fn in_clean_access(&self) -> bool {
        self.clean_depth.get() > 0
    }

    fn touch(&self) {
        if !self.in_clean_access() {
            self.dirty.set(true);
        }
    }

    fn mismatch<T>(&self) -> ResourceError {
        ResourceError::TypeMismatch {
            resource: self.descriptor.to_string(),
            expected: type_name::<T>(),
        }
    }

    pub(crate) fn into_parts(self) -> (ResourceDescriptor, u64, ResourceObject, bool) {
        let dirty = self.dirty.get();
        (self.descriptor, self.instance, self.object.into_inner(), dirty)
    }
}

impl std::fmt::Debug for ResourceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceHandle")
            .field("descriptor", &self.descriptor)
            .field("instance", &self.instance)
            .field("dirty", &self.dirty.get())
            .field("clean_depth", &self.clean_depth.get())
            .finish_non_exhaustive()
    }
}

/// Guard returned by [`ResourceHandle::clean_access`].
///
/// Dropping it, on any exit path, closes one level of the scope.
#[must_use = "dirty tracking resumes as soon as the guard is dropped"]
pub struct CleanAccess<'a> {
    handle: &'a ResourceHandle,
}

impl Drop for CleanAccess<'_> {
    fn drop(&mut self) {
        let depth = &self.handle.clean_depth;
        depth.set(depth.get().saturating_sub(1));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::Arc;

    use crate::resource::Resource;
    use crate::runner::result::Failure;

    struct Counter;

    impl Resource for Counter {
        fn name(&self) -> &str {
            "counter"
        }

        fn set_up(
            &self,
            _args: &[String],
            _options: &BTreeMap<String, String>,
        ) -> Result<ResourceObject, Failure> {
            Ok(Box::new(Vec::<u32>::new()))
        }

        fn dirty_methods(&self) -> &[&str] {
            &["push", "clear"]
        }
    }

    fn handle() -> ResourceHandle {
        let descriptor = ResourceDescriptor::new(Arc::new(Counter));
        ResourceHandle::new(descriptor, 1, Box::new(vec![1u32, 2, 3]))
    }

    #[test]
    fn read_does_not_dirty() {
        let h = handle();
        let len = h.read(|v: &Vec<u32>| v.len()).unwrap();
        assert_eq!(len, 3);
        assert!(!h.is_dirty());
    }

    #[test]
    fn write_dirties() {
        let h = handle();
        h.write(|v: &mut Vec<u32>| v.push(4)).unwrap();
        assert!(h.is_dirty());
        assert_eq!(h.read(|v: &Vec<u32>| v.len()).unwrap(), 4);
    }

    #[test]
    fn invoke_dirties_only_listed_methods() {
        let h = handle();
        let first = h.invoke("first", |v: &mut Vec<u32>| v.first().copied()).unwrap();
        assert_eq!(first, Some(1));
        assert!(!h.is_dirty());

        h.invoke("clear", |v: &mut Vec<u32>| v.clear()).unwrap();
        assert!(h.is_dirty());
    }

    #[test]
    fn raw_is_untracked() {
        let h = handle();
        h.raw(|v: &mut Vec<u32>| v.push(9)).unwrap();
        assert!(!h.is_dirty());
    }

    #[test]
    fn clean_access_suppresses_tracking() {
        let h = handle();
        {
            let _scope = h.clean_access();
            h.write(|v: &mut Vec<u32>| v.push(4)).unwrap();
            h.invoke("push", |v: &mut Vec<u32>| v.push(5)).unwrap();
        }
        assert!(!h.is_dirty());
        h.write(|v: &mut Vec<u32>| v.pop()).unwrap();
        assert!(h.is_dirty());
    }

    #[test]
    fn clean_access_is_reentrant() {
        let h = handle();
        let outer = h.clean_access();
        {
            let _inner = h.clean_access();
            assert!(h.in_clean_access());
        }
        assert!(h.in_clean_access());
        h.write(|v: &mut Vec<u32>| v.push(1)).unwrap();
        assert!(!h.is_dirty());
        drop(outer);
        assert!(!h.in_clean_access());
    }

    #[test]
    fn clean_access_released_on_unwind() {
        let h = handle();
        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _scope = h.clean_access();
            panic!("inside scope");
        }));
        assert!(outcome.is_err());
        assert!(!h.in_clean_access());
    }

    #[test]
    fn explicit_marks_override_scope() {
        let h = handle();
        {
            let _scope = h.clean_access();
            h.mark_dirty();
        }
        assert!(h.is_dirty());
        h.mark_clean();
        assert!(!h.is_dirty());
    }

    #[test]
    fn wrong_type_is_reported() {
        let h = handle();
        let err = h.read(|s: &String| s.len()).unwrap_err();
        assert!(matches!(err, ResourceError::TypeMismatch { .. }));
        assert!(err.to_string().contains("counter()"));
    }

    #[test]
    fn into_parts_carries_dirty_flag() {
        let h = handle();
        h.mark_dirty();
        let (descriptor, id, object, dirty) = h.into_parts();
        assert_eq!(descriptor.key().class, "counter");
        assert_eq!(id, 1);
        assert!(dirty);
        assert!(object.downcast_ref::<Vec<u32>>().is_some());
    }
}

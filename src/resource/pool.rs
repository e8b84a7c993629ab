use std::collections::HashMap;
use std::thread::{self, ThreadId};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use crate::resource::descriptor::{ResourceDescriptor, ResourceKey};
use crate::resource::handle::ResourceHandle;
use crate::resource::{ResourceError, ResourceObject};
use crate::runner::result::{Failure, TeardownError, guarded};
use crate::runner::status::Status;

/// One cached instance. `object` is `None` while a handle holds it.
struct Slot {
    id: u64,
    object: Option<ResourceObject>,
    holder: Option<ThreadId>,
}

struct Entry {
    descriptor: ResourceDescriptor,
    slots: Vec<Slot>,
    /// Instances currently being set up, counted against the cap.
    reserved: usize,
    /// Declared users that have not acquired yet.
    pending: usize,
}

impl Entry {
    fn new(descriptor: &ResourceDescriptor) -> Self {
        Self {
            descriptor: descriptor.clone(),
            slots: Vec::new(),
            reserved: 0,
            pending: 0,
        }
    }

    fn take_free(&mut self) -> Vec<ResourceObject> {
        let mut free = Vec::new();
        self.slots.retain_mut(|slot| match slot.object.take() {
            Some(object) => {
                free.push(object);
                false
            }
            None => true,
        });
        free
    }

    fn live(&self) -> usize {
        self.slots.len() + self.reserved
    }
}

#[derive(Default)]
struct PoolState {
    entries: HashMap<ResourceKey, Entry>,
    next_id: u64,
}

impl PoolState {
    fn entry(&mut self, descriptor: &ResourceDescriptor) -> &mut Entry {
        self.entries
            .entry(descriptor.key().clone())
            .or_insert_with(|| Entry::new(descriptor))
    }
}

/// Objects scheduled for tear down, with the status forwarded to it.
type Doomed = Vec<(ResourceObject, Option<Status>)>;

/// Cache of live resource instances keyed by descriptor.
///
/// Each instance is held by at most one handle at a time. Set up and tear
/// down always run with the pool lock released.
pub struct ResourcePool {
    state: Mutex<PoolState>,
    released: Condvar,
    max_instances: Option<usize>,
}

impl Default for ResourcePool {
    fn default() -> Self {
        Self::new(None)
    }
}

impl ResourcePool {
    /// `max_instances` caps live instances per descriptor. `None` means a
    /// new instance is built whenever no free one exists.
    pub fn new(max_instances: Option<usize>) -> Self {
        Self {
            state: Mutex::new(PoolState::default()),
            released: Condvar::new(),
            max_instances: max_instances.map(|n| n.max(1)),
        }
    }

    /// Record one more node that will acquire `descriptor` during the run.
    pub fn register_user(&self, descriptor: &ResourceDescriptor) {
        self.state.lock().entry(descriptor).pending += 1;
    }

    /// Withdraw a registered user that will never acquire. Tears down free
    /// instances once no users remain.
    pub fn forgo(&self, descriptor: &ResourceDescriptor) -> Vec<TeardownError> {
        let doomed = {
            let mut state = self.state.lock();
            let entry = state.entry(descriptor);
            entry.pending = entry.pending.saturating_sub(1);
            if entry.pending == 0 {
                unused(entry)
            } else {
                Vec::new()
            }
        };
        tear_down(descriptor, doomed)
    }

    /// Hand out a free instance of `descriptor`, building one if none is
    /// free. Blocks while the instance cap is reached, unless the calling
    /// thread already holds an instance of `descriptor`; the cap may then be
    /// exceeded.
    ///
    /// # Errors
    ///
    /// Returns [`ResourceError::SetUp`] if a new instance could not be built.
    /// Nothing is cached in that case.
    pub fn acquire(
        &self,
        descriptor: &ResourceDescriptor,
    ) -> Result<ResourceHandle, ResourceError> {
        let holder = thread::current().id();
        let mut state = self.state.lock();
        loop {
            let entry = state.entry(descriptor);
            let free = entry.slots.iter_mut().find_map(|slot| {
                let object = slot.object.take()?;
                slot.holder = Some(holder);
                Some((slot.id, object))
            });
            if let Some((id, object)) = free {
                entry.pending = entry.pending.saturating_sub(1);
                debug!(resource = %descriptor, instance = id, "reusing instance");
                return Ok(ResourceHandle::new(descriptor.clone(), id, object));
            }
            // A thread already holding an instance would wait on itself.
            let holds_one = entry.slots.iter().any(|slot| slot.holder == Some(holder));
            if !holds_one && self.max_instances.is_some_and(|max| entry.live() >= max) {
                debug!(resource = %descriptor, "instance cap reached, waiting");
                self.released.wait(&mut state);
                continue;
            }
            entry.reserved += 1;
            break;
        }
        let id = state.next_id;
        state.next_id += 1;
        drop(state);

        let key = descriptor.key();
        let outcome =
            guarded(|| descriptor.resource().set_up(&key.args, &key.options), Failure::Error);

        let mut state = self.state.lock();
        let entry = state.entry(descriptor);
        entry.reserved -= 1;
        entry.pending = entry.pending.saturating_sub(1);
        match outcome {
            Ok(object) => {
                entry.slots.push(Slot {
                    id,
                    object: None,
                    holder: Some(holder),
                });
                debug!(resource = %descriptor, instance = id, "set up new instance");
                Ok(ResourceHandle::new(descriptor.clone(), id, object))
            }
            Err(failure) => {
                drop(state);
                self.released.notify_all();
                Err(ResourceError::SetUp {
                    resource: descriptor.to_string(),
                    message: failure.message().to_owned(),
                })
            }
        }
    }

    /// Return a handle after the node using it ended with `status`.
    ///
    /// Dirty and oneshot instances are torn down with `Some(status)`.
    /// Clean ones go back to the free list, and are torn down with `None`
    /// once no registered users remain.
    pub fn release(&self, handle: ResourceHandle, status: Status) -> Vec<TeardownError> {
        let (descriptor, id, object, dirty) = handle.into_parts();
        let discard = dirty || descriptor.oneshot();
        let doomed = {
            let mut state = self.state.lock();
            let entry = state.entry(&descriptor);
            let position = entry.slots.iter().position(|slot| slot.id == id);
            let mut doomed: Doomed = Vec::new();
            match position {
                Some(pos) if !discard => {
                    let slot = &mut entry.slots[pos];
                    slot.object = Some(object);
                    slot.holder = None;
                }
                Some(pos) => {
                    entry.slots.remove(pos);
                    doomed.push((object, Some(status)));
                }
                None => doomed.push((object, Some(status))),
            }
            if entry.pending == 0 {
                doomed.extend(unused(entry));
            }
            doomed
        };
        self.released.notify_all();
        if discard {
            debug!(resource = %descriptor, instance = id, dirty, "discarding instance");
        }
        tear_down(&descriptor, doomed)
    }

    /// Tear down every cached instance with status `None`.
    pub fn close(&self) -> Vec<TeardownError> {
        let drained: Vec<(ResourceDescriptor, Doomed)> = {
            let mut state = self.state.lock();
            state
                .entries
                .drain()
                .map(|(_, mut entry)| {
                    let doomed = unused(&mut entry);
                    if !entry.slots.is_empty() {
                        warn!(
                            resource = %entry.descriptor,
                            held = entry.slots.len(),
                            "closing pool with held instances"
                        );
                    }
                    (entry.descriptor, doomed)
                })
                .collect()
        };
        self.released.notify_all();
        drained
            .into_iter()
            .flat_map(|(descriptor, doomed)| tear_down(&descriptor, doomed))
            .collect()
    }

    /// Live instances of `descriptor`, held or free.
    pub fn instance_count(&self, descriptor: &ResourceDescriptor) -> usize {
        self.state
            .lock()
            .entries
            .get(descriptor.key())
            .map_or(0, |entry| entry.slots.len())
    }

    pub fn pending_users(&self, descriptor: &ResourceDescriptor) -> usize {
        self.state.lock().entries.get(descriptor.key()).map_or(0, |entry| entry.pending)
    }

    /// Threads currently holding an instance of `descriptor`.
    pub fn holders(&self, descriptor: &ResourceDescriptor) -> Vec<ThreadId> {
        self.state
            .lock()
            .entries
            .get(descriptor.key())
            .map(|entry| entry.slots.iter().filter_map(|slot| slot.holder).collect())
            .unwrap_or_default()
    }
}

fn unused(entry: &mut Entry) -> Doomed {
    entry.take_free().into_iter().map(|object| (object, None)).collect()
}

fn tear_down(descriptor: &ResourceDescriptor, doomed: Doomed) -> Vec<TeardownError> {
    doomed
        .into_iter()
        .filter_map(|(object, status)| {
            let outcome =
                guarded(|| descriptor.resource().tear_down(object, status), Failure::Error);
            match outcome {
                Ok(()) => {
                    debug!(resource = %descriptor, ?status, "tore down instance");
                    None
                }
                Err(failure) => {
                    warn!(resource = %descriptor, error = failure.message(), "tear down failed");
                    Some(TeardownError {
                        resource: descriptor.to_string(),
                        node: None,
                        message: failure.message().to_owned(),
                    })
                }
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    use crate::resource::Resource;

    #[derive(Default)]
    struct Tracked {
        oneshot: bool,
        fail_set_up: bool,
        fail_tear_down: bool,
        set_ups: AtomicUsize,
        tear_downs: parking_lot::Mutex<Vec<Option<Status>>>,
    }

    impl Resource for Tracked {
        fn name(&self) -> &str {
            "tracked"
        }

        fn set_up(
            &self,
            args: &[String],
            _options: &BTreeMap<String, String>,
        ) -> Result<ResourceObject, Failure> {
            if self.fail_set_up {
                return Err(Failure::error("no connection"));
            }
            let n = self.set_ups.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(format!("{}#{n}", args.join(","))))
        }

        fn tear_down(
            &self,
            _object: ResourceObject,
            status: Option<Status>,
        ) -> Result<(), Failure> {
            self.tear_downs.lock().push(status);
            if self.fail_tear_down {
                return Err(Failure::error("socket closed"));
            }
            Ok(())
        }

        fn oneshot(&self) -> bool {
            self.oneshot
        }
    }

    fn tracked(resource: Tracked) -> (Arc<Tracked>, ResourceDescriptor) {
        let resource = Arc::new(resource);
        let descriptor = ResourceDescriptor::new(resource.clone());
        (resource, descriptor)
    }

    #[test]
    fn clean_instance_is_reused_then_reclaimed() {
        let (res, desc) = tracked(Tracked::default());
        let pool = ResourcePool::default();
        pool.register_user(&desc);
        pool.register_user(&desc);

        let first = pool.acquire(&desc).unwrap();
        let id = first.instance_id();
        assert!(pool.release(first, Status::Passed).is_empty());
        assert_eq!(pool.instance_count(&desc), 1);
        assert!(res.tear_downs.lock().is_empty());

        let second = pool.acquire(&desc).unwrap();
        assert_eq!(second.instance_id(), id);
        assert!(pool.release(second, Status::Passed).is_empty());

        assert_eq!(res.set_ups.load(Ordering::SeqCst), 1);
        assert_eq!(*res.tear_downs.lock(), vec![None]);
        assert_eq!(pool.instance_count(&desc), 0);
    }

    #[test]
    fn dirty_instance_is_discarded_with_status() {
        let (res, desc) = tracked(Tracked::default());
        let pool = ResourcePool::default();
        pool.register_user(&desc);
        pool.register_user(&desc);

        let handle = pool.acquire(&desc).unwrap();
        let id = handle.instance_id();
        handle.write(|s: &mut String| s.push('!')).unwrap();
        pool.release(handle, Status::Failed);
        assert_eq!(*res.tear_downs.lock(), vec![Some(Status::Failed)]);
        assert_eq!(pool.instance_count(&desc), 0);

        let fresh = pool.acquire(&desc).unwrap();
        assert_ne!(fresh.instance_id(), id);
        assert_eq!(res.set_ups.load(Ordering::SeqCst), 2);
        pool.release(fresh, Status::Passed);
    }

    #[test]
    fn oneshot_receives_real_status() {
        let (res, desc) = tracked(Tracked {
            oneshot: true,
            ..Tracked::default()
        });
        let pool = ResourcePool::default();
        pool.register_user(&desc);
        pool.register_user(&desc);

        let handle = pool.acquire(&desc).unwrap();
        pool.release(handle, Status::Passed);
        let handle = pool.acquire(&desc).unwrap();
        pool.release(handle, Status::Error);

        assert_eq!(res.set_ups.load(Ordering::SeqCst), 2);
        assert_eq!(*res.tear_downs.lock(), vec![Some(Status::Passed), Some(Status::Error)]);
    }

    #[test]
    fn set_up_failure_caches_nothing() {
        let (_res, desc) = tracked(Tracked {
            fail_set_up: true,
            ..Tracked::default()
        });
        let pool = ResourcePool::default();
        pool.register_user(&desc);

        let err = pool.acquire(&desc).unwrap_err();
        assert_eq!(
            err,
            ResourceError::SetUp {
                resource: "tracked()".into(),
                message: "no connection".into()
            }
        );
        assert_eq!(pool.instance_count(&desc), 0);
        assert_eq!(pool.pending_users(&desc), 0);
    }

    struct Exploding;

    impl Resource for Exploding {
        fn name(&self) -> &str {
            "exploding"
        }

        fn set_up(
            &self,
            _args: &[String],
            _options: &BTreeMap<String, String>,
        ) -> Result<ResourceObject, Failure> {
            panic!("kaboom")
        }
    }

    #[test]
    fn set_up_panic_is_an_error() {
        let desc = ResourceDescriptor::new(Arc::new(Exploding));
        let pool = ResourcePool::default();
        let err = pool.acquire(&desc).unwrap_err();
        assert!(err.to_string().contains("kaboom"));
    }

    #[test]
    fn tear_down_failure_is_reported() {
        let (_res, desc) = tracked(Tracked {
            oneshot: true,
            fail_tear_down: true,
            ..Tracked::default()
        });
        let pool = ResourcePool::default();
        let handle = pool.acquire(&desc).unwrap();
        let errors = pool.release(handle, Status::Passed);
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].message, "socket closed");
        assert_eq!(errors[0].resource, "tracked()");
    }

    #[test]
    fn distinct_options_do_not_share() {
        let (res, desc) = tracked(Tracked::default());
        let users = desc.clone().arg("users");
        let orders = desc.arg("orders");
        let pool = ResourcePool::default();
        pool.register_user(&users);
        pool.register_user(&orders);

        let a = pool.acquire(&users).unwrap();
        let b = pool.acquire(&orders).unwrap();
        assert_eq!(a.read(|s: &String| s.clone()).unwrap(), "users#0");
        assert_eq!(b.read(|s: &String| s.clone()).unwrap(), "orders#1");
        pool.release(a, Status::Passed);
        pool.release(b, Status::Passed);
        assert_eq!(res.set_ups.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn forgo_reclaims_when_demand_ends() {
        let (res, desc) = tracked(Tracked::default());
        let pool = ResourcePool::default();
        pool.register_user(&desc);
        pool.register_user(&desc);
        pool.register_user(&desc);

        let handle = pool.acquire(&desc).unwrap();
        pool.release(handle, Status::Passed);
        assert_eq!(pool.pending_users(&desc), 2);

        assert!(pool.forgo(&desc).is_empty());
        assert_eq!(pool.instance_count(&desc), 1);
        pool.forgo(&desc);
        assert_eq!(pool.instance_count(&desc), 0);
        assert_eq!(*res.tear_downs.lock(), vec![None]);
    }

    #[test]
    fn close_tears_down_remaining() {
        let (res, desc) = tracked(Tracked::default());
        let pool = ResourcePool::default();
        pool.register_user(&desc);
        pool.register_user(&desc);
        let handle = pool.acquire(&desc).unwrap();
        pool.release(handle, Status::Passed);
        assert_eq!(pool.instance_count(&desc), 1);

        pool.close();
        assert_eq!(*res.tear_downs.lock(), vec![None]);
        assert_eq!(pool.instance_count(&desc), 0);
    }

    #[test]
    fn holders_track_lock_state() {
        let (_res, desc) = tracked(Tracked::default());
        let pool = ResourcePool::default();
        pool.register_user(&desc);
        pool.register_user(&desc);
        let handle = pool.acquire(&desc).unwrap();
        assert_eq!(pool.holders(&desc), vec![thread::current().id()]);
        pool.release(handle, Status::Passed);
        assert!(pool.holders(&desc).is_empty());
    }

    #[test]
    fn cap_blocks_until_release() {
        let (res, desc) = tracked(Tracked::default());
        let pool = ResourcePool::new(Some(1));
        pool.register_user(&desc);
        pool.register_user(&desc);
        let acquired = AtomicBool::new(false);

        let first = pool.acquire(&desc).unwrap();
        let id = first.instance_id();
        thread::scope(|s| {
            let waiter = s.spawn(|| {
                let handle = pool.acquire(&desc).unwrap();
                acquired.store(true, Ordering::SeqCst);
                let got = handle.instance_id();
                pool.release(handle, Status::Passed);
                got
            });
            thread::sleep(Duration::from_millis(50));
            assert!(!acquired.load(Ordering::SeqCst));
            assert_eq!(pool.instance_count(&desc), 1);
            pool.release(first, Status::Passed);
            assert_eq!(waiter.join().unwrap(), id);
        });
        assert_eq!(res.set_ups.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn holder_may_exceed_cap_for_a_second_binding() {
        let (res, desc) = tracked(Tracked::default());
        let pool = ResourcePool::new(Some(1));
        pool.register_user(&desc);
        pool.register_user(&desc);

        let first = pool.acquire(&desc).unwrap();
        let second = pool.acquire(&desc).unwrap();
        assert_ne!(first.instance_id(), second.instance_id());
        assert_eq!(pool.instance_count(&desc), 2);
        pool.release(first, Status::Passed);
        pool.release(second, Status::Passed);

        assert_eq!(res.set_ups.load(Ordering::SeqCst), 2);
        assert_eq!(*res.tear_downs.lock(), vec![None, None]);
        assert_eq!(pool.instance_count(&desc), 0);
    }
}

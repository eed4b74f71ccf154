//! Registry of mutator threads and the stop-the-world protocol.
//!
//! Every registered mutator holds a shared guard of the mutator lock while
//! it runs. A collector suspends the world by raising the suspend flag and
//! taking the lock exclusively: it gets the lock once every mutator either
//! reached a safepoint or entered a blocking region.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::{Duration, Instant},
};

use parking_lot::{Mutex, RawRwLock, RwLock, RwLockWriteGuard, lock_api::ArcRwLockReadGuard};

use crate::{
    object::ObjectRef,
    space::{SpaceId, malloc_space::SlotBatches},
};

pub type MutatorGuard = ArcRwLockReadGuard<RawRwLock, ()>;

/// Thread-local bump buffer carved out of a bump pointer or region space.
#[derive(Debug, Clone, Copy)]
pub struct Tlab {
    pub space: SpaceId,
    pub cursor: usize,
    pub end: usize,
    pub objects: usize,
}

impl Tlab {
    pub fn remaining(&self) -> usize {
        self.end - self.cursor
    }
}

/// Allocation buffers a mutator owns. Collectors revoke them while the
/// world is suspended.
#[derive(Debug, Default)]
pub struct ThreadLocalBuffers {
    pub tlab: Option<Tlab>,
    pub slots: SlotBatches,
    /// Space the RosAlloc slots were taken from.
    pub slots_space: Option<SpaceId>,
}

impl ThreadLocalBuffers {
    pub fn is_empty(&self) -> bool {
        self.tlab.is_none() && self.slots.is_empty()
    }
}

#[derive(Debug)]
pub struct MutatorContext {
    id: usize,
    name: String,
    pub(crate) buffers: Mutex<ThreadLocalBuffers>,
    /// Objects the heap holds on the mutator's behalf while it waits for
    /// a collection, updated when they move.
    pub(crate) scoped_roots: Mutex<Vec<ObjectRef>>,
}

impl MutatorContext {
    pub fn id(&self) -> usize {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

pub struct ThreadList {
    mutator_lock: Arc<RwLock<()>>,
    suspend_requested: AtomicBool,
    mutators: Mutex<Vec<Arc<MutatorContext>>>,
    next_id: AtomicUsize,
}

impl ThreadList {
    pub fn new() -> Self {
        Self {
            mutator_lock: Arc::new(RwLock::new(())),
            suspend_requested: AtomicBool::new(false),
            mutators: Mutex::new(Vec::new()),
            next_id: AtomicUsize::new(0),
        }
    }

    /// Registers the calling thread. Blocks while the world is suspended.
    pub fn register(&self, name: &str) -> (Arc<MutatorContext>, MutatorGuard) {
        let guard = self.mutator_lock.read_arc();
        let context = Arc::new(MutatorContext {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            name: name.to_string(),
            buffers: Mutex::new(ThreadLocalBuffers::default()),
            scoped_roots: Mutex::new(Vec::new()),
        });
        self.mutators.lock().push(context.clone());
        log::trace!(target: "heap", "registered mutator {} ({name})", context.id);
        (context, guard)
    }

    /// Removes a mutator. Its buffers must have been revoked.
    pub fn unregister(&self, context: &MutatorContext) {
        debug_assert!(context.buffers.lock().is_empty(), "unrevoked buffers");
        self.mutators.lock().retain(|other| other.id != context.id);
        log::trace!(target: "heap", "unregistered mutator {}", context.id);
    }

    pub fn count(&self) -> usize {
        self.mutators.lock().len()
    }

    pub fn for_each_mutator(&self, mut visitor: impl FnMut(&MutatorContext)) {
        let mutators = self.mutators.lock().clone();
        for mutator in &mutators {
            visitor(mutator);
        }
    }

    /// Shared guard for a mutator leaving a blocking region.
    pub(crate) fn acquire(&self) -> MutatorGuard {
        self.mutator_lock.read_arc()
    }

    #[inline]
    pub fn is_suspend_requested(&self) -> bool {
        self.suspend_requested.load(Ordering::Acquire)
    }

    /// Stops every mutator. The calling thread must not hold a mutator
    /// guard. Mutators resume when the returned guard is dropped.
    pub fn suspend_all(&self) -> SuspendAll<'_> {
        self.suspend_requested.store(true, Ordering::Release);
        let started = Instant::now();
        let lock = self.mutator_lock.write();
        log::trace!(target: "gc", "suspended all mutators in {:?}", started.elapsed());
        SuspendAll {
            list: self,
            _lock: lock,
            started,
        }
    }
}

impl Default for ThreadList {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ThreadList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ThreadList[{} mutators]", self.count())
    }
}

/// Proof that every mutator is stopped.
pub struct SuspendAll<'a> {
    list: &'a ThreadList,
    _lock: RwLockWriteGuard<'a, ()>,
    started: Instant,
}

impl SuspendAll<'_> {
    /// Time since the suspension was requested.
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

impl Drop for SuspendAll<'_> {
    fn drop(&mut self) {
        self.list.suspend_requested.store(false, Ordering::Release);
    }
}

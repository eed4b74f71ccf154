//! Per-thread handle through which managed code allocates and stores
//! references.

use std::sync::Arc;

use crate::{
    collector::GcType,
    error::{HeapError, OutOfMemoryError},
    heap::{AllocatorType, Heap, MovingGcDisabled, allocation::AllocationSite},
    object::{ObjectRef, ObjectSlot},
    thread_list::{MutatorContext, MutatorGuard},
};

/// A registered mutator thread.
///
/// While it is alive the mutator holds its share of the mutator lock and
/// collections can only suspend it at allocations, at
/// [`safepoint`](Self::safepoint) or inside [`blocking`](Self::blocking).
/// The handle stays on the thread that created it.
pub struct Mutator {
    heap: Heap,
    context: Arc<MutatorContext>,
    guard: Option<MutatorGuard>,
}

impl Mutator {
    /// Registers a mutator. Blocks while the world is suspended.
    pub fn new(heap: Heap, name: &str) -> Self {
        let (context, guard) = heap.thread_list.register(name);
        Self {
            heap,
            context,
            guard: Some(guard),
        }
    }

    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    pub fn id(&self) -> usize {
        self.context.id()
    }

    pub fn name(&self) -> &str {
        self.context.name()
    }

    /// Parks here if a collector is suspending the world.
    #[inline]
    pub fn safepoint(&mut self) {
        self.heap.safepoint(&mut self.guard);
    }

    /// Runs `f` without the mutator guard, so that anything `f` waits on
    /// may suspend this thread. `f` must not touch objects that can move.
    pub fn blocking<R>(&mut self, f: impl FnOnce(&Heap) -> R) -> R {
        let heap = &self.heap;
        heap.blocking(&mut self.guard, || f(heap))
    }

    fn site(&mut self) -> AllocationSite<'_> {
        AllocationSite {
            context: &self.context,
            guard: &mut self.guard,
        }
    }

    /// Allocates a zeroed instance of `class` with the current allocator.
    pub fn alloc_object(
        &mut self,
        class: ObjectRef,
        byte_count: usize,
    ) -> Result<ObjectRef, OutOfMemoryError> {
        self.alloc_object_with(class, byte_count, |_, _| {})
    }

    /// Allocates an instance of `class` and runs `init` on it before the
    /// object becomes visible to collectors. `init` gets the usable size.
    pub fn alloc_object_with(
        &mut self,
        class: ObjectRef,
        byte_count: usize,
        init: impl FnMut(ObjectRef, usize),
    ) -> Result<ObjectRef, OutOfMemoryError> {
        let allocator = self.heap.current_allocator();
        self.alloc_object_with_allocator(class, byte_count, allocator, init)
    }

    pub fn alloc_object_with_allocator(
        &mut self,
        class: ObjectRef,
        byte_count: usize,
        allocator: AllocatorType,
        mut init: impl FnMut(ObjectRef, usize),
    ) -> Result<ObjectRef, OutOfMemoryError> {
        let heap = self.heap.clone();
        heap.allocate_object(&mut self.site(), Some(class), byte_count, allocator, &mut init)
    }

    /// Allocates an instance of `class` that no collection moves.
    pub fn alloc_non_movable(
        &mut self,
        class: ObjectRef,
        byte_count: usize,
        init: impl FnMut(ObjectRef, usize),
    ) -> Result<ObjectRef, OutOfMemoryError> {
        self.alloc_object_with_allocator(class, byte_count, AllocatorType::NonMoving, init)
    }

    /// Allocates zeroed memory without a class. The caller has to make it
    /// a valid object before the next safepoint.
    pub fn alloc_raw(
        &mut self,
        byte_count: usize,
        allocator: AllocatorType,
    ) -> Result<ObjectRef, OutOfMemoryError> {
        let heap = self.heap.clone();
        heap.allocate_object(&mut self.site(), None, byte_count, allocator, &mut |_, _| {})
    }

    /// Stores `value` into a reference field of `holder`.
    #[inline]
    pub fn write_field(&self, holder: ObjectRef, slot: ObjectSlot, value: Option<ObjectRef>) {
        slot.store(value);
        self.heap.write_barrier(holder, value);
    }

    /// Runs an explicit collection. Returns the type that ran.
    pub fn collect_garbage(&mut self, clear_soft_references: bool) -> GcType {
        self.blocking(|heap| heap.collect_garbage(clear_soft_references))
    }

    pub fn register_native_allocation(&mut self, bytes: usize) {
        self.blocking(|heap| heap.register_native_allocation(bytes));
    }

    pub fn register_native_free(&self, bytes: usize) -> Result<(), HeapError> {
        self.heap.register_native_free(bytes)
    }

    pub fn disable_moving_gc(&mut self) -> MovingGcDisabled {
        self.blocking(MovingGcDisabled::new)
    }
}

impl Drop for Mutator {
    fn drop(&mut self) {
        if self.guard.is_none() {
            self.guard = Some(self.heap.thread_list.acquire());
        }
        {
            let spaces = self.heap.spaces.read();
            self.heap
                .revoke_buffers(&spaces, &mut self.context.buffers.lock());
        }
        self.heap.thread_list.unregister(&self.context);
    }
}

impl std::fmt::Debug for Mutator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mutator")
            .field("id", &self.context.id())
            .field("name", &self.context.name())
            .field("runnable", &self.guard.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        collector::CollectorType,
        heap::{
            HeapDaemon,
            tests::{create_test_env, create_test_settings, install_classes},
        },
        settings::HeapSettings,
        testing::{TestRuntime, init_object, object_size, ref_slot},
    };
    use std::{sync::Barrier, thread};

    #[test]
    fn test_drop_unregisters_and_returns_buffers() {
        let (heap, mut mutator, runtime) = create_test_env(create_test_settings());
        let classes = install_classes(&mut mutator, &runtime);
        let mut second = heap.mutator("second");
        assert_eq!(heap.thread_list.count(), 2);
        second
            .alloc_object(classes.normal, object_size(0, 8))
            .expect("allocation");
        let context = second.context.clone();
        drop(second);
        assert!(context.buffers.lock().is_empty(), "buffers revoked");
        assert_eq!(heap.thread_list.count(), 1);
    }

    #[test]
    fn test_non_movable_allocations_stay_put() {
        let (heap, mut mutator, runtime) = create_test_env(create_test_settings());
        let classes = install_classes(&mut mutator, &runtime);
        let size = object_size(1, 0);
        let pinned = mutator
            .alloc_non_movable(classes.normal, size, |obj, _| {
                // SAFETY: the allocation is at least `size` bytes
                unsafe { init_object(obj, size, 1) };
            })
            .expect("allocation");
        assert!(heap.spaces.read().non_moving_space().contains(pinned));
        assert!(!heap.is_movable_object(pinned));
    }

    #[test]
    fn test_write_field_dirties_the_holder_card() {
        let (heap, mut mutator, runtime) = create_test_env(create_test_settings());
        let classes = install_classes(&mut mutator, &runtime);
        let size = object_size(1, 0);
        let holder = mutator
            .alloc_object_with(classes.normal, size, |obj, _| {
                // SAFETY: the allocation is at least `size` bytes
                unsafe { init_object(obj, size, 1) };
            })
            .expect("holder");
        heap.card_table.clear_all();
        // SAFETY: holder has one reference slot
        mutator.write_field(holder, unsafe { ref_slot(holder, 0) }, None);
        assert!(!heap.card_table.is_dirty(holder.addr()), "null stores need no card");
        // SAFETY: as above
        mutator.write_field(holder, unsafe { ref_slot(holder, 0) }, Some(classes.normal));
        assert!(heap.card_table.is_dirty(holder.addr()));
    }

    fn run_worker(heap: &Heap, runtime: &TestRuntime, class: ObjectRef, slot: usize, count: usize) {
        let mut worker = heap.mutator("worker");
        for index in 0..count {
            let refs = usize::from(index % 2 == 0);
            let size = object_size(refs, index % 48);
            let obj = worker
                .alloc_object_with(class, size, |obj, _| {
                    // SAFETY: the allocation is at least `size` bytes
                    unsafe { init_object(obj, size, refs) };
                })
                .expect("worker allocation");
            // chains of roots get cut now and then so the live set stays bounded
            if refs == 1 && index % 256 != 0 {
                let previous = runtime.root(slot);
                // SAFETY: obj has one reference slot
                worker.write_field(obj, unsafe { ref_slot(obj, 0) }, Some(previous));
            }
            if index % 8 == 0 {
                runtime.roots.lock()[slot] = obj;
            }
            worker.safepoint();
        }
    }

    #[test]
    fn test_collection_waits_for_other_mutators_to_park() {
        let (heap, mut mutator, runtime) = create_test_env(create_test_settings());
        let classes = install_classes(&mut mutator, &runtime);
        let slot = runtime.push(classes.normal);
        let ready = Barrier::new(2);
        mutator.blocking(|heap| {
            thread::scope(|scope| {
                scope.spawn(|| {
                    ready.wait();
                    run_worker(heap, &runtime, classes.normal, slot, 2000);
                });
                ready.wait();
                assert_eq!(heap.collect_garbage(false), GcType::Full);
            });
        });
        assert_eq!(heap.thread_list.count(), 1);
        assert!(heap.gcs_completed() >= 1);
        assert_eq!(mutator.blocking(|heap| heap.verify_heap()), 0);
    }

    #[test]
    fn test_concurrent_collections_under_parallel_mutators() {
        for collector in [CollectorType::Cms, CollectorType::Ss] {
            let settings = HeapSettings {
                foreground_collector: collector,
                initial_size: 256 * 1024,
                ..create_test_settings()
            };
            let (heap, mut mutator, runtime) = create_test_env(settings);
            let classes = install_classes(&mut mutator, &runtime);
            let slots = (0..4).map(|_| runtime.push(classes.normal)).collect::<Vec<_>>();
            let daemon = HeapDaemon::start(&heap);
            mutator.blocking(|heap| {
                thread::scope(|scope| {
                    for &slot in &slots {
                        let runtime = &runtime;
                        scope.spawn(move || run_worker(heap, runtime, classes.normal, slot, 20_000));
                    }
                });
            });
            drop(daemon);
            assert!(heap.gcs_completed() > 0, "{collector} never collected");
            assert_eq!(
                mutator.blocking(|heap| heap.verify_heap()),
                0,
                "{collector} left broken references"
            );
            assert_eq!(heap.thread_list.count(), 1);
        }
    }
}

//! Object allocation: allocator selection, the thread-local fast paths and
//! the retry ladder that runs collections until an allocation fits.

use std::sync::atomic::Ordering;

use crate::{
    collector::{GcCause, GcType},
    error::{OutOfMemoryError, fatal},
    object::{OBJECT_ALIGNMENT, ObjectRef},
    space::{Allocation, MallocKind},
    system::align_up,
    thread_list::{MutatorContext, MutatorGuard, Tlab, ThreadLocalBuffers},
};

use super::{HeapInner, HeapSpaces};

/// Size of a freshly handed out bump pointer TLAB, on top of the object
/// that triggered the refill.
pub const TLAB_SIZE: usize = 32 * 1024;

/// Where an allocation gets its memory from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum AllocatorType {
    /// Shared cursor of the bump pointer space.
    BumpPointer = 0,
    /// Thread-local buffers carved from the bump pointer space.
    Tlab = 1,
    /// RosAlloc main space with per-thread slot batches.
    RosAlloc = 2,
    /// DlMalloc main space.
    DlMalloc = 3,
    /// The non-moving space, for objects that must never move.
    NonMoving = 4,
    /// One mapping per object.
    Los = 5,
    Region = 6,
    RegionTlab = 7,
}

impl AllocatorType {
    /// Whether objects allocated this way go into a space that only a
    /// compacting collection reclaims.
    pub fn is_moving(self) -> bool {
        matches!(
            self,
            AllocatorType::BumpPointer
                | AllocatorType::Tlab
                | AllocatorType::Region
                | AllocatorType::RegionTlab
        )
    }

    /// Objects of bitmap-less spaces are never pushed on the allocation
    /// stack.
    fn has_allocation_stack(self) -> bool {
        !self.is_moving()
    }

    fn may_have_concurrent_gc(self) -> bool {
        !matches!(self, AllocatorType::BumpPointer | AllocatorType::Tlab)
    }
}

impl From<u8> for AllocatorType {
    fn from(value: u8) -> Self {
        match value {
            0 => AllocatorType::BumpPointer,
            1 => AllocatorType::Tlab,
            2 => AllocatorType::RosAlloc,
            3 => AllocatorType::DlMalloc,
            4 => AllocatorType::NonMoving,
            5 => AllocatorType::Los,
            6 => AllocatorType::Region,
            7 => AllocatorType::RegionTlab,
            _ => fatal(&format!("invalid allocator type {value}")),
        }
    }
}

/// A mutator's view of one allocation in flight.
pub(crate) struct AllocationSite<'a> {
    pub context: &'a MutatorContext,
    pub guard: &'a mut Option<MutatorGuard>,
}

impl HeapInner {
    /// Parks the calling mutator if a collector asked every thread to
    /// stop.
    #[inline]
    pub(crate) fn safepoint(&self, guard: &mut Option<MutatorGuard>) {
        if self.thread_list.is_suspend_requested() {
            self.blocking(guard, || ());
        }
    }

    /// Allocates and initializes an object of `byte_count` bytes.
    ///
    /// Without a class the object is left for the caller to initialize,
    /// which is how class objects bootstrap themselves.
    pub(crate) fn allocate_object(
        &self,
        site: &mut AllocationSite<'_>,
        class: Option<ObjectRef>,
        byte_count: usize,
        allocator: AllocatorType,
        init: &mut dyn FnMut(ObjectRef, usize),
    ) -> Result<ObjectRef, OutOfMemoryError> {
        self.safepoint(site.guard);
        let byte_count = align_up(byte_count.max(OBJECT_ALIGNMENT), OBJECT_ALIGNMENT);
        // SAFETY: classes handed to the heap are initialized objects
        if let Some(class) = class
            && byte_count >= self.large_object_threshold()
            && unsafe { self.model().is_card_table_exempt(class) }
        {
            match self.allocate_with(site, Some(class), byte_count, AllocatorType::Los, init) {
                Ok(obj) => return Ok(obj),
                Err(oom) => {
                    log::debug!(target: "heap", "large object allocation failed, retrying in the heap: {oom}");
                }
            }
        }
        self.allocate_with(site, class, byte_count, allocator, init)
    }

    fn allocate_with(
        &self,
        site: &mut AllocationSite<'_>,
        mut class: Option<ObjectRef>,
        byte_count: usize,
        mut allocator: AllocatorType,
        init: &mut dyn FnMut(ObjectRef, usize),
    ) -> Result<ObjectRef, OutOfMemoryError> {
        let allocation = loop {
            if let Some(allocation) = self.try_to_allocate(site.context, allocator, byte_count, false) {
                break allocation;
            }
            let was_default = allocator == self.current_allocator();
            let scoped = class.is_some();
            if let Some(class) = class {
                site.context.scoped_roots.lock().push(class);
            }
            let result = self.allocate_internal_with_gc(site, allocator, byte_count, was_default);
            if scoped {
                class = site.context.scoped_roots.lock().pop();
            }
            match result? {
                Some(allocation) => break allocation,
                // a collector transition installed another allocator
                None => allocator = self.current_allocator(),
            }
        };

        let obj = allocation.object;
        if let Some(class) = class {
            // SAFETY: the allocation is at least one word and exclusively ours
            unsafe { obj.set_class(class) };
        }
        init(obj, allocation.usable_size);
        let new_bytes = self
            .num_bytes_allocated
            .fetch_add(allocation.bulk_bytes_allocated, Ordering::SeqCst)
            + allocation.bulk_bytes_allocated;
        if !self.is_in_moving_range(obj.addr()) {
            self.card_table.mark_card(obj.addr());
        }
        if allocator.has_allocation_stack() {
            self.push_on_allocation_stack(site, obj);
        }
        if allocator.may_have_concurrent_gc()
            && self.collector_type().is_concurrent()
            && new_bytes >= self.concurrent_start_bytes()
        {
            self.request_concurrent_gc();
        }
        Ok(obj)
    }

    /// Allocates without collecting. With `grow` the heap footprint may be
    /// raised up to the growth limit.
    pub(crate) fn try_to_allocate(
        &self,
        context: &MutatorContext,
        allocator: AllocatorType,
        byte_count: usize,
        grow: bool,
    ) -> Option<Allocation> {
        let spaces = self.spaces.read();
        match allocator {
            AllocatorType::Tlab => {
                let mut buffers = context.buffers.lock();
                if let Some(allocation) = alloc_from_tlab(&mut buffers, byte_count) {
                    return Some(allocation);
                }
                let tlab_size = byte_count + TLAB_SIZE;
                if self.is_out_of_memory_on_allocation(allocator, tlab_size, grow) {
                    return None;
                }
                self.revoke_tlab(&spaces, &mut buffers);
                let (start, end) = spaces.bump_space().alloc_new_tlab(tlab_size)?;
                buffers.tlab = Some(Tlab {
                    space: spaces.bump_pointer,
                    cursor: start,
                    end,
                    objects: 0,
                });
                let mut allocation = alloc_from_tlab(&mut buffers, byte_count)?;
                allocation.bulk_bytes_allocated = end - start;
                Some(allocation)
            }
            AllocatorType::RegionTlab => {
                let id = spaces.region?;
                let region = spaces.region_space(id);
                let mut buffers = context.buffers.lock();
                if let Some(allocation) = alloc_from_tlab(&mut buffers, byte_count) {
                    return Some(allocation);
                }
                if self.is_out_of_memory_on_allocation(allocator, region.region_size(), grow) {
                    return None;
                }
                if byte_count > region.region_size() {
                    return region.alloc(byte_count);
                }
                self.revoke_tlab(&spaces, &mut buffers);
                let (start, end) = region.alloc_new_tlab()?;
                buffers.tlab = Some(Tlab {
                    space: id,
                    cursor: start,
                    end,
                    objects: 0,
                });
                let mut allocation = alloc_from_tlab(&mut buffers, byte_count)?;
                allocation.bulk_bytes_allocated = end - start;
                Some(allocation)
            }
            _ if self.is_out_of_memory_on_allocation(allocator, byte_count, grow) => None,
            AllocatorType::BumpPointer => spaces.bump_space().alloc(byte_count),
            AllocatorType::Region => spaces.region_space(spaces.region?).alloc(byte_count),
            AllocatorType::RosAlloc => {
                let id = spaces.primary_malloc_id();
                let space = spaces.malloc(id);
                if space.kind() != MallocKind::RosAlloc {
                    return space.alloc(byte_count);
                }
                let mut buffers = context.buffers.lock();
                if buffers.slots_space.is_some_and(|owner| owner != id) {
                    self.revoke_buffers(&spaces, &mut buffers);
                }
                buffers.slots_space = Some(id);
                space.alloc_thread_local(&mut buffers.slots, byte_count)
            }
            AllocatorType::DlMalloc => spaces.malloc(spaces.primary_malloc_id()).alloc(byte_count),
            AllocatorType::NonMoving => spaces.non_moving_space().alloc(byte_count),
            AllocatorType::Los => spaces.large_objects().alloc(byte_count),
        }
    }

    /// Whether `byte_count` more bytes would push the heap past what it
    /// may use. Raises the footprint when `grow` allows it.
    pub(crate) fn is_out_of_memory_on_allocation(
        &self,
        allocator: AllocatorType,
        byte_count: usize,
        grow: bool,
    ) -> bool {
        let new_footprint = self.bytes_allocated() + byte_count;
        let max_allowed = self.max_allowed_footprint();
        if new_footprint <= max_allowed {
            return false;
        }
        if new_footprint > self.growth_limit.load(Ordering::Relaxed) {
            return true;
        }
        if !allocator.may_have_concurrent_gc() || !self.collector_type().is_concurrent() {
            if !grow {
                return true;
            }
            log::debug!(
                target: "heap",
                "growing heap from {max_allowed} to {new_footprint} for a {byte_count} byte allocation"
            );
            self.max_allowed_footprint
                .fetch_max(new_footprint, Ordering::Relaxed);
        }
        false
    }

    /// Runs progressively more thorough collections until the allocation
    /// fits. `Ok(None)` when a collection switched allocators and the
    /// caller must start over.
    fn allocate_internal_with_gc(
        &self,
        site: &mut AllocationSite<'_>,
        allocator: AllocatorType,
        byte_count: usize,
        was_default: bool,
    ) -> Result<Option<Allocation>, OutOfMemoryError> {
        let context = site.context;
        let allocator_changed = || was_default && allocator != self.current_allocator();

        let last_gc = self.blocking(site.guard, || self.wait_for_gc_to_complete(GcCause::ForAlloc));
        if allocator_changed() {
            return Ok(None);
        }
        if last_gc != GcType::None
            && let Some(allocation) = self.try_to_allocate(context, allocator, byte_count, false)
        {
            return Ok(Some(allocation));
        }

        let tried = self.policy.lock().next_gc_type;
        let ran = self.blocking(site.guard, || {
            self.collect_garbage_internal(tried, GcCause::ForAlloc, false)
        });
        if allocator_changed() {
            return Ok(None);
        }
        if ran != GcType::None
            && let Some(allocation) = self.try_to_allocate(context, allocator, byte_count, false)
        {
            return Ok(Some(allocation));
        }

        let plan = self.policy.lock().gc_plan.clone();
        for gc_type in plan.iter().copied().filter(|&gc_type| gc_type != tried) {
            let ran = self.blocking(site.guard, || {
                self.collect_garbage_internal(gc_type, GcCause::ForAlloc, false)
            });
            if allocator_changed() {
                return Ok(None);
            }
            if ran != GcType::None
                && let Some(allocation) = self.try_to_allocate(context, allocator, byte_count, false)
            {
                return Ok(Some(allocation));
            }
        }

        if let Some(allocation) = self.try_to_allocate(context, allocator, byte_count, true) {
            return Ok(Some(allocation));
        }

        log::info!(
            target: "heap",
            "forcing collection of soft references for a {byte_count} byte allocation"
        );
        let last = plan.last().copied().unwrap_or(GcType::Full);
        self.blocking(site.guard, || {
            self.collect_garbage_internal(last, GcCause::ForAlloc, true)
        });
        if allocator_changed() {
            return Ok(None);
        }
        match self.try_to_allocate(context, allocator, byte_count, true) {
            Some(allocation) => Ok(Some(allocation)),
            None => Err(self.out_of_memory_error(allocator, byte_count)),
        }
    }

    fn out_of_memory_error(&self, allocator: AllocatorType, byte_count: usize) -> OutOfMemoryError {
        let free = self.free_memory();
        let mut largest = None;
        if allocator != AllocatorType::Los && free >= byte_count {
            let spaces = self.spaces.read();
            let space = match allocator {
                AllocatorType::NonMoving => Some(spaces.non_moving_space()),
                AllocatorType::RosAlloc | AllocatorType::DlMalloc => {
                    Some(spaces.malloc(spaces.primary_malloc_id()))
                }
                _ => None,
            };
            largest = space.map(|space| space.largest_free_contiguous());
        }
        let oom = OutOfMemoryError::new(byte_count, free, largest);
        log::error!(target: "heap", "{oom}");
        oom
    }

    /// Records `obj` for the next sticky collection. A full stack gets
    /// drained by a sticky collection first.
    fn push_on_allocation_stack(&self, site: &mut AllocationSite<'_>, obj: ObjectRef) {
        if self.allocation_stack().atomic_push_back(obj) {
            return;
        }
        site.context.scoped_roots.lock().push(obj);
        self.blocking(site.guard, || {
            self.collect_garbage_internal(GcType::Sticky, GcCause::ForAlloc, false)
        });
        let obj = site
            .context
            .scoped_roots
            .lock()
            .pop()
            .unwrap_or_else(|| fatal("lost the object held across an allocation stack flush"));
        if !self.allocation_stack().atomic_push_back(obj) {
            fatal(&format!(
                "allocation stack of {} entries is still full after a collection",
                self.allocation_stack().capacity()
            ));
        }
    }

    fn revoke_tlab(&self, spaces: &HeapSpaces, buffers: &mut ThreadLocalBuffers) {
        let slots = std::mem::take(&mut buffers.slots);
        let slots_space = buffers.slots_space.take();
        self.revoke_buffers(spaces, buffers);
        buffers.slots = slots;
        buffers.slots_space = slots_space;
    }
}

fn alloc_from_tlab(buffers: &mut ThreadLocalBuffers, byte_count: usize) -> Option<Allocation> {
    let tlab = buffers.tlab.as_mut()?;
    if tlab.remaining() < byte_count {
        return None;
    }
    let addr = tlab.cursor;
    tlab.cursor += byte_count;
    tlab.objects += 1;
    Some(Allocation {
        // SAFETY: TLAB cursors are aligned and non-null
        object: unsafe { ObjectRef::from_addr_unchecked(addr) },
        bytes_allocated: byte_count,
        usable_size: byte_count,
        bulk_bytes_allocated: 0,
    })
}

//! The managed heap.
//!
//! [`HeapInner`] owns one address range reservation and carves every
//! continuous space out of it: the image, the non-moving space, the main
//! malloc space, two bump pointer spaces and the optional region space, in
//! that order. A single card table covers the whole reservation. Large
//! objects are mapped one by one and live outside of it.
//!
//! Lock order, outermost first: the GC state mutex, the mutator lock, the
//! space table lock, per-space locks, reference queues. Only the thread
//! owning the running-collector slot ever takes the space table lock for
//! writing.

pub(crate) mod allocation;
mod collection;
mod daemon;
mod diagnostics;
mod growth;
mod image;
mod native;
mod transition;
mod verification;
mod zygote;

use std::{
    collections::BTreeMap,
    fmt,
    ops::Deref,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering},
    },
    time::Duration,
};

use parking_lot::{Condvar, Mutex, RwLock};

pub use allocation::AllocatorType;
pub use collection::MovingGcDisabled;
pub use daemon::HeapDaemon;
pub use transition::ProcessState;

use crate::{
    OS_PAGE_SIZE,
    accounting::{CardTable, ObjectStack, RememberedSet, card_table::age_card},
    collector::{CollectorStats, CollectorType, GcType, Iteration},
    error::{HeapError, fatal},
    memory_region::MemoryRegion,
    mutator::Mutator,
    object::{ObjectModel, ObjectRef, Runtime},
    reference_queue::ReferenceProcessor,
    settings::HeapSettings,
    space::{
        BumpPointerSpace, LargeObjectSpace, MallocKind, MallocSpace, RegionSpace, Space,
        SpaceId, SpaceTable,
    },
    thread_list::{MutatorGuard, ThreadList, ThreadLocalBuffers},
};

pub(crate) const NON_MOVING_SPACE_NAME: &str = "non moving space";
pub(crate) const MAIN_SPACE_NAME: &str = "main space";
pub(crate) const BUMP_SPACE_NAME: &str = "bump pointer space";
pub(crate) const TEMP_SPACE_NAME: &str = "bump pointer space 2";

// ── Spaces ────────────────────────────────────────────────────────────

/// The space table plus the roles the heap assigns to its spaces.
pub(crate) struct HeapSpaces {
    pub table: SpaceTable,
    /// Main malloc space, absent while a compacting collector owns the
    /// heap or when the non-moving space plays its part.
    pub main: Option<SpaceId>,
    pub non_moving: SpaceId,
    /// Allocation target of the compacting collectors.
    pub bump_pointer: SpaceId,
    /// To-space of the next semi-space collection.
    pub temp: SpaceId,
    pub region: Option<SpaceId>,
    pub large_objects: SpaceId,
    pub image: Option<SpaceId>,
    /// Memory of the main space while it is not installed.
    pub parked_main: Option<MemoryRegion>,
    /// Reserved for the image until one gets installed.
    pub image_reserve: Option<MemoryRegion>,
    /// Reserved for the non-moving space created by the zygote fork.
    pub post_zygote_non_moving: Option<MemoryRegion>,
}

impl HeapSpaces {
    #[inline]
    pub fn space(&self, id: SpaceId) -> &Space {
        self.table
            .get(id)
            .unwrap_or_else(|| fatal(&format!("{id:?} is not in the space table")))
    }

    pub fn malloc(&self, id: SpaceId) -> &MallocSpace {
        self.space(id)
            .as_malloc()
            .unwrap_or_else(|| fatal(&format!("{id:?} is not a malloc space")))
    }

    pub fn non_moving_space(&self) -> &MallocSpace {
        self.malloc(self.non_moving)
    }

    pub fn main_space(&self) -> Option<&MallocSpace> {
        self.main.map(|id| self.malloc(id))
    }

    /// Space the malloc allocators of the mark-sweep collectors use.
    pub fn primary_malloc_id(&self) -> SpaceId {
        self.main.unwrap_or(self.non_moving)
    }

    pub fn bump_space(&self) -> &BumpPointerSpace {
        self.space(self.bump_pointer)
            .as_bump_pointer()
            .unwrap_or_else(|| fatal("bump pointer role without a bump pointer space"))
    }

    pub fn temp_space(&self) -> &BumpPointerSpace {
        self.space(self.temp)
            .as_bump_pointer()
            .unwrap_or_else(|| fatal("temp role without a bump pointer space"))
    }

    pub fn region_space(&self, id: SpaceId) -> &RegionSpace {
        self.space(id)
            .as_region()
            .unwrap_or_else(|| fatal(&format!("{id:?} is not a region space")))
    }

    pub fn large_objects(&self) -> &LargeObjectSpace {
        self.space(self.large_objects)
            .as_large_object()
            .unwrap_or_else(|| fatal("large object role without a large object space"))
    }

    /// Spaces whose objects only compacting collectors reclaim.
    pub fn moving_space_ids(&self) -> Vec<SpaceId> {
        let mut ids = vec![self.bump_pointer, self.temp];
        ids.extend(self.region);
        ids
    }

    fn add_remembered_set(&mut self, id: SpaceId, name: &str) {
        let space = self.space(id);
        let set = RememberedSet::new(name, id, space.begin(), space.limit());
        self.table.remembered_sets.insert(id, set);
    }
}

// ── State ─────────────────────────────────────────────────────────────

/// Who is collecting right now. Guarded by `HeapInner::gc`.
#[derive(Debug)]
pub(crate) struct GcState {
    pub collector_type_running: CollectorType,
    pub last_gc_type: GcType,
    /// While non-zero, compacting collections and transitions are skipped.
    pub disable_moving_gc_count: usize,
    pub gcs_completed: u64,
    pub total_wait_time: Duration,
}

// ── HeapInner ─────────────────────────────────────────────────────────

/// Core shared heap state.
pub struct HeapInner {
    pub settings: HeapSettings,
    model: Box<dyn ObjectModel>,
    pub(crate) runtime: Arc<dyn Runtime>,
    pub(crate) spaces: RwLock<HeapSpaces>,
    pub(crate) card_table: CardTable,
    pub(crate) thread_list: ThreadList,
    pub(crate) references: ReferenceProcessor,

    /// Allocation and live stack, their roles swap at every collection.
    stacks: [ObjectStack; 2],
    live_stack_index: AtomicUsize,
    /// `[begin, end)` of the bump pointer and region spaces.
    moving_range: (usize, usize),

    pub(crate) last_gc_to_space_end: AtomicUsize,
    pub(crate) bytes_promoted_since_whole_heap: AtomicUsize,

    pub(crate) num_bytes_allocated: AtomicUsize,
    pub(crate) total_bytes_freed_ever: AtomicUsize,
    pub(crate) total_objects_freed_ever: AtomicUsize,
    pub(crate) max_allowed_footprint: AtomicUsize,
    pub(crate) growth_limit: AtomicUsize,
    pub(crate) concurrent_start_bytes: AtomicUsize,
    pub(crate) large_object_threshold: AtomicUsize,
    current_allocator: AtomicU8,
    collector_type: AtomicU8,
    pub(crate) have_zygote_space: AtomicBool,
    pub(crate) zygote_mode: AtomicBool,

    pub(crate) gc: Mutex<GcState>,
    pub(crate) gc_complete: Condvar,
    pub(crate) policy: Mutex<growth::GrowthPolicy>,
    pub(crate) tasks: Mutex<daemon::PendingTasks>,
    pub(crate) tasks_changed: Condvar,
    pub(crate) native: native::NativeAccounting,
    /// Totals per collector name, filled as collections finish.
    pub(crate) stats: Mutex<BTreeMap<String, CollectorStats>>,
    pub(crate) last_iteration: Mutex<Option<Iteration>>,

    /// Every space lives inside this mapping, it has to go last.
    reservation: MemoryRegion,
}

/// Offsets of the spaces inside the reservation.
#[derive(Debug, Clone, Copy)]
struct Layout {
    image: usize,
    non_moving: (usize, usize),
    post_zygote: Option<(usize, usize)>,
    main: Option<(usize, usize)>,
    bump: (usize, usize),
    temp: (usize, usize),
    region: Option<(usize, usize)>,
    total: usize,
}

impl Layout {
    fn new(settings: &HeapSettings) -> Self {
        let split = !settings.is_zygote
            && (settings.foreground_collector.is_compacting()
                || settings.background_collector.is_compacting());
        let mut cursor = settings.image_capacity;
        let mut carve = |size: usize| {
            let range = (cursor, size);
            cursor += size;
            range
        };
        let non_moving = carve(if split {
            settings.non_moving_capacity
        } else {
            settings.capacity
        });
        let post_zygote = settings
            .is_zygote
            .then(|| carve(settings.non_moving_capacity));
        let main = split.then(|| carve(settings.capacity));
        let bump_capacity = settings.capacity.min(settings.bump_pointer_capacity);
        let bump = carve(bump_capacity);
        let temp = carve(bump_capacity);
        let region = (settings.region_capacity > 0).then(|| carve(settings.region_capacity));
        Self {
            image: settings.image_capacity,
            non_moving,
            post_zygote,
            main,
            bump,
            temp,
            region,
            total: cursor,
        }
    }
}

fn carve(
    reservation: &MemoryRegion,
    name: &str,
    (offset, size): (usize, usize),
) -> Result<MemoryRegion, HeapError> {
    reservation
        .sub_region(name, offset, size)
        .ok_or(HeapError::InvalidSettings("heap layout exceeds its reservation"))
}

impl HeapInner {
    pub fn new(
        settings: HeapSettings,
        model: Box<dyn ObjectModel>,
        runtime: Arc<dyn Runtime>,
    ) -> Result<Self, HeapError> {
        settings.validate().map_err(HeapError::InvalidSettings)?;

        let layout = Layout::new(&settings);
        let reservation = MemoryRegion::map("heap reservation", layout.total)?;
        debug_assert!(reservation.begin().is_multiple_of(OS_PAGE_SIZE));
        let card_table = CardTable::new(reservation.begin(), reservation.size());
        let malloc_kind = if settings.use_rosalloc {
            MallocKind::RosAlloc
        } else {
            MallocKind::DlMalloc
        };

        let mut table = SpaceTable::new();
        let image_reserve = if layout.image > 0 {
            Some(carve(&reservation, "image space", (0, layout.image))?)
        } else {
            None
        };
        let non_moving = if settings.is_zygote {
            let region = carve(&reservation, "zygote / non moving space", layout.non_moving)?;
            MallocSpace::new(
                region,
                malloc_kind,
                settings.growth_limit,
                settings.low_memory_mode,
                false,
            )
        } else if layout.main.is_some() {
            let region = carve(&reservation, NON_MOVING_SPACE_NAME, layout.non_moving)?;
            MallocSpace::new(
                region,
                MallocKind::DlMalloc,
                settings.non_moving_capacity,
                settings.low_memory_mode,
                false,
            )
        } else {
            let region = carve(&reservation, "alloc space", layout.non_moving)?;
            MallocSpace::new(
                region,
                malloc_kind,
                settings.growth_limit,
                settings.low_memory_mode,
                false,
            )
        };
        non_moving.set_footprint_limit(non_moving.capacity());
        let non_moving = table.add(Space::Malloc(non_moving));

        let main = match layout.main {
            Some(range) => {
                let region = carve(&reservation, MAIN_SPACE_NAME, range)?;
                let main = MallocSpace::new(
                    region,
                    malloc_kind,
                    settings.growth_limit,
                    settings.low_memory_mode,
                    true,
                );
                main.set_footprint_limit(main.capacity());
                Some(table.add(Space::Malloc(main)))
            }
            None => None,
        };
        let post_zygote_non_moving = match layout.post_zygote {
            Some(range) => Some(carve(&reservation, NON_MOVING_SPACE_NAME, range)?),
            None => None,
        };

        let bump_pointer = table.add(Space::BumpPointer(BumpPointerSpace::new(carve(
            &reservation,
            BUMP_SPACE_NAME,
            layout.bump,
        )?)));
        let temp = table.add(Space::BumpPointer(BumpPointerSpace::new(carve(
            &reservation,
            TEMP_SPACE_NAME,
            layout.temp,
        )?)));
        let region = match layout.region {
            Some(range) => {
                let memory = carve(&reservation, "region space", range)?;
                Some(table.add(Space::Region(RegionSpace::new(memory, settings.region_size))))
            }
            None => None,
        };
        let large_objects = table.add(Space::LargeObject(LargeObjectSpace::new("large object space")));

        let moving_range = {
            let begin = reservation.begin() + layout.bump.0;
            let (offset, size) = layout.region.unwrap_or(layout.temp);
            (begin, reservation.begin() + offset + size)
        };

        let mut spaces = HeapSpaces {
            table,
            main,
            non_moving,
            bump_pointer,
            temp,
            region,
            large_objects,
            image: None,
            parked_main: None,
            image_reserve,
            post_zygote_non_moving,
        };
        spaces.add_remembered_set(non_moving, "Non-moving space remembered set");
        if let Some(main) = main {
            spaces.add_remembered_set(main, "Main space remembered set");
        }

        let initial_collector = if settings.is_zygote {
            if settings.foreground_collector == CollectorType::Gss {
                CollectorType::Gss
            } else {
                CollectorType::Ss
            }
        } else {
            settings.foreground_collector
        };
        let large_object_threshold = if settings.is_zygote {
            usize::MAX
        } else {
            settings.large_object_threshold
        };
        let stacks = [
            ObjectStack::new("allocation stack", settings.allocation_stack_size),
            ObjectStack::new("live stack", settings.allocation_stack_size),
        ];

        let heap = Self {
            model,
            runtime,
            card_table,
            thread_list: ThreadList::new(),
            references: ReferenceProcessor::new(),
            stacks,
            live_stack_index: AtomicUsize::new(1),
            moving_range,
            last_gc_to_space_end: AtomicUsize::new(0),
            bytes_promoted_since_whole_heap: AtomicUsize::new(0),
            num_bytes_allocated: AtomicUsize::new(0),
            total_bytes_freed_ever: AtomicUsize::new(0),
            total_objects_freed_ever: AtomicUsize::new(0),
            max_allowed_footprint: AtomicUsize::new(settings.initial_size),
            growth_limit: AtomicUsize::new(settings.growth_limit),
            concurrent_start_bytes: AtomicUsize::new(usize::MAX),
            large_object_threshold: AtomicUsize::new(large_object_threshold),
            current_allocator: AtomicU8::new(AllocatorType::DlMalloc as u8),
            collector_type: AtomicU8::new(CollectorType::None as u8),
            have_zygote_space: AtomicBool::new(false),
            zygote_mode: AtomicBool::new(settings.is_zygote),
            gc: Mutex::new(GcState {
                collector_type_running: CollectorType::None,
                last_gc_type: GcType::None,
                disable_moving_gc_count: 0,
                gcs_completed: 0,
                total_wait_time: Duration::ZERO,
            }),
            gc_complete: Condvar::new(),
            policy: Mutex::new(growth::GrowthPolicy::new(&settings)),
            tasks: Mutex::new(daemon::PendingTasks::new(settings.foreground_collector)),
            tasks_changed: Condvar::new(),
            native: native::NativeAccounting::new(settings.initial_size),
            stats: Mutex::new(BTreeMap::new()),
            last_iteration: Mutex::new(None),
            spaces: RwLock::new(spaces),
            settings,
            reservation,
        };
        heap.change_collector(initial_collector);
        log::debug!(
            target: "heap",
            "reserved {:#x}-{:#x} for the heap, collector {initial_collector}",
            heap.reservation.begin(),
            heap.reservation.end()
        );
        Ok(heap)
    }

    #[inline]
    pub fn model(&self) -> &dyn ObjectModel {
        &*self.model
    }

    pub fn collector_type(&self) -> CollectorType {
        CollectorType::from(self.collector_type.load(Ordering::Acquire))
    }

    pub fn current_allocator(&self) -> AllocatorType {
        AllocatorType::from(self.current_allocator.load(Ordering::Acquire))
    }

    pub fn have_zygote_space(&self) -> bool {
        self.have_zygote_space.load(Ordering::Acquire)
    }

    pub fn is_zygote_mode(&self) -> bool {
        self.zygote_mode.load(Ordering::Acquire)
    }

    /// Bytes handed out and not yet reclaimed, in every space.
    pub fn bytes_allocated(&self) -> usize {
        self.num_bytes_allocated.load(Ordering::SeqCst)
    }

    pub fn max_allowed_footprint(&self) -> usize {
        self.max_allowed_footprint.load(Ordering::Relaxed)
    }

    pub fn concurrent_start_bytes(&self) -> usize {
        self.concurrent_start_bytes.load(Ordering::Relaxed)
    }

    pub fn large_object_threshold(&self) -> usize {
        self.large_object_threshold.load(Ordering::Relaxed)
    }

    /// Number of collections that ran to completion.
    pub fn gcs_completed(&self) -> u64 {
        self.gc.lock().gcs_completed
    }

    /// Type of the last collection that ran.
    pub fn last_gc_type(&self) -> GcType {
        self.gc.lock().last_gc_type
    }

    pub fn last_iteration(&self) -> Option<Iteration> {
        self.last_iteration.lock().clone()
    }

    /// Installs the tables of `collector_type`. The caller makes sure no
    /// collection runs.
    pub(crate) fn change_collector(&self, collector_type: CollectorType) {
        if collector_type == self.collector_type() {
            return;
        }
        let mut policy = self.policy.lock();
        let allocator = match collector_type {
            CollectorType::Ss | CollectorType::Gss => {
                policy.gc_plan = vec![GcType::Full];
                if self.settings.use_tlab {
                    AllocatorType::Tlab
                } else {
                    AllocatorType::BumpPointer
                }
            }
            CollectorType::Ms | CollectorType::Cms => {
                policy.gc_plan = vec![GcType::Sticky, GcType::Partial, GcType::Full];
                if self.settings.use_rosalloc {
                    AllocatorType::RosAlloc
                } else {
                    AllocatorType::DlMalloc
                }
            }
            other => fatal(&format!("cannot install collector {other}")),
        };
        self.collector_type
            .store(collector_type as u8, Ordering::Release);
        self.current_allocator
            .store(allocator as u8, Ordering::Release);
        let start_bytes = if collector_type.is_concurrent() {
            self.max_allowed_footprint()
                .max(growth::MIN_CONCURRENT_REMAINING_BYTES)
                - growth::MIN_CONCURRENT_REMAINING_BYTES
        } else {
            usize::MAX
        };
        self.concurrent_start_bytes
            .store(start_bytes, Ordering::Relaxed);
        log::debug!(
            target: "heap",
            "installed collector {collector_type}, allocator {allocator:?}, plan {:?}",
            policy.gc_plan
        );
    }

    // ── Stacks ────────────────────────────────────────────────────────

    #[inline]
    pub(crate) fn allocation_stack(&self) -> &ObjectStack {
        &self.stacks[1 - self.live_stack_index.load(Ordering::Acquire)]
    }

    #[inline]
    pub(crate) fn live_stack(&self) -> &ObjectStack {
        &self.stacks[self.live_stack_index.load(Ordering::Acquire)]
    }

    /// The allocation stack becomes the live stack. Mutators must be
    /// suspended and the live stack empty.
    pub(crate) fn swap_stacks(&self) {
        debug_assert!(self.live_stack().is_empty(), "live stack was not flushed");
        self.live_stack_index.fetch_xor(1, Ordering::AcqRel);
    }

    /// Marks the objects of `stack` in the live bitmap of their space.
    pub(crate) fn mark_alloc_stack_as_live(&self, spaces: &HeapSpaces, stack: &ObjectStack) {
        stack.for_each(|obj| match spaces.table.find_space(obj) {
            Some((_, Space::Malloc(malloc))) => {
                malloc.live_bitmap().set(obj);
            }
            Some((_, Space::LargeObject(los))) => {
                los.live_objects().set(obj);
            }
            _ => {}
        });
    }

    // ── Roots and buffers ─────────────────────────────────────────────

    /// Runtime roots plus the objects held for blocked mutators.
    pub(crate) fn visit_roots(&self, visitor: &mut dyn FnMut(&mut ObjectRef)) {
        self.runtime.visit_roots(visitor);
        self.thread_list.for_each_mutator(|mutator| {
            for root in mutator.scoped_roots.lock().iter_mut() {
                visitor(root);
            }
        });
    }

    /// Returns every TLAB and RosAlloc slot batch to its space. Mutators
    /// must be suspended.
    pub(crate) fn revoke_all_thread_local_buffers(&self, spaces: &HeapSpaces) {
        self.thread_list
            .for_each_mutator(|mutator| self.revoke_buffers(spaces, &mut mutator.buffers.lock()));
    }

    pub(crate) fn revoke_buffers(&self, spaces: &HeapSpaces, buffers: &mut ThreadLocalBuffers) {
        if let Some(tlab) = buffers.tlab.take() {
            match spaces.table.get(tlab.space) {
                Some(Space::BumpPointer(bump)) => bump.revoke_tlab(tlab.objects),
                Some(Space::Region(region)) => region.revoke_tlab(tlab.objects),
                _ => fatal(&format!("TLAB of unknown space {:?}", tlab.space)),
            }
        }
        if let Some(id) = buffers.slots_space.take()
            && let Some(malloc) = spaces.table.get(id).and_then(Space::as_malloc)
        {
            let freed = malloc.revoke_thread_local(&mut buffers.slots);
            self.record_free_bytes(freed);
        }
    }

    // ── Cards ─────────────────────────────────────────────────────────

    #[inline]
    pub(crate) fn is_in_moving_range(&self, addr: usize) -> bool {
        addr >= self.moving_range.0 && addr < self.moving_range.1
    }

    /// Dirties the card of `holder` after a reference store. Stores of
    /// null never need a card.
    #[inline]
    pub fn write_barrier(&self, holder: ObjectRef, value: Option<ObjectRef>) {
        if value.is_some() && self.card_table.covers(holder.addr()) {
            self.card_table.mark_card(holder.addr());
        }
    }

    /// Moves the dirty cards of spaces with a mod-union table (and, when
    /// `use_rem_sets`, a remembered set) into those tables. Cards of the
    /// other malloc spaces get cleared or aged when
    /// `process_alloc_space_cards` is set.
    pub(crate) fn process_cards(
        &self,
        spaces: &HeapSpaces,
        use_rem_sets: bool,
        process_alloc_space_cards: bool,
        clear_alloc_space_cards: bool,
    ) {
        for (id, space) in spaces.table.continuous_spaces() {
            if let Some(table) = spaces.table.mod_union_tables.get(&id) {
                table.clear_cards(&self.card_table);
            } else if use_rem_sets && let Some(set) = spaces.table.remembered_sets.get(&id) {
                set.clear_cards(&self.card_table);
            } else if process_alloc_space_cards && let Space::Malloc(malloc) = space {
                if clear_alloc_space_cards {
                    self.card_table
                        .clear_card_range(malloc.begin(), malloc.limit());
                } else {
                    self.card_table.modify_cards_atomic(
                        malloc.begin(),
                        malloc.limit(),
                        age_card,
                        |_, _, _| {},
                    );
                }
            }
        }
    }

    // ── Accounting ────────────────────────────────────────────────────

    pub(crate) fn record_free_bytes(&self, bytes: usize) {
        if bytes == 0 {
            return;
        }
        let previous = self.num_bytes_allocated.fetch_sub(bytes, Ordering::SeqCst);
        if previous < bytes {
            fatal(&format!("freed {bytes} bytes with only {previous} allocated"));
        }
    }

    /// Folds a finished collection into the counters.
    pub(crate) fn record_iteration(&self, name: &str, iteration: &Iteration) {
        let freed_bytes = iteration.total_freed_bytes();
        if freed_bytes >= 0 {
            self.record_free_bytes(freed_bytes as usize);
            self.total_bytes_freed_ever
                .fetch_add(freed_bytes as usize, Ordering::Relaxed);
        } else {
            // promotion out of zygote holes can take more than it freed
            self.num_bytes_allocated
                .fetch_add(freed_bytes.unsigned_abs() as usize, Ordering::SeqCst);
        }
        self.total_objects_freed_ever
            .fetch_add(iteration.total_freed_objects().max(0) as usize, Ordering::Relaxed);
        self.stats
            .lock()
            .entry(name.to_string())
            .or_default()
            .record(iteration);
        *self.last_iteration.lock() = Some(iteration.clone());
    }

    /// Releases `guard` while `f` runs, so that a collection can suspend
    /// the calling mutator.
    pub(crate) fn blocking<R>(&self, guard: &mut Option<MutatorGuard>, f: impl FnOnce() -> R) -> R {
        let held = guard.take().is_some();
        let result = f();
        if held {
            *guard = Some(self.thread_list.acquire());
        }
        result
    }
}

impl fmt::Debug for HeapInner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HeapInner")
            .field("reservation", &self.reservation)
            .field("collector", &self.collector_type())
            .field("allocator", &self.current_allocator())
            .field("bytes_allocated", &self.bytes_allocated())
            .field("max_allowed_footprint", &self.max_allowed_footprint())
            .field("thread_list", &self.thread_list)
            .finish()
    }
}

// ── Heap (Arc wrapper) ────────────────────────────────────────────────

/// Handle to a heap, cheap to clone and share between threads.
#[derive(Debug, Clone)]
pub struct Heap(Arc<HeapInner>);

impl Heap {
    pub fn new(
        settings: HeapSettings,
        model: Box<dyn ObjectModel>,
        runtime: Arc<dyn Runtime>,
    ) -> Result<Self, HeapError> {
        let inner = HeapInner::new(settings, model, runtime)?;
        Ok(Self(Arc::new(inner)))
    }

    /// Registers the calling thread as a mutator.
    #[must_use]
    pub fn mutator(&self, name: &str) -> Mutator {
        Mutator::new(self.clone(), name)
    }
}

impl Deref for Heap {
    type Target = HeapInner;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

// ── Tests ─────────────────────────────────────────────────────────────

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::{
        collector::GcCause,
        error::OutOfMemoryError,
        testing::{
            CLASS_SIZE, KIND_NORMAL, KIND_PRIMITIVE_ARRAY, TestModel, TestRuntime, init_class,
            init_object, object_size, ref_slot,
        },
    };

    pub(crate) fn create_test_settings() -> HeapSettings {
        HeapSettings {
            initial_size: 1024 * 1024,     // 1 MB
            growth_limit: 4 * 1024 * 1024, // 4 MB
            capacity: 4 * 1024 * 1024,     // 4 MB
            non_moving_capacity: 1024 * 1024,
            bump_pointer_capacity: 4 * 1024 * 1024,
            image_capacity: 64 * 1024,
            min_free: 64 * 1024,
            max_free: 256 * 1024,
            foreground_collector: CollectorType::Ms,
            background_collector: CollectorType::Ss,
            large_object_threshold: 3 * OS_PAGE_SIZE,
            ..HeapSettings::default()
        }
    }

    pub(crate) fn create_test_env(settings: HeapSettings) -> (Heap, Mutator, Arc<TestRuntime>) {
        let runtime = Arc::new(TestRuntime::new());
        let heap = Heap::new(settings, Box::new(TestModel), runtime.clone())
            .expect("valid test settings");
        let mutator = heap.mutator("main");
        (heap, mutator, runtime)
    }

    /// Classes the tests instantiate: a metaclass, a plain class, and a
    /// card table exempt array class, allocated in the non-moving space.
    pub(crate) struct TestClasses {
        pub metaclass: ObjectRef,
        pub normal: ObjectRef,
        pub array: ObjectRef,
    }

    pub(crate) fn install_classes(mutator: &mut Mutator, runtime: &TestRuntime) -> TestClasses {
        let metaclass = alloc_class(mutator, None, KIND_NORMAL);
        let normal = alloc_class(mutator, Some(metaclass), KIND_NORMAL);
        let array = alloc_class(mutator, Some(metaclass), KIND_PRIMITIVE_ARRAY);
        runtime.push(metaclass);
        runtime.push(normal);
        runtime.push(array);
        TestClasses {
            metaclass,
            normal,
            array,
        }
    }

    pub(crate) fn alloc_class(
        mutator: &mut Mutator,
        metaclass: Option<ObjectRef>,
        kind: usize,
    ) -> ObjectRef {
        let class = mutator
            .alloc_raw(CLASS_SIZE, AllocatorType::NonMoving)
            .expect("class allocation");
        // SAFETY: freshly allocated CLASS_SIZE bytes
        unsafe { init_class(class, metaclass.unwrap_or(class), kind) };
        class
    }

    pub(crate) fn alloc_test_object(
        mutator: &mut Mutator,
        class: ObjectRef,
        refs: usize,
        payload: usize,
    ) -> Result<ObjectRef, OutOfMemoryError> {
        let size = object_size(refs, payload);
        mutator.alloc_object_with(class, size, |obj, _| {
            // SAFETY: the allocation is at least `size` bytes
            unsafe { init_object(obj, size, refs) };
        })
    }

    #[test]
    fn test_layout_of_split_configuration() {
        let (heap, _mutator, _runtime) = create_test_env(create_test_settings());
        let spaces = heap.spaces.read();
        assert!(spaces.main.is_some(), "compacting background needs a main space");
        assert_eq!(spaces.non_moving_space().name(), NON_MOVING_SPACE_NAME);
        assert_eq!(spaces.main_space().map(MallocSpace::name), Some(MAIN_SPACE_NAME));
        assert_eq!(spaces.bump_space().name(), BUMP_SPACE_NAME);
        assert_eq!(spaces.temp_space().name(), TEMP_SPACE_NAME);
        assert!(spaces.image_reserve.is_some());
        assert!(spaces.table.remembered_sets.len() == 2);
        assert!(heap.is_in_moving_range(spaces.bump_space().begin()));
        assert!(heap.is_in_moving_range(spaces.temp_space().limit() - 8));
        assert!(!heap.is_in_moving_range(spaces.non_moving_space().begin()));
        assert_eq!(heap.collector_type(), CollectorType::Ms);
        assert_eq!(heap.current_allocator(), AllocatorType::RosAlloc);
    }

    #[test]
    fn test_single_alloc_space_without_compacting_collectors() {
        let settings = HeapSettings {
            background_collector: CollectorType::Ms,
            use_rosalloc: false,
            ..create_test_settings()
        };
        let (heap, _mutator, _runtime) = create_test_env(settings);
        let spaces = heap.spaces.read();
        assert!(spaces.main.is_none());
        assert_eq!(spaces.non_moving_space().name(), "alloc space");
        assert_eq!(spaces.primary_malloc_id(), spaces.non_moving);
        assert_eq!(heap.current_allocator(), AllocatorType::DlMalloc);
    }

    #[test]
    fn test_invalid_settings_are_rejected() {
        let settings = HeapSettings {
            initial_size: 8 * 1024 * 1024,
            ..create_test_settings()
        };
        let runtime = Arc::new(TestRuntime::new());
        let result = Heap::new(settings, Box::new(TestModel), runtime);
        assert!(matches!(result, Err(HeapError::InvalidSettings(_))));
    }

    #[test]
    fn test_stacks_swap_roles() {
        let (heap, mut mutator, runtime) = create_test_env(create_test_settings());
        let classes = install_classes(&mut mutator, &runtime);
        let obj = alloc_test_object(&mut mutator, classes.normal, 0, 8).expect("allocation");
        assert!(heap.allocation_stack().contains(obj));
        mutator.blocking(|heap| {
            let _suspended = heap.thread_list.suspend_all();
            heap.swap_stacks();
            assert!(heap.live_stack().contains(obj));
            assert!(heap.allocation_stack().is_empty());
            let spaces = heap.spaces.read();
            heap.mark_alloc_stack_as_live(&spaces, heap.live_stack());
            heap.live_stack().reset();
            assert!(spaces.table.live_bitmap().test(obj), "stack objects marked live");
        });
    }

    #[test]
    fn test_process_cards_ages_alloc_space_cards() {
        let (heap, mut mutator, runtime) = create_test_env(create_test_settings());
        let classes = install_classes(&mut mutator, &runtime);
        let holder = alloc_test_object(&mut mutator, classes.normal, 1, 0).expect("holder");
        let target = alloc_test_object(&mut mutator, classes.normal, 0, 0).expect("target");
        // SAFETY: holder has one reference slot
        let slot = unsafe { ref_slot(holder, 0) };
        mutator.write_field(holder, slot, Some(target));
        assert!(heap.card_table.is_dirty(holder.addr()));
        mutator.blocking(|heap| {
            let spaces = heap.spaces.read();
            heap.process_cards(&spaces, false, true, false);
            assert!(!heap.card_table.is_dirty(holder.addr()));
            assert_eq!(
                heap.card_table.get_card(holder.addr()),
                crate::accounting::card_table::CARD_AGED
            );
            heap.process_cards(&spaces, false, true, true);
            assert_eq!(heap.card_table.get_card(holder.addr()), 0);
        });
    }

    #[test]
    fn test_record_iteration_updates_counters() {
        let (heap, mut mutator, runtime) = create_test_env(create_test_settings());
        let classes = install_classes(&mut mutator, &runtime);
        alloc_test_object(&mut mutator, classes.normal, 0, 1000).expect("allocation");
        let before = heap.bytes_allocated();
        let mut iteration = Iteration::new("mark sweep", GcType::Full, GcCause::Explicit, true);
        iteration.record_free(1, 512);
        heap.record_iteration("mark sweep", &iteration);
        assert_eq!(heap.bytes_allocated(), before - 512);
        assert_eq!(heap.total_bytes_freed_ever.load(Ordering::Relaxed), 512);
        assert!(heap.last_iteration().is_some());
        assert_eq!(heap.stats.lock()["mark sweep"].iterations, 1);
    }
}

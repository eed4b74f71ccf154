//! Copying collector.
//!
//! Reachable objects of the from-spaces are copied into the to-space and
//! forwarded through a side table, so from-space memory is left untouched
//! until it is cleared. Objects of spaces with bitmaps are marked in place.
//! The same collector runs regular semi-space collections, heap compaction
//! for collector transitions and the zygote compaction, which packs the
//! bump pointer space into the holes of the non-moving space.

use std::{
    collections::{BTreeMap, HashMap},
    sync::atomic::Ordering,
    time::Instant,
};

use crate::{
    collector::{GcCause, GcType, Iteration},
    error::fatal,
    heap::{HeapInner, HeapSpaces},
    object::{OBJECT_ALIGNMENT, ObjectModel, ObjectRef, ObjectSlot},
    reference_queue::ReferenceMarker,
    space::{
        Space, SpaceId, bump_pointer::BumpPointerSpace, malloc_space::MallocSpace,
        region::RegionSpace,
    },
    system::align_up,
};

/// Promotion since the last whole heap collection that forces the next
/// generational collection to cover the whole heap.
pub const PROMOTED_BYTES_THRESHOLD: usize = 4 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SemiSpaceMode {
    Normal,
    /// Survivors of one collection are promoted into the main space.
    Generational,
    /// Packs movable objects into the non-moving space before the zygote
    /// fork.
    ZygoteCompaction,
}

pub struct SemiSpace {
    mode: SemiSpaceMode,
    from: Vec<SpaceId>,
    to: Option<SpaceId>,
    /// Bump space over the unused tail of the non-moving space, receiving
    /// what does not fit in the holes.
    overflow: Option<BumpPointerSpace>,
}

impl SemiSpace {
    pub fn new(mode: SemiSpaceMode, from: Vec<SpaceId>, to: SpaceId) -> Self {
        debug_assert!(mode != SemiSpaceMode::ZygoteCompaction);
        Self {
            mode,
            from,
            to: Some(to),
            overflow: None,
        }
    }

    pub fn zygote(from: Vec<SpaceId>, overflow: BumpPointerSpace) -> Self {
        Self {
            mode: SemiSpaceMode::ZygoteCompaction,
            from,
            to: None,
            overflow: Some(overflow),
        }
    }

    pub fn mode(&self) -> SemiSpaceMode {
        self.mode
    }

    pub fn name(&self) -> &'static str {
        match self.mode {
            SemiSpaceMode::Normal => "semispace",
            SemiSpaceMode::Generational => "generational semispace",
            SemiSpaceMode::ZygoteCompaction => "zygote collector",
        }
    }

    /// End of the overflow area after a zygote compaction.
    pub fn overflow_end(&self) -> Option<usize> {
        self.overflow.as_ref().map(BumpPointerSpace::end)
    }

    /// Runs one collection. Mutators must be suspended with their buffers
    /// revoked and the space table must not change while it runs.
    pub(crate) fn run_paused(
        &self,
        heap: &HeapInner,
        spaces: &HeapSpaces,
        cause: GcCause,
        clear_soft: bool,
    ) -> Iteration {
        let start = Instant::now();
        let mut iteration = Iteration::new(self.name(), GcType::Full, cause, clear_soft);
        let whole_heap = self.mode != SemiSpaceMode::Generational
            || matches!(cause, GcCause::Explicit | GcCause::NativeAlloc)
            || clear_soft
            || heap.bytes_promoted_since_whole_heap.load(Ordering::Relaxed)
                >= PROMOTED_BYTES_THRESHOLD;

        iteration.timings.new_split("InitializePhase");
        let env = self.environment(heap, spaces, whole_heap);
        let mut state = CopyState::default();
        if let Destination::ZygoteBins { target, .. } = env.to {
            state.bins = build_bins(target, env.model);
        }
        let region_from_objects = env.region.map_or(0, |region| {
            region.set_from_space();
            region.objects_allocated()
        });
        let mut from_bytes = 0;
        let mut from_objects = 0;
        for id in &self.from {
            let space = spaces.space(*id);
            from_bytes += space.bytes_allocated();
            from_objects += space.objects_allocated();
        }

        iteration.timings.new_split("SwapStacks");
        heap.swap_stacks();
        heap.mark_alloc_stack_as_live(spaces, heap.live_stack());
        heap.live_stack().reset();
        if !whole_heap {
            spaces.large_objects().copy_live_to_marked();
        }

        iteration.timings.new_split("ProcessCards");
        heap.process_cards(spaces, self.mode == SemiSpaceMode::Generational, false, false);

        iteration.timings.new_split("MarkRoots");
        heap.visit_roots(&mut |root| {
            *root = state.mark_object(&env, *root);
        });
        iteration.timings.new_split("UpdateAndMarkModUnion");
        for (id, table) in &spaces.table.mod_union_tables {
            if let Some(live) = spaces.table.get(*id).and_then(Space::live_bitmap) {
                table.update_and_mark_references(&live, env.model, &mut |_, slot| {
                    state.forward_slot(&env, slot);
                });
            }
        }
        if !whole_heap {
            iteration.timings.new_split("UpdateAndMarkRememberedSets");
            for (id, remembered) in &spaces.table.remembered_sets {
                let Some(live) = spaces.table.get(*id).and_then(Space::live_bitmap) else {
                    continue;
                };
                remembered.update_and_mark_references(
                    &|target: ObjectRef| env.in_from(target.addr()),
                    &live,
                    env.model,
                    &mut |_, slot| state.forward_slot(&env, slot),
                );
            }
            iteration.timings.new_split("ScanLargeObjects");
            for obj in spaces.large_objects().live_objects().snapshot() {
                // SAFETY: live large objects are initialized
                unsafe { state.scan(&env, obj) };
            }
        }
        iteration.timings.new_split("ScanGraySpaces");
        for id in spaces.moving_space_ids() {
            if self.from.contains(&id) || self.to == Some(id) {
                continue;
            }
            let space = spaces.space(id);
            if env.region.is_some() && space.as_region().is_some() {
                continue;
            }
            // SAFETY: mutators are suspended and their buffers revoked
            unsafe { space.walk(env.model, &mut |obj| state.scan(&env, obj)) };
        }

        iteration.timings.new_split("RecursiveMark");
        state.drain(&env);
        iteration.timings.new_split("ProcessReferences");
        let mut marking = ReferenceForwarding {
            env: &env,
            state: &mut state,
        };
        // SAFETY: queued references were scanned this cycle and are alive
        iteration.references = unsafe {
            heap.references
                .process_references(env.model, clear_soft, &mut marking)
        };
        heap.references
            .update_cleared(|reference| state.forward.get(&reference).copied().unwrap_or(reference));

        self.reclaim(&env, &mut iteration, whole_heap);

        iteration.timings.new_split("ClearFromSpace");
        if let Some(region) = env.region {
            from_bytes += region.clear_from_space(region_from_objects);
            from_objects += region_from_objects;
        }
        for id in &self.from {
            match spaces.space(*id) {
                Space::BumpPointer(bump) => bump.clear(),
                Space::Malloc(malloc) => malloc.clear(),
                other => fatal(&format!("cannot evacuate {}", other.name())),
            }
        }
        iteration.freed_objects += from_objects as i64 - state.moved_objects as i64;
        iteration.freed_bytes += from_bytes as i64 - state.moved_bytes as i64;

        if self.mode == SemiSpaceMode::Generational {
            if let Some(to) = self.to {
                heap.last_gc_to_space_end
                    .store(spaces.space(to).end(), Ordering::Relaxed);
            }
            if whole_heap {
                heap.bytes_promoted_since_whole_heap.store(0, Ordering::Relaxed);
            } else {
                heap.bytes_promoted_since_whole_heap
                    .fetch_add(state.promoted_bytes, Ordering::Relaxed);
            }
        }
        log::debug!(
            target: "gc",
            "{}: moved {} objects ({} bytes), promoted {} bytes, whole heap {whole_heap}",
            self.name(),
            state.moved_objects,
            state.moved_bytes,
            state.promoted_bytes
        );
        iteration.timings.end_split();
        iteration.duration = start.elapsed();
        iteration.pauses.push(iteration.duration);
        iteration
    }

    fn environment<'a>(
        &'a self,
        heap: &'a HeapInner,
        spaces: &'a HeapSpaces,
        whole_heap: bool,
    ) -> Env<'a> {
        let mut from = Vec::new();
        for id in &self.from {
            let space = spaces.space(*id);
            from.push((space.begin(), space.limit()));
        }
        let mut immune = Vec::new();
        if let Some((_, image)) = spaces.table.image_space() {
            immune.push((image.begin(), image.limit()));
        }
        if let Some((_, zygote)) = spaces.table.zygote_space() {
            immune.push((zygote.begin(), zygote.limit()));
        }
        let to = match (&self.overflow, self.to) {
            (Some(overflow), _) => Destination::ZygoteBins {
                target: spaces.non_moving_space(),
                overflow,
            },
            (None, Some(to)) => match spaces.space(to) {
                Space::BumpPointer(bump) => Destination::Bump(bump),
                Space::Malloc(malloc) => Destination::Malloc(malloc),
                other => fatal(&format!("cannot copy into {}", other.name())),
            },
            (None, None) => fatal("semi-space collection without a destination"),
        };
        let region = match self.mode {
            SemiSpaceMode::ZygoteCompaction => None,
            _ => spaces.region.map(|id| spaces.region_space(id)),
        };
        Env {
            heap,
            spaces,
            model: heap.model(),
            mode: self.mode,
            from,
            immune,
            to,
            region,
            whole_heap,
            last_gc_to_space_end: heap.last_gc_to_space_end.load(Ordering::Relaxed),
            promote_to: spaces.main.map(|id| spaces.malloc(id)),
            fallback: spaces.non_moving_space(),
        }
    }

    /// Sweeps what was traced in place and swaps its bitmaps.
    fn reclaim(&self, env: &Env<'_>, iteration: &mut Iteration, whole_heap: bool) {
        let spaces = env.spaces;
        let sweep = whole_heap && self.mode != SemiSpaceMode::ZygoteCompaction;
        if sweep {
            iteration.timings.new_split("Sweep");
            for (id, malloc) in spaces.table.malloc_spaces() {
                if self.from.contains(&id) {
                    continue;
                }
                let (objects, bytes) = malloc.sweep();
                iteration.record_free(objects, bytes);
                malloc.swap_bitmaps();
            }
            let los = spaces.large_objects();
            let (objects, bytes) = los.sweep();
            iteration.record_free_large(objects, bytes);
            los.swap_bitmaps();
        }
        for (_, malloc) in spaces.table.malloc_spaces() {
            malloc.mark_bitmap().clear_all();
        }
        spaces.large_objects().mark_objects().clear_all();
    }
}

enum Destination<'a> {
    Bump(&'a BumpPointerSpace),
    Malloc(&'a MallocSpace),
    ZygoteBins {
        target: &'a MallocSpace,
        overflow: &'a BumpPointerSpace,
    },
}

/// Everything that stays fixed during one collection.
struct Env<'a> {
    heap: &'a HeapInner,
    spaces: &'a HeapSpaces,
    model: &'a dyn ObjectModel,
    mode: SemiSpaceMode,
    /// `[begin, limit)` of every from-space.
    from: Vec<(usize, usize)>,
    immune: Vec<(usize, usize)>,
    to: Destination<'a>,
    /// Region space evacuated in place.
    region: Option<&'a RegionSpace>,
    whole_heap: bool,
    last_gc_to_space_end: usize,
    promote_to: Option<&'a MallocSpace>,
    fallback: &'a MallocSpace,
}

impl Env<'_> {
    #[inline]
    fn in_from(&self, addr: usize) -> bool {
        self.from.iter().any(|&(begin, limit)| addr >= begin && addr < limit)
            || self.region.is_some_and(|region| region.is_in_from_space(addr))
    }

    #[inline]
    fn is_immune(&self, addr: usize) -> bool {
        self.immune.iter().any(|&(begin, limit)| addr >= begin && addr < limit)
    }
}

#[derive(Default)]
struct CopyState {
    forward: HashMap<ObjectRef, ObjectRef>,
    stack: Vec<ObjectRef>,
    /// Holes of the non-moving space by size, for the zygote compaction.
    bins: BTreeMap<usize, Vec<usize>>,
    moved_objects: usize,
    moved_bytes: usize,
    promoted_bytes: usize,
}

impl CopyState {
    /// Current address of `obj` if it survives, `None` if it is white.
    fn is_marked(&self, env: &Env<'_>, obj: ObjectRef) -> Option<ObjectRef> {
        let addr = obj.addr();
        if env.in_from(addr) {
            return self.forward.get(&obj).copied();
        }
        if env.is_immune(addr) {
            return Some(obj);
        }
        match env.spaces.table.find_space(obj) {
            Some((_, Space::Malloc(malloc))) if env.whole_heap => {
                malloc.mark_bitmap().test(obj).then_some(obj)
            }
            Some((_, Space::LargeObject(los))) => los.mark_objects().test(obj).then_some(obj),
            _ => Some(obj),
        }
    }

    /// Marks `obj` and returns its new address.
    fn mark_object(&mut self, env: &Env<'_>, obj: ObjectRef) -> ObjectRef {
        let addr = obj.addr();
        if env.in_from(addr) {
            if let Some(forwarded) = self.forward.get(&obj) {
                return *forwarded;
            }
            // SAFETY: reachable from-space objects are initialized
            return unsafe { self.copy(env, obj) };
        }
        if env.is_immune(addr) {
            return obj;
        }
        match env.spaces.table.find_space(obj) {
            Some((_, Space::Malloc(malloc))) => {
                if env.whole_heap && !malloc.mark_bitmap().set(obj) {
                    self.stack.push(obj);
                }
            }
            Some((_, Space::LargeObject(los))) => {
                if !los.mark_objects().set(obj) {
                    self.stack.push(obj);
                }
            }
            _ => {}
        }
        obj
    }

    fn forward_slot(&mut self, env: &Env<'_>, slot: ObjectSlot) {
        if let Some(target) = slot.load() {
            let forwarded = self.mark_object(env, target);
            if forwarded != target {
                slot.store(Some(forwarded));
            }
        }
    }

    /// # Safety
    ///
    /// `obj` must be an initialized object of a from-space.
    unsafe fn copy(&mut self, env: &Env<'_>, obj: ObjectRef) -> ObjectRef {
        // SAFETY: guaranteed by the caller
        let size = align_up(unsafe { env.model.size_of(obj) }, OBJECT_ALIGNMENT);
        let (dest, bytes) = self.allocate_copy(env, obj, size);
        // SAFETY: both ranges are `size` bytes of mapped heap memory and
        // the destination was just allocated, so they cannot overlap
        unsafe {
            std::ptr::copy_nonoverlapping(obj.addr() as *const u8, dest.addr() as *mut u8, size);
        }
        self.forward.insert(obj, dest);
        self.stack.push(dest);
        self.moved_objects += 1;
        self.moved_bytes += bytes;
        dest
    }

    fn allocate_copy(&mut self, env: &Env<'_>, obj: ObjectRef, size: usize) -> (ObjectRef, usize) {
        if let Some(region) = env.region
            && region.is_in_from_space(obj.addr())
        {
            if let Some(allocation) = region.alloc(size) {
                return (allocation.object, allocation.bytes_allocated);
            }
            return self.allocate_fallback(env, size);
        }
        match env.to {
            Destination::ZygoteBins { target, overflow } => {
                let dest = match self.take_bin(size) {
                    Some(dest) => dest,
                    None => match overflow.alloc_thread_unsafe(size) {
                        Some(allocation) => allocation.object,
                        None => fatal("zygote compaction ran out of room"),
                    },
                };
                target.live_bitmap().set(dest);
                target.mark_bitmap().set(dest);
                (dest, size)
            }
            Destination::Bump(bump) => {
                if env.mode == SemiSpaceMode::Generational
                    && obj.addr() < env.last_gc_to_space_end
                    && let Some(promoted) = self.promote(env, size)
                {
                    return promoted;
                }
                match bump.alloc_thread_unsafe(size) {
                    Some(allocation) => (allocation.object, allocation.bytes_allocated),
                    None => self.allocate_fallback(env, size),
                }
            }
            Destination::Malloc(malloc) => match malloc.alloc(size) {
                Some(allocation) => {
                    malloc.live_bitmap().set(allocation.object);
                    malloc.mark_bitmap().set(allocation.object);
                    env.heap.card_table.mark_card(allocation.object.addr());
                    (allocation.object, allocation.bytes_allocated)
                }
                None => self.allocate_fallback(env, size),
            },
        }
    }

    fn promote(&mut self, env: &Env<'_>, size: usize) -> Option<(ObjectRef, usize)> {
        let space = env.promote_to.unwrap_or(env.fallback);
        let allocation = space.alloc(size)?;
        space.live_bitmap().set(allocation.object);
        space.mark_bitmap().set(allocation.object);
        // the promoted copy may still point at young objects
        env.heap.card_table.mark_card(allocation.object.addr());
        self.promoted_bytes += allocation.bytes_allocated;
        Some((allocation.object, allocation.bytes_allocated))
    }

    fn allocate_fallback(&mut self, env: &Env<'_>, size: usize) -> (ObjectRef, usize) {
        let Some(allocation) = env.fallback.alloc(size) else {
            fatal(&format!("out of memory copying an object of {size} bytes"));
        };
        env.fallback.live_bitmap().set(allocation.object);
        env.fallback.mark_bitmap().set(allocation.object);
        env.heap.card_table.mark_card(allocation.object.addr());
        (allocation.object, allocation.bytes_allocated)
    }

    /// Best fit hole of at least `size` bytes. The rest of the hole stays
    /// available.
    fn take_bin(&mut self, size: usize) -> Option<ObjectRef> {
        let (&bin_size, _) = self.bins.range(size..).next()?;
        let holes = self.bins.get_mut(&bin_size)?;
        let addr = holes.pop()?;
        if holes.is_empty() {
            self.bins.remove(&bin_size);
        }
        add_bin(&mut self.bins, addr + size, bin_size - size);
        ObjectRef::from_addr(addr)
    }

    /// # Safety
    ///
    /// `obj` must be an initialized object outside the from-spaces.
    unsafe fn scan(&mut self, env: &Env<'_>, obj: ObjectRef) {
        // SAFETY: guaranteed by the caller
        unsafe {
            self.forward_slot(env, obj.class_slot());
            env.model
                .visit_references(obj, &mut |slot| self.forward_slot(env, slot));
            if let Some(kind) = env.model.reference_kind(obj) {
                let slot = env.model.referent_slot(obj);
                if let Some(referent) = slot.load() {
                    match self.is_marked(env, referent) {
                        Some(current) if current != referent => slot.store(Some(current)),
                        Some(_) => {}
                        None => env.heap.references.delay_reference_referent(kind, obj),
                    }
                }
            }
        }
    }

    fn drain(&mut self, env: &Env<'_>) {
        while let Some(obj) = self.stack.pop() {
            // SAFETY: pushed objects are copies or marked in-place objects
            unsafe { self.scan(env, obj) };
        }
    }
}

fn add_bin(bins: &mut BTreeMap<usize, Vec<usize>>, addr: usize, size: usize) {
    if size > 0 {
        bins.entry(size).or_default().push(addr);
    }
}

/// Holes between the live objects of `space`, plus the tail up to the
/// allocator end.
fn build_bins(space: &MallocSpace, model: &dyn ObjectModel) -> BTreeMap<usize, Vec<usize>> {
    let mut bins = BTreeMap::new();
    let mut prev = space.begin();
    space.live_bitmap().walk(|obj| {
        add_bin(&mut bins, prev, obj.addr().saturating_sub(prev));
        // SAFETY: live objects are initialized
        let size = unsafe { model.size_of(obj) };
        prev = obj.addr() + align_up(size, OBJECT_ALIGNMENT);
    });
    add_bin(&mut bins, prev, space.end().saturating_sub(prev));
    bins
}

struct ReferenceForwarding<'e, 'a> {
    env: &'e Env<'a>,
    state: &'e mut CopyState,
}

impl ReferenceMarker for ReferenceForwarding<'_, '_> {
    fn is_marked(&mut self, obj: ObjectRef) -> Option<ObjectRef> {
        self.state.is_marked(self.env, obj)
    }

    fn mark(&mut self, obj: ObjectRef) -> ObjectRef {
        self.state.mark_object(self.env, obj)
    }

    fn process_mark_stack(&mut self) {
        self.state.drain(self.env);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bins_hand_out_best_fit() {
        let mut state = CopyState::default();
        add_bin(&mut state.bins, 0x1000, 64);
        add_bin(&mut state.bins, 0x2000, 32);
        add_bin(&mut state.bins, 0x3000, 0);
        let first = state.take_bin(24).expect("bin of 32");
        assert_eq!(first.addr(), 0x2000);
        assert_eq!(state.bins.get(&8), Some(&vec![0x2018]), "remainder stays");
        let second = state.take_bin(40).expect("bin of 64");
        assert_eq!(second.addr(), 0x1000);
        assert!(state.take_bin(64).is_none(), "no hole is large enough");
    }

    #[test]
    fn test_names() {
        let zygote = SemiSpace {
            mode: SemiSpaceMode::ZygoteCompaction,
            from: Vec::new(),
            to: None,
            overflow: None,
        };
        assert_eq!(zygote.name(), "zygote collector");
        assert_eq!(zygote.overflow_end(), None);
        let gss = SemiSpace::new(SemiSpaceMode::Generational, vec![SpaceId(1)], SpaceId(2));
        assert_eq!(gss.name(), "generational semispace");
        assert_eq!(gss.mode(), SemiSpaceMode::Generational);
    }
}

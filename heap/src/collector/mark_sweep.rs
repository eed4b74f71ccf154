//! Mark-sweep collectors: full, partial and sticky, each paused or
//! concurrent.
//!
//! Bump pointer and region spaces carry no bitmaps. While a mark-sweep
//! collector is installed their objects are treated as gray: they count
//! as marked and are scanned as a whole in the final pause. Only a
//! compacting collection reclaims them.

use std::time::Instant;

use crate::{
    accounting::{
        HeapBitmap, ObjectStack,
        card_table::{CARD_AGED, CARD_DIRTY},
    },
    collector::{GcCause, GcType, Iteration},
    error::fatal,
    heap::{HeapInner, HeapSpaces},
    object::{ObjectModel, ObjectRef},
    reference_queue::{ReferenceMarker, ReferenceStats},
    settings::VerifyFlags,
    space::{Space, SpaceId},
    worker_pool,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkSweepKind {
    /// Everything but the image space.
    Full,
    /// Image and zygote spaces are immune.
    Partial,
    /// Only objects allocated since the last collection are candidates.
    Sticky,
}

#[derive(Debug, Clone, Copy)]
pub struct MarkSweep {
    kind: MarkSweepKind,
    concurrent: bool,
}

impl MarkSweep {
    pub fn new(kind: MarkSweepKind, concurrent: bool) -> Self {
        Self { kind, concurrent }
    }

    pub fn for_gc_type(gc_type: GcType, concurrent: bool) -> Option<Self> {
        let kind = match gc_type {
            GcType::Sticky => MarkSweepKind::Sticky,
            GcType::Partial => MarkSweepKind::Partial,
            GcType::Full => MarkSweepKind::Full,
            GcType::None => return None,
        };
        Some(Self::new(kind, concurrent))
    }

    pub fn kind(&self) -> MarkSweepKind {
        self.kind
    }

    pub fn is_concurrent(&self) -> bool {
        self.concurrent
    }

    pub fn gc_type(&self) -> GcType {
        match self.kind {
            MarkSweepKind::Full => GcType::Full,
            MarkSweepKind::Partial => GcType::Partial,
            MarkSweepKind::Sticky => GcType::Sticky,
        }
    }

    pub fn name(&self) -> String {
        let prefix = match self.kind {
            MarkSweepKind::Full => "",
            MarkSweepKind::Partial => "partial ",
            MarkSweepKind::Sticky => "sticky ",
        };
        let base = if self.concurrent {
            "concurrent mark sweep"
        } else {
            "mark sweep"
        };
        format!("{prefix}{base}")
    }

    /// Runs one collection. The caller owns the running-collector slot and
    /// holds no mutator guard.
    pub fn run(&self, heap: &HeapInner, cause: GcCause, clear_soft: bool) -> Iteration {
        self.run_with(heap, cause, clear_soft, &mut || {})
    }

    /// Like [`MarkSweep::run`], calling `concurrent_phase` once the
    /// concurrent mark has drained, before the remark pause.
    pub(crate) fn run_with(
        &self,
        heap: &HeapInner,
        cause: GcCause,
        clear_soft: bool,
        concurrent_phase: &mut dyn FnMut(),
    ) -> Iteration {
        let start = Instant::now();
        let mut iteration = Iteration::new(&self.name(), self.gc_type(), cause, clear_soft);
        let spaces = heap.spaces.read();
        if self.concurrent {
            self.run_concurrent(heap, &spaces, &mut iteration, concurrent_phase);
        } else {
            self.run_paused(heap, &spaces, &mut iteration);
        }
        iteration.timings.end_split();
        iteration.duration = start.elapsed();
        iteration
    }

    fn run_paused(&self, heap: &HeapInner, spaces: &HeapSpaces, iteration: &mut Iteration) {
        let suspended = heap.thread_list.suspend_all();
        iteration.timings.new_split("(Paused)RevokeThreadLocalBuffers");
        heap.revoke_all_thread_local_buffers(spaces);

        iteration.timings.new_split("(Paused)BindBitmaps");
        let marker = self.bind_bitmaps(heap, spaces, heap.settings.parallel_gc_threads);
        iteration.timings.new_split("(Paused)ProcessCards");
        heap.process_cards(spaces, false, true, self.kind != MarkSweepKind::Sticky);

        let mut stack = Vec::with_capacity(heap.settings.mark_stack_size);
        iteration.timings.new_split("(Paused)UpdateAndMarkModUnion");
        marker.update_and_mark_mod_union(&mut stack);
        iteration.timings.new_split("(Paused)MarkRoots");
        marker.mark_roots(&mut stack);
        if self.kind == MarkSweepKind::Sticky {
            iteration.timings.new_split("(Paused)ScanGrayObjects");
            marker.scan_cards(CARD_AGED, &mut stack);
        }
        iteration.timings.new_split("(Paused)ScanGraySpaces");
        marker.scan_gray_spaces(&mut stack);
        iteration.timings.new_split("(Paused)RecursiveMark");
        marker.drain(stack);

        iteration.timings.new_split("(Paused)SwapStacks");
        heap.swap_stacks();
        iteration.timings.new_split("(Paused)ProcessReferences");
        iteration.references = marker.process_references(iteration.clear_soft);
        self.pre_sweeping_verification(heap, &marker);
        iteration.pauses.push(suspended.elapsed());
        drop(suspended);

        self.reclaim(heap, &marker, iteration);
    }

    fn run_concurrent(
        &self,
        heap: &HeapInner,
        spaces: &HeapSpaces,
        iteration: &mut Iteration,
        concurrent_phase: &mut dyn FnMut(),
    ) {
        let mut stack = Vec::with_capacity(heap.settings.mark_stack_size);
        let marker = {
            let suspended = heap.thread_list.suspend_all();
            iteration.timings.new_split("(Paused)InitialMark");
            heap.revoke_all_thread_local_buffers(spaces);
            let marker = self.bind_bitmaps(heap, spaces, heap.settings.conc_gc_threads);
            heap.process_cards(spaces, false, true, self.kind != MarkSweepKind::Sticky);
            marker.mark_roots(&mut stack);
            iteration.pauses.push(suspended.elapsed());
            marker
        };

        iteration.timings.new_split("UpdateAndMarkModUnion");
        marker.update_and_mark_mod_union(&mut stack);
        if self.kind == MarkSweepKind::Sticky {
            iteration.timings.new_split("ScanGrayObjects");
            marker.scan_cards(CARD_AGED, &mut stack);
        }
        iteration.timings.new_split("ConcurrentMark");
        marker.drain(std::mem::take(&mut stack));
        concurrent_phase();

        {
            let suspended = heap.thread_list.suspend_all();
            iteration.timings.new_split("(Paused)RemarkRoots");
            heap.revoke_all_thread_local_buffers(spaces);
            marker.mark_roots(&mut stack);
            iteration.timings.new_split("(Paused)ScanDirtyCards");
            marker.scan_cards(CARD_DIRTY, &mut stack);
            marker.scan_gray_spaces(&mut stack);
            iteration.timings.new_split("(Paused)RecursiveMark");
            marker.drain_with(heap.settings.parallel_gc_threads, std::mem::take(&mut stack));
            iteration.timings.new_split("(Paused)SwapStacks");
            heap.swap_stacks();
            iteration.timings.new_split("(Paused)ProcessReferences");
            iteration.references = marker.process_references(iteration.clear_soft);
            self.pre_sweeping_verification(heap, &marker);
            iteration.pauses.push(suspended.elapsed());
        }

        self.reclaim(heap, &marker, iteration);
    }

    /// Picks the immune spaces and binds bitmaps for sticky collections.
    /// Returns the marker over the resulting mark bitmaps.
    fn bind_bitmaps<'a>(
        &self,
        heap: &'a HeapInner,
        spaces: &'a HeapSpaces,
        threads: usize,
    ) -> Marker<'a> {
        let mut immune = Vec::new();
        if let Some((_, image)) = spaces.table.image_space() {
            immune.push((image.begin(), image.limit()));
        }
        if self.kind != MarkSweepKind::Full
            && let Some((_, zygote)) = spaces.table.zygote_space()
        {
            immune.push((zygote.begin(), zygote.limit()));
        }
        if self.kind == MarkSweepKind::Sticky {
            for (_, malloc) in spaces.table.malloc_spaces() {
                malloc.bind_live_to_mark_bitmap();
            }
            spaces.large_objects().copy_live_to_marked();
        }
        Marker {
            heap,
            spaces,
            model: heap.model(),
            immune,
            mark_bitmap: spaces.table.mark_bitmap(),
            threads,
        }
    }

    fn pre_sweeping_verification(&self, heap: &HeapInner, marker: &Marker<'_>) {
        let live_stack = heap.live_stack();
        if heap.settings.verify.contains(VerifyFlags::PRE_SWEEPING_HEAP) {
            live_stack.sort();
            let failures = heap.verify_heap_references(marker.spaces, &|obj: ObjectRef| {
                marker.is_marked(obj) || live_stack.contains_sorted(obj)
            });
            if failures > 0 {
                fatal(&format!("pre sweeping verification of {} failed", self.name()));
            }
        }
        if self.kind == MarkSweepKind::Sticky
            && heap.settings.verify.contains(VerifyFlags::MISSING_CARD_MARKS)
            && !heap.verify_missing_card_marks(marker.spaces)
        {
            fatal("missing card marks");
        }
    }

    // ── Reclaim ───────────────────────────────────────────────────────

    /// Sweeps with mutators running. Objects they allocate from now on are
    /// in no live bitmap and on no stack the sweep looks at.
    fn reclaim(&self, heap: &HeapInner, marker: &Marker<'_>, iteration: &mut Iteration) {
        let spaces = marker.spaces;
        let live_stack = heap.live_stack();
        if self.kind == MarkSweepKind::Sticky {
            iteration.timings.new_split("SweepArray");
            self.sweep_array(marker, live_stack, iteration);
        } else {
            iteration.timings.new_split("MarkAllocStackAsLive");
            heap.mark_alloc_stack_as_live(spaces, live_stack);
            live_stack.reset();
            iteration.timings.new_split("SweepMallocSpaces");
            for (_, malloc) in spaces.table.malloc_spaces() {
                let (objects, bytes) = malloc.sweep();
                iteration.record_free(objects, bytes);
            }
            if self.kind == MarkSweepKind::Full
                && let Some((_, zygote)) = spaces.table.zygote_space()
            {
                iteration.timings.new_split("SweepZygoteSpace");
                let objects = zygote.sweep(&heap.card_table);
                iteration.record_free(objects, 0);
            }
            iteration.timings.new_split("SweepLargeObjects");
            let (objects, bytes) = spaces.large_objects().sweep();
            iteration.record_free_large(objects, bytes);
        }

        iteration.timings.new_split("SwapBitmaps");
        for (_, malloc) in spaces.table.malloc_spaces() {
            if !malloc.has_bound_bitmaps() {
                malloc.swap_bitmaps();
                malloc.mark_bitmap().clear_all();
            }
            malloc.unbind_bitmaps();
        }
        if self.kind == MarkSweepKind::Full
            && let Some((_, zygote)) = spaces.table.zygote_space()
        {
            zygote.swap_bitmaps();
            zygote.mark_bitmap().clear_all();
        }
        let los = spaces.large_objects();
        los.swap_bitmaps();
        los.mark_objects().clear_all();
    }

    /// Frees unmarked objects of the live stack, the only candidates of a
    /// sticky collection.
    fn sweep_array(&self, marker: &Marker<'_>, live_stack: &ObjectStack, iteration: &mut Iteration) {
        let spaces = marker.spaces;
        let mut garbage: Vec<(SpaceId, Vec<ObjectRef>)> = Vec::new();
        let mut large_garbage = Vec::new();
        live_stack.for_each(|obj| {
            if marker.is_marked(obj) {
                return;
            }
            match spaces.table.find_space(obj) {
                Some((id, Space::Malloc(_))) => match garbage.iter_mut().find(|(s, _)| *s == id) {
                    Some((_, list)) => list.push(obj),
                    None => garbage.push((id, vec![obj])),
                },
                Some((_, Space::LargeObject(_))) => large_garbage.push(obj),
                _ => {}
            }
        });
        for (id, objects) in garbage {
            if let Some(malloc) = spaces.table.get(id).and_then(Space::as_malloc) {
                let live = malloc.live_bitmap();
                for obj in &objects {
                    live.clear(*obj);
                }
                let bytes = malloc.free_list(&objects);
                iteration.record_free(objects.len(), bytes);
            }
        }
        let los = spaces.large_objects();
        let live = los.live_objects();
        for obj in &large_garbage {
            live.clear(*obj);
        }
        let bytes = los.free_list(&large_garbage);
        iteration.record_free_large(large_garbage.len(), bytes);
        live_stack.reset();
    }
}

// ── Marking ───────────────────────────────────────────────────────────

struct Marker<'a> {
    heap: &'a HeapInner,
    spaces: &'a HeapSpaces,
    model: &'a dyn ObjectModel,
    /// `[begin, limit)` of every immune space.
    immune: Vec<(usize, usize)>,
    mark_bitmap: HeapBitmap,
    threads: usize,
}

impl Marker<'_> {
    #[inline]
    fn is_immune(&self, addr: usize) -> bool {
        self.immune.iter().any(|&(begin, limit)| addr >= begin && addr < limit)
    }

    #[inline]
    fn is_gray(&self, addr: usize) -> bool {
        self.heap.is_in_moving_range(addr)
    }

    fn is_marked(&self, obj: ObjectRef) -> bool {
        self.is_immune(obj.addr()) || self.is_gray(obj.addr()) || self.mark_bitmap.test(obj)
    }

    /// Marks `obj`. Returns whether it was white and has to be scanned.
    #[inline]
    fn mark(&self, obj: ObjectRef) -> bool {
        if self.is_immune(obj.addr()) || self.is_gray(obj.addr()) {
            return false;
        }
        !self.mark_bitmap.set(obj)
    }

    /// # Safety
    ///
    /// `obj` must be an initialized object.
    unsafe fn scan(&self, obj: ObjectRef, push: &mut dyn FnMut(ObjectRef)) {
        // SAFETY: guaranteed by the caller
        unsafe {
            if let Some(class) = obj.class()
                && self.mark(class)
            {
                push(class);
            }
            self.model.visit_references(obj, &mut |slot| {
                if let Some(target) = slot.load()
                    && self.mark(target)
                {
                    push(target);
                }
            });
            if let Some(kind) = self.model.reference_kind(obj)
                && let Some(referent) = self.model.referent_slot(obj).load()
                && !self.is_marked(referent)
            {
                self.heap.references.delay_reference_referent(kind, obj);
            }
        }
    }

    fn drain(&self, stack: Vec<ObjectRef>) {
        self.drain_with(self.threads, stack);
    }

    fn drain_with(&self, threads: usize, stack: Vec<ObjectRef>) {
        worker_pool::process(threads, stack, |obj, queue| {
            // SAFETY: only marked objects are pushed and they stay
            // allocated until the sweep
            unsafe { self.scan(obj, &mut |child| queue.push(child)) };
        });
    }

    fn mark_roots(&self, stack: &mut Vec<ObjectRef>) {
        self.heap.visit_roots(&mut |root| {
            if self.mark(*root) {
                stack.push(*root);
            }
        });
    }

    fn update_and_mark_mod_union(&self, stack: &mut Vec<ObjectRef>) {
        for (id, table) in &self.spaces.table.mod_union_tables {
            let Some(space) = self.spaces.table.get(*id) else {
                continue;
            };
            if !self.is_immune(space.begin()) {
                continue;
            }
            let Some(live) = space.live_bitmap() else {
                continue;
            };
            table.update_and_mark_references(&live, self.model, &mut |_, slot| {
                if let Some(target) = slot.load()
                    && self.mark(target)
                {
                    stack.push(target);
                }
            });
        }
    }

    /// Scans the marked objects on cards of at least `minimum_age` in every
    /// space with a bitmap.
    fn scan_cards(&self, minimum_age: u8, stack: &mut Vec<ObjectRef>) {
        for (_, space) in self.spaces.table.continuous_spaces() {
            let bitmap = if self.is_immune(space.begin()) {
                space.live_bitmap()
            } else {
                space.mark_bitmap()
            };
            let Some(bitmap) = bitmap else {
                continue;
            };
            let cards = self.heap.card_table.scan(
                &bitmap,
                space.begin(),
                space.end(),
                minimum_age,
                |obj| {
                    // SAFETY: marked objects are initialized
                    unsafe { self.scan(obj, &mut |child| stack.push(child)) };
                },
            );
            log::trace!(target: "gc", "scanned {cards} cards of {}", space.name());
        }
    }

    fn scan_gray_spaces(&self, stack: &mut Vec<ObjectRef>) {
        for id in self.spaces.moving_space_ids() {
            let Some(space) = self.spaces.table.get(id) else {
                continue;
            };
            // SAFETY: mutators are suspended and their buffers revoked
            unsafe {
                space.walk(self.model, &mut |obj| {
                    self.scan(obj, &mut |child| stack.push(child));
                });
            }
        }
    }

    fn process_references(&self, clear_soft: bool) -> ReferenceStats {
        let mut marking = ReferenceMarking {
            marker: self,
            stack: Vec::new(),
        };
        // SAFETY: queued references were scanned this cycle and are alive
        unsafe {
            self.heap
                .references
                .process_references(self.model, clear_soft, &mut marking)
        }
    }
}

struct ReferenceMarking<'m, 'a> {
    marker: &'m Marker<'a>,
    stack: Vec<ObjectRef>,
}

impl ReferenceMarker for ReferenceMarking<'_, '_> {
    fn is_marked(&mut self, obj: ObjectRef) -> Option<ObjectRef> {
        self.marker.is_marked(obj).then_some(obj)
    }

    fn mark(&mut self, obj: ObjectRef) -> ObjectRef {
        if self.marker.mark(obj) {
            self.stack.push(obj);
        }
        obj
    }

    fn process_mark_stack(&mut self) {
        self.marker.drain(std::mem::take(&mut self.stack));
    }
}

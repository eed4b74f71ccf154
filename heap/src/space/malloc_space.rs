//! Free list backed space for objects that never move (or only move when
//! the whole space is compacted).

use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use parking_lot::Mutex;

use crate::{
    OS_PAGE_SIZE,
    accounting::SpaceBitmap,
    memory_region::MemoryRegion,
    object::ObjectRef,
    space::{
        Allocation,
        dlmalloc::{CHUNK_OVERHEAD, DlMalloc},
        rosalloc::{self, NUM_SMALL_BRACKETS, RosAlloc},
        zygote::ZygoteSpace,
    },
    system::align_up,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MallocKind {
    RosAlloc,
    DlMalloc,
}

#[derive(Debug)]
enum Allocator {
    RosAlloc(RosAlloc),
    DlMalloc(DlMalloc),
}

impl Allocator {
    fn new(kind: MallocKind, region: &MemoryRegion, footprint_limit: usize, low_memory: bool) -> Self {
        match kind {
            MallocKind::RosAlloc => Allocator::RosAlloc(RosAlloc::new(
                region.begin(),
                region.size(),
                footprint_limit,
                low_memory,
            )),
            MallocKind::DlMalloc => {
                Allocator::DlMalloc(DlMalloc::new(region.begin(), region.size(), footprint_limit))
            }
        }
    }
}

struct Bitmaps {
    live: Arc<SpaceBitmap>,
    mark: Arc<SpaceBitmap>,
    /// Mark bitmap parked while live and mark are bound.
    temp: Option<Arc<SpaceBitmap>>,
}

/// RosAlloc slots a mutator took out of a run and allocates from without
/// locking, one free list per small bracket.
#[derive(Debug)]
pub struct SlotBatches {
    slots: [Vec<usize>; NUM_SMALL_BRACKETS],
    objects: usize,
}

impl Default for SlotBatches {
    fn default() -> Self {
        Self {
            slots: std::array::from_fn(|_| Vec::new()),
            objects: 0,
        }
    }
}

impl SlotBatches {
    pub fn is_empty(&self) -> bool {
        self.slots.iter().all(Vec::is_empty)
    }

    /// Bytes held by unused slots.
    pub fn remaining_bytes(&self) -> usize {
        self.slots
            .iter()
            .enumerate()
            .map(|(bracket, slots)| slots.len() * rosalloc::bracket_size(bracket))
            .sum()
    }
}

pub struct MallocSpace {
    region: MemoryRegion,
    kind: MallocKind,
    allocator: Mutex<Allocator>,
    bitmaps: Mutex<Bitmaps>,
    bytes_allocated: AtomicUsize,
    objects_allocated: AtomicUsize,
    growth_limit: AtomicUsize,
    low_memory_mode: bool,
    can_move_objects: bool,
}

impl MallocSpace {
    pub fn new(
        region: MemoryRegion,
        kind: MallocKind,
        growth_limit: usize,
        low_memory_mode: bool,
        can_move_objects: bool,
    ) -> Self {
        let growth_limit = growth_limit.min(region.size());
        let name = region.name().to_string();
        let live = SpaceBitmap::new(&format!("{name} live-bitmap"), region.begin(), region.size());
        let mark = SpaceBitmap::new(&format!("{name} mark-bitmap"), region.begin(), region.size());
        Self {
            allocator: Mutex::new(Allocator::new(kind, &region, growth_limit, low_memory_mode)),
            bitmaps: Mutex::new(Bitmaps {
                live: Arc::new(live),
                mark: Arc::new(mark),
                temp: None,
            }),
            region,
            kind,
            bytes_allocated: AtomicUsize::new(0),
            objects_allocated: AtomicUsize::new(0),
            growth_limit: AtomicUsize::new(growth_limit),
            low_memory_mode,
            can_move_objects,
        }
    }

    pub fn name(&self) -> &str {
        self.region.name()
    }

    pub fn kind(&self) -> MallocKind {
        self.kind
    }

    pub fn begin(&self) -> usize {
        self.region.begin()
    }

    /// End of the memory handed out so far.
    pub fn end(&self) -> usize {
        match &*self.allocator.lock() {
            Allocator::RosAlloc(ros) => ros.end(),
            Allocator::DlMalloc(dl) => dl.end(),
        }
    }

    pub fn limit(&self) -> usize {
        self.region.end()
    }

    pub fn capacity(&self) -> usize {
        self.region.size()
    }

    /// Whether `obj` lies in the allocated part of the space.
    pub fn contains(&self, obj: ObjectRef) -> bool {
        obj.addr() >= self.begin() && obj.addr() < self.end()
    }

    pub fn can_move_objects(&self) -> bool {
        self.can_move_objects
    }

    pub fn bytes_allocated(&self) -> usize {
        self.bytes_allocated.load(Ordering::Relaxed)
    }

    pub fn objects_allocated(&self) -> usize {
        self.objects_allocated.load(Ordering::Relaxed)
    }

    // ── Allocation ────────────────────────────────────────────────────

    pub fn alloc(&self, byte_count: usize) -> Option<Allocation> {
        let (addr, bytes, usable) = match &mut *self.allocator.lock() {
            Allocator::RosAlloc(ros) => {
                let (addr, bytes) = ros.alloc(byte_count)?;
                (addr, bytes, bytes)
            }
            Allocator::DlMalloc(dl) => {
                let (addr, bytes) = dl.alloc(byte_count)?;
                (addr, bytes, bytes - CHUNK_OVERHEAD)
            }
        };
        self.bytes_allocated.fetch_add(bytes, Ordering::Relaxed);
        self.objects_allocated.fetch_add(1, Ordering::Relaxed);
        Some(Allocation {
            // SAFETY: both allocators return aligned, non-null addresses
            object: unsafe { ObjectRef::from_addr_unchecked(addr) },
            bytes_allocated: bytes,
            usable_size: usable,
            bulk_bytes_allocated: bytes,
        })
    }

    /// Allocates out of the caller's slot batches, refilling the bracket
    /// from a run when it ran dry. Sizes without a batched bracket, and
    /// DlMalloc spaces, fall back to [`alloc`](Self::alloc).
    pub fn alloc_thread_local(&self, batches: &mut SlotBatches, byte_count: usize) -> Option<Allocation> {
        let bracket = rosalloc::bracket_index(byte_count)
            .filter(|&b| b < NUM_SMALL_BRACKETS && self.kind == MallocKind::RosAlloc);
        let Some(bracket) = bracket else {
            return self.alloc(byte_count);
        };
        let slot_size = rosalloc::bracket_size(bracket);
        let mut bulk = 0;
        if batches.slots[bracket].is_empty() {
            let Allocator::RosAlloc(ros) = &mut *self.allocator.lock() else {
                return None;
            };
            let (_, mut slots) = ros.alloc_batch(byte_count)?;
            bulk = slots.len() * slot_size;
            self.bytes_allocated.fetch_add(bulk, Ordering::Relaxed);
            // pop from the back, hand out in address order
            slots.reverse();
            batches.slots[bracket] = slots;
        }
        let addr = batches.slots[bracket].pop()?;
        batches.objects += 1;
        Some(Allocation {
            // SAFETY: rosalloc slots are aligned and non-null
            object: unsafe { ObjectRef::from_addr_unchecked(addr) },
            bytes_allocated: slot_size,
            usable_size: slot_size,
            bulk_bytes_allocated: bulk,
        })
    }

    /// Returns unused batch slots to their runs and folds the batch's
    /// object count into the space. Returns the bytes given back.
    pub fn revoke_thread_local(&self, batches: &mut SlotBatches) -> usize {
        let objects = std::mem::take(&mut batches.objects);
        self.objects_allocated.fetch_add(objects, Ordering::Relaxed);
        if batches.is_empty() {
            return 0;
        }
        let mut freed = 0;
        if let Allocator::RosAlloc(ros) = &mut *self.allocator.lock() {
            for slots in &mut batches.slots {
                for addr in slots.drain(..) {
                    freed += ros.free(addr);
                }
            }
        }
        self.bytes_allocated.fetch_sub(freed, Ordering::Relaxed);
        freed
    }

    /// Frees one object, returning its size in the space.
    pub fn free(&self, obj: ObjectRef) -> usize {
        self.free_list(&[obj])
    }

    /// Frees a batch of objects under one lock acquisition.
    pub fn free_list(&self, objects: &[ObjectRef]) -> usize {
        let mut freed = 0;
        let mut count = 0;
        {
            let mut allocator = self.allocator.lock();
            for obj in objects {
                let bytes = match &mut *allocator {
                    Allocator::RosAlloc(ros) => ros.free(obj.addr()),
                    Allocator::DlMalloc(dl) => dl.free(obj.addr()),
                };
                if bytes > 0 {
                    freed += bytes;
                    count += 1;
                }
            }
        }
        self.bytes_allocated.fetch_sub(freed, Ordering::Relaxed);
        self.objects_allocated.fetch_sub(count, Ordering::Relaxed);
        freed
    }

    pub fn allocation_size(&self, obj: ObjectRef) -> usize {
        match &*self.allocator.lock() {
            Allocator::RosAlloc(ros) => ros.allocation_size(obj.addr()),
            Allocator::DlMalloc(dl) => dl.allocation_size(obj.addr()),
        }
    }

    // ── Footprint ─────────────────────────────────────────────────────

    pub fn footprint(&self) -> usize {
        match &*self.allocator.lock() {
            Allocator::RosAlloc(ros) => ros.footprint(),
            Allocator::DlMalloc(dl) => dl.footprint(),
        }
    }

    pub fn footprint_limit(&self) -> usize {
        match &*self.allocator.lock() {
            Allocator::RosAlloc(ros) => ros.footprint_limit(),
            Allocator::DlMalloc(dl) => dl.footprint_limit(),
        }
    }

    pub fn set_footprint_limit(&self, bytes: usize) {
        let bytes = bytes.min(self.growth_limit());
        match &mut *self.allocator.lock() {
            Allocator::RosAlloc(ros) => ros.set_footprint_limit(bytes),
            Allocator::DlMalloc(dl) => dl.set_footprint_limit(bytes),
        }
    }

    pub fn growth_limit(&self) -> usize {
        self.growth_limit.load(Ordering::Relaxed)
    }

    /// Lets the space grow to its full capacity.
    pub fn clear_growth_limit(&self) {
        self.growth_limit.store(self.capacity(), Ordering::Relaxed);
        self.set_footprint_limit(self.capacity());
    }

    /// Returns free pages to the OS, the number of bytes released.
    pub fn trim(&self) -> usize {
        match &mut *self.allocator.lock() {
            Allocator::RosAlloc(ros) => ros.trim(),
            Allocator::DlMalloc(dl) => dl.trim(),
        }
    }

    pub fn largest_free_contiguous(&self) -> usize {
        match &*self.allocator.lock() {
            Allocator::RosAlloc(ros) => ros.largest_free_contiguous(),
            Allocator::DlMalloc(dl) => dl.largest_free_contiguous(),
        }
    }

    /// Allocator level consistency errors, empty when consistent.
    pub fn verify(&self) -> Vec<String> {
        match &*self.allocator.lock() {
            Allocator::RosAlloc(ros) => ros
                .verify()
                .into_iter()
                .map(|error| format!("{}: {error}", self.name()))
                .collect(),
            Allocator::DlMalloc(_) => Vec::new(),
        }
    }

    // ── Bitmaps ───────────────────────────────────────────────────────

    pub fn live_bitmap(&self) -> Arc<SpaceBitmap> {
        self.bitmaps.lock().live.clone()
    }

    pub fn mark_bitmap(&self) -> Arc<SpaceBitmap> {
        self.bitmaps.lock().mark.clone()
    }

    /// Makes the mark bitmap the live bitmap, so everything live counts as
    /// marked. Used by sticky collections.
    pub fn bind_live_to_mark_bitmap(&self) {
        let mut bitmaps = self.bitmaps.lock();
        if bitmaps.temp.is_some() {
            return;
        }
        let live = bitmaps.live.clone();
        bitmaps.temp = Some(std::mem::replace(&mut bitmaps.mark, live));
    }

    pub fn has_bound_bitmaps(&self) -> bool {
        self.bitmaps.lock().temp.is_some()
    }

    pub fn unbind_bitmaps(&self) {
        let mut bitmaps = self.bitmaps.lock();
        if let Some(mark) = bitmaps.temp.take() {
            mark.clear_all();
            bitmaps.mark = mark;
        }
    }

    pub fn swap_bitmaps(&self) {
        let mut bitmaps = self.bitmaps.lock();
        let Bitmaps { live, mark, .. } = &mut *bitmaps;
        std::mem::swap(live, mark);
    }

    /// Frees every object that is live but unmarked. Returns the freed
    /// objects and bytes.
    pub fn sweep(&self) -> (usize, usize) {
        let (live, mark) = {
            let bitmaps = self.bitmaps.lock();
            (bitmaps.live.clone(), bitmaps.mark.clone())
        };
        if Arc::ptr_eq(&live, &mark) {
            return (0, 0);
        }
        let mut objects = 0;
        let mut bytes = 0;
        SpaceBitmap::sweep_walk(&live, &mark, self.begin(), self.end(), |batch| {
            objects += batch.len();
            bytes += self.free_list(batch);
        });
        (objects, bytes)
    }

    /// Drops every object and returns all pages to the OS.
    pub fn clear(&self) {
        let mut allocator = self.allocator.lock();
        let end = match &*allocator {
            Allocator::RosAlloc(ros) => ros.end(),
            Allocator::DlMalloc(dl) => dl.end(),
        };
        self.region.release(self.begin(), align_up(end, OS_PAGE_SIZE).min(self.limit()));
        match &mut *allocator {
            Allocator::RosAlloc(ros) => ros.reset(),
            Allocator::DlMalloc(dl) => dl.reset(),
        }
        let bitmaps = self.bitmaps.lock();
        bitmaps.live.clear_all();
        bitmaps.mark.clear_all();
        self.bytes_allocated.store(0, Ordering::Relaxed);
        self.objects_allocated.store(0, Ordering::Relaxed);
    }

    /// Gives the memory back so the space can be recreated later. The
    /// pages are released first.
    pub fn into_region(self) -> MemoryRegion {
        self.clear();
        self.region
    }

    /// Freezes everything below `zygote_end` (and below the allocator's own
    /// end) into a zygote space and returns it together with a fresh space
    /// over the rest of the region.
    ///
    /// Objects placed into the space directly by the zygote compaction are
    /// only known to the live bitmap, which is why the objects are counted
    /// there.
    pub fn create_zygote_space(
        self,
        zygote_end: usize,
        zygote_name: &str,
        tail_name: &str,
        tail_kind: MallocKind,
        can_move_objects: bool,
    ) -> (ZygoteSpace, MallocSpace) {
        let split =
            align_up(self.end().max(zygote_end), OS_PAGE_SIZE).min(self.limit()) - self.begin();
        let live = self.live_bitmap();
        let objects = live.count_marked(self.begin(), self.begin() + split);
        let growth_limit = self.growth_limit().saturating_sub(split);
        let low_memory_mode = self.low_memory_mode;
        let (head, tail) = self.region.split_at(split, tail_name);
        let zygote = ZygoteSpace::new(head.renamed(zygote_name), &live, objects);
        log::debug!(
            target: "heap",
            "split {:#x}-{:#x} into zygote space and {}",
            zygote.begin(),
            tail.end(),
            tail.name()
        );
        let main = MallocSpace::new(tail, tail_kind, growth_limit, low_memory_mode, can_move_objects);
        (zygote, main)
    }
}

impl std::fmt::Debug for MallocSpace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "MallocSpace[{} {:?} {:#x}-{:#x} limit {:#x}]",
            self.name(),
            self.kind,
            self.begin(),
            self.end(),
            self.limit()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{KIND_NORMAL, init_class, init_object, object_size};

    fn create_space(kind: MallocKind, size: usize) -> (MemoryRegion, MallocSpace) {
        let reservation = MemoryRegion::map("malloc test", size).expect("map");
        let view = reservation.sub_region("malloc space", 0, size).expect("view");
        (reservation, MallocSpace::new(view, kind, size, false, false))
    }

    #[test]
    fn test_alloc_and_free_accounting() {
        for kind in [MallocKind::RosAlloc, MallocKind::DlMalloc] {
            let (_reservation, space) = create_space(kind, 256 * 1024);
            let a = space.alloc(40).expect("alloc");
            let b = space.alloc(5000).expect("alloc");
            assert!(a.usable_size >= 40, "{kind:?}");
            assert_eq!(space.allocation_size(a.object), a.bytes_allocated, "{kind:?}");
            assert_eq!(space.objects_allocated(), 2);
            assert_eq!(space.bytes_allocated(), a.bytes_allocated + b.bytes_allocated);
            assert_eq!(space.free(b.object), b.bytes_allocated);
            assert_eq!(space.objects_allocated(), 1);
            assert_eq!(space.bytes_allocated(), a.bytes_allocated);
            assert!(space.verify().is_empty());
        }
    }

    #[test]
    fn test_contains_only_the_allocated_part() {
        for kind in [MallocKind::RosAlloc, MallocKind::DlMalloc] {
            let (_reservation, space) = create_space(kind, 256 * 1024);
            let a = space.alloc(64).expect("alloc");
            assert!(space.contains(a.object), "{kind:?}");
            let past_end = ObjectRef::from_addr(space.limit()).expect("aligned");
            assert!(!space.contains(past_end), "{kind:?}");
        }
    }

    #[test]
    fn test_slot_batches_revoke_unused_slots() {
        let (_reservation, space) = create_space(MallocKind::RosAlloc, 256 * 1024);
        let mut batches = SlotBatches::default();
        let first = space.alloc_thread_local(&mut batches, 64).expect("alloc");
        assert_eq!(first.bulk_bytes_allocated, rosalloc::MAX_BATCH_BYTES);
        let second = space.alloc_thread_local(&mut batches, 60).expect("alloc");
        assert_eq!(second.bulk_bytes_allocated, 0, "served from the batch");
        assert_eq!(second.object.addr(), first.object.addr() + 64);

        let unused = batches.remaining_bytes();
        assert_eq!(space.revoke_thread_local(&mut batches), unused);
        assert!(batches.is_empty());
        assert_eq!(space.bytes_allocated(), 128);
        assert_eq!(space.objects_allocated(), 2);
    }

    #[test]
    fn test_sweep_frees_unmarked_objects() {
        let (_reservation, space) = create_space(MallocKind::DlMalloc, 256 * 1024);
        let meta = space.alloc(32).expect("alloc").object;
        unsafe { init_class(meta, meta, KIND_NORMAL) };
        let mut objects = Vec::new();
        for _ in 0..10 {
            let obj = space.alloc(object_size(0, 16)).expect("alloc").object;
            unsafe {
                obj.set_class(meta);
                init_object(obj, object_size(0, 16), 0);
            }
            space.live_bitmap().set(obj);
            objects.push(obj);
        }
        let mark = space.mark_bitmap();
        for obj in objects.iter().step_by(2) {
            mark.set(*obj);
        }
        let before = space.bytes_allocated();
        let (freed_objects, freed_bytes) = space.sweep();
        assert_eq!(freed_objects, 5);
        assert_eq!(space.bytes_allocated(), before - freed_bytes);
        space.swap_bitmaps();
        assert!(space.live_bitmap().test(objects[0]));
        assert!(!space.live_bitmap().test(objects[1]));
    }

    #[test]
    fn test_bound_bitmaps_sweep_nothing() {
        let (_reservation, space) = create_space(MallocKind::RosAlloc, 64 * 1024);
        let obj = space.alloc(32).expect("alloc").object;
        space.live_bitmap().set(obj);
        space.bind_live_to_mark_bitmap();
        assert!(space.has_bound_bitmaps());
        assert!(space.mark_bitmap().test(obj), "live bits count as marked");
        assert_eq!(space.sweep(), (0, 0));
        space.unbind_bitmaps();
        assert!(!space.mark_bitmap().test(obj), "old mark bitmap restored");
    }

    #[test]
    fn test_growth_limit() {
        let (_reservation, space) = create_space(MallocKind::DlMalloc, 64 * 1024);
        space.set_footprint_limit(8 * 1024);
        let reservation2 = MemoryRegion::map("malloc test", 64 * 1024).expect("map");
        let view = reservation2.sub_region("limited", 0, 64 * 1024).expect("view");
        let limited = MallocSpace::new(view, MallocKind::DlMalloc, 8 * 1024, false, false);
        assert!(limited.alloc(16 * 1024).is_none(), "beyond growth limit");
        limited.clear_growth_limit();
        assert!(limited.alloc(16 * 1024).is_some());
        assert_eq!(limited.growth_limit(), 64 * 1024);
        assert!(space.footprint_limit() <= 8 * 1024);
    }

    #[test]
    fn test_create_zygote_space_splits_region() {
        let (_reservation, space) = create_space(MallocKind::DlMalloc, 256 * 1024);
        let obj = space.alloc(100).expect("alloc").object;
        space.live_bitmap().set(obj);
        let begin = space.begin();
        let limit = space.limit();
        let (zygote, main) = space.create_zygote_space(
            begin + 3 * OS_PAGE_SIZE + 8,
            "zygote space",
            "main space",
            MallocKind::RosAlloc,
            false,
        );
        assert_eq!(zygote.begin(), begin);
        assert_eq!(zygote.limit(), begin + 4 * OS_PAGE_SIZE, "split past the compacted end");
        assert_eq!(zygote.limit(), main.begin());
        assert_eq!(main.limit(), limit);
        assert!(main.begin().is_multiple_of(OS_PAGE_SIZE));
        assert!(zygote.live_bitmap().test(obj));
        assert_eq!(zygote.objects_allocated(), 1);
        let fresh = main.alloc(100).expect("alloc");
        assert!(fresh.object.addr() >= main.begin());
    }
}

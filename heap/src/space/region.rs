//! Space split into equally sized regions with bump allocation inside each.
//!
//! Objects larger than a region take a run of whole regions. A copying
//! collection flags the used regions as from-space, evacuates live objects
//! into fresh regions of the same space and then frees the flagged ones.

use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::{
    memory_region::MemoryRegion,
    object::{OBJECT_ALIGNMENT, ObjectModel, ObjectRef},
    space::{Allocation, bump_pointer::walk_range},
    system::align_up,
};

const NO_REGION: usize = usize::MAX;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionState {
    Free = 0,
    Alloc = 1,
    /// First region of a large object.
    Large = 2,
    /// Following regions of a large object.
    LargeTail = 3,
    Tlab = 4,
}

impl From<u8> for RegionState {
    fn from(value: u8) -> Self {
        match value {
            1 => RegionState::Alloc,
            2 => RegionState::Large,
            3 => RegionState::LargeTail,
            4 => RegionState::Tlab,
            _ => RegionState::Free,
        }
    }
}

#[derive(Debug)]
struct Region {
    begin: usize,
    top: AtomicUsize,
    state: AtomicU8,
    from_space: AtomicBool,
}

impl Region {
    fn state(&self) -> RegionState {
        RegionState::from(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: RegionState) {
        self.state.store(state as u8, Ordering::Release);
    }
}

pub struct RegionSpace {
    memory: MemoryRegion,
    region_size: usize,
    regions: Box<[Region]>,
    current: AtomicUsize,
    objects_allocated: AtomicUsize,
    /// Serializes handing out regions.
    lock: Mutex<()>,
}

impl RegionSpace {
    pub fn new(memory: MemoryRegion, region_size: usize) -> Self {
        debug_assert!(region_size.is_multiple_of(crate::OS_PAGE_SIZE));
        let count = memory.size() / region_size;
        let regions = (0..count)
            .map(|index| {
                let begin = memory.begin() + index * region_size;
                Region {
                    begin,
                    top: AtomicUsize::new(begin),
                    state: AtomicU8::new(RegionState::Free as u8),
                    from_space: AtomicBool::new(false),
                }
            })
            .collect();
        Self {
            memory,
            region_size,
            regions,
            current: AtomicUsize::new(NO_REGION),
            objects_allocated: AtomicUsize::new(0),
            lock: Mutex::new(()),
        }
    }

    pub fn name(&self) -> &str {
        self.memory.name()
    }

    pub fn begin(&self) -> usize {
        self.memory.begin()
    }

    pub fn end(&self) -> usize {
        self.memory.end()
    }

    pub fn limit(&self) -> usize {
        self.memory.end()
    }

    pub fn region_size(&self) -> usize {
        self.region_size
    }

    pub fn region_count(&self) -> usize {
        self.regions.len()
    }

    pub fn free_regions(&self) -> usize {
        self.regions
            .iter()
            .filter(|region| region.state() == RegionState::Free)
            .count()
    }

    /// Bytes of used regions up to their tops. TLAB regions count in full,
    /// a large object counts once in its first region.
    pub fn bytes_allocated(&self) -> usize {
        (0..self.regions.len()).map(|index| self.used_bytes(index)).sum()
    }

    fn used_bytes(&self, index: usize) -> usize {
        let region = &self.regions[index];
        match region.state() {
            RegionState::Free | RegionState::LargeTail => 0,
            RegionState::Tlab => self.region_size,
            RegionState::Alloc | RegionState::Large => {
                region.top.load(Ordering::Relaxed) - region.begin
            }
        }
    }

    pub fn objects_allocated(&self) -> usize {
        self.objects_allocated.load(Ordering::Relaxed)
    }

    #[inline]
    fn region_index(&self, addr: usize) -> Option<usize> {
        if addr < self.begin() || addr >= self.limit() {
            return None;
        }
        Some((addr - self.begin()) / self.region_size)
    }

    fn region_end(&self, index: usize) -> usize {
        self.regions[index].begin + self.region_size
    }

    // ── Allocation ────────────────────────────────────────────────────

    fn bump_in(&self, index: usize, bytes: usize) -> Option<usize> {
        let region = &self.regions[index];
        let end = self.region_end(index);
        let mut old = region.top.load(Ordering::Relaxed);
        loop {
            let new = old + bytes;
            if new > end {
                return None;
            }
            match region.top.compare_exchange_weak(old, new, Ordering::AcqRel, Ordering::Relaxed) {
                Ok(_) => return Some(old),
                Err(current) => old = current,
            }
        }
    }

    /// Free regions that can be claimed, skipping from-space regions that
    /// are still being evacuated.
    fn claim_free_regions(&self, count: usize) -> Option<usize> {
        let mut run = 0;
        for (index, region) in self.regions.iter().enumerate() {
            if region.state() == RegionState::Free && !region.from_space.load(Ordering::Relaxed) {
                run += 1;
                if run == count {
                    return Some(index + 1 - count);
                }
            } else {
                run = 0;
            }
        }
        None
    }

    pub fn alloc(&self, byte_count: usize) -> Option<Allocation> {
        let bytes = align_up(byte_count.max(OBJECT_ALIGNMENT), OBJECT_ALIGNMENT);
        if bytes > self.region_size {
            return self.alloc_large(bytes);
        }
        loop {
            let current = self.current.load(Ordering::Acquire);
            if current != NO_REGION
                && let Some(addr) = self.bump_in(current, bytes)
            {
                self.objects_allocated.fetch_add(1, Ordering::Relaxed);
                return Some(Self::allocation(addr, bytes));
            }
            let _guard = self.lock.lock();
            if self.current.load(Ordering::Acquire) != current {
                continue;
            }
            let index = self.claim_free_regions(1)?;
            let region = &self.regions[index];
            region.top.store(region.begin, Ordering::Relaxed);
            region.set_state(RegionState::Alloc);
            self.current.store(index, Ordering::Release);
        }
    }

    fn alloc_large(&self, bytes: usize) -> Option<Allocation> {
        let count = bytes.div_ceil(self.region_size);
        let _guard = self.lock.lock();
        let first = self.claim_free_regions(count)?;
        for index in first..first + count {
            let region = &self.regions[index];
            if index == first {
                region.top.store(region.begin + bytes, Ordering::Relaxed);
                region.set_state(RegionState::Large);
            } else {
                region.top.store(self.region_end(index), Ordering::Relaxed);
                region.set_state(RegionState::LargeTail);
            }
        }
        self.objects_allocated.fetch_add(1, Ordering::Relaxed);
        Some(Self::allocation(self.regions[first].begin, bytes))
    }

    fn allocation(addr: usize, bytes: usize) -> Allocation {
        Allocation {
            // SAFETY: region addresses are aligned and non-null
            object: unsafe { ObjectRef::from_addr_unchecked(addr) },
            bytes_allocated: bytes,
            usable_size: bytes,
            bulk_bytes_allocated: bytes,
        }
    }

    /// Hands a whole free region out as a thread-local buffer. The buffer
    /// is never larger than one region.
    pub fn alloc_new_tlab(&self) -> Option<(usize, usize)> {
        let _guard = self.lock.lock();
        let index = self.claim_free_regions(1)?;
        let region = &self.regions[index];
        let end = self.region_end(index);
        region.top.store(end, Ordering::Relaxed);
        region.set_state(RegionState::Tlab);
        Some((region.begin, end))
    }

    pub fn revoke_tlab(&self, objects: usize) {
        self.objects_allocated.fetch_add(objects, Ordering::Relaxed);
    }

    // ── Evacuation ────────────────────────────────────────────────────

    /// Flags every used region as from-space. New allocations go to fresh
    /// regions until [`clear_from_space`](Self::clear_from_space).
    pub fn set_from_space(&self) -> usize {
        let _guard = self.lock.lock();
        let mut flagged = 0;
        for region in self.regions.iter() {
            if region.state() != RegionState::Free {
                region.from_space.store(true, Ordering::Relaxed);
                flagged += 1;
            }
        }
        self.current.store(NO_REGION, Ordering::Release);
        flagged
    }

    #[inline]
    pub fn is_in_from_space(&self, addr: usize) -> bool {
        self.region_index(addr)
            .is_some_and(|index| self.regions[index].from_space.load(Ordering::Relaxed))
    }

    /// Frees the evacuated regions, which held `from_objects` objects.
    /// Returns the bytes they spanned.
    pub fn clear_from_space(&self, from_objects: usize) -> usize {
        let _guard = self.lock.lock();
        let mut freed = 0;
        for index in 0..self.regions.len() {
            let region = &self.regions[index];
            if !region.from_space.swap(false, Ordering::Relaxed) {
                continue;
            }
            freed += self.used_bytes(index);
            self.memory.release(region.begin, self.region_end(index));
            region.top.store(region.begin, Ordering::Relaxed);
            region.set_state(RegionState::Free);
        }
        self.objects_allocated.fetch_sub(
            from_objects.min(self.objects_allocated()),
            Ordering::Relaxed,
        );
        freed
    }

    /// Drops every object.
    pub fn clear(&self) {
        let _guard = self.lock.lock();
        for index in 0..self.regions.len() {
            let region = &self.regions[index];
            if region.state() != RegionState::Free {
                self.memory.release(region.begin, self.region_end(index));
            }
            region.top.store(region.begin, Ordering::Relaxed);
            region.set_state(RegionState::Free);
            region.from_space.store(false, Ordering::Relaxed);
        }
        self.current.store(NO_REGION, Ordering::Release);
        self.objects_allocated.store(0, Ordering::Relaxed);
    }

    /// Visits the objects of every used region in address order.
    ///
    /// # Safety
    ///
    /// No mutator may be allocating into the space.
    pub unsafe fn walk(&self, model: &dyn ObjectModel, visitor: &mut dyn FnMut(ObjectRef)) {
        for index in 0..self.regions.len() {
            let region = &self.regions[index];
            match region.state() {
                RegionState::Free | RegionState::LargeTail => {}
                RegionState::Large => {
                    // SAFETY: large regions start with their object
                    visitor(unsafe { ObjectRef::from_addr_unchecked(region.begin) });
                }
                RegionState::Alloc | RegionState::Tlab => {
                    let top = region.top.load(Ordering::Acquire);
                    // SAFETY: guaranteed by the caller
                    unsafe { walk_range(model, region.begin, top, visitor) };
                }
            }
        }
    }

    pub fn region_state(&self, addr: usize) -> Option<RegionState> {
        self.region_index(addr).map(|index| self.regions[index].state())
    }
}

impl std::fmt::Debug for RegionSpace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "RegionSpace[{} {:#x}-{:#x} {}/{} regions free]",
            self.name(),
            self.begin(),
            self.limit(),
            self.free_regions(),
            self.region_count()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        OS_PAGE_SIZE,
        testing::{KIND_NORMAL, TestModel, init_class, init_object, object_size},
    };

    const REGION: usize = 4 * OS_PAGE_SIZE;

    fn create_space(regions: usize) -> (MemoryRegion, RegionSpace) {
        let reservation = MemoryRegion::map("region test", regions * REGION).expect("map");
        let view = reservation.sub_region("region space", 0, regions * REGION).expect("view");
        (reservation, RegionSpace::new(view, REGION))
    }

    #[test]
    fn test_allocation_moves_to_next_region() {
        let (_reservation, space) = create_space(4);
        let a = space.alloc(REGION - 64).expect("alloc");
        let b = space.alloc(128).expect("alloc");
        assert_eq!(b.object.addr(), space.begin() + REGION, "next region");
        assert_eq!(space.free_regions(), 2);
        assert_eq!(space.region_state(a.object.addr()), Some(RegionState::Alloc));
        assert_eq!(space.bytes_allocated(), REGION - 64 + 128);
    }

    #[test]
    fn test_large_objects_span_regions() {
        let (_reservation, space) = create_space(4);
        let large = space.alloc(2 * REGION + 8).expect("alloc");
        assert_eq!(space.region_state(large.object.addr()), Some(RegionState::Large));
        assert_eq!(
            space.region_state(large.object.addr() + REGION),
            Some(RegionState::LargeTail)
        );
        assert_eq!(space.free_regions(), 1);
        assert!(space.alloc(2 * REGION).is_none(), "no two free regions left");
    }

    #[test]
    fn test_evacuation_frees_from_space() {
        let (_reservation, space) = create_space(4);
        let meta = space.alloc(32).expect("alloc").object;
        unsafe { init_class(meta, meta, KIND_NORMAL) };
        let old = space.alloc(object_size(0, 0)).expect("alloc").object;
        unsafe {
            old.set_class(meta);
            init_object(old, object_size(0, 0), 0);
        }
        assert_eq!(space.set_from_space(), 1);
        assert!(space.is_in_from_space(old.addr()));

        let copy = space.alloc(object_size(0, 0)).expect("alloc").object;
        assert!(!space.is_in_from_space(copy.addr()), "copies go to fresh regions");
        unsafe {
            copy.set_class(meta);
            init_object(copy, object_size(0, 0), 0);
        }
        let freed = space.clear_from_space(2);
        assert_eq!(freed, 32 + object_size(0, 0));
        assert_eq!(space.objects_allocated(), 1);
        assert_eq!(space.region_state(old.addr()), Some(RegionState::Free));

        let mut seen = Vec::new();
        unsafe { space.walk(&TestModel, &mut |obj| seen.push(obj)) };
        assert_eq!(seen, vec![copy]);
    }
}

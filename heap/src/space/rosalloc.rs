//! Runs-of-slots allocator.
//!
//! Requests up to [`MAX_BRACKET_SIZE`] are rounded to a size bracket and
//! served from runs: page aligned blocks split into equal slots with an
//! allocation bitmap. Larger requests take whole page runs. Free pages are
//! kept in address order and coalesced, the footprint only grows when no
//! free page run fits.
//!
//! Mutators can take a batch of slots out of a run at once and allocate
//! from it without locking, see [`RosAlloc::alloc_batch`].

use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::{OS_PAGE_SIZE, system::align_up};

pub const NUM_SMALL_BRACKETS: usize = 32;
pub const NUM_BRACKETS: usize = NUM_SMALL_BRACKETS + 2;
pub const MAX_SMALL_BRACKET_SIZE: usize = 512;
pub const MAX_BRACKET_SIZE: usize = 2048;
/// Upper bound of the bytes a thread-local slot batch covers.
pub const MAX_BATCH_BYTES: usize = 2048;

const SMALL_BRACKET_QUANTUM: usize = 16;

#[inline]
pub fn bracket_index(size: usize) -> Option<usize> {
    match size {
        0..=MAX_SMALL_BRACKET_SIZE => {
            Some(align_up(size.max(1), SMALL_BRACKET_QUANTUM) / SMALL_BRACKET_QUANTUM - 1)
        }
        513..=1024 => Some(NUM_SMALL_BRACKETS),
        1025..=MAX_BRACKET_SIZE => Some(NUM_SMALL_BRACKETS + 1),
        _ => None,
    }
}

#[inline]
pub fn bracket_size(index: usize) -> usize {
    match index {
        i if i < NUM_SMALL_BRACKETS => (i + 1) * SMALL_BRACKET_QUANTUM,
        NUM_SMALL_BRACKETS => 1024,
        _ => MAX_BRACKET_SIZE,
    }
}

fn run_pages(index: usize) -> usize {
    match index {
        i if i < NUM_SMALL_BRACKETS => 1,
        NUM_SMALL_BRACKETS => 4,
        _ => 8,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PageOwner {
    Run(usize),
    Large(usize),
}

#[derive(Debug)]
struct Run {
    bracket: usize,
    num_slots: usize,
    free_slots: usize,
    alloc_bits: Vec<u64>,
}

impl Run {
    fn new(bracket: usize) -> Self {
        let num_slots = run_pages(bracket) * OS_PAGE_SIZE / bracket_size(bracket);
        Self {
            bracket,
            num_slots,
            free_slots: num_slots,
            alloc_bits: vec![0; num_slots.div_ceil(64)],
        }
    }

    fn take_slot(&mut self) -> Option<usize> {
        for (word_index, word) in self.alloc_bits.iter_mut().enumerate() {
            if *word == u64::MAX {
                continue;
            }
            let bit = (!*word).trailing_zeros() as usize;
            let slot = word_index * 64 + bit;
            if slot >= self.num_slots {
                return None;
            }
            *word |= 1 << bit;
            self.free_slots -= 1;
            return Some(slot);
        }
        None
    }

    fn release_slot(&mut self, slot: usize) -> bool {
        let (word, mask) = (slot / 64, 1u64 << (slot % 64));
        if self.alloc_bits[word] & mask == 0 {
            return false;
        }
        self.alloc_bits[word] &= !mask;
        self.free_slots += 1;
        true
    }

    fn is_full(&self) -> bool {
        self.free_slots == 0
    }

    fn is_empty(&self) -> bool {
        self.free_slots == self.num_slots
    }
}

#[derive(Debug)]
pub struct RosAlloc {
    base: usize,
    capacity_pages: usize,
    footprint_pages: usize,
    footprint_limit_pages: usize,
    page_map: Vec<Option<PageOwner>>,
    /// Free page runs below the footprint, start page → page count.
    free_page_runs: BTreeMap<usize, usize>,
    runs: HashMap<usize, Run>,
    large: HashMap<usize, usize>,
    current_runs: [Option<usize>; NUM_BRACKETS],
    non_full_runs: [BTreeSet<usize>; NUM_BRACKETS],
    low_memory_mode: bool,
}

impl RosAlloc {
    pub fn new(base: usize, capacity: usize, footprint_limit: usize, low_memory_mode: bool) -> Self {
        debug_assert!(base.is_multiple_of(OS_PAGE_SIZE));
        let capacity_pages = capacity / OS_PAGE_SIZE;
        Self {
            base,
            capacity_pages,
            footprint_pages: 0,
            footprint_limit_pages: (footprint_limit / OS_PAGE_SIZE).min(capacity_pages),
            page_map: vec![None; capacity_pages],
            free_page_runs: BTreeMap::new(),
            runs: HashMap::new(),
            large: HashMap::new(),
            current_runs: [None; NUM_BRACKETS],
            non_full_runs: std::array::from_fn(|_| BTreeSet::new()),
            low_memory_mode,
        }
    }

    #[inline]
    fn page_addr(&self, page: usize) -> usize {
        self.base + page * OS_PAGE_SIZE
    }

    pub fn footprint(&self) -> usize {
        self.footprint_pages * OS_PAGE_SIZE
    }

    pub fn footprint_limit(&self) -> usize {
        self.footprint_limit_pages * OS_PAGE_SIZE
    }

    pub fn set_footprint_limit(&mut self, bytes: usize) {
        let pages = align_up(bytes, OS_PAGE_SIZE) / OS_PAGE_SIZE;
        self.footprint_limit_pages = pages.clamp(self.footprint_pages, self.capacity_pages);
    }

    /// Highest address handed out so far.
    pub fn end(&self) -> usize {
        self.page_addr(self.footprint_pages)
    }

    // ── Pages ─────────────────────────────────────────────────────────

    fn alloc_pages(&mut self, count: usize, owner: impl Fn(usize) -> PageOwner) -> Option<usize> {
        let found = self
            .free_page_runs
            .iter()
            .find(|&(_, &pages)| pages >= count)
            .map(|(&start, &pages)| (start, pages));
        let start = match found {
            Some((start, pages)) => {
                self.free_page_runs.remove(&start);
                if pages > count {
                    self.free_page_runs.insert(start + count, pages - count);
                }
                start
            }
            None => {
                // Grow, reusing a free run that touches the footprint end.
                let tail = self
                    .free_page_runs
                    .last_key_value()
                    .filter(|&(&start, &pages)| start + pages == self.footprint_pages)
                    .map(|(&start, _)| start);
                let start = tail.unwrap_or(self.footprint_pages);
                if start + count > self.footprint_limit_pages {
                    return None;
                }
                if let Some(tail) = tail {
                    self.free_page_runs.remove(&tail);
                }
                self.footprint_pages = start + count;
                start
            }
        };
        let kind = owner(start);
        for page in start..start + count {
            self.page_map[page] = Some(kind);
        }
        // Pages may still hold data of freed objects.
        // SAFETY: the pages are inside the space's mapping
        unsafe {
            (self.page_addr(start) as *mut u8).write_bytes(0, count * OS_PAGE_SIZE);
        }
        Some(start)
    }

    fn free_pages(&mut self, start: usize, count: usize) {
        for page in start..start + count {
            self.page_map[page] = None;
        }
        let mut start = start;
        let mut count = count;
        if let Some((&prev, &prev_count)) = self.free_page_runs.range(..start).next_back()
            && prev + prev_count == start
        {
            self.free_page_runs.remove(&prev);
            start = prev;
            count += prev_count;
        }
        if let Some(next_count) = self.free_page_runs.remove(&(start + count)) {
            count += next_count;
        }
        self.free_page_runs.insert(start, count);
        if self.low_memory_mode {
            crate::system::release_memory(
                self.page_addr(start),
                self.page_addr(start + count),
            );
        }
    }

    // ── Allocation ────────────────────────────────────────────────────

    /// Returns the address and the bytes it occupies.
    pub fn alloc(&mut self, size: usize) -> Option<(usize, usize)> {
        match bracket_index(size) {
            Some(bracket) => {
                let addr = self.alloc_from_run(bracket)?;
                Some((addr, bracket_size(bracket)))
            }
            None => self.alloc_large(size),
        }
    }

    fn alloc_large(&mut self, size: usize) -> Option<(usize, usize)> {
        let pages = align_up(size, OS_PAGE_SIZE) / OS_PAGE_SIZE;
        let start = self.alloc_pages(pages, PageOwner::Large)?;
        self.large.insert(start, pages);
        Some((self.page_addr(start), pages * OS_PAGE_SIZE))
    }

    /// Run of `bracket` with a free slot, making a new one if needed.
    fn usable_run(&mut self, bracket: usize) -> Option<usize> {
        if let Some(current) = self.current_runs[bracket]
            && self.runs.get(&current).is_some_and(|run| !run.is_full())
        {
            return Some(current);
        }
        let next = match self.non_full_runs[bracket].pop_first() {
            Some(run) => run,
            None => {
                let start = self.alloc_pages(run_pages(bracket), PageOwner::Run)?;
                self.runs.insert(start, Run::new(bracket));
                start
            }
        };
        self.current_runs[bracket] = Some(next);
        Some(next)
    }

    fn alloc_from_run(&mut self, bracket: usize) -> Option<usize> {
        let start = self.usable_run(bracket)?;
        let slot = self.runs.get_mut(&start)?.take_slot()?;
        let addr = self.page_addr(start) + slot * bracket_size(bracket);
        // SAFETY: the slot is inside the run's pages
        unsafe { (addr as *mut u8).write_bytes(0, bracket_size(bracket)) };
        Some(addr)
    }

    /// Takes up to [`MAX_BATCH_BYTES`] worth of slots of the bracket `size`
    /// falls in, at least one. Returns the slot size and the slots.
    pub fn alloc_batch(&mut self, size: usize) -> Option<(usize, Vec<usize>)> {
        let bracket = bracket_index(size).filter(|&b| bracket_size(b) <= MAX_SMALL_BRACKET_SIZE)?;
        let slot_size = bracket_size(bracket);
        let wanted = (MAX_BATCH_BYTES / slot_size).max(1);
        let start = self.usable_run(bracket)?;
        let base = self.page_addr(start);
        let run = self.runs.get_mut(&start)?;
        let mut slots = Vec::with_capacity(wanted.min(run.free_slots));
        while slots.len() < wanted {
            match run.take_slot() {
                Some(slot) => slots.push(base + slot * slot_size),
                None => break,
            }
        }
        for &addr in &slots {
            // SAFETY: slots are inside the run's pages
            unsafe { (addr as *mut u8).write_bytes(0, slot_size) };
        }
        Some((slot_size, slots))
    }

    /// Frees the slot or page run at `addr`, returning its size. Unknown
    /// addresses free nothing.
    pub fn free(&mut self, addr: usize) -> usize {
        let Some(page) = addr.checked_sub(self.base).map(|offset| offset / OS_PAGE_SIZE) else {
            return 0;
        };
        match self.page_map.get(page).copied().flatten() {
            Some(PageOwner::Large(start)) => {
                if self.page_addr(start) != addr {
                    return 0;
                }
                let pages = self.large.remove(&start).unwrap_or(0);
                self.free_pages(start, pages);
                pages * OS_PAGE_SIZE
            }
            Some(PageOwner::Run(start)) => self.free_from_run(start, addr),
            None => 0,
        }
    }

    fn free_from_run(&mut self, start: usize, addr: usize) -> usize {
        let base = self.page_addr(start);
        let Some(run) = self.runs.get_mut(&start) else {
            return 0;
        };
        let bracket = run.bracket;
        let size = bracket_size(bracket);
        let was_full = run.is_full();
        if !run.release_slot((addr - base) / size) {
            return 0;
        }
        let is_current = self.current_runs[bracket] == Some(start);
        if run.is_empty() && !is_current {
            self.runs.remove(&start);
            self.non_full_runs[bracket].remove(&start);
            self.free_pages(start, run_pages(bracket));
        } else if was_full && !is_current {
            self.non_full_runs[bracket].insert(start);
        }
        size
    }

    pub fn allocation_size(&self, addr: usize) -> usize {
        let page = (addr - self.base) / OS_PAGE_SIZE;
        match self.page_map.get(page).copied().flatten() {
            Some(PageOwner::Large(start)) => {
                self.large.get(&start).map_or(0, |pages| pages * OS_PAGE_SIZE)
            }
            Some(PageOwner::Run(start)) => {
                self.runs.get(&start).map_or(0, |run| bracket_size(run.bracket))
            }
            None => 0,
        }
    }

    /// Gives free pages back to the OS and lowers the footprint past a free
    /// tail. Returns the bytes released.
    pub fn trim(&mut self) -> usize {
        if let Some((&start, &count)) = self.free_page_runs.last_key_value()
            && start + count == self.footprint_pages
        {
            self.free_page_runs.remove(&start);
            self.footprint_pages = start;
        }
        let mut released = 0;
        for (&start, &count) in &self.free_page_runs {
            released += crate::system::release_memory(
                self.page_addr(start),
                self.page_addr(start + count),
            );
        }
        released
            + crate::system::release_memory(self.end(), self.page_addr(self.capacity_pages))
    }

    /// Largest request that would succeed without growing past the limit.
    pub fn largest_free_contiguous(&self) -> usize {
        let tail_start = self
            .free_page_runs
            .last_key_value()
            .filter(|&(&start, &count)| start + count == self.footprint_pages)
            .map_or(self.footprint_pages, |(&start, _)| start);
        let tail = self.footprint_limit_pages.saturating_sub(tail_start);
        let largest_run = self.free_page_runs.values().copied().max().unwrap_or(0);
        tail.max(largest_run) * OS_PAGE_SIZE
    }

    /// Consistency check of the run bitmaps and the page map.
    pub fn verify(&self) -> Vec<String> {
        let mut errors = Vec::new();
        for (&start, run) in &self.runs {
            let used: usize = run.alloc_bits.iter().map(|w| w.count_ones() as usize).sum();
            if used + run.free_slots != run.num_slots {
                errors.push(format!(
                    "run at page {start}: {used} used + {} free != {} slots",
                    run.free_slots, run.num_slots
                ));
            }
            for page in start..start + run_pages(run.bracket) {
                if self.page_map[page] != Some(PageOwner::Run(start)) {
                    errors.push(format!("page {page} not owned by run {start}"));
                }
            }
        }
        for (&start, &count) in &self.free_page_runs {
            if (start..start + count).any(|page| self.page_map[page].is_some()) {
                errors.push(format!("free page run {start}+{count} overlaps used pages"));
            }
        }
        errors
    }

    pub fn reset(&mut self) {
        *self = Self::new(
            self.base,
            self.capacity_pages * OS_PAGE_SIZE,
            self.footprint_limit(),
            self.low_memory_mode,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_region::MemoryRegion;

    fn create_allocator(pages: usize) -> (MemoryRegion, RosAlloc) {
        let region = MemoryRegion::map("rosalloc test", pages * OS_PAGE_SIZE).expect("map");
        let rosalloc = RosAlloc::new(region.begin(), region.size(), region.size(), false);
        (region, rosalloc)
    }

    #[test]
    fn test_brackets() {
        assert_eq!(bracket_index(1), Some(0));
        assert_eq!(bracket_index(16), Some(0));
        assert_eq!(bracket_index(17), Some(1));
        assert_eq!(bracket_size(bracket_index(512).unwrap_or(0)), 512);
        assert_eq!(bracket_size(bracket_index(700).unwrap_or(0)), 1024);
        assert_eq!(bracket_size(bracket_index(2048).unwrap_or(0)), 2048);
        assert_eq!(bracket_index(2049), None);
    }

    #[test]
    fn test_slots_come_from_one_run() {
        let (_region, mut rosalloc) = create_allocator(16);
        let (a, size_a) = rosalloc.alloc(24).expect("alloc");
        let (b, _) = rosalloc.alloc(30).expect("alloc");
        assert_eq!(size_a, 32);
        assert_eq!(b, a + 32, "same bracket, next slot");
        assert_eq!(rosalloc.footprint(), OS_PAGE_SIZE);
        assert_eq!(rosalloc.allocation_size(b), 32);
        assert_eq!(rosalloc.free(a), 32);
        assert_eq!(rosalloc.free(a), 0, "double free is ignored");
        let (c, _) = rosalloc.alloc(32).expect("alloc");
        assert_eq!(c, a, "freed slot reused");
        assert!(rosalloc.verify().is_empty());
    }

    #[test]
    fn test_large_allocations_coalesce() {
        let (_region, mut rosalloc) = create_allocator(16);
        let (a, size) = rosalloc.alloc(3 * OS_PAGE_SIZE).expect("alloc");
        assert_eq!(size, 3 * OS_PAGE_SIZE);
        let (b, _) = rosalloc.alloc(2 * OS_PAGE_SIZE).expect("alloc");
        let (c, _) = rosalloc.alloc(OS_PAGE_SIZE + 1).expect("alloc");
        assert_eq!(rosalloc.footprint(), 7 * OS_PAGE_SIZE);
        rosalloc.free(a);
        rosalloc.free(b);
        let (d, _) = rosalloc.alloc(5 * OS_PAGE_SIZE).expect("fits coalesced run");
        assert_eq!(d, a);
        assert!(rosalloc.alloc(16 * OS_PAGE_SIZE).is_none(), "beyond capacity");
        rosalloc.free(c);
        assert!(rosalloc.verify().is_empty());
        rosalloc.free(d);
        rosalloc.trim();
        assert_eq!(rosalloc.footprint(), 0, "free tail trimmed");
    }

    #[test]
    fn test_batch_and_revoke() {
        let (_region, mut rosalloc) = create_allocator(16);
        let (slot_size, slots) = rosalloc.alloc_batch(64).expect("batch");
        assert_eq!(slot_size, 64);
        assert_eq!(slots.len(), MAX_BATCH_BYTES / 64);
        let freed: usize = slots[1..].iter().map(|&addr| rosalloc.free(addr)).sum();
        assert_eq!(freed, (slots.len() - 1) * 64);
        assert!(rosalloc.alloc_batch(4096).is_none(), "large sizes are not batched");
        assert!(rosalloc.verify().is_empty());
    }

    #[test]
    fn test_footprint_limit() {
        let (_region, mut rosalloc) = create_allocator(16);
        rosalloc.set_footprint_limit(2 * OS_PAGE_SIZE);
        assert!(rosalloc.alloc(2 * OS_PAGE_SIZE).is_some());
        assert!(rosalloc.alloc(16).is_none(), "limit reached");
        assert_eq!(rosalloc.largest_free_contiguous(), 0);
        rosalloc.set_footprint_limit(16 * OS_PAGE_SIZE);
        assert!(rosalloc.alloc(16).is_some());
    }
}

//! Best-fit free list allocator with boundary coalescing.
//!
//! Every chunk starts with one header word holding its size, the object
//! follows the header. Chunks are 16-byte multiples. Memory past `top` has
//! never been handed out (or was trimmed) and grows like `sbrk` up to the
//! footprint limit.

use std::collections::{BTreeMap, BTreeSet};

use crate::{
    OS_PAGE_SIZE,
    system::{align_down, align_up},
};

pub const CHUNK_OVERHEAD: usize = 8;
const CHUNK_ALIGNMENT: usize = 16;
const MIN_CHUNK_SIZE: usize = 32;

#[derive(Debug)]
pub struct DlMalloc {
    base: usize,
    capacity: usize,
    top: usize,
    footprint_limit: usize,
    /// Free chunk start → size.
    free_chunks: BTreeMap<usize, usize>,
    /// (size, start), for best fit lookups.
    free_by_size: BTreeSet<(usize, usize)>,
}

impl DlMalloc {
    pub fn new(base: usize, capacity: usize, footprint_limit: usize) -> Self {
        // object addresses sit one header word past a 16 byte boundary
        debug_assert!(base.is_multiple_of(CHUNK_ALIGNMENT));
        Self {
            base,
            capacity,
            top: base + CHUNK_OVERHEAD,
            footprint_limit: footprint_limit.min(capacity),
            free_chunks: BTreeMap::new(),
            free_by_size: BTreeSet::new(),
        }
    }

    #[inline]
    fn chunk_size_for(size: usize) -> usize {
        align_up(size + CHUNK_OVERHEAD, CHUNK_ALIGNMENT).max(MIN_CHUNK_SIZE)
    }

    #[inline]
    unsafe fn header(chunk: usize) -> *mut usize {
        chunk as *mut usize
    }

    pub fn footprint(&self) -> usize {
        align_up(self.top - self.base, OS_PAGE_SIZE)
    }

    pub fn footprint_limit(&self) -> usize {
        self.footprint_limit
    }

    pub fn set_footprint_limit(&mut self, bytes: usize) {
        self.footprint_limit = bytes.clamp(self.top - self.base, self.capacity);
    }

    /// End of the highest chunk handed out.
    pub fn end(&self) -> usize {
        self.top
    }

    fn insert_free(&mut self, chunk: usize, size: usize) {
        self.free_chunks.insert(chunk, size);
        self.free_by_size.insert((size, chunk));
    }

    fn remove_free(&mut self, chunk: usize) -> Option<usize> {
        let size = self.free_chunks.remove(&chunk)?;
        self.free_by_size.remove(&(size, chunk));
        Some(size)
    }

    /// Returns the object address and the chunk size.
    pub fn alloc(&mut self, size: usize) -> Option<(usize, usize)> {
        let needed = Self::chunk_size_for(size);
        let chunk = match self.free_by_size.range((needed, 0)..).next().copied() {
            Some((chunk_size, chunk)) => {
                self.remove_free(chunk);
                let remainder = chunk_size - needed;
                if remainder >= MIN_CHUNK_SIZE {
                    self.insert_free(chunk + needed, remainder);
                    Some((chunk, needed))
                } else {
                    Some((chunk, chunk_size))
                }
            }
            None => {
                // chunks start one word before a 16 byte boundary
                let chunk = self.top - CHUNK_OVERHEAD;
                if chunk + needed + CHUNK_OVERHEAD > self.base + self.footprint_limit {
                    None
                } else {
                    self.top = chunk + needed + CHUNK_OVERHEAD;
                    Some((chunk, needed))
                }
            }
        };
        let (chunk, chunk_size) = chunk?;
        // SAFETY: the chunk is inside the space's mapping
        unsafe {
            (chunk as *mut u8).write_bytes(0, chunk_size);
            *Self::header(chunk) = chunk_size;
        }
        Some((chunk + CHUNK_OVERHEAD, chunk_size))
    }

    /// Frees the chunk of the object at `addr`, returning the chunk size.
    pub fn free(&mut self, addr: usize) -> usize {
        let chunk = addr - CHUNK_OVERHEAD;
        // SAFETY: `addr` came from `alloc`
        let size = unsafe { *Self::header(chunk) };
        if size == 0 || self.free_chunks.contains_key(&chunk) {
            return 0;
        }
        let mut start = chunk;
        let mut total = size;
        if let Some((&prev, &prev_size)) = self.free_chunks.range(..chunk).next_back()
            && prev + prev_size == chunk
        {
            self.remove_free(prev);
            start = prev;
            total += prev_size;
        }
        if let Some(next_size) = self.remove_free(chunk + size) {
            total += next_size;
        }
        // SAFETY: the header belongs to a chunk inside the mapping
        unsafe { *Self::header(chunk) = 0 };
        if start + total + CHUNK_OVERHEAD == self.top {
            self.top = start + CHUNK_OVERHEAD;
        } else {
            self.insert_free(start, total);
        }
        size
    }

    pub fn allocation_size(&self, addr: usize) -> usize {
        // SAFETY: `addr` came from `alloc`
        unsafe { *Self::header(addr - CHUNK_OVERHEAD) }
    }

    /// Releases the pages inside free chunks and above `top`.
    pub fn trim(&self) -> usize {
        let mut released = 0;
        for (&chunk, &size) in &self.free_chunks {
            // keep the header word of the free chunk readable
            released += crate::system::release_memory(chunk + CHUNK_OVERHEAD, chunk + size);
        }
        released
            + crate::system::release_memory(
                align_up(self.top, OS_PAGE_SIZE),
                self.base + self.capacity,
            )
    }

    pub fn largest_free_contiguous(&self) -> usize {
        let tail = align_down(
            (self.base + self.footprint_limit).saturating_sub(self.top),
            CHUNK_ALIGNMENT,
        )
        .saturating_sub(CHUNK_OVERHEAD);
        let largest = self.free_by_size.last().map_or(0, |&(size, _)| size - CHUNK_OVERHEAD);
        tail.max(largest)
    }

    pub fn free_chunk_count(&self) -> usize {
        self.free_chunks.len()
    }

    pub fn reset(&mut self) {
        *self = Self::new(self.base, self.capacity, self.footprint_limit);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_region::MemoryRegion;

    fn create_allocator(size: usize) -> (MemoryRegion, DlMalloc) {
        let region = MemoryRegion::map("dlmalloc test", size).expect("map");
        let dlmalloc = DlMalloc::new(region.begin(), region.size(), region.size());
        (region, dlmalloc)
    }

    #[test]
    fn test_alloc_is_aligned_and_zeroed() {
        let (_region, mut dl) = create_allocator(64 * 1024);
        let (a, size) = dl.alloc(40).expect("alloc");
        assert!(a.is_multiple_of(8));
        assert_eq!(size, 48);
        assert_eq!(dl.allocation_size(a), 48);
        unsafe { *(a as *mut u64) = 7 };
        dl.free(a);
        let (b, _) = dl.alloc(40).expect("alloc");
        assert_eq!(b, a, "top chunk reused");
        assert_eq!(unsafe { *(b as *const u64) }, 0, "memory zeroed");
    }

    #[test]
    fn test_free_coalesces_neighbours() {
        let (_region, mut dl) = create_allocator(64 * 1024);
        let (a, _) = dl.alloc(100).expect("alloc");
        let (b, _) = dl.alloc(100).expect("alloc");
        let (c, _) = dl.alloc(100).expect("alloc");
        let (_guard, _) = dl.alloc(100).expect("alloc");
        dl.free(a);
        dl.free(c);
        assert_eq!(dl.free_chunk_count(), 2);
        dl.free(b);
        assert_eq!(dl.free_chunk_count(), 1, "a, b and c merged");
        let (d, _) = dl.alloc(300).expect("alloc");
        assert_eq!(d, a, "merged chunk serves a larger request");
    }

    #[test]
    fn test_footprint_limit_and_fragmentation() {
        let (_region, mut dl) = create_allocator(64 * 1024);
        dl.set_footprint_limit(4096);
        let mut objects = Vec::new();
        while let Some((addr, _)) = dl.alloc(240) {
            objects.push(addr);
        }
        assert!(dl.footprint() <= 4096);
        for addr in objects.iter().step_by(2) {
            dl.free(*addr);
        }
        assert!(dl.alloc(1000).is_none(), "only small holes left");
        // the freed tail chunk went back to the top
        let largest = dl.largest_free_contiguous();
        assert_eq!(largest, 488);
        assert!(dl.alloc(largest + 1).is_none());
        let (fit, _) = dl.alloc(largest).expect("largest contiguous fits");
        dl.free(fit);
        dl.set_footprint_limit(64 * 1024);
        assert!(dl.alloc(1000).is_some(), "grows past the old limit");
    }
}

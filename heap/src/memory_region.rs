//! Named ranges of virtual memory.
//!
//! The heap reserves one mapping up front and carves every continuous space
//! out of it as a non-owning view. Large objects get mappings of their own.

use std::{fmt, ptr::NonNull};

use crate::{
    OS_PAGE_SIZE,
    error::HeapError,
    system::{self, align_up},
};

pub struct MemoryRegion {
    name: String,
    begin: NonNull<u8>,
    size: usize,
    /// Only owning regions unmap on drop.
    owned: bool,
}

// SAFETY: a region is just an address range, access to the memory behind it
// is synchronized by the spaces that use it
unsafe impl Send for MemoryRegion {}
// SAFETY: see above
unsafe impl Sync for MemoryRegion {}

impl MemoryRegion {
    /// Maps `size` bytes (rounded up to whole pages) of zeroed memory.
    pub fn map(name: &str, size: usize) -> Result<Self, HeapError> {
        let size = align_up(size.max(1), OS_PAGE_SIZE);
        let begin =
            system::map_memory(size).ok_or_else(|| HeapError::MapFailed {
                name: name.to_string(),
                size,
            })?;
        Ok(Self {
            name: name.to_string(),
            begin,
            size,
            owned: true,
        })
    }

    /// Creates a view over `[begin, begin + size)` of another region.
    ///
    /// # Safety
    ///
    /// The range must lie inside an owning region that outlives the view.
    pub unsafe fn view(name: &str, begin: usize, size: usize) -> Self {
        debug_assert!(begin.is_multiple_of(OS_PAGE_SIZE));
        Self {
            name: name.to_string(),
            // SAFETY: begin comes from a live mapping and is never zero
            begin: unsafe { NonNull::new_unchecked(begin as *mut u8) },
            size,
            owned: false,
        }
    }

    /// Carves a view of `[begin, begin + size)` out of this region.
    pub fn sub_region(
        &self,
        name: &str,
        offset: usize,
        size: usize,
    ) -> Option<Self> {
        if offset.checked_add(size)? > self.size {
            return None;
        }
        // SAFETY: the range is inside `self`, the caller keeps `self` alive
        Some(unsafe { Self::view(name, self.begin() + offset, size) })
    }

    /// Splits the view at `offset` into `[begin, begin + offset)` and the
    /// remainder.
    pub fn split_at(self, offset: usize, tail_name: &str) -> (Self, Self) {
        debug_assert!(!self.owned, "only views are split");
        debug_assert!(offset <= self.size);
        // SAFETY: both halves stay inside the original view
        let tail = unsafe {
            Self::view(tail_name, self.begin() + offset, self.size - offset)
        };
        // SAFETY: same
        let head = unsafe { Self::view(&self.name, self.begin(), offset) };
        (head, tail)
    }

    /// The same range under another name.
    pub fn renamed(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline(always)]
    pub fn begin(&self) -> usize {
        self.begin.as_ptr() as usize
    }

    #[inline(always)]
    pub fn end(&self) -> usize {
        self.begin() + self.size
    }

    #[inline(always)]
    pub fn size(&self) -> usize {
        self.size
    }

    #[inline(always)]
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.begin() && addr < self.end()
    }

    /// Zeroes `[begin, end)` and gives whole pages back to the OS.
    pub fn release(&self, begin: usize, end: usize) -> usize {
        debug_assert!(begin >= self.begin() && end <= self.end());
        if end <= begin {
            return 0;
        }
        let released = system::release_memory(begin, end);
        // SAFETY: ranges are inside the region
        unsafe {
            if released == 0 {
                (begin as *mut u8).write_bytes(0, end - begin);
                return 0;
            }
            // Partial pages at either end still hold data.
            let page_begin = align_up(begin, OS_PAGE_SIZE);
            let page_end = page_begin + released;
            (begin as *mut u8).write_bytes(0, page_begin - begin);
            (page_end as *mut u8).write_bytes(0, end - page_end);
        }
        released
    }
}

impl Drop for MemoryRegion {
    fn drop(&mut self) {
        if self.owned {
            system::unmap_memory(self.begin, self.size);
        }
    }
}

impl fmt::Debug for MemoryRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "MemoryRegion[{} {:#x}-{:#x}]",
            self.name,
            self.begin(),
            self.end()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_rounds_to_pages() {
        let region = MemoryRegion::map("test", 100).expect("map");
        assert_eq!(region.size(), OS_PAGE_SIZE);
        assert!(region.begin().is_multiple_of(OS_PAGE_SIZE));
        assert!(region.contains(region.begin()));
        assert!(!region.contains(region.end()));
    }

    #[test]
    fn test_views_and_split() {
        let region = MemoryRegion::map("reservation", 8 * OS_PAGE_SIZE)
            .expect("map");
        let view = region
            .sub_region("main", OS_PAGE_SIZE, 4 * OS_PAGE_SIZE)
            .expect("in range");
        assert_eq!(view.begin(), region.begin() + OS_PAGE_SIZE);
        assert!(region.sub_region("too big", 0, 9 * OS_PAGE_SIZE).is_none());

        let (head, tail) = view.split_at(OS_PAGE_SIZE, "tail");
        assert_eq!(head.end(), tail.begin());
        assert_eq!(tail.size(), 3 * OS_PAGE_SIZE);
        assert_eq!(tail.name(), "tail");
        drop(head);
        drop(tail);

        // views do not unmap, the reservation is still writable
        unsafe { *(region.begin() as *mut u8) = 1 };
    }

    #[test]
    fn test_release_zeroes_partial_pages() {
        let region = MemoryRegion::map("release", 4 * OS_PAGE_SIZE)
            .expect("map");
        unsafe {
            (region.begin() as *mut u8).write_bytes(0xFF, region.size())
        };
        let begin = region.begin() + 8;
        let end = region.begin() + 2 * OS_PAGE_SIZE + 16;
        region.release(begin, end);
        unsafe {
            assert_eq!(*(region.begin() as *const u8), 0xFF);
            assert_eq!(*(begin as *const u8), 0);
            assert_eq!(*((end - 1) as *const u8), 0);
            assert_eq!(*(end as *const u8), 0xFF);
        }
    }
}

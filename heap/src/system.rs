use std::ptr::NonNull;

#[cfg(unix)]
#[allow(unused)]
mod unix {
    use core::ffi::c_void;

    pub const PROT_NONE: i32 = 0x0;
    pub const PROT_READ: i32 = 0x1;
    pub const PROT_WRITE: i32 = 0x2;

    pub const MAP_PRIVATE: i32 = 0x02;

    #[cfg(target_os = "linux")]
    pub const MAP_ANON: i32 = 0x20;
    #[cfg(target_os = "linux")]
    pub const MAP_NORESERVE: i32 = 0x4000;
    #[cfg(any(target_os = "macos", target_os = "ios"))]
    pub const MAP_ANON: i32 = 0x1000;
    #[cfg(any(target_os = "macos", target_os = "ios"))]
    pub const MAP_NORESERVE: i32 = 0x40;

    pub const MAP_FAILED: isize = -1;

    pub const MADV_DONTNEED: i32 = 4;

    /// posix mmap, munmap and madvise
    /// # Safety
    /// see valid mmap, munmap and madvise usage online
    unsafe extern "C" {
        pub fn mmap(
            addr: *mut c_void,
            length: usize,
            prot: i32,
            flags: i32,
            fd: i32,
            offset: isize,
        ) -> *mut c_void;

        pub fn munmap(addr: *mut c_void, length: usize) -> i32;

        pub fn madvise(addr: *mut c_void, length: usize, advice: i32) -> i32;
    }

    /// posix memory reservation using mmap, pages are committed lazily
    /// # Safety
    /// null must be checked
    #[inline]
    pub unsafe fn anonymous_mmap(len: usize) -> *mut u8 {
        // SAFETY: safe if contract holds
        let p = unsafe {
            mmap(
                core::ptr::null_mut(),
                len,
                PROT_READ | PROT_WRITE,
                MAP_PRIVATE | MAP_ANON | MAP_NORESERVE,
                -1,
                0,
            )
        };
        if (p as isize) == MAP_FAILED {
            core::ptr::null_mut()
        } else {
            p as *mut u8
        }
    }

    /// posix memory deallocation using munmap
    /// # Safety
    /// must be allocated by mmmap
    #[inline]
    pub unsafe fn anonymous_munmap(ptr: *mut u8, len: usize) {
        // SAFETY: safe if contract holds
        let _ = unsafe { munmap(ptr.cast(), len) };
    }

    /// hands the pages back to the kernel, they read as zero afterwards
    /// # Safety
    /// range must be page aligned and inside a private anonymous mapping
    #[inline]
    pub unsafe fn anonymous_release(ptr: *mut u8, len: usize) -> bool {
        // SAFETY: safe if contract holds
        unsafe { madvise(ptr.cast(), len, MADV_DONTNEED) == 0 }
    }
}

pub const OS_PAGE_SIZE: usize = 4096;

#[inline(always)]
pub const fn align_up(value: usize, alignment: usize) -> usize {
    debug_assert!(alignment.is_power_of_two());
    (value + alignment - 1) & !(alignment - 1)
}

#[inline(always)]
pub const fn align_down(value: usize, alignment: usize) -> usize {
    debug_assert!(alignment.is_power_of_two());
    value & !(alignment - 1)
}

#[must_use]
pub fn map_memory(size: usize) -> Option<NonNull<u8>> {
    // SAFETY: this is safe
    let ptr = unsafe { unix::anonymous_mmap(size) };
    NonNull::new(ptr)
}

pub fn unmap_memory(ptr: NonNull<u8>, size: usize) {
    // SAFETY: ptr must be from mmap allocation
    unsafe { unix::anonymous_munmap(ptr.as_ptr(), size) };
}

/// Returns the whole pages inside `[begin, end)` to the OS.
///
/// Returns the number of bytes released.
pub fn release_memory(begin: usize, end: usize) -> usize {
    let begin = align_up(begin, OS_PAGE_SIZE);
    let end = align_down(end, OS_PAGE_SIZE);
    if end <= begin {
        return 0;
    }
    // SAFETY: callers only pass ranges inside heap mappings, which are
    // private and anonymous
    let released =
        unsafe { unix::anonymous_release(begin as *mut u8, end - begin) };
    if released { end - begin } else { 0 }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alignment_helpers() {
        assert_eq!(align_up(1, 8), 8);
        assert_eq!(align_up(16, 8), 16);
        assert_eq!(align_down(4097, OS_PAGE_SIZE), OS_PAGE_SIZE);
        assert_eq!(align_down(4095, OS_PAGE_SIZE), 0);
    }

    #[test]
    fn test_release_memory_zeroes_pages() {
        let size = 4 * OS_PAGE_SIZE;
        let ptr = map_memory(size).expect("map");
        let base = ptr.as_ptr() as usize;
        unsafe { ptr.as_ptr().write_bytes(0xAB, size) };

        let released = release_memory(base + 1, base + size);
        assert_eq!(
            released,
            3 * OS_PAGE_SIZE,
            "only whole pages inside the range are released"
        );
        unsafe {
            assert_eq!(*ptr.as_ptr(), 0xAB, "first page kept");
            assert_eq!(*ptr.as_ptr().add(OS_PAGE_SIZE), 0, "released page");
        }
        unmap_memory(ptr, size);
    }
}

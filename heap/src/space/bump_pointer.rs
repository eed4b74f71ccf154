use std::{
    collections::BTreeMap,
    sync::atomic::{AtomicUsize, Ordering},
};

use parking_lot::Mutex;

use crate::{
    memory_region::MemoryRegion,
    object::{OBJECT_ALIGNMENT, ObjectModel, ObjectRef},
    space::Allocation,
    system::align_up,
};

/// Contiguous space allocated by advancing a cursor.
///
/// Thread-local allocation buffers are carved off the cursor. The tail of a
/// buffer that was revoked before it filled up stays zeroed, walks stop at
/// the first null class word inside a buffer and skip to its end.
pub struct BumpPointerSpace {
    region: MemoryRegion,
    cursor: AtomicUsize,
    objects_allocated: AtomicUsize,
    /// TLAB start → TLAB size.
    blocks: Mutex<BTreeMap<usize, usize>>,
}

impl BumpPointerSpace {
    pub fn new(region: MemoryRegion) -> Self {
        let begin = region.begin();
        Self {
            region,
            cursor: AtomicUsize::new(begin),
            objects_allocated: AtomicUsize::new(0),
            blocks: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn name(&self) -> &str {
        self.region.name()
    }

    pub fn begin(&self) -> usize {
        self.region.begin()
    }

    pub fn end(&self) -> usize {
        self.cursor.load(Ordering::Acquire)
    }

    pub fn limit(&self) -> usize {
        self.region.end()
    }

    pub fn size(&self) -> usize {
        self.end() - self.begin()
    }

    pub fn capacity(&self) -> usize {
        self.limit() - self.begin()
    }

    pub fn is_empty(&self) -> bool {
        self.end() == self.begin()
    }

    /// Bytes between begin and the cursor, TLAB slack included.
    pub fn bytes_allocated(&self) -> usize {
        self.size()
    }

    pub fn objects_allocated(&self) -> usize {
        self.objects_allocated.load(Ordering::Relaxed)
    }

    #[inline(always)]
    fn bump(&self, bytes: usize) -> Option<usize> {
        let limit = self.limit();
        let mut old = self.cursor.load(Ordering::Relaxed);
        loop {
            let new = old.checked_add(bytes)?;
            if new > limit {
                return None;
            }
            match self.cursor.compare_exchange_weak(
                old,
                new,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Some(old),
                Err(current) => old = current,
            }
        }
    }

    #[inline]
    pub fn alloc(&self, byte_count: usize) -> Option<Allocation> {
        let bytes = align_up(byte_count, OBJECT_ALIGNMENT);
        let addr = self.bump(bytes)?;
        self.objects_allocated.fetch_add(1, Ordering::Relaxed);
        Some(Allocation {
            // SAFETY: the cursor only yields aligned, non-null addresses
            object: unsafe { ObjectRef::from_addr_unchecked(addr) },
            bytes_allocated: bytes,
            usable_size: bytes,
            bulk_bytes_allocated: bytes,
        })
    }

    /// Allocation used by collectors while mutators are suspended.
    pub fn alloc_thread_unsafe(&self, byte_count: usize) -> Option<Allocation> {
        let bytes = align_up(byte_count, OBJECT_ALIGNMENT);
        let addr = self.end();
        if addr + bytes > self.limit() {
            return None;
        }
        self.cursor.store(addr + bytes, Ordering::Release);
        self.objects_allocated.fetch_add(1, Ordering::Relaxed);
        Some(Allocation {
            // SAFETY: see `alloc`
            object: unsafe { ObjectRef::from_addr_unchecked(addr) },
            bytes_allocated: bytes,
            usable_size: bytes,
            bulk_bytes_allocated: bytes,
        })
    }

    /// Hands out `[start, start + bytes)` as a thread-local buffer.
    pub fn alloc_new_tlab(&self, bytes: usize) -> Option<(usize, usize)> {
        let bytes = align_up(bytes, OBJECT_ALIGNMENT);
        let mut blocks = self.blocks.lock();
        let start = self.bump(bytes)?;
        blocks.insert(start, bytes);
        Some((start, start + bytes))
    }

    /// Folds the objects a thread allocated in its buffer into the space
    /// totals.
    pub fn revoke_tlab(&self, objects: usize) {
        self.objects_allocated.fetch_add(objects, Ordering::Relaxed);
    }

    /// Visits every object in allocation order.
    ///
    /// # Safety
    ///
    /// No mutator may be allocating into the space, and every object must be
    /// fully initialized.
    pub unsafe fn walk(&self, model: &dyn ObjectModel, visitor: &mut dyn FnMut(ObjectRef)) {
        let blocks = self.blocks.lock().clone();
        let end = self.end();
        let mut pos = self.begin();
        while pos < end {
            let next = match blocks.get(&pos) {
                Some(size) => (pos + size).min(end),
                None => blocks
                    .range(pos + 1..)
                    .next()
                    .map_or(end, |(&start, _)| start)
                    .min(end),
            };
            // SAFETY: guaranteed by the caller
            unsafe { walk_range(model, pos, next, visitor) };
            pos = next;
        }
    }

    /// Resets the cursor and returns the pages to the OS.
    pub fn clear(&self) {
        let begin = self.begin();
        let end = self.end();
        self.region.release(begin, end);
        self.cursor.store(begin, Ordering::Release);
        self.objects_allocated.store(0, Ordering::Relaxed);
        self.blocks.lock().clear();
    }

    pub fn contains(&self, obj: ObjectRef) -> bool {
        obj.addr() >= self.begin() && obj.addr() < self.end()
    }
}

/// Visits objects laid out back to back in `[begin, end)`, stopping at the
/// first null class word.
///
/// # Safety
///
/// Every object in the range must be initialized.
pub(crate) unsafe fn walk_range(
    model: &dyn ObjectModel,
    begin: usize,
    end: usize,
    visitor: &mut dyn FnMut(ObjectRef),
) {
    let mut cursor = begin;
    while cursor < end {
        // SAFETY: cursor is aligned and inside the range
        let obj = unsafe { ObjectRef::from_addr_unchecked(cursor) };
        // SAFETY: guaranteed by the caller
        if unsafe { obj.class() }.is_none() {
            break;
        }
        visitor(obj);
        // SAFETY: guaranteed by the caller
        let size = unsafe { model.size_of(obj) };
        cursor += align_up(size, OBJECT_ALIGNMENT).max(OBJECT_ALIGNMENT);
    }
}

//! One bit per object slot of a continuous space, plus the hashed object
//! sets the large object space uses instead.

use std::{
    collections::HashSet,
    fmt,
    sync::atomic::{AtomicUsize, Ordering},
};

use parking_lot::Mutex;

use crate::object::{OBJECT_ALIGNMENT, ObjectRef};

const BITS_PER_WORD: usize = usize::BITS as usize;
/// Bytes of heap covered by one bitmap word.
const BYTES_PER_WORD: usize = OBJECT_ALIGNMENT * BITS_PER_WORD;

/// Objects handed to the sweep callback at once.
pub const SWEEP_BATCH: usize = 128;

pub struct SpaceBitmap {
    name: String,
    heap_begin: usize,
    heap_limit: usize,
    bits: Box<[AtomicUsize]>,
}

impl SpaceBitmap {
    pub fn new(name: &str, heap_begin: usize, capacity: usize) -> Self {
        debug_assert!(heap_begin.is_multiple_of(OBJECT_ALIGNMENT));
        let words = capacity.div_ceil(BYTES_PER_WORD);
        let mut bits = Vec::with_capacity(words);
        bits.resize_with(words, || AtomicUsize::new(0));
        Self {
            name: name.to_string(),
            heap_begin,
            heap_limit: heap_begin + capacity,
            bits: bits.into_boxed_slice(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline(always)]
    pub fn heap_begin(&self) -> usize {
        self.heap_begin
    }

    #[inline(always)]
    pub fn heap_limit(&self) -> usize {
        self.heap_limit
    }

    #[inline(always)]
    pub fn has_address(&self, addr: usize) -> bool {
        addr >= self.heap_begin && addr < self.heap_limit
    }

    #[inline(always)]
    fn locate(&self, addr: usize) -> (usize, usize) {
        debug_assert!(
            self.has_address(addr),
            "{:#x} outside of bitmap {}",
            addr,
            self.name
        );
        let offset = (addr - self.heap_begin) / OBJECT_ALIGNMENT;
        (offset / BITS_PER_WORD, 1usize << (offset % BITS_PER_WORD))
    }

    #[inline(always)]
    pub fn test(&self, obj: ObjectRef) -> bool {
        let (index, mask) = self.locate(obj.addr());
        self.bits[index].load(Ordering::Relaxed) & mask != 0
    }

    /// Sets the bit, returns whether it was already set.
    #[inline(always)]
    pub fn set(&self, obj: ObjectRef) -> bool {
        let (index, mask) = self.locate(obj.addr());
        self.bits[index].fetch_or(mask, Ordering::Relaxed) & mask != 0
    }

    /// Like [`set`](Self::set), safe for parallel markers racing on the
    /// same word.
    #[inline(always)]
    pub fn atomic_test_and_set(&self, obj: ObjectRef) -> bool {
        let (index, mask) = self.locate(obj.addr());
        self.bits[index].fetch_or(mask, Ordering::AcqRel) & mask != 0
    }

    #[inline(always)]
    pub fn clear(&self, obj: ObjectRef) -> bool {
        let (index, mask) = self.locate(obj.addr());
        self.bits[index].fetch_and(!mask, Ordering::Relaxed) & mask != 0
    }

    pub fn clear_all(&self) {
        for word in self.bits.iter() {
            word.store(0, Ordering::Relaxed);
        }
    }

    /// Clears every bit for addresses in `[begin, end)`.
    pub fn clear_range(&self, begin: usize, end: usize) {
        let begin = begin.max(self.heap_begin);
        let end = end.min(self.heap_limit);
        let mut addr = begin;
        while addr < end && !(addr - self.heap_begin).is_multiple_of(BYTES_PER_WORD) {
            if let Some(obj) = ObjectRef::from_addr(addr) {
                self.clear(obj);
            }
            addr += OBJECT_ALIGNMENT;
        }
        while addr + BYTES_PER_WORD <= end {
            let (index, _) = self.locate(addr);
            self.bits[index].store(0, Ordering::Relaxed);
            addr += BYTES_PER_WORD;
        }
        while addr < end {
            if let Some(obj) = ObjectRef::from_addr(addr) {
                self.clear(obj);
            }
            addr += OBJECT_ALIGNMENT;
        }
    }

    /// Calls `visitor` for every set bit with an address in `[begin, end)`,
    /// in address order.
    pub fn visit_marked_range(
        &self,
        begin: usize,
        end: usize,
        mut visitor: impl FnMut(ObjectRef),
    ) {
        let begin = begin.max(self.heap_begin);
        let end = end.min(self.heap_limit);
        if begin >= end {
            return;
        }
        let first = (begin - self.heap_begin) / BYTES_PER_WORD;
        let last = (end - 1 - self.heap_begin) / BYTES_PER_WORD;
        for index in first..=last {
            let mut word = self.bits[index].load(Ordering::Relaxed);
            let word_base = self.heap_begin + index * BYTES_PER_WORD;
            while word != 0 {
                let bit = word.trailing_zeros() as usize;
                word &= word - 1;
                let addr = word_base + bit * OBJECT_ALIGNMENT;
                if addr < begin {
                    continue;
                }
                if addr >= end {
                    return;
                }
                // SAFETY: bitmap addresses are aligned and non-zero
                visitor(unsafe { ObjectRef::from_addr_unchecked(addr) });
            }
        }
    }

    pub fn walk(&self, visitor: impl FnMut(ObjectRef)) {
        self.visit_marked_range(self.heap_begin, self.heap_limit, visitor);
    }

    pub fn count_marked(&self, begin: usize, end: usize) -> usize {
        let mut count = 0;
        self.visit_marked_range(begin, end, |_| count += 1);
        count
    }

    /// Copies the bits of `other` covering `[begin, end)` into `self`.
    pub fn copy_range_from(&self, other: &SpaceBitmap, begin: usize, end: usize) {
        other.visit_marked_range(begin, end, |obj| {
            if self.has_address(obj.addr()) {
                self.set(obj);
            }
        });
    }

    /// Hands objects that are live but not marked in `[begin, end)` to
    /// `callback`, in batches of at most [`SWEEP_BATCH`].
    pub fn sweep_walk(
        live: &SpaceBitmap,
        mark: &SpaceBitmap,
        begin: usize,
        end: usize,
        mut callback: impl FnMut(&[ObjectRef]),
    ) {
        debug_assert_eq!(live.heap_begin, mark.heap_begin);
        let begin = begin.max(live.heap_begin);
        let end = end.min(live.heap_limit);
        if begin >= end {
            return;
        }
        let mut batch = Vec::with_capacity(SWEEP_BATCH);
        let first = (begin - live.heap_begin) / BYTES_PER_WORD;
        let last = (end - 1 - live.heap_begin) / BYTES_PER_WORD;
        for index in first..=last {
            let mut garbage = live.bits[index].load(Ordering::Relaxed)
                & !mark.bits[index].load(Ordering::Relaxed);
            let word_base = live.heap_begin + index * BYTES_PER_WORD;
            while garbage != 0 {
                let bit = garbage.trailing_zeros() as usize;
                garbage &= garbage - 1;
                let addr = word_base + bit * OBJECT_ALIGNMENT;
                if addr < begin || addr >= end {
                    continue;
                }
                // SAFETY: bitmap addresses are aligned and non-zero
                batch.push(unsafe { ObjectRef::from_addr_unchecked(addr) });
                if batch.len() == SWEEP_BATCH {
                    callback(&batch);
                    batch.clear();
                }
            }
        }
        if !batch.is_empty() {
            callback(&batch);
        }
    }
}

impl fmt::Debug for SpaceBitmap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "SpaceBitmap[{} {:#x}-{:#x}]",
            self.name, self.heap_begin, self.heap_limit
        )
    }
}

// ── ObjectSet ─────────────────────────────────────────────────────────

/// Set of object addresses, the large object space counterpart of a
/// bitmap.
#[derive(Debug)]
pub struct ObjectSet {
    name: String,
    objects: Mutex<HashSet<ObjectRef>>,
}

impl ObjectSet {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            objects: Mutex::new(HashSet::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn test(&self, obj: ObjectRef) -> bool {
        self.objects.lock().contains(&obj)
    }

    /// Returns whether the object was already in the set.
    pub fn set(&self, obj: ObjectRef) -> bool {
        !self.objects.lock().insert(obj)
    }

    pub fn clear(&self, obj: ObjectRef) {
        self.objects.lock().remove(&obj);
    }

    pub fn clear_all(&self) {
        self.objects.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.objects.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn copy_from(&self, other: &ObjectSet) {
        let source = other.objects.lock().clone();
        *self.objects.lock() = source;
    }

    pub fn snapshot(&self) -> Vec<ObjectRef> {
        let mut objects: Vec<_> = self.objects.lock().iter().copied().collect();
        objects.sort_unstable();
        objects
    }
}

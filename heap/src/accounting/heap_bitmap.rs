use std::sync::Arc;

use crate::{
    accounting::space_bitmap::{ObjectSet, SpaceBitmap},
    object::ObjectRef,
};

/// All live (or all mark) bitmaps of the heap, looked up by address.
///
/// Built from the space table whenever a collector or verifier needs a
/// consistent view. Cheap, it only clones the `Arc`s.
#[derive(Debug, Default, Clone)]
pub struct HeapBitmap {
    /// Sorted by `heap_begin`.
    continuous: Vec<Arc<SpaceBitmap>>,
    large: Vec<Arc<ObjectSet>>,
}

impl HeapBitmap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_continuous(&mut self, bitmap: Arc<SpaceBitmap>) {
        debug_assert!(
            self.continuous.iter().all(|b| b.heap_limit() <= bitmap.heap_begin()
                || bitmap.heap_limit() <= b.heap_begin()),
            "bitmap {} overlaps",
            bitmap.name()
        );
        let at = self
            .continuous
            .partition_point(|b| b.heap_begin() < bitmap.heap_begin());
        self.continuous.insert(at, bitmap);
    }

    pub fn add_large(&mut self, set: Arc<ObjectSet>) {
        self.large.push(set);
    }

    #[inline]
    pub fn bitmap_for(&self, addr: usize) -> Option<&Arc<SpaceBitmap>> {
        let at = self.continuous.partition_point(|b| b.heap_begin() <= addr);
        let candidate = self.continuous.get(at.checked_sub(1)?)?;
        candidate.has_address(addr).then_some(candidate)
    }

    pub fn test(&self, obj: ObjectRef) -> bool {
        match self.bitmap_for(obj.addr()) {
            Some(bitmap) => bitmap.test(obj),
            None => self.large.iter().any(|set| set.test(obj)),
        }
    }

    /// Sets the bit in the covering bitmap. Objects outside every bitmap
    /// are assumed to be large objects and go into the first large set.
    pub fn set(&self, obj: ObjectRef) -> bool {
        match self.bitmap_for(obj.addr()) {
            Some(bitmap) => bitmap.atomic_test_and_set(obj),
            None => self.large.first().is_some_and(|set| set.set(obj)),
        }
    }

    pub fn clear(&self, obj: ObjectRef) {
        match self.bitmap_for(obj.addr()) {
            Some(bitmap) => {
                bitmap.clear(obj);
            }
            None => self.large.iter().for_each(|set| set.clear(obj)),
        }
    }

    pub fn walk(&self, mut visitor: impl FnMut(ObjectRef)) {
        for bitmap in &self.continuous {
            bitmap.walk(&mut visitor);
        }
        for set in &self.large {
            set.snapshot().into_iter().for_each(&mut visitor);
        }
    }

    pub fn continuous(&self) -> &[Arc<SpaceBitmap>] {
        &self.continuous
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn obj(addr: usize) -> ObjectRef {
        ObjectRef::from_addr(addr).expect("aligned")
    }

    #[test]
    fn test_lookup_by_address() {
        let mut heap_bitmap = HeapBitmap::new();
        let high = Arc::new(SpaceBitmap::new("high", 0x20_0000, 0x1000));
        let low = Arc::new(SpaceBitmap::new("low", 0x10_0000, 0x1000));
        heap_bitmap.add_continuous(high.clone());
        heap_bitmap.add_continuous(low.clone());
        heap_bitmap.add_large(Arc::new(ObjectSet::new("large")));

        assert_eq!(heap_bitmap.bitmap_for(0x10_0008).map(|b| b.name()), Some("low"));
        assert_eq!(heap_bitmap.bitmap_for(0x20_0ff8).map(|b| b.name()), Some("high"));
        assert!(heap_bitmap.bitmap_for(0x10_1000).is_none());
        assert!(heap_bitmap.bitmap_for(0x8).is_none());

        heap_bitmap.set(obj(0x20_0010));
        heap_bitmap.set(obj(0x90_0000));
        assert!(high.test(obj(0x20_0010)));
        assert!(heap_bitmap.test(obj(0x90_0000)), "large objects live in the set");

        let mut walked = Vec::new();
        heap_bitmap.walk(|o| walked.push(o.addr()));
        assert_eq!(walked, vec![0x20_0010, 0x90_0000]);
    }
}

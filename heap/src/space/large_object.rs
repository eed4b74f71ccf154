use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use parking_lot::Mutex;

use crate::{
    accounting::ObjectSet,
    memory_region::MemoryRegion,
    object::ObjectRef,
    space::Allocation,
};

/// Discontinuous space giving every object a mapping of its own.
///
/// Only card table exempt objects land here, the mappings lie outside the
/// heap reservation and no card covers them.
pub struct LargeObjectSpace {
    name: String,
    mappings: Mutex<HashMap<ObjectRef, MemoryRegion>>,
    live: Mutex<Arc<ObjectSet>>,
    mark: Mutex<Arc<ObjectSet>>,
    bytes_allocated: AtomicUsize,
    objects_allocated: AtomicUsize,
}

impl LargeObjectSpace {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            mappings: Mutex::new(HashMap::new()),
            live: Mutex::new(Arc::new(ObjectSet::new(&format!("{name} live-objects")))),
            mark: Mutex::new(Arc::new(ObjectSet::new(&format!("{name} mark-objects")))),
            bytes_allocated: AtomicUsize::new(0),
            objects_allocated: AtomicUsize::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn bytes_allocated(&self) -> usize {
        self.bytes_allocated.load(Ordering::Relaxed)
    }

    pub fn objects_allocated(&self) -> usize {
        self.objects_allocated.load(Ordering::Relaxed)
    }

    pub fn alloc(&self, byte_count: usize) -> Option<Allocation> {
        let region = match MemoryRegion::map(&self.name, byte_count) {
            Ok(region) => region,
            Err(err) => {
                log::debug!(target: "heap", "large object allocation failed: {err}");
                return None;
            }
        };
        let bytes = region.size();
        let object = ObjectRef::from_addr(region.begin())?;
        self.mappings.lock().insert(object, region);
        self.bytes_allocated.fetch_add(bytes, Ordering::Relaxed);
        self.objects_allocated.fetch_add(1, Ordering::Relaxed);
        Some(Allocation {
            object,
            bytes_allocated: bytes,
            usable_size: bytes,
            bulk_bytes_allocated: bytes,
        })
    }

    #[inline]
    pub fn contains(&self, obj: ObjectRef) -> bool {
        self.mappings.lock().contains_key(&obj)
    }

    pub fn allocation_size(&self, obj: ObjectRef) -> usize {
        self.mappings.lock().get(&obj).map_or(0, MemoryRegion::size)
    }

    /// Unmaps the objects, returning the bytes freed.
    pub fn free_list(&self, objects: &[ObjectRef]) -> usize {
        let released: Vec<MemoryRegion> = {
            let mut mappings = self.mappings.lock();
            objects.iter().filter_map(|obj| mappings.remove(obj)).collect()
        };
        let bytes: usize = released.iter().map(MemoryRegion::size).sum();
        self.bytes_allocated.fetch_sub(bytes, Ordering::Relaxed);
        self.objects_allocated.fetch_sub(released.len(), Ordering::Relaxed);
        bytes
    }

    pub fn free(&self, obj: ObjectRef) -> usize {
        self.free_list(&[obj])
    }

    pub fn live_objects(&self) -> Arc<ObjectSet> {
        self.live.lock().clone()
    }

    pub fn mark_objects(&self) -> Arc<ObjectSet> {
        self.mark.lock().clone()
    }

    pub fn swap_bitmaps(&self) {
        let mut live = self.live.lock();
        let mut mark = self.mark.lock();
        std::mem::swap(&mut *live, &mut *mark);
    }

    /// Marks every live object, sticky collections never free large
    /// objects allocated before the last GC.
    pub fn copy_live_to_marked(&self) {
        self.mark_objects().copy_from(&self.live_objects());
    }

    /// Frees live objects that were not marked. Returns the freed objects
    /// and bytes.
    pub fn sweep(&self) -> (usize, usize) {
        let live = self.live_objects();
        let mark = self.mark_objects();
        let garbage: Vec<ObjectRef> = live
            .snapshot()
            .into_iter()
            .filter(|obj| !mark.test(*obj))
            .collect();
        for obj in &garbage {
            live.clear(*obj);
        }
        let bytes = self.free_list(&garbage);
        (garbage.len(), bytes)
    }

    /// Every object mapping, in address order.
    pub fn objects(&self) -> Vec<ObjectRef> {
        let mut objects: Vec<_> = self.mappings.lock().keys().copied().collect();
        objects.sort_unstable();
        objects
    }
}

impl std::fmt::Debug for LargeObjectSpace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "LargeObjectSpace[{} {} objects]", self.name, self.objects_allocated())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::OS_PAGE_SIZE;

    #[test]
    fn test_each_object_gets_a_mapping() {
        let los = LargeObjectSpace::new("large object space");
        let a = los.alloc(3 * OS_PAGE_SIZE + 1).expect("alloc");
        let b = los.alloc(OS_PAGE_SIZE).expect("alloc");
        assert_eq!(a.bytes_allocated, 4 * OS_PAGE_SIZE);
        assert!(los.contains(a.object));
        assert!(!los.contains(ObjectRef::from_addr(a.object.addr() + 8).expect("aligned")));
        assert_eq!(los.bytes_allocated(), 5 * OS_PAGE_SIZE);
        assert_eq!(los.free(a.object), 4 * OS_PAGE_SIZE);
        assert!(!los.contains(a.object));
        assert_eq!(los.objects(), vec![b.object]);
    }

    #[test]
    fn test_sweep_keeps_marked_objects() {
        let los = LargeObjectSpace::new("large object space");
        let keep = los.alloc(OS_PAGE_SIZE).expect("alloc").object;
        let drop = los.alloc(OS_PAGE_SIZE).expect("alloc").object;
        los.live_objects().set(keep);
        los.live_objects().set(drop);
        los.mark_objects().set(keep);
        assert_eq!(los.sweep(), (1, OS_PAGE_SIZE));
        assert!(los.contains(keep));
        assert!(!los.contains(drop));
        los.swap_bitmaps();
        assert!(los.live_objects().test(keep));

        los.mark_objects().clear_all();
        los.copy_live_to_marked();
        assert!(los.mark_objects().test(keep), "sticky GCs keep old objects");
    }
}

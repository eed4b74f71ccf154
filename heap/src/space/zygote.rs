use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use parking_lot::Mutex;

use crate::{
    accounting::{CardTable, SpaceBitmap},
    memory_region::MemoryRegion,
    object::ObjectRef,
};

/// Objects frozen at the zygote fork.
///
/// The space never allocates. Its objects are only reclaimed by full
/// collections, and even then the memory stays mapped: sweeping drops the
/// objects from the live bitmap, marks their cards and lowers the object
/// count.
pub struct ZygoteSpace {
    region: MemoryRegion,
    live: Mutex<Arc<SpaceBitmap>>,
    mark: Mutex<Arc<SpaceBitmap>>,
    objects_allocated: AtomicUsize,
}

impl ZygoteSpace {
    /// Takes over the live objects `source` records inside `region`.
    pub fn new(region: MemoryRegion, source: &SpaceBitmap, objects: usize) -> Self {
        let name = region.name().to_string();
        let live = SpaceBitmap::new(&format!("{name} live-bitmap"), region.begin(), region.size());
        live.copy_range_from(source, region.begin(), region.end());
        let mark = SpaceBitmap::new(&format!("{name} mark-bitmap"), region.begin(), region.size());
        Self {
            region,
            live: Mutex::new(Arc::new(live)),
            mark: Mutex::new(Arc::new(mark)),
            objects_allocated: AtomicUsize::new(objects),
        }
    }

    pub fn name(&self) -> &str {
        self.region.name()
    }

    pub fn begin(&self) -> usize {
        self.region.begin()
    }

    pub fn end(&self) -> usize {
        self.region.end()
    }

    pub fn limit(&self) -> usize {
        self.region.end()
    }

    pub fn live_bitmap(&self) -> Arc<SpaceBitmap> {
        self.live.lock().clone()
    }

    pub fn mark_bitmap(&self) -> Arc<SpaceBitmap> {
        self.mark.lock().clone()
    }

    pub fn swap_bitmaps(&self) {
        let mut live = self.live.lock();
        let mut mark = self.mark.lock();
        std::mem::swap(&mut *live, &mut *mark);
    }

    /// The whole range counts as allocated, freed objects are not reused.
    pub fn bytes_allocated(&self) -> usize {
        self.region.size()
    }

    pub fn objects_allocated(&self) -> usize {
        self.objects_allocated.load(Ordering::Relaxed)
    }

    /// Forgets live but unmarked objects. Returns the count.
    ///
    /// Cards of the dead objects are marked so the mod-union table rescans
    /// them and drops the references they held.
    pub fn sweep(&self, card_table: &CardTable) -> usize {
        let live = self.live_bitmap();
        let mark = self.mark_bitmap();
        let mut freed = 0;
        SpaceBitmap::sweep_walk(&live, &mark, self.begin(), self.end(), |batch: &[ObjectRef]| {
            for obj in batch {
                card_table.mark_card(obj.addr());
            }
            freed += batch.len();
        });
        self.objects_allocated.fetch_sub(freed, Ordering::Relaxed);
        freed
    }
}

impl std::fmt::Debug for ZygoteSpace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ZygoteSpace[{} {:#x}-{:#x}]", self.name(), self.begin(), self.end())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sweep_marks_cards_and_keeps_memory() {
        let reservation = MemoryRegion::map("zygote test", 16 * 1024).expect("map");
        let source = SpaceBitmap::new("source", reservation.begin(), reservation.size());
        let a = ObjectRef::from_addr(reservation.begin()).expect("aligned");
        let b = ObjectRef::from_addr(reservation.begin() + 1024).expect("aligned");
        source.set(a);
        source.set(b);
        let view = reservation.sub_region("zygote space", 0, 8 * 1024).expect("view");
        let zygote = ZygoteSpace::new(view, &source, 2);
        let card_table = CardTable::new(reservation.begin(), reservation.size());

        zygote.mark_bitmap().set(a);
        assert_eq!(zygote.sweep(&card_table), 1);
        assert!(card_table.is_dirty(b.addr()), "dead object's card marked");
        assert!(!card_table.is_dirty(a.addr()));
        assert_eq!(zygote.objects_allocated(), 1);
        assert_eq!(zygote.bytes_allocated(), 8 * 1024);

        zygote.swap_bitmaps();
        assert!(zygote.live_bitmap().test(a));
        assert!(!zygote.live_bitmap().test(b));
    }
}

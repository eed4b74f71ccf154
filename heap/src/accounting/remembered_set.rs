use std::collections::BTreeSet;

use parking_lot::Mutex;

use crate::{
    accounting::{
        card_table::{CARD_DIRTY, CARD_SIZE, CardTable, age_card},
        mod_union_table::SlotVisitor,
        space_bitmap::SpaceBitmap,
        visit_all_slots,
    },
    object::{ObjectModel, ObjectRef},
    space::SpaceId,
};

/// Cards of a non-moving space that may hold references into the space
/// being evacuated.
///
/// Lets a generational semi-space collection skip tracing the non-moving
/// spaces: only objects on remembered cards are scanned.
#[derive(Debug)]
pub struct RememberedSet {
    name: String,
    space: SpaceId,
    begin: usize,
    end: usize,
    dirty_cards: Mutex<BTreeSet<usize>>,
}

impl RememberedSet {
    pub fn new(name: &str, space: SpaceId, begin: usize, end: usize) -> Self {
        Self {
            name: name.to_string(),
            space,
            begin,
            end,
            dirty_cards: Mutex::new(BTreeSet::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn space(&self) -> SpaceId {
        self.space
    }

    /// Moves the dirty cards of the space into the set, aging them in the
    /// card table.
    pub fn clear_cards(&self, card_table: &CardTable) {
        let mut dirty = self.dirty_cards.lock();
        card_table.modify_cards_atomic(self.begin, self.end, age_card, |card, old, _| {
            if old == CARD_DIRTY {
                dirty.insert(card);
            }
        });
    }

    /// Calls `visitor` for every slot on a remembered card that points into
    /// the target space. Cards left without such a slot are forgotten.
    pub fn update_and_mark_references(
        &self,
        in_target_space: &dyn Fn(ObjectRef) -> bool,
        live_bitmap: &SpaceBitmap,
        model: &dyn ObjectModel,
        visitor: &mut SlotVisitor<'_>,
    ) {
        let mut dirty = self.dirty_cards.lock();
        dirty.retain(|&card| {
            let mut contains_target_reference = false;
            let begin = card.max(self.begin);
            let end = (card + CARD_SIZE).min(self.end);
            live_bitmap.visit_marked_range(begin, end, |holder| {
                // SAFETY: live objects of a non-moving space are initialized
                unsafe {
                    visit_all_slots(model, holder, &mut |slot| {
                        if slot.load().is_some_and(in_target_space) {
                            contains_target_reference = true;
                            visitor(holder, slot);
                        }
                    });
                }
            });
            contains_target_reference
        });
    }

    pub fn contains_card(&self, addr: usize) -> bool {
        self.dirty_cards.lock().contains(&(addr - addr % CARD_SIZE))
    }

    pub fn len(&self) -> usize {
        self.dirty_cards.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dump(&self) -> String {
        format!("{}: {} remembered cards", self.name, self.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        memory_region::MemoryRegion,
        testing::{KIND_NORMAL, TestModel, init_class, init_object, object_size, ref_slot},
    };

    #[test]
    fn test_cards_without_target_references_are_dropped() {
        let region = MemoryRegion::map("remset test", 64 * 1024).expect("map");
        let begin = region.begin();
        let space_end = begin + 32 * 1024;
        let bitmap = SpaceBitmap::new("non moving live", begin, 32 * 1024);
        let cards = CardTable::new(begin, 64 * 1024);

        let meta = ObjectRef::from_addr(begin).expect("aligned");
        let holder = ObjectRef::from_addr(begin + 4096).expect("aligned");
        let target = ObjectRef::from_addr(space_end + 128).expect("aligned");
        unsafe {
            init_class(meta, meta, KIND_NORMAL);
            holder.set_class(meta);
            init_object(holder, object_size(1, 0), 1);
            target.set_class(meta);
            init_object(target, object_size(0, 0), 0);
            ref_slot(holder, 0).store(Some(target));
        }
        bitmap.set(meta);
        bitmap.set(holder);

        let remset = RememberedSet::new("remset", SpaceId(0), begin, space_end);
        cards.mark_card(holder.addr());
        remset.clear_cards(&cards);
        assert!(remset.contains_card(holder.addr()));
        assert!(!cards.is_dirty(holder.addr()));

        let in_target = |obj: ObjectRef| obj.addr() >= space_end;
        let mut visited = Vec::new();
        remset.update_and_mark_references(&in_target, &bitmap, &TestModel, &mut |h, slot| {
            visited.push((h, slot.load()))
        });
        assert_eq!(visited, vec![(holder, Some(target))]);
        assert_eq!(remset.len(), 1, "card still points into the target");

        unsafe { ref_slot(holder, 0).store(None) };
        remset.update_and_mark_references(&in_target, &bitmap, &TestModel, &mut |_, _| {});
        assert!(remset.is_empty(), "card forgotten once its references are gone");
    }
}

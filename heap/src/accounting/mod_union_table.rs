//! Summaries of references leaving an immune space (image or zygote).
//!
//! Collections that do not trace an immune space still need the references
//! it holds into collected spaces. Each cycle the table takes over the dirty
//! cards of its space ([`ModUnionTable::clear_cards`]), then reports every
//! outgoing reference found on those cards
//! ([`ModUnionTable::update_and_mark_references`]). Clearing a card never
//! loses information: the card either stays cached, or its references move
//! into the reference cache.

use std::collections::{BTreeMap, BTreeSet};

use parking_lot::Mutex;

use crate::{
    accounting::{
        card_table::{CARD_CLEAN, CARD_DIRTY, CARD_SIZE, CardTable, age_card},
        space_bitmap::SpaceBitmap,
        visit_all_slots,
    },
    object::{ObjectModel, ObjectRef, ObjectSlot},
    space::SpaceId,
};

/// Receives `(holder, slot)` for every cross-space reference.
pub type SlotVisitor<'a> = dyn FnMut(ObjectRef, ObjectSlot) + 'a;

#[derive(Debug)]
pub struct ModUnionTable {
    name: String,
    space: SpaceId,
    begin: usize,
    end: usize,
    kind: ModUnionKind,
    /// Cards cleared from the card table and not yet folded into the
    /// summary.
    cleared_cards: Mutex<BTreeSet<usize>>,
}

#[derive(Debug)]
pub enum ModUnionKind {
    /// Keeps cards, rescans their objects on every update.
    CardCache,
    /// Keeps the exact slots found on each card.
    ReferenceCache(Mutex<BTreeMap<usize, Vec<(ObjectRef, ObjectSlot)>>>),
}

impl ModUnionTable {
    pub fn card_cache(name: &str, space: SpaceId, begin: usize, end: usize) -> Self {
        Self::new(name, space, begin, end, ModUnionKind::CardCache)
    }

    pub fn reference_cache(name: &str, space: SpaceId, begin: usize, end: usize) -> Self {
        let kind = ModUnionKind::ReferenceCache(Mutex::new(BTreeMap::new()));
        Self::new(name, space, begin, end, kind)
    }

    fn new(name: &str, space: SpaceId, begin: usize, end: usize, kind: ModUnionKind) -> Self {
        Self {
            name: name.to_string(),
            space,
            begin,
            end,
            kind,
            cleared_cards: Mutex::new(BTreeSet::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn space(&self) -> SpaceId {
        self.space
    }

    #[inline(always)]
    fn is_cross_space(&self, target: ObjectRef) -> bool {
        target.addr() < self.begin || target.addr() >= self.end
    }

    /// Ages the space's cards and remembers the ones that were dirty.
    pub fn clear_cards(&self, card_table: &CardTable) {
        let mut cleared = self.cleared_cards.lock();
        card_table.modify_cards_atomic(self.begin, self.end, age_card, |card, old, _| {
            if old == CARD_DIRTY {
                cleared.insert(card);
            }
        });
    }

    /// Treats every card of the space as cleared. Used for a freshly created
    /// zygote space whose objects were never card marked.
    pub fn set_cards(&self) {
        let mut cleared = self.cleared_cards.lock();
        let mut card = self.begin - self.begin % CARD_SIZE;
        while card < self.end {
            cleared.insert(card);
            card += CARD_SIZE;
        }
    }

    /// Folds cleared cards into the summary and calls `visitor` for every
    /// non-null reference leaving the space.
    pub fn update_and_mark_references(
        &self,
        live_bitmap: &SpaceBitmap,
        model: &dyn ObjectModel,
        visitor: &mut SlotVisitor<'_>,
    ) {
        match &self.kind {
            ModUnionKind::CardCache => {
                let mut cleared = self.cleared_cards.lock();
                cleared.retain(|&card| {
                    let mut cross = false;
                    self.scan_card(live_bitmap, model, card, &mut |holder, slot| {
                        cross = true;
                        visitor(holder, slot);
                    });
                    // A card with nothing leaving the space needs no
                    // rescans until it is dirtied again.
                    cross
                });
            }
            ModUnionKind::ReferenceCache(references) => {
                let mut references = references.lock();
                let cleared = std::mem::take(&mut *self.cleared_cards.lock());
                for card in cleared {
                    let mut found = Vec::new();
                    self.scan_card(live_bitmap, model, card, &mut |holder, slot| {
                        found.push((holder, slot));
                    });
                    if found.is_empty() {
                        references.remove(&card);
                    } else {
                        references.insert(card, found);
                    }
                }
                for slots in references.values() {
                    for &(holder, slot) in slots {
                        if slot.load().is_some_and(|target| self.is_cross_space(target)) {
                            visitor(holder, slot);
                        }
                    }
                }
            }
        }
    }

    fn scan_card(
        &self,
        live_bitmap: &SpaceBitmap,
        model: &dyn ObjectModel,
        card: usize,
        visitor: &mut SlotVisitor<'_>,
    ) {
        let begin = card.max(self.begin);
        let end = (card + CARD_SIZE).min(self.end);
        live_bitmap.visit_marked_range(begin, end, |holder| {
            // SAFETY: objects in the live bitmap of an immune space are
            // initialized and never freed while the table exists
            unsafe {
                visit_all_slots(model, holder, &mut |slot| {
                    if slot.load().is_some_and(|target| self.is_cross_space(target)) {
                        visitor(holder, slot);
                    }
                });
            }
        });
    }

    /// Checks that every reference leaving the space is either on a dirty
    /// card, on a cleared card, or in the reference cache. Returns one
    /// message per violation.
    pub fn verify(
        &self,
        live_bitmap: &SpaceBitmap,
        model: &dyn ObjectModel,
        card_table: &CardTable,
    ) -> Vec<String> {
        let mut errors = Vec::new();
        let cleared = self.cleared_cards.lock();
        let cached: BTreeSet<usize> = match &self.kind {
            ModUnionKind::CardCache => BTreeSet::new(),
            ModUnionKind::ReferenceCache(references) => references
                .lock()
                .values()
                .flatten()
                .map(|(_, slot)| slot.addr())
                .collect(),
        };
        live_bitmap.visit_marked_range(self.begin, self.end, |holder| {
            let card = holder.addr() - holder.addr() % CARD_SIZE;
            if card_table.get_card(holder.addr()) != CARD_CLEAN || cleared.contains(&card) {
                return;
            }
            // SAFETY: see `scan_card`
            unsafe {
                visit_all_slots(model, holder, &mut |slot| {
                    if let Some(target) = slot.load()
                        && self.is_cross_space(target)
                        && !cached.contains(&slot.addr())
                    {
                        errors.push(format!(
                            "{}: {:?} references {:?} from a clean, untracked card",
                            self.name, holder, target
                        ));
                    }
                });
            }
        });
        errors
    }

    pub fn dump(&self) -> String {
        let cleared = self.cleared_cards.lock().len();
        match &self.kind {
            ModUnionKind::CardCache => {
                format!("{} card cache: {} cards", self.name, cleared)
            }
            ModUnionKind::ReferenceCache(references) => {
                let references = references.lock();
                let slots: usize = references.values().map(Vec::len).sum();
                format!(
                    "{} reference cache: {} cleared cards, {} cards with {} references",
                    self.name,
                    cleared,
                    references.len(),
                    slots
                )
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn cleared_card_count(&self) -> usize {
        self.cleared_cards.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        memory_region::MemoryRegion,
        testing::{KIND_NORMAL, TestModel, init_class, init_object, object_size, ref_slot},
    };

    struct Fixture {
        _region: MemoryRegion,
        bitmap: SpaceBitmap,
        cards: CardTable,
        immune_begin: usize,
        immune_end: usize,
        class: ObjectRef,
    }

    /// Two halves of one mapping: an immune space below, a collected one
    /// above. The metaclass and class live in the immune half.
    fn create_fixture() -> Fixture {
        let region = MemoryRegion::map("mod union test", 64 * 1024).expect("map");
        let begin = region.begin();
        let bitmap = SpaceBitmap::new("immune live", begin, 64 * 1024);
        let cards = CardTable::new(begin, 64 * 1024);
        let meta = ObjectRef::from_addr(begin).expect("aligned");
        let class = ObjectRef::from_addr(begin + 32).expect("aligned");
        unsafe {
            init_class(meta, meta, KIND_NORMAL);
            init_class(class, meta, KIND_NORMAL);
        }
        bitmap.set(meta);
        bitmap.set(class);
        Fixture {
            _region: region,
            bitmap,
            cards,
            immune_begin: begin,
            immune_end: begin + 32 * 1024,
            class,
        }
    }

    fn place(fixture: &Fixture, addr: usize, refs: usize) -> ObjectRef {
        let obj = ObjectRef::from_addr(addr).expect("aligned");
        unsafe {
            obj.set_class(fixture.class);
            init_object(obj, object_size(refs, 0), refs);
        }
        if addr < fixture.immune_end {
            fixture.bitmap.set(obj);
        }
        obj
    }

    fn collect(table: &ModUnionTable, fixture: &Fixture) -> Vec<ObjectRef> {
        let mut targets = Vec::new();
        table.update_and_mark_references(&fixture.bitmap, &TestModel, &mut |_, slot| {
            targets.extend(slot.load());
        });
        targets
    }

    #[test]
    fn test_card_cache_tracks_cross_space_writes() {
        let f = create_fixture();
        let table = ModUnionTable::card_cache("zygote", SpaceId(0), f.immune_begin, f.immune_end);
        let holder = place(&f, f.immune_begin + 1024, 2);
        let inner = place(&f, f.immune_begin + 2048, 0);
        let outside = place(&f, f.immune_end + 256, 0);
        unsafe {
            ref_slot(holder, 0).store(Some(outside));
            ref_slot(holder, 1).store(Some(inner));
        }
        f.cards.mark_card(holder.addr());

        table.clear_cards(&f.cards);
        assert!(!f.cards.is_dirty(holder.addr()), "card aged after clear");
        assert_eq!(collect(&table, &f), vec![outside], "only cross-space targets");
        assert_eq!(collect(&table, &f), vec![outside], "card stays cached");

        unsafe { ref_slot(holder, 0).store(None) };
        assert!(collect(&table, &f).is_empty());
        assert_eq!(table.cleared_card_count(), 0, "card without cross refs dropped");
    }

    #[test]
    fn test_reference_cache_keeps_slots_after_card_clear() {
        let f = create_fixture();
        let table =
            ModUnionTable::reference_cache("image", SpaceId(0), f.immune_begin, f.immune_end);
        let holder = place(&f, f.immune_begin + 4096, 1);
        let outside = place(&f, f.immune_end + 512, 0);
        unsafe { ref_slot(holder, 0).store(Some(outside)) };
        f.cards.mark_card(holder.addr());

        table.clear_cards(&f.cards);
        assert_eq!(collect(&table, &f), vec![outside]);
        // second cycle, the card is no longer dirty
        table.clear_cards(&f.cards);
        assert_eq!(table.cleared_card_count(), 0);
        assert_eq!(collect(&table, &f), vec![outside], "reference cached");
        assert!(table.verify(&f.bitmap, &TestModel, &f.cards).is_empty());
    }

    #[test]
    fn test_verify_reports_missing_card_mark() {
        let f = create_fixture();
        let table = ModUnionTable::card_cache("zygote", SpaceId(0), f.immune_begin, f.immune_end);
        let holder = place(&f, f.immune_begin + 8192, 1);
        let outside = place(&f, f.immune_end + 64, 0);
        unsafe { ref_slot(holder, 0).store(Some(outside)) };

        let errors = table.verify(&f.bitmap, &TestModel, &f.cards);
        assert_eq!(errors.len(), 1, "store without a card mark: {errors:?}");

        table.set_cards();
        assert!(table.verify(&f.bitmap, &TestModel, &f.cards).is_empty());
    }
}

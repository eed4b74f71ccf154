//! Byte-per-card write barrier table.
//!
//! A card covers [`CARD_SIZE`] bytes of the heap reservation. Mutators dirty
//! the card of every object they store a reference into. Collectors age
//! dirty cards (dirty → aged → clean) so sticky collections can tell fresh
//! writes from writes one cycle old.

use std::sync::atomic::{AtomicU8, Ordering};

use crate::{
    accounting::space_bitmap::SpaceBitmap,
    object::ObjectRef,
    system::{align_down, align_up},
};

pub const CARD_SHIFT: usize = 7;
pub const CARD_SIZE: usize = 1 << CARD_SHIFT;

pub const CARD_CLEAN: u8 = 0;
pub const CARD_DIRTY: u8 = 0x70;
pub const CARD_AGED: u8 = CARD_DIRTY - 1;

/// Dirty cards become aged, everything else becomes clean.
#[inline(always)]
pub fn age_card(value: u8) -> u8 {
    if value == CARD_DIRTY {
        CARD_AGED
    } else {
        CARD_CLEAN
    }
}

#[derive(Debug)]
pub struct CardTable {
    heap_begin: usize,
    heap_end: usize,
    cards: Box<[AtomicU8]>,
}

impl CardTable {
    pub fn new(heap_begin: usize, heap_capacity: usize) -> Self {
        let heap_begin = align_down(heap_begin, CARD_SIZE);
        let count = align_up(heap_capacity, CARD_SIZE) >> CARD_SHIFT;
        let mut cards = Vec::with_capacity(count);
        cards.resize_with(count, || AtomicU8::new(CARD_CLEAN));
        Self {
            heap_begin,
            heap_end: heap_begin + (count << CARD_SHIFT),
            cards: cards.into_boxed_slice(),
        }
    }

    #[inline(always)]
    pub fn covers(&self, addr: usize) -> bool {
        addr >= self.heap_begin && addr < self.heap_end
    }

    #[inline(always)]
    fn index(&self, addr: usize) -> Option<usize> {
        self.covers(addr)
            .then(|| (addr - self.heap_begin) >> CARD_SHIFT)
    }

    /// Address of the first byte a card index covers.
    #[inline(always)]
    pub fn addr_from_card(&self, index: usize) -> usize {
        self.heap_begin + (index << CARD_SHIFT)
    }

    /// Dirties the card covering `addr`. Addresses the table does not cover
    /// (large objects) are ignored.
    #[inline(always)]
    pub fn mark_card(&self, addr: usize) {
        if let Some(index) = self.index(addr) {
            self.cards[index].store(CARD_DIRTY, Ordering::Relaxed);
        }
    }

    #[inline(always)]
    pub fn get_card(&self, addr: usize) -> u8 {
        self.index(addr)
            .map_or(CARD_CLEAN, |i| self.cards[i].load(Ordering::Relaxed))
    }

    #[inline(always)]
    pub fn is_dirty(&self, addr: usize) -> bool {
        self.get_card(addr) == CARD_DIRTY
    }

    fn card_range(&self, begin: usize, end: usize) -> std::ops::Range<usize> {
        let begin = begin.clamp(self.heap_begin, self.heap_end);
        let end = align_up(end, CARD_SIZE).clamp(self.heap_begin, self.heap_end);
        if end <= begin {
            return 0..0;
        }
        ((begin - self.heap_begin) >> CARD_SHIFT)..((end - self.heap_begin) >> CARD_SHIFT)
    }

    /// Resets every card touching `[begin, end)` to clean.
    pub fn clear_card_range(&self, begin: usize, end: usize) {
        for index in self.card_range(begin, end) {
            self.cards[index].store(CARD_CLEAN, Ordering::Relaxed);
        }
    }

    pub fn clear_all(&self) {
        for card in self.cards.iter() {
            card.store(CARD_CLEAN, Ordering::Relaxed);
        }
    }

    /// Replaces every card in `[begin, end)` with `visitor(card)`.
    ///
    /// Each update is a compare-and-swap so a concurrent dirty mark is never
    /// lost: either it lands after the update, or the update retries on the
    /// dirty value. `modified(card_addr, old, new)` runs for every card whose
    /// value changed.
    pub fn modify_cards_atomic(
        &self,
        begin: usize,
        end: usize,
        visitor: impl Fn(u8) -> u8,
        mut modified: impl FnMut(usize, u8, u8),
    ) {
        for index in self.card_range(begin, end) {
            let card = &self.cards[index];
            let mut expected = card.load(Ordering::Relaxed);
            loop {
                let new_value = visitor(expected);
                if new_value == expected {
                    break;
                }
                match card.compare_exchange_weak(
                    expected,
                    new_value,
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        modified(self.addr_from_card(index), expected, new_value);
                        break;
                    }
                    Err(actual) => expected = actual,
                }
            }
        }
    }

    /// Visits marked objects of `bitmap` whose start lies on a card in
    /// `[begin, end)` holding at least `minimum_age`. Returns the number of
    /// cards scanned.
    pub fn scan(
        &self,
        bitmap: &SpaceBitmap,
        begin: usize,
        end: usize,
        minimum_age: u8,
        mut visitor: impl FnMut(ObjectRef),
    ) -> usize {
        let mut scanned = 0;
        let range = self.card_range(begin, end);
        let mut index = range.start;
        while index < range.end {
            if self.cards[index].load(Ordering::Relaxed) < minimum_age {
                index += 1;
                continue;
            }
            // Coalesce runs of qualifying cards into one bitmap walk.
            let run_start = index;
            while index < range.end
                && self.cards[index].load(Ordering::Relaxed) >= minimum_age
            {
                index += 1;
            }
            scanned += index - run_start;
            let walk_begin = self.addr_from_card(run_start).max(begin);
            let walk_end = self.addr_from_card(index).min(end);
            bitmap.visit_marked_range(walk_begin, walk_end, &mut visitor);
        }
        scanned
    }

    /// Calls `visitor` with the address of every card in `[begin, end)`
    /// holding at least `minimum_age`.
    pub fn visit_cards(
        &self,
        begin: usize,
        end: usize,
        minimum_age: u8,
        mut visitor: impl FnMut(usize),
    ) {
        for index in self.card_range(begin, end) {
            if self.cards[index].load(Ordering::Relaxed) >= minimum_age {
                visitor(self.addr_from_card(index));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> CardTable {
        CardTable::new(0x100_0000, 64 * 1024)
    }

    #[test]
    fn test_mark_and_clear_round_trip() {
        let cards = table();
        let holder = 0x100_0000 + 3 * CARD_SIZE + 24;
        cards.mark_card(holder);
        assert!(cards.is_dirty(holder));
        assert!(cards.is_dirty(0x100_0000 + 3 * CARD_SIZE), "same card");
        assert!(!cards.is_dirty(0x100_0000 + 4 * CARD_SIZE));

        cards.clear_card_range(holder, holder + 8);
        assert!(!cards.is_dirty(holder));
        cards.clear_card_range(holder, holder + 8);
        assert_eq!(cards.get_card(holder), CARD_CLEAN, "clear is idempotent");
    }

    #[test]
    fn test_out_of_range_marks_are_ignored() {
        let cards = table();
        cards.mark_card(0x10);
        cards.mark_card(0x200_0000);
        assert_eq!(cards.get_card(0x10), CARD_CLEAN);
    }

    #[test]
    fn test_aging() {
        let cards = table();
        let a = 0x100_0000;
        let b = 0x100_0000 + CARD_SIZE;
        cards.mark_card(a);
        cards.mark_card(b);

        let mut changes = Vec::new();
        cards.modify_cards_atomic(a, b, age_card, |addr, old, new| {
            changes.push((addr, old, new))
        });
        assert_eq!(changes, vec![(a, CARD_DIRTY, CARD_AGED)]);
        assert_eq!(cards.get_card(b), CARD_DIRTY, "end is exclusive");

        cards.modify_cards_atomic(a, b, age_card, |_, _, _| {});
        assert_eq!(cards.get_card(a), CARD_CLEAN, "aged cards become clean");
    }

    #[test]
    fn test_scan_visits_objects_on_dirty_cards() {
        let begin = 0x100_0000;
        let cards = table();
        let bitmap = SpaceBitmap::new("scan", begin, 64 * 1024);
        let on_dirty = ObjectRef::from_addr(begin + 2 * CARD_SIZE + 8).expect("aligned");
        let on_aged = ObjectRef::from_addr(begin + 5 * CARD_SIZE).expect("aligned");
        let on_clean = ObjectRef::from_addr(begin + 9 * CARD_SIZE).expect("aligned");
        for obj in [on_dirty, on_aged, on_clean] {
            bitmap.set(obj);
        }
        cards.mark_card(on_dirty.addr());
        cards.mark_card(on_aged.addr());
        cards.modify_cards_atomic(on_aged.addr(), on_aged.addr() + 8, age_card, |_, _, _| {});

        let mut dirty_only = Vec::new();
        cards.scan(&bitmap, begin, begin + 64 * 1024, CARD_DIRTY, |o| dirty_only.push(o));
        assert_eq!(dirty_only, vec![on_dirty]);

        let mut aged = Vec::new();
        let scanned =
            cards.scan(&bitmap, begin, begin + 64 * 1024, CARD_AGED, |o| aged.push(o));
        assert_eq!(aged, vec![on_dirty, on_aged]);
        assert_eq!(scanned, 2);
    }
}

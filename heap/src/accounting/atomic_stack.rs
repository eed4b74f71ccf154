use std::sync::atomic::{AtomicUsize, Ordering};

use crate::object::ObjectRef;

/// Fixed-capacity stack of objects with a lock-free push.
///
/// Backs the allocation stack (what mutators allocated since the last GC)
/// and the live stack (the allocation stack frozen at the start of a GC).
pub struct ObjectStack {
    name: String,
    entries: Box<[AtomicUsize]>,
    back: AtomicUsize,
}

impl ObjectStack {
    pub fn new(name: &str, capacity: usize) -> Self {
        let mut entries = Vec::with_capacity(capacity);
        entries.resize_with(capacity, || AtomicUsize::new(0));
        Self {
            name: name.to_string(),
            entries: entries.into_boxed_slice(),
            back: AtomicUsize::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    pub fn size(&self) -> usize {
        self.back.load(Ordering::Acquire).min(self.entries.len())
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Returns `false` when the stack is full.
    #[inline]
    pub fn atomic_push_back(&self, obj: ObjectRef) -> bool {
        let mut index = self.back.load(Ordering::Relaxed);
        loop {
            if index >= self.entries.len() {
                return false;
            }
            match self.back.compare_exchange_weak(
                index,
                index + 1,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(current) => index = current,
            }
        }
        self.entries[index].store(obj.addr(), Ordering::Release);
        true
    }

    pub fn pop_back(&self) -> Option<ObjectRef> {
        let index = self.back.load(Ordering::Acquire).checked_sub(1)?;
        self.back.store(index, Ordering::Release);
        ObjectRef::from_addr(self.entries[index].load(Ordering::Acquire))
    }

    /// Entries are read one at a time, a slot reserved by a racing push but
    /// not yet written reads as empty and is skipped.
    pub fn for_each(&self, mut visitor: impl FnMut(ObjectRef)) {
        self.for_each_from(0, &mut visitor);
    }

    pub fn for_each_from(&self, start: usize, mut visitor: impl FnMut(ObjectRef)) {
        let end = self.size();
        for entry in self.entries.get(start..end).unwrap_or_default() {
            if let Some(obj) = ObjectRef::from_addr(entry.load(Ordering::Acquire)) {
                visitor(obj);
            }
        }
    }

    pub fn to_vec(&self) -> Vec<ObjectRef> {
        let mut objects = Vec::with_capacity(self.size());
        self.for_each(|obj| objects.push(obj));
        objects
    }

    pub fn contains(&self, obj: ObjectRef) -> bool {
        let end = self.size();
        self.entries[..end]
            .iter()
            .any(|entry| entry.load(Ordering::Relaxed) == obj.addr())
    }

    /// Sorts entries so [`contains_sorted`](Self::contains_sorted) can binary
    /// search. Only valid while no pushes run.
    pub fn sort(&self) {
        let mut objects: Vec<usize> = self.entries[..self.size()]
            .iter()
            .map(|entry| entry.load(Ordering::Relaxed))
            .collect();
        objects.sort_unstable();
        for (entry, value) in self.entries.iter().zip(objects) {
            entry.store(value, Ordering::Relaxed);
        }
    }

    pub fn contains_sorted(&self, obj: ObjectRef) -> bool {
        let entries = &self.entries[..self.size()];
        entries
            .binary_search_by(|entry| entry.load(Ordering::Relaxed).cmp(&obj.addr()))
            .is_ok()
    }

    /// Empties the stack. Only valid while no pushes run.
    pub fn reset(&self) {
        let end = self.size();
        for entry in &self.entries[..end] {
            entry.store(0, Ordering::Relaxed);
        }
        self.back.store(0, Ordering::Release);
    }
}

impl std::fmt::Debug for ObjectStack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ObjectStack[{} {}/{}]", self.name, self.size(), self.capacity())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn obj(addr: usize) -> ObjectRef {
        ObjectRef::from_addr(addr).expect("aligned")
    }

    #[test]
    fn test_push_until_full() {
        let stack = ObjectStack::new("allocation stack", 4);
        for i in 1..=4 {
            assert!(stack.atomic_push_back(obj(i * 8)));
        }
        assert!(!stack.atomic_push_back(obj(40)), "stack is full");
        assert_eq!(stack.size(), 4);
        assert_eq!(stack.pop_back(), Some(obj(32)));
        assert!(stack.atomic_push_back(obj(48)));
        assert!(stack.contains(obj(48)));
        stack.reset();
        assert!(stack.is_empty());
        assert_eq!(stack.pop_back(), None);
    }

    #[test]
    fn test_sorted_lookup() {
        let stack = ObjectStack::new("live stack", 16);
        for addr in [64, 8, 128, 32] {
            stack.atomic_push_back(obj(addr));
        }
        stack.sort();
        assert_eq!(stack.to_vec(), vec![obj(8), obj(32), obj(64), obj(128)]);
        assert!(stack.contains_sorted(obj(64)));
        assert!(!stack.contains_sorted(obj(16)));
    }

    #[test]
    fn test_concurrent_pushes() {
        let stack = ObjectStack::new("allocation stack", 4000);
        std::thread::scope(|scope| {
            for t in 0..4 {
                let stack = &stack;
                scope.spawn(move || {
                    for i in 0..1000 {
                        assert!(stack.atomic_push_back(obj((t * 1000 + i + 1) * 8)));
                    }
                });
            }
        });
        let mut all = stack.to_vec();
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), 4000, "no push lost");
    }
}

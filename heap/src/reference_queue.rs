//! Soft, weak, finalizer and phantom reference processing.
//!
//! Collectors hand every reference object whose referent was not marked
//! when the reference was scanned to [`ReferenceProcessor::delay_reference_referent`].
//! Once marking is done, [`ReferenceProcessor::process_references`] decides
//! the fate of each referent and collects the cleared references for the
//! runtime.

use std::collections::HashSet;

use parking_lot::Mutex;

use crate::object::{ObjectModel, ObjectRef, ReferenceKind, Runtime};

/// Collector side of reference processing.
pub trait ReferenceMarker {
    /// The current address of `obj` if it is marked, `None` if it is white.
    fn is_marked(&mut self, obj: ObjectRef) -> Option<ObjectRef>;

    /// Marks `obj`, returning its current address.
    fn mark(&mut self, obj: ObjectRef) -> ObjectRef;

    /// Drains the mark stack filled by [`mark`](Self::mark).
    fn process_mark_stack(&mut self);
}

#[derive(Debug, Default)]
struct Queues {
    soft: Vec<ObjectRef>,
    weak: Vec<ObjectRef>,
    finalizer: Vec<ObjectRef>,
    phantom: Vec<ObjectRef>,
    /// References enqueued this cycle.
    seen: HashSet<ObjectRef>,
}

impl Queues {
    fn queue(&mut self, kind: ReferenceKind) -> &mut Vec<ObjectRef> {
        match kind {
            ReferenceKind::Soft => &mut self.soft,
            ReferenceKind::Weak => &mut self.weak,
            ReferenceKind::Finalizer => &mut self.finalizer,
            ReferenceKind::Phantom => &mut self.phantom,
        }
    }
}

/// Counts of one processing pass, for GC logging.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReferenceStats {
    pub soft_cleared: usize,
    pub weak_cleared: usize,
    pub finalizers_cleared: usize,
    pub phantom_cleared: usize,
}

#[derive(Debug, Default)]
pub struct ReferenceProcessor {
    queues: Mutex<Queues>,
    cleared: Mutex<Vec<ObjectRef>>,
}

impl ReferenceProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues `reference` for processing. Each reference is queued at most
    /// once per cycle.
    pub fn delay_reference_referent(&self, kind: ReferenceKind, reference: ObjectRef) {
        let mut queues = self.queues.lock();
        if queues.seen.insert(reference) {
            queues.queue(kind).push(reference);
        }
    }

    pub fn pending(&self) -> usize {
        let queues = self.queues.lock();
        queues.soft.len() + queues.weak.len() + queues.finalizer.len() + queues.phantom.len()
    }

    pub fn cleared_len(&self) -> usize {
        self.cleared.lock().len()
    }

    fn take(&self, kind: ReferenceKind) -> Vec<ObjectRef> {
        std::mem::take(self.queues.lock().queue(kind))
    }

    /// Resolves every queued reference against the final marking.
    ///
    /// # Safety
    ///
    /// Every queued reference must be a live, initialized reference object.
    pub unsafe fn process_references(
        &self,
        model: &dyn ObjectModel,
        clear_soft: bool,
        marker: &mut dyn ReferenceMarker,
    ) -> ReferenceStats {
        let mut stats = ReferenceStats::default();
        if !clear_soft {
            // SAFETY: guaranteed by the caller
            unsafe { self.preserve_soft_references(model, marker) };
        }
        // SAFETY: guaranteed by the caller, for this and the passes below
        unsafe {
            stats.soft_cleared += self.clear_white_references(model, ReferenceKind::Soft, marker);
            stats.weak_cleared += self.clear_white_references(model, ReferenceKind::Weak, marker);
            // referents kept alive for finalization may reach more
            // references, finalizer ones included
            loop {
                stats.finalizers_cleared += self.enqueue_finalizer_references(model, marker);
                if self.queues.lock().finalizer.is_empty() {
                    break;
                }
            }
            stats.soft_cleared += self.clear_white_references(model, ReferenceKind::Soft, marker);
            stats.weak_cleared += self.clear_white_references(model, ReferenceKind::Weak, marker);
            stats.phantom_cleared +=
                self.clear_white_references(model, ReferenceKind::Phantom, marker);
        }
        debug_assert_eq!(self.pending(), 0, "references left after processing");
        self.queues.lock().seen.clear();
        log::trace!(target: "gc", "reference processing: {stats:?}");
        stats
    }

    unsafe fn preserve_soft_references(
        &self,
        model: &dyn ObjectModel,
        marker: &mut dyn ReferenceMarker,
    ) {
        for reference in self.soft_snapshot() {
            // SAFETY: guaranteed by the caller
            let slot = unsafe { model.referent_slot(reference) };
            if let Some(referent) = slot.load()
                && marker.is_marked(referent).is_none()
            {
                slot.store(Some(marker.mark(referent)));
            }
        }
        marker.process_mark_stack();
    }

    fn soft_snapshot(&self) -> Vec<ObjectRef> {
        self.queues.lock().soft.clone()
    }

    /// Clears references of `kind` whose referents are white, updates the
    /// others to their referent's current address.
    unsafe fn clear_white_references(
        &self,
        model: &dyn ObjectModel,
        kind: ReferenceKind,
        marker: &mut dyn ReferenceMarker,
    ) -> usize {
        let mut cleared = 0;
        for reference in self.take(kind) {
            // SAFETY: guaranteed by the caller
            let slot = unsafe { model.referent_slot(reference) };
            let Some(referent) = slot.load() else {
                continue;
            };
            match marker.is_marked(referent) {
                Some(current) => {
                    if current != referent {
                        slot.store(Some(current));
                    }
                }
                None => {
                    slot.store(None);
                    cleared += 1;
                    // SAFETY: guaranteed by the caller
                    if unsafe { model.is_enqueuable(reference) } {
                        self.cleared.lock().push(reference);
                    }
                }
            }
        }
        cleared
    }

    /// Keeps white referents of finalizer references alive in their zombie
    /// field and moves the references to the cleared list.
    unsafe fn enqueue_finalizer_references(
        &self,
        model: &dyn ObjectModel,
        marker: &mut dyn ReferenceMarker,
    ) -> usize {
        let mut cleared = 0;
        for reference in self.take(ReferenceKind::Finalizer) {
            // SAFETY: guaranteed by the caller
            let slot = unsafe { model.referent_slot(reference) };
            let Some(referent) = slot.load() else {
                continue;
            };
            if let Some(current) = marker.is_marked(referent) {
                if current != referent {
                    slot.store(Some(current));
                }
                continue;
            }
            let kept = marker.mark(referent);
            // SAFETY: guaranteed by the caller
            if let Some(zombie) = unsafe { model.zombie_slot(reference) } {
                zombie.store(Some(kept));
            }
            slot.store(None);
            cleared += 1;
            self.cleared.lock().push(reference);
        }
        marker.process_mark_stack();
        cleared
    }

    /// Rewrites cleared references that were moved after they were
    /// cleared.
    pub fn update_cleared(&self, mut forward: impl FnMut(ObjectRef) -> ObjectRef) {
        for reference in self.cleared.lock().iter_mut() {
            *reference = forward(*reference);
        }
    }

    /// Hands the cleared references to the runtime, dropping them if it
    /// has not started yet.
    pub fn enqueue_cleared_references(&self, runtime: &dyn Runtime) -> usize {
        let cleared = std::mem::take(&mut *self.cleared.lock());
        let count = cleared.len();
        if count == 0 {
            return 0;
        }
        if runtime.is_started() {
            runtime.enqueue_cleared_references(cleared);
        } else {
            log::debug!(target: "gc", "dropping {count} cleared references, runtime not started");
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        object::ObjectSlot,
        testing::{
            KIND_FINALIZER, KIND_NORMAL, KIND_PHANTOM, KIND_SOFT, KIND_WEAK, TestModel,
            TestRuntime, init_class, init_object, object_size, ref_slot,
        },
    };

    /// Marks through a set and scans references eagerly.
    struct SetMarker {
        marked: HashSet<ObjectRef>,
        stack: Vec<ObjectRef>,
    }

    impl ReferenceMarker for SetMarker {
        fn is_marked(&mut self, obj: ObjectRef) -> Option<ObjectRef> {
            self.marked.contains(&obj).then_some(obj)
        }

        fn mark(&mut self, obj: ObjectRef) -> ObjectRef {
            if self.marked.insert(obj) {
                self.stack.push(obj);
            }
            obj
        }

        fn process_mark_stack(&mut self) {
            while let Some(obj) = self.stack.pop() {
                let mut children = Vec::new();
                unsafe {
                    TestModel.visit_references(obj, &mut |slot: ObjectSlot| {
                        if let Some(child) = slot.load() {
                            children.push(child);
                        }
                    })
                };
                for child in children {
                    self.mark(child);
                }
            }
        }
    }

    struct Arena {
        words: Vec<u64>,
        used: usize,
    }

    impl Arena {
        fn new() -> Self {
            Self { words: vec![0; 1024], used: 0 }
        }

        fn alloc(&mut self, class: Option<ObjectRef>, refs: usize) -> ObjectRef {
            let size = object_size(refs, 0);
            let obj = ObjectRef::from_addr(self.words.as_mut_ptr() as usize + self.used)
                .expect("aligned");
            self.used += size;
            unsafe {
                if let Some(class) = class {
                    obj.set_class(class);
                }
                init_object(obj, size, refs);
            }
            obj
        }

        fn class(&mut self, meta: ObjectRef, kind: usize) -> ObjectRef {
            let class = self.alloc(None, 0);
            self.used += 8;
            unsafe { init_class(class, meta, kind) };
            class
        }
    }

    #[test]
    fn test_weak_referent_cleared_once() {
        let mut arena = Arena::new();
        let meta = arena.alloc(None, 0);
        arena.used += 8;
        unsafe { init_class(meta, meta, KIND_NORMAL) };
        let normal = arena.class(meta, KIND_NORMAL);
        let weak_class = arena.class(meta, KIND_WEAK);
        let referent = arena.alloc(Some(normal), 0);
        let weak = arena.alloc(Some(weak_class), 1);
        unsafe { ref_slot(weak, 0).store(Some(referent)) };

        let processor = ReferenceProcessor::new();
        processor.delay_reference_referent(ReferenceKind::Weak, weak);
        processor.delay_reference_referent(ReferenceKind::Weak, weak);
        assert_eq!(processor.pending(), 1, "queued once per cycle");

        let mut marker = SetMarker { marked: HashSet::from([weak]), stack: Vec::new() };
        let stats = unsafe { processor.process_references(&TestModel, true, &mut marker) };
        assert_eq!(stats.weak_cleared, 1);
        assert_eq!(unsafe { ref_slot(weak, 0).load() }, None);
        assert_eq!(processor.pending(), 0, "all queues drained");

        let runtime = TestRuntime::new();
        assert_eq!(processor.enqueue_cleared_references(&runtime), 1);
        assert_eq!(*runtime.cleared.lock(), vec![weak]);
    }

    #[test]
    fn test_soft_preserved_unless_clearing() {
        let mut arena = Arena::new();
        let meta = arena.alloc(None, 0);
        arena.used += 8;
        unsafe { init_class(meta, meta, KIND_NORMAL) };
        let normal = arena.class(meta, KIND_NORMAL);
        let soft_class = arena.class(meta, KIND_SOFT);
        let referent = arena.alloc(Some(normal), 0);
        let soft = arena.alloc(Some(soft_class), 1);
        unsafe { ref_slot(soft, 0).store(Some(referent)) };

        let processor = ReferenceProcessor::new();
        processor.delay_reference_referent(ReferenceKind::Soft, soft);
        let mut marker = SetMarker { marked: HashSet::new(), stack: Vec::new() };
        let stats = unsafe { processor.process_references(&TestModel, false, &mut marker) };
        assert_eq!(stats.soft_cleared, 0);
        assert!(marker.marked.contains(&referent), "soft referent preserved");
        assert_eq!(unsafe { ref_slot(soft, 0).load() }, Some(referent));

        processor.delay_reference_referent(ReferenceKind::Soft, soft);
        let mut marker = SetMarker { marked: HashSet::new(), stack: Vec::new() };
        let stats = unsafe { processor.process_references(&TestModel, true, &mut marker) };
        assert_eq!(stats.soft_cleared, 1);
        assert_eq!(unsafe { ref_slot(soft, 0).load() }, None);
    }

    #[test]
    fn test_finalizer_keeps_referent_and_clears_weak_to_it_later() {
        let mut arena = Arena::new();
        let meta = arena.alloc(None, 0);
        arena.used += 8;
        unsafe { init_class(meta, meta, KIND_NORMAL) };
        let normal = arena.class(meta, KIND_NORMAL);
        let finalizer_class = arena.class(meta, KIND_FINALIZER);
        let phantom_class = arena.class(meta, KIND_PHANTOM);
        let referent = arena.alloc(Some(normal), 1);
        let child = arena.alloc(Some(normal), 0);
        unsafe { ref_slot(referent, 0).store(Some(child)) };
        let finalizer = arena.alloc(Some(finalizer_class), 2);
        unsafe { ref_slot(finalizer, 0).store(Some(referent)) };
        let phantom = arena.alloc(Some(phantom_class), 1);
        unsafe { ref_slot(phantom, 0).store(Some(child)) };

        let processor = ReferenceProcessor::new();
        processor.delay_reference_referent(ReferenceKind::Finalizer, finalizer);
        processor.delay_reference_referent(ReferenceKind::Phantom, phantom);
        let mut marker = SetMarker { marked: HashSet::new(), stack: Vec::new() };
        let stats = unsafe { processor.process_references(&TestModel, true, &mut marker) };

        assert_eq!(stats.finalizers_cleared, 1);
        assert_eq!(stats.phantom_cleared, 0, "child reachable from the zombie");
        assert_eq!(unsafe { ref_slot(finalizer, 0).load() }, None);
        assert_eq!(unsafe { ref_slot(finalizer, 1).load() }, Some(referent), "zombie");
        assert!(marker.marked.contains(&child));
        assert_eq!(unsafe { ref_slot(phantom, 0).load() }, Some(child));
        assert_eq!(processor.cleared_len(), 1);
    }
}

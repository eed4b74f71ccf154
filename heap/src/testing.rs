//! Object model and runtime used by the unit tests and the stress binary.
//!
//! Layout of every test object, in words:
//! `[class, size in bytes, reference count, references...]`.
//! Class objects are instances of a metaclass and keep the kind of their
//! instances in word 3. Reference instances keep the referent in their
//! first reference slot and, for finalizer references, the zombie in the
//! second.

use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use crate::{
    object::{ObjectModel, ObjectRef, ObjectSlot, ReferenceKind, Runtime},
    system::align_up,
};

pub const HEADER_WORDS: usize = 3;
pub const CLASS_SIZE: usize = 32;

pub const KIND_NORMAL: usize = 0;
pub const KIND_SOFT: usize = 1;
pub const KIND_WEAK: usize = 2;
pub const KIND_FINALIZER: usize = 3;
pub const KIND_PHANTOM: usize = 4;
pub const KIND_PRIMITIVE_ARRAY: usize = 5;

pub fn object_size(refs: usize, payload: usize) -> usize {
    (HEADER_WORDS + refs) * 8 + align_up(payload, 8)
}

/// # Safety
/// `obj` must point at `size` writable bytes.
pub unsafe fn init_object(obj: ObjectRef, size: usize, refs: usize) {
    unsafe {
        obj.slot_at(8).store_raw(size);
        obj.slot_at(16).store_raw(refs);
    }
}

/// # Safety
/// `class` must point at `CLASS_SIZE` writable bytes.
pub unsafe fn init_class(class: ObjectRef, metaclass: ObjectRef, kind: usize) {
    unsafe {
        class.set_class(metaclass);
        init_object(class, CLASS_SIZE, 0);
        class.slot_at(24).store_raw(kind);
    }
}

/// # Safety
/// `obj` must be a test object with more than `index` references.
pub unsafe fn ref_slot(obj: ObjectRef, index: usize) -> ObjectSlot {
    unsafe { obj.slot_at((HEADER_WORDS + index) * 8) }
}

unsafe fn word(obj: ObjectRef, index: usize) -> usize {
    unsafe { obj.slot_at(index * 8) }.load_raw()
}

unsafe fn instance_kind(obj: ObjectRef) -> usize {
    unsafe {
        match obj.class() {
            Some(class) => word(class, 3),
            None => KIND_NORMAL,
        }
    }
}

#[derive(Debug, Default)]
pub struct TestModel;

impl ObjectModel for TestModel {
    unsafe fn size_of(&self, obj: ObjectRef) -> usize {
        unsafe { word(obj, 1) }
    }

    unsafe fn visit_references(&self, obj: ObjectRef, visitor: &mut dyn FnMut(ObjectSlot)) {
        unsafe {
            let refs = word(obj, 2);
            let first = if self.reference_kind(obj).is_some() { 1 } else { 0 };
            for index in first..refs {
                visitor(ref_slot(obj, index));
            }
        }
    }

    unsafe fn reference_kind(&self, obj: ObjectRef) -> Option<ReferenceKind> {
        match unsafe { instance_kind(obj) } {
            KIND_SOFT => Some(ReferenceKind::Soft),
            KIND_WEAK => Some(ReferenceKind::Weak),
            KIND_FINALIZER => Some(ReferenceKind::Finalizer),
            KIND_PHANTOM => Some(ReferenceKind::Phantom),
            _ => None,
        }
    }

    unsafe fn referent_slot(&self, reference: ObjectRef) -> ObjectSlot {
        unsafe { ref_slot(reference, 0) }
    }

    unsafe fn zombie_slot(&self, reference: ObjectRef) -> Option<ObjectSlot> {
        unsafe {
            (instance_kind(reference) == KIND_FINALIZER && word(reference, 2) > 1)
                .then(|| ref_slot(reference, 1))
        }
    }

    unsafe fn is_card_table_exempt(&self, class: ObjectRef) -> bool {
        unsafe { word(class, 3) == KIND_PRIMITIVE_ARRAY }
    }
}

/// Root provider for tests. Roots are plain vectors behind a lock.
#[derive(Debug, Default)]
pub struct TestRuntime {
    pub roots: Mutex<Vec<ObjectRef>>,
    pub cleared: Mutex<Vec<ObjectRef>>,
    pub finalization_requests: Mutex<usize>,
    pub not_started: AtomicBool,
}

impl TestRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, obj: ObjectRef) -> usize {
        let mut roots = self.roots.lock();
        roots.push(obj);
        roots.len() - 1
    }

    pub fn root(&self, index: usize) -> ObjectRef {
        self.roots.lock()[index]
    }

    pub fn clear(&self) {
        self.roots.lock().clear();
    }
}

impl Runtime for TestRuntime {
    fn visit_roots(&self, visitor: &mut dyn FnMut(&mut ObjectRef)) {
        for root in self.roots.lock().iter_mut() {
            visitor(root);
        }
    }

    fn enqueue_cleared_references(&self, references: Vec<ObjectRef>) {
        self.cleared.lock().extend(references);
    }

    fn run_finalization(&self) {
        *self.finalization_requests.lock() += 1;
    }

    fn is_started(&self) -> bool {
        !self.not_started.load(Ordering::Relaxed)
    }
}

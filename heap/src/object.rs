//! The heap's view of managed objects.
//!
//! The heap does not know object layouts. It only assumes that every object
//! is 8-byte aligned and starts with its class pointer. Everything else comes
//! from the embedder through [`ObjectModel`] and [`Runtime`].

use std::{
    fmt,
    num::NonZeroUsize,
    ptr::NonNull,
    sync::atomic::{AtomicUsize, Ordering},
};

pub const OBJECT_ALIGNMENT: usize = 8;

/// Word size of the class slot every object starts with.
pub const CLASS_SLOT_SIZE: usize = size_of::<usize>();

// ── ObjectRef ─────────────────────────────────────────────────────────

/// Address of a managed object.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectRef(NonZeroUsize);

impl ObjectRef {
    #[inline(always)]
    pub fn from_addr(addr: usize) -> Option<Self> {
        if !addr.is_multiple_of(OBJECT_ALIGNMENT) {
            return None;
        }
        NonZeroUsize::new(addr).map(Self)
    }

    /// # Safety
    ///
    /// `addr` must be non-zero and aligned.
    #[inline(always)]
    pub unsafe fn from_addr_unchecked(addr: usize) -> Self {
        debug_assert!(addr != 0 && addr.is_multiple_of(OBJECT_ALIGNMENT));
        // SAFETY: guaranteed by the caller
        Self(unsafe { NonZeroUsize::new_unchecked(addr) })
    }

    #[inline(always)]
    pub fn addr(self) -> usize {
        self.0.get()
    }

    /// The class slot at offset zero.
    ///
    /// # Safety
    ///
    /// `self` must point at mapped heap memory.
    #[inline(always)]
    pub unsafe fn class_slot(self) -> ObjectSlot {
        // SAFETY: every object starts with an aligned class word
        unsafe { ObjectSlot::from_addr(self.addr()) }
    }

    /// # Safety
    ///
    /// `self` must point at mapped heap memory.
    #[inline(always)]
    pub unsafe fn class(self) -> Option<ObjectRef> {
        // SAFETY: guaranteed by the caller
        unsafe { self.class_slot() }.load()
    }

    /// # Safety
    ///
    /// `self` must point at mapped heap memory.
    #[inline(always)]
    pub unsafe fn set_class(self, class: ObjectRef) {
        // SAFETY: guaranteed by the caller
        unsafe { self.class_slot() }.store(Some(class));
    }

    /// Slot at `offset` bytes into the object.
    ///
    /// # Safety
    ///
    /// The object must be at least `offset + 8` bytes long.
    #[inline(always)]
    pub unsafe fn slot_at(self, offset: usize) -> ObjectSlot {
        // SAFETY: guaranteed by the caller
        unsafe { ObjectSlot::from_addr(self.addr() + offset) }
    }
}

impl fmt::Debug for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectRef({:#x})", self.addr())
    }
}

impl fmt::Pointer for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.addr())
    }
}

// ── ObjectSlot ────────────────────────────────────────────────────────

/// A reference-typed field inside an object (or the class word).
///
/// Loads and stores are atomic so collectors may read fields while
/// mutators write them.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct ObjectSlot(NonNull<AtomicUsize>);

// SAFETY: slots are atomic words
unsafe impl Send for ObjectSlot {}
// SAFETY: slots are atomic words
unsafe impl Sync for ObjectSlot {}

impl ObjectSlot {
    /// # Safety
    ///
    /// `addr` must be an aligned word inside mapped memory that stays mapped
    /// as long as the slot is used.
    #[inline(always)]
    pub unsafe fn from_addr(addr: usize) -> Self {
        debug_assert!(addr != 0 && addr.is_multiple_of(OBJECT_ALIGNMENT));
        // SAFETY: guaranteed by the caller
        Self(unsafe { NonNull::new_unchecked(addr as *mut AtomicUsize) })
    }

    #[inline(always)]
    pub fn addr(self) -> usize {
        self.0.as_ptr() as usize
    }

    #[inline(always)]
    pub fn load(self) -> Option<ObjectRef> {
        // SAFETY: slots always point at live atomic words
        let raw = unsafe { self.0.as_ref() }.load(Ordering::Acquire);
        NonZeroUsize::new(raw).map(ObjectRef)
    }

    #[inline(always)]
    pub fn store(self, value: Option<ObjectRef>) {
        let raw = value.map_or(0, ObjectRef::addr);
        // SAFETY: slots always point at live atomic words
        unsafe { self.0.as_ref() }.store(raw, Ordering::Release);
    }

    /// The slot word as a plain integer, for embedders storing non
    /// reference data in object words.
    #[inline(always)]
    pub fn load_raw(self) -> usize {
        // SAFETY: slots always point at live atomic words
        unsafe { self.0.as_ref() }.load(Ordering::Relaxed)
    }

    #[inline(always)]
    pub fn store_raw(self, value: usize) {
        // SAFETY: slots always point at live atomic words
        unsafe { self.0.as_ref() }.store(value, Ordering::Relaxed);
    }
}

impl fmt::Debug for ObjectSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectSlot({:#x} -> {:?})", self.addr(), self.load())
    }
}

// ── Embedder interface ────────────────────────────────────────────────

/// Strength of a `java.lang.ref.Reference`-like object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReferenceKind {
    Soft,
    Weak,
    Finalizer,
    Phantom,
}

/// Object layout knowledge supplied by the embedder.
///
/// # Safety
///
/// All methods taking objects require `obj` to be an initialized object in
/// mapped heap memory, with a class that is still readable.
pub trait ObjectModel: Send + Sync {
    /// Size of the object in bytes, including its class word.
    unsafe fn size_of(&self, obj: ObjectRef) -> usize;

    /// Calls `visitor` for every reference field of `obj` except its class
    /// word and, for reference objects, the referent.
    unsafe fn visit_references(
        &self,
        obj: ObjectRef,
        visitor: &mut dyn FnMut(ObjectSlot),
    );

    /// `Some` if `obj` is a reference object.
    unsafe fn reference_kind(&self, obj: ObjectRef) -> Option<ReferenceKind>;

    /// The referent field of a reference object.
    unsafe fn referent_slot(&self, reference: ObjectRef) -> ObjectSlot;

    /// Field a finalizer reference keeps its cleared referent alive in.
    unsafe fn zombie_slot(&self, _reference: ObjectRef) -> Option<ObjectSlot> {
        None
    }

    /// Whether the reference still has to be handed to the runtime once
    /// cleared.
    unsafe fn is_enqueuable(&self, _reference: ObjectRef) -> bool {
        true
    }

    /// Instances of card table exempt classes hold no references worth a
    /// card mark (primitive arrays, strings). Only these may be placed in
    /// the large object space.
    unsafe fn is_card_table_exempt(&self, class: ObjectRef) -> bool;

    /// Whether instances of `other` are instances of `class`.
    unsafe fn is_assignable_from(&self, class: ObjectRef, other: ObjectRef) -> bool {
        class == other
    }
}

/// Root set and reference delivery supplied by the embedder.
pub trait Runtime: Send + Sync {
    /// Calls `visitor` for every root. Roots may be updated in place when
    /// objects move.
    fn visit_roots(&self, visitor: &mut dyn FnMut(&mut ObjectRef));

    /// Receives references cleared by the last collection.
    fn enqueue_cleared_references(&self, _references: Vec<ObjectRef>) {}

    /// Asks the runtime to run pending finalizers.
    fn run_finalization(&self) {}

    /// Cleared references are dropped until the runtime is started.
    fn is_started(&self) -> bool {
        true
    }
}

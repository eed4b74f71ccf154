//! Side structures that track liveness and cross-space references.

pub mod atomic_stack;
pub mod card_table;
pub mod heap_bitmap;
pub mod mod_union_table;
pub mod remembered_set;
pub mod space_bitmap;

pub use atomic_stack::ObjectStack;
pub use card_table::CardTable;
pub use heap_bitmap::HeapBitmap;
pub use mod_union_table::ModUnionTable;
pub use remembered_set::RememberedSet;
pub use space_bitmap::{ObjectSet, SpaceBitmap};

use crate::object::{ObjectModel, ObjectRef, ObjectSlot};

/// Visits the class slot and every reference field of `obj`. The referent
/// of a reference object is included, cross-space summaries treat it as a
/// strong edge.
///
/// # Safety
///
/// `obj` must be a live, initialized object.
pub(crate) unsafe fn visit_all_slots(
    model: &dyn ObjectModel,
    obj: ObjectRef,
    visitor: &mut dyn FnMut(ObjectSlot),
) {
    // SAFETY: guaranteed by the caller
    unsafe {
        visitor(obj.class_slot());
        model.visit_references(obj, visitor);
        if model.reference_kind(obj).is_some() {
            visitor(model.referent_slot(obj));
        }
    }
}

//! A managed heap with mark-sweep and semi-space collectors.
//!
//! The embedder describes its objects through [`ObjectModel`] and its roots
//! through [`Runtime`], then allocates through one [`Mutator`] per thread.

pub mod accounting;
pub mod collector;
pub mod error;
mod heap;
pub mod logger;
pub mod memory_region;
pub mod mutator;
pub mod object;
pub mod reference_queue;
pub mod settings;
pub mod space;
mod system;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod thread_list;
mod worker_pool;

pub use collector::{CollectorType, GcCause, GcType};
pub use error::{HeapError, OutOfMemoryError};
pub use heap::{
    AllocatorType, Heap, HeapDaemon, HeapInner, MovingGcDisabled, ProcessState,
};
pub use mutator::Mutator;
pub use object::{ObjectModel, ObjectRef, ObjectSlot, ReferenceKind, Runtime};
pub use settings::{HeapSettings, VerifyFlags};
pub use system::OS_PAGE_SIZE;

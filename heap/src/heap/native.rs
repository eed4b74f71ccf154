//! Accounting for native memory kept alive by managed objects.
//!
//! Crossing the GC watermark starts a collection (concurrent when the
//! collector allows it); crossing the limit collects synchronously and runs
//! finalizers, which are expected to release native memory.

use std::sync::atomic::{AtomicUsize, Ordering};

use crate::{
    collector::{GcCause, GcType},
    error::HeapError,
};

use super::HeapInner;

#[derive(Debug)]
pub(crate) struct NativeAccounting {
    pub bytes_allocated: AtomicUsize,
    pub gc_watermark: AtomicUsize,
    pub limit: AtomicUsize,
}

impl NativeAccounting {
    pub fn new(initial_size: usize) -> Self {
        Self {
            bytes_allocated: AtomicUsize::new(0),
            gc_watermark: AtomicUsize::new(initial_size),
            limit: AtomicUsize::new(initial_size * 2),
        }
    }
}

impl HeapInner {
    pub fn native_bytes_allocated(&self) -> usize {
        self.native.bytes_allocated.load(Ordering::Relaxed)
    }

    /// Registers `bytes` of native memory. May collect and run finalizers,
    /// so it must not be called by a mutator holding its guard.
    pub fn register_native_allocation(&self, bytes: usize) {
        let run_finalization = std::mem::take(&mut self.policy.lock().native_need_to_run_finalization);
        if run_finalization {
            self.runtime.run_finalization();
            self.update_max_native_footprint();
        }
        let new_native_bytes = self.native.bytes_allocated.fetch_add(bytes, Ordering::SeqCst) + bytes;
        if new_native_bytes <= self.native.gc_watermark.load(Ordering::Relaxed) {
            return;
        }
        let gc_type = if self.have_zygote_space() {
            GcType::Partial
        } else {
            GcType::Full
        };
        if new_native_bytes > self.native.limit.load(Ordering::Relaxed) {
            log::debug!(
                target: "heap",
                "{new_native_bytes} native bytes are over the limit, collecting"
            );
            if self.wait_for_gc_to_complete(GcCause::NativeAlloc) != GcType::None {
                // a collection just finished, its finalizers may free enough
                self.runtime.run_finalization();
            }
            if self.native_bytes_allocated() > self.native.limit.load(Ordering::Relaxed) {
                self.collect_garbage_internal(gc_type, GcCause::NativeAlloc, false);
                self.runtime.run_finalization();
                self.policy.lock().native_need_to_run_finalization = false;
            }
            self.update_max_native_footprint();
        } else if !self.tasks.lock().concurrent_gc_pending {
            if self.collector_type().is_concurrent() {
                self.request_concurrent_gc();
            } else {
                self.collect_garbage_internal(gc_type, GcCause::NativeAlloc, false);
            }
        }
    }

    /// Unregisters `bytes` of native memory. Freeing more than is
    /// registered leaves the count untouched.
    pub fn register_native_free(&self, bytes: usize) -> Result<(), HeapError> {
        self.native
            .bytes_allocated
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |registered| {
                registered.checked_sub(bytes)
            })
            .map(|_| ())
            .map_err(|registered| HeapError::NativeFreeUnderflow {
                freed: bytes,
                registered,
            })
    }

    /// Moves both watermarks relative to the native bytes allocated right
    /// now, the same way the managed footprint follows utilization.
    pub(crate) fn update_max_native_footprint(&self) {
        let native_size = self.native_bytes_allocated();
        let (min_free, max_free, utilization) = {
            let policy = self.policy.lock();
            (policy.min_free, policy.max_free, policy.target_utilization)
        };
        let target = ((native_size as f64 / utilization) as usize)
            .clamp(native_size + min_free, native_size + max_free);
        self.native
            .gc_watermark
            .store(target.min(self.growth_limit()), Ordering::Relaxed);
        self.native
            .limit
            .store(2 * target - native_size, Ordering::Relaxed);
    }
}

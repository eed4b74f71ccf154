//! Heap sizing after a collection.
//!
//! The footprint grows towards `bytes_allocated / target_utilization`,
//! clamped to `[min_free, max_free]` of headroom. Sticky collections only
//! shrink the footprint and decide whether the next collection stays
//! sticky.

use std::{sync::atomic::Ordering, time::Instant};

use crate::{
    collector::{GcType, Iteration},
    settings::HeapSettings,
};

use super::{HeapInner, transition::ProcessState};

/// Concurrent collections start at least this many bytes before the
/// footprint limit.
pub const MIN_CONCURRENT_REMAINING_BYTES: usize = 128 * 1024;
pub const MAX_CONCURRENT_REMAINING_BYTES: usize = 512 * 1024;

/// Decisions carried from one collection to the next. Guarded by
/// `HeapInner::policy`.
#[derive(Debug)]
pub(crate) struct GrowthPolicy {
    /// Collection types tried by the allocation slow path, cheapest first.
    pub gc_plan: Vec<GcType>,
    pub next_gc_type: GcType,
    pub last_gc_time: Instant,
    pub last_gc_size: usize,
    /// Bytes per second allocated between the last two collections.
    pub allocation_rate: f64,
    pub target_utilization: f64,
    pub min_free: usize,
    pub max_free: usize,
    pub process_state: ProcessState,
    /// Set by non-sticky collections, consumed by the native allocation
    /// path before it asks the runtime to finalize.
    pub native_need_to_run_finalization: bool,
}

impl GrowthPolicy {
    pub fn new(settings: &HeapSettings) -> Self {
        Self {
            gc_plan: Vec::new(),
            next_gc_type: GcType::Partial,
            last_gc_time: Instant::now(),
            last_gc_size: 0,
            allocation_rate: 0.0,
            target_utilization: settings.target_utilization,
            min_free: settings.min_free,
            max_free: settings.max_free,
            process_state: ProcessState::JankPerceptible,
            native_need_to_run_finalization: false,
        }
    }
}

impl HeapInner {
    /// Whether pauses are noticeable right now.
    pub fn care_about_pause_times(&self) -> bool {
        self.policy.lock().process_state == ProcessState::JankPerceptible
    }

    /// Folds the bytes allocated since the last collection into the
    /// allocation rate.
    pub(crate) fn update_allocation_rate(&self) {
        let allocated = self.bytes_allocated();
        let mut policy = self.policy.lock();
        let elapsed = policy.last_gc_time.elapsed().as_millis();
        if elapsed != 0 {
            policy.allocation_rate =
                allocated.saturating_sub(policy.last_gc_size) as f64 * 1000.0 / elapsed as f64;
        }
    }

    pub fn allocation_rate(&self) -> f64 {
        self.policy.lock().allocation_rate
    }

    pub fn next_gc_type(&self) -> GcType {
        self.policy.lock().next_gc_type
    }

    /// Sets the footprint after a collection. This only moves limits, no
    /// memory is mapped or released.
    pub(crate) fn grow_for_utilization(&self, collector_name: &str, iteration: &Iteration) {
        let bytes_allocated = self.bytes_allocated();
        let max_allowed = self.max_allowed_footprint();
        let have_zygote_space = self.have_zygote_space();

        let mut policy = self.policy.lock();
        policy.last_gc_size = bytes_allocated;
        policy.last_gc_time = Instant::now();
        let target_size = if iteration.gc_type != GcType::Sticky {
            let target = (bytes_allocated as f64 / policy.target_utilization) as usize;
            policy.native_need_to_run_finalization = true;
            policy.next_gc_type = GcType::Sticky;
            target.clamp(
                bytes_allocated + policy.min_free,
                bytes_allocated + policy.max_free,
            )
        } else {
            // stay sticky while the footprint leaves room for min_free
            policy.next_gc_type = if bytes_allocated + policy.min_free <= max_allowed {
                GcType::Sticky
            } else if have_zygote_space {
                GcType::Partial
            } else {
                GcType::Full
            };
            if bytes_allocated + policy.max_free < max_allowed {
                bytes_allocated + policy.max_free
            } else {
                bytes_allocated.max(max_allowed)
            }
        };
        let allocation_rate = policy.allocation_rate;
        drop(policy);
        log::trace!(
            target: "heap",
            "{collector_name}: {bytes_allocated} bytes live, target footprint {target_size}"
        );

        if self.settings.ignore_max_footprint {
            return;
        }
        self.set_ideal_footprint(target_size);
        if self.collector_type().is_concurrent() {
            let max_allowed = self.max_allowed_footprint();
            let mut remaining = (allocation_rate * iteration.duration.as_secs_f64()) as usize;
            remaining = remaining.clamp(MIN_CONCURRENT_REMAINING_BYTES, MAX_CONCURRENT_REMAINING_BYTES);
            if remaining > max_allowed {
                // the rate would eat the whole footprint, collect again soon
                remaining = MIN_CONCURRENT_REMAINING_BYTES.min(max_allowed);
            }
            let start = (max_allowed - remaining).max(bytes_allocated);
            self.concurrent_start_bytes.store(start, Ordering::Relaxed);
        }
    }

    /// Caps `footprint` at the growth limit and installs it.
    pub(crate) fn set_ideal_footprint(&self, footprint: usize) {
        let limit = self.growth_limit.load(Ordering::Relaxed);
        let footprint = if footprint > limit {
            log::trace!(target: "heap", "clamping target footprint {footprint} to {limit}");
            limit
        } else {
            footprint
        };
        self.max_allowed_footprint
            .store(footprint, Ordering::Relaxed);
    }

    pub fn growth_limit(&self) -> usize {
        self.growth_limit.load(Ordering::Relaxed)
    }

    /// Lets the heap grow up to its full capacity.
    pub fn clear_growth_limit(&self) {
        self.growth_limit
            .store(self.settings.capacity, Ordering::Relaxed);
        let spaces = self.spaces.read();
        for (_, malloc) in spaces.table.malloc_spaces() {
            malloc.clear_growth_limit();
        }
        log::debug!(target: "heap", "growth limit cleared, heap may use {} bytes", self.settings.capacity);
    }

    pub fn target_heap_utilization(&self) -> f64 {
        self.policy.lock().target_utilization
    }

    pub fn set_target_heap_utilization(&self, target: f64) {
        debug_assert!(target > 0.0 && target < 1.0, "utilization {target} out of range");
        self.policy.lock().target_utilization = target;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        collector::{CollectorType, GcCause},
        heap::tests::{create_test_env, create_test_settings},
        settings::HeapSettings,
    };
    use std::time::Duration;

    fn iteration(gc_type: GcType, freed: usize, millis: u64) -> Iteration {
        let mut iteration = Iteration::new("test", gc_type, GcCause::Explicit, false);
        iteration.record_free(1, freed);
        iteration.duration = Duration::from_millis(millis);
        iteration
    }

    /// Runs `grow_for_utilization` as if `allocated` bytes were live.
    fn grow_with_allocated(heap: &HeapInner, allocated: usize, gc_type: GcType) {
        let previous = heap.num_bytes_allocated.swap(allocated, Ordering::SeqCst);
        heap.grow_for_utilization("mark sweep", &iteration(gc_type, 0, 1));
        heap.num_bytes_allocated.store(previous, Ordering::SeqCst);
    }

    #[test]
    fn test_non_sticky_growth_is_clamped_by_free_limits() {
        let (heap, _mutator, _runtime) = create_test_env(create_test_settings());
        let (min_free, max_free) = (heap.settings.min_free, heap.settings.max_free);

        grow_with_allocated(&heap, 0, GcType::Full);
        assert_eq!(heap.max_allowed_footprint(), min_free, "at least min_free of headroom");
        assert_eq!(heap.next_gc_type(), GcType::Sticky);
        assert!(heap.policy.lock().native_need_to_run_finalization);

        let allocated = 1024 * 1024;
        grow_with_allocated(&heap, allocated, GcType::Full);
        assert_eq!(
            heap.max_allowed_footprint(),
            allocated + max_free,
            "at most max_free of headroom"
        );
    }

    #[test]
    fn test_growth_follows_target_utilization_between_limits() {
        let settings = HeapSettings {
            max_free: 1024 * 1024,
            ..create_test_settings()
        };
        let (heap, _mutator, _runtime) = create_test_env(settings);
        heap.set_target_heap_utilization(0.5);
        let allocated = 400 * 1024;
        grow_with_allocated(&heap, allocated, GcType::Full);
        assert_eq!(heap.max_allowed_footprint(), 800 * 1024);
    }

    #[test]
    fn test_background_state_grows_like_the_foreground() {
        let (heap, _mutator, _runtime) = create_test_env(create_test_settings());
        heap.policy.lock().process_state = ProcessState::JankImperceptible;
        assert!(!heap.care_about_pause_times());
        grow_with_allocated(&heap, 0, GcType::Full);
        assert_eq!(heap.max_allowed_footprint(), heap.settings.min_free);
    }

    #[test]
    fn test_sticky_stays_sticky_while_min_free_fits() {
        let (heap, _mutator, _runtime) = create_test_env(create_test_settings());
        let max_allowed = heap.max_allowed_footprint();
        grow_with_allocated(&heap, max_allowed - heap.settings.min_free, GcType::Sticky);
        assert_eq!(heap.next_gc_type(), GcType::Sticky);
        assert_eq!(heap.max_allowed_footprint(), max_allowed, "no room to shrink");

        grow_with_allocated(&heap, max_allowed, GcType::Sticky);
        assert_eq!(heap.next_gc_type(), GcType::Full, "footprint exhausted");
    }

    #[test]
    fn test_sticky_shrinks_an_oversized_footprint() {
        let (heap, _mutator, _runtime) = create_test_env(create_test_settings());
        heap.set_ideal_footprint(heap.growth_limit());
        grow_with_allocated(&heap, 4096, GcType::Sticky);
        assert_eq!(heap.max_allowed_footprint(), 4096 + heap.settings.max_free);
        assert_eq!(heap.next_gc_type(), GcType::Sticky);
    }

    #[test]
    fn test_ideal_footprint_is_capped_at_growth_limit() {
        let (heap, _mutator, _runtime) = create_test_env(create_test_settings());
        heap.set_ideal_footprint(usize::MAX / 2);
        assert_eq!(heap.max_allowed_footprint(), heap.growth_limit());
        heap.clear_growth_limit();
        assert_eq!(heap.growth_limit(), heap.settings.capacity);
    }

    #[test]
    fn test_ignore_max_footprint_keeps_limits() {
        let settings = HeapSettings {
            ignore_max_footprint: true,
            ..create_test_settings()
        };
        let (heap, _mutator, _runtime) = create_test_env(settings);
        let before = heap.max_allowed_footprint();
        heap.grow_for_utilization("mark sweep", &iteration(GcType::Full, 0, 1));
        assert_eq!(heap.max_allowed_footprint(), before);
    }

    #[test]
    fn test_concurrent_start_follows_footprint() {
        let settings = HeapSettings {
            foreground_collector: CollectorType::Cms,
            ..create_test_settings()
        };
        let (heap, _mutator, _runtime) = create_test_env(settings);
        heap.grow_for_utilization("concurrent mark sweep", &iteration(GcType::Full, 0, 1));
        let max_allowed = heap.max_allowed_footprint();
        assert_eq!(
            heap.concurrent_start_bytes(),
            max_allowed.saturating_sub(MIN_CONCURRENT_REMAINING_BYTES)
        );
    }
}

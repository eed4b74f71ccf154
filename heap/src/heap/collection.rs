//! Running collections.
//!
//! Every collection goes through [`HeapInner::collect_garbage_internal`],
//! which owns the running-collector slot for the duration of the run. No
//! caller may hold a mutator guard: the collectors suspend every mutator.

use std::time::{Duration, Instant};

use crate::{
    collector::{
        Collector, CollectorType, GcCause, GcType, Iteration,
        timing::{pretty_duration, pretty_size},
    },
    error::fatal,
};

use super::{GcState, Heap, HeapInner};

impl HeapInner {
    /// Blocks until no collection runs. Returns the type of the last
    /// collection that finished while waiting, `GcType::None` when
    /// nothing ran.
    pub fn wait_for_gc_to_complete(&self, cause: GcCause) -> GcType {
        let mut state = self.gc.lock();
        self.wait_for_gc_to_complete_locked(&mut state, cause)
    }

    pub(crate) fn wait_for_gc_to_complete_locked(
        &self,
        state: &mut parking_lot::MutexGuard<'_, GcState>,
        cause: GcCause,
    ) -> GcType {
        let mut last_gc_type = GcType::None;
        let start = Instant::now();
        while state.collector_type_running != CollectorType::None {
            self.gc_complete.wait(state);
            last_gc_type = state.last_gc_type;
        }
        let waited = start.elapsed();
        state.total_wait_time += waited;
        if waited > self.settings.long_pause_log_threshold {
            log::info!(
                target: "gc",
                "WaitForGcToComplete blocked for {} for cause {cause}",
                pretty_duration(waited)
            );
        }
        last_gc_type
    }

    /// Runs a collection of the last type of the plan.
    pub fn collect_garbage(&self, clear_soft: bool) -> GcType {
        let gc_type = self
            .policy
            .lock()
            .gc_plan
            .last()
            .copied()
            .unwrap_or(GcType::Full);
        self.collect_garbage_internal(gc_type, GcCause::Explicit, clear_soft)
    }

    /// Runs one collection with the installed collector. Returns the type
    /// of collection that ran, `GcType::None` when it was skipped.
    pub(crate) fn collect_garbage_internal(
        &self,
        gc_type: GcType,
        cause: GcCause,
        clear_soft: bool,
    ) -> GcType {
        if gc_type == GcType::Partial && !self.have_zygote_space() {
            return GcType::None;
        }
        let collector_type = {
            let mut state = self.gc.lock();
            self.wait_for_gc_to_complete_locked(&mut state, cause);
            let collector_type = self.collector_type();
            if collector_type.is_compacting() && state.disable_moving_gc_count != 0 {
                log::warn!(
                    target: "gc",
                    "skipping {cause} GC, moving GC disabled {} times",
                    state.disable_moving_gc_count
                );
                return GcType::None;
            }
            state.collector_type_running = collector_type;
            collector_type
        };
        self.update_allocation_rate();
        let zygote_mode = self.is_zygote_mode();

        let collector = {
            let spaces = self.spaces.read();
            Collector::new(collector_type, gc_type, spaces.bump_pointer, spaces.temp)
        }
        .unwrap_or_else(|| fatal("mark sweep collection without a GC type"));
        let iteration = match &collector {
            Collector::SemiSpace(semi_space) => {
                let suspended = self.thread_list.suspend_all();
                let mut spaces = self.spaces.write();
                self.revoke_all_thread_local_buffers(&spaces);
                self.pre_gc_verification(&spaces);
                let iteration = semi_space.run_paused(self, &spaces, cause, clear_soft || zygote_mode);
                let roles = &mut *spaces;
                std::mem::swap(&mut roles.bump_pointer, &mut roles.temp);
                self.post_gc_verification(&spaces);
                drop(spaces);
                drop(suspended);
                iteration
            }
            Collector::MarkSweep(mark_sweep) => {
                self.run_paused_verification(true);
                let iteration = mark_sweep.run(
                    self,
                    cause,
                    clear_soft || gc_type != GcType::Sticky || zygote_mode,
                );
                self.run_paused_verification(false);
                iteration
            }
        };
        let name = collector.name();

        self.record_iteration(&name, &iteration);
        self.request_heap_trim();
        self.references.enqueue_cleared_references(&*self.runtime);
        self.grow_for_utilization(&name, &iteration);
        self.log_gc(&name, &iteration);
        self.finish_gc(iteration.gc_type);
        iteration.gc_type
    }

    /// Releases the running-collector slot and wakes every waiter.
    pub(crate) fn finish_gc(&self, gc_type: GcType) {
        let mut state = self.gc.lock();
        state.collector_type_running = CollectorType::None;
        if gc_type != GcType::None {
            state.last_gc_type = gc_type;
            state.gcs_completed += 1;
        }
        self.gc_complete.notify_all();
    }

    fn log_gc(&self, name: &str, iteration: &Iteration) {
        let mut log_gc = iteration.cause == GcCause::Explicit;
        if !log_gc && self.care_about_pause_times() {
            let long_pause = self.settings.long_pause_log_threshold;
            log_gc = iteration.duration > self.settings.long_gc_log_threshold
                || (iteration.cause == GcCause::ForAlloc && iteration.duration > long_pause)
                || iteration.pauses.iter().any(|pause| *pause >= long_pause);
        }
        if !log_gc {
            return;
        }
        let pauses = iteration
            .pauses
            .iter()
            .map(|pause| pretty_duration(*pause))
            .collect::<Vec<_>>()
            .join(", ");
        log::info!(
            target: "gc",
            "{} {name} GC freed {}({}) AllocSpace objects, {}({}) LOS objects, {}% free, {}/{}, paused {pauses} total {}",
            iteration.cause,
            iteration.freed_objects,
            pretty_size(iteration.freed_bytes),
            iteration.freed_large_objects,
            pretty_size(iteration.freed_large_object_bytes as i64),
            self.percent_free(),
            pretty_size(self.bytes_allocated() as i64),
            pretty_size(self.total_memory() as i64),
            pretty_duration(Duration::from_micros(iteration.duration.as_micros() as u64))
        );
    }

    /// Background collection started once allocations crossed the
    /// concurrent start bytes. Escalates through the plan when the next
    /// type cannot run.
    pub fn concurrent_gc(&self) {
        if self.wait_for_gc_to_complete(GcCause::Background) != GcType::None {
            return;
        }
        let next = self.next_gc_type();
        if self.collect_garbage_internal(next, GcCause::Background, false) != GcType::None {
            return;
        }
        let plan = self.policy.lock().gc_plan.clone();
        for gc_type in plan.into_iter().filter(|&gc_type| gc_type > next) {
            if self.collect_garbage_internal(gc_type, GcCause::Background, false) != GcType::None {
                break;
            }
        }
    }

    /// Waits for a running moving collection to finish, then keeps moving
    /// collections from starting until the returned count drops back.
    pub(crate) fn increment_disable_moving_gc(&self) {
        let mut state = self.gc.lock();
        while state.collector_type_running.is_compacting() {
            self.gc_complete.wait(&mut state);
        }
        state.disable_moving_gc_count += 1;
    }

    pub(crate) fn decrement_disable_moving_gc(&self) {
        let mut state = self.gc.lock();
        debug_assert!(state.disable_moving_gc_count > 0, "unbalanced moving GC enable");
        state.disable_moving_gc_count = state.disable_moving_gc_count.saturating_sub(1);
        self.gc_complete.notify_all();
    }

    pub fn is_moving_gc_disabled(&self) -> bool {
        self.gc.lock().disable_moving_gc_count != 0
    }

    /// Time mutators spent waiting for collections to finish.
    pub fn total_wait_time(&self) -> Duration {
        self.gc.lock().total_wait_time
    }
}

/// Keeps moving collections and compacting transitions from running while
/// alive.
#[derive(Debug)]
#[must_use = "moving GC is enabled again when the guard is dropped"]
pub struct MovingGcDisabled {
    heap: Heap,
}

impl MovingGcDisabled {
    /// Must not be called by a mutator holding its guard, use
    /// `Mutator::disable_moving_gc`.
    pub fn new(heap: &Heap) -> Self {
        heap.increment_disable_moving_gc();
        Self { heap: heap.clone() }
    }
}

impl Drop for MovingGcDisabled {
    fn drop(&mut self) {
        self.heap.decrement_disable_moving_gc();
    }
}

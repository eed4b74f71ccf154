//! Switching between the mark-sweep and the compacting collectors.
//!
//! A transition between the two families rebuilds the spaces: going
//! compacting compacts the main space into the bump pointer space and
//! parks its memory, going back recreates the main space from that memory
//! and compacts the bump pointer space into it. Transitions inside a
//! family only swap the collector tables.

use std::{
    fmt,
    sync::atomic::Ordering,
    time::{Duration, Instant},
};

use crate::{
    collector::{
        CollectorType, GcCause, GcType, SemiSpace, SemiSpaceMode,
        timing::{pretty_duration, pretty_size},
    },
    error::HeapError,
    space::{MallocKind, MallocSpace, Space},
};

use super::{HeapInner, MAIN_SPACE_NAME};

/// A background transition waits this long for the process to come back.
const COLLECTOR_TRANSITION_WAIT: Duration = Duration::from_secs(5);
/// One round of waiting for moving GC to be enabled again.
const DISABLED_MOVING_GC_WAIT: Duration = Duration::from_millis(1);
/// A compacting transition gives up after moving GC stayed disabled this
/// long.
pub(crate) const DISABLED_MOVING_GC_TIMEOUT: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    /// Foreground, pauses show up as jank.
    JankPerceptible,
    /// Background, throughput matters more than pauses.
    JankImperceptible,
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ProcessState::JankPerceptible => "jank perceptible",
            ProcessState::JankImperceptible => "jank imperceptible",
        })
    }
}

impl HeapInner {
    pub fn process_state(&self) -> ProcessState {
        self.policy.lock().process_state
    }

    /// Records the new state and schedules the matching collector. Going
    /// to the foreground transitions right away; going to the background
    /// transitions after a delay, unless this is a debug build.
    pub fn update_process_state(&self, state: ProcessState) {
        {
            let mut policy = self.policy.lock();
            if policy.process_state == state {
                return;
            }
            policy.process_state = state;
        }
        log::debug!(target: "heap", "process state is now {state}");
        match state {
            ProcessState::JankPerceptible => {
                self.request_collector_transition(self.settings.foreground_collector, Duration::ZERO);
            }
            ProcessState::JankImperceptible => {
                let delay = if cfg!(debug_assertions) {
                    Duration::ZERO
                } else {
                    COLLECTOR_TRANSITION_WAIT
                };
                self.request_collector_transition(self.settings.background_collector, delay);
            }
        }
    }

    /// Asks the heap daemon to install `desired` no sooner than `delay`
    /// from now.
    pub fn request_collector_transition(&self, desired: CollectorType, delay: Duration) {
        let mut tasks = self.tasks.lock();
        if tasks.desired_collector == desired {
            return;
        }
        tasks.target_time = tasks.target_time.max(Instant::now() + delay);
        tasks.desired_collector = desired;
        self.tasks_changed.notify_all();
    }

    /// Installs `collector_type`, compacting the heap when the collector
    /// family changes.
    ///
    /// Waits until no collection runs, and for compacting transitions
    /// until moving GC is enabled again, failing with
    /// [`HeapError::TransitionBlocked`] when that takes longer than
    /// [`DISABLED_MOVING_GC_TIMEOUT`]. Must not be called by a mutator
    /// holding its guard.
    pub fn transition_collector(&self, collector_type: CollectorType) -> Result<(), HeapError> {
        if collector_type == self.collector_type() {
            return Ok(());
        }
        log::debug!(
            target: "heap",
            "transition collector {} -> {collector_type}",
            self.collector_type()
        );
        let start = Instant::now();
        let before_allocated = self.bytes_allocated();
        let deadline = start + DISABLED_MOVING_GC_TIMEOUT;
        let copying = {
            let mut state = self.gc.lock();
            loop {
                self.wait_for_gc_to_complete_locked(&mut state, GcCause::CollectorTransition);
                let current = self.collector_type();
                if collector_type == current {
                    // someone else transitioned first
                    return Ok(());
                }
                let copying = current.is_compacting() != collector_type.is_compacting();
                if !copying || state.disable_moving_gc_count == 0 {
                    state.collector_type_running = if copying {
                        CollectorType::Ss
                    } else {
                        collector_type
                    };
                    break copying;
                }
                if Instant::now() >= deadline {
                    log::debug!(
                        target: "heap",
                        "moving GC disabled by {} holders, transition to {collector_type} skipped",
                        state.disable_moving_gc_count
                    );
                    return Err(HeapError::TransitionBlocked);
                }
                self.gc_complete.wait_for(&mut state, DISABLED_MOVING_GC_WAIT);
            }
        };

        if copying {
            let suspended = self.thread_list.suspend_all();
            let mut spaces = self.spaces.write();
            self.revoke_all_thread_local_buffers(&spaces);
            let compacted = if collector_type.is_compacting() {
                self.compact_into_bump_pointer_space(&mut spaces)
            } else {
                self.compact_into_main_space(&mut spaces)
            };
            if let Err(err) = compacted {
                drop(spaces);
                drop(suspended);
                self.finish_gc(GcType::None);
                return Err(err);
            }
            self.change_collector(collector_type);
            drop(spaces);
            drop(suspended);
        } else {
            self.change_collector(collector_type);
        }

        self.references.enqueue_cleared_references(&*self.runtime);
        if let Some(iteration) = self.last_iteration().filter(|_| copying) {
            self.grow_for_utilization("semispace", &iteration);
        }
        self.finish_gc(GcType::Full);

        let delta = before_allocated as i64 - self.bytes_allocated() as i64;
        let outcome = if delta >= 0 {
            format!("saved at least {}", pretty_size(delta))
        } else {
            format!("expanded {}", pretty_size(-delta))
        };
        log::info!(
            target: "heap",
            "Heap transition to {} took {} {outcome}",
            self.process_state(),
            pretty_duration(start.elapsed())
        );
        Ok(())
    }

    /// Moves every object of the main space into the bump pointer space
    /// and parks the main space's memory. Nothing moves when the allocated
    /// bytes could exceed the destination. Mutators are suspended.
    fn compact_into_bump_pointer_space(
        &self,
        spaces: &mut super::HeapSpaces,
    ) -> Result<(), HeapError> {
        let Some(main) = spaces.main else {
            return Err(HeapError::UnsupportedTransition {
                from: self.collector_type().name(),
                to: CollectorType::Ss.name(),
            });
        };
        let live = spaces.malloc(main).bytes_allocated() + spaces.bump_space().bytes_allocated();
        let capacity = spaces.temp_space().capacity();
        if live > capacity {
            return Err(HeapError::TransitionTooLarge { live, capacity });
        }
        let collector = SemiSpace::new(
            SemiSpaceMode::Normal,
            vec![main, spaces.bump_pointer],
            spaces.temp,
        );
        let iteration =
            collector.run_paused(self, spaces, GcCause::CollectorTransition, false);
        let roles = &mut *spaces;
        std::mem::swap(&mut roles.bump_pointer, &mut roles.temp);
        roles.main = None;
        if let Some(Space::Malloc(main)) = roles.table.remove(main) {
            roles.parked_main = Some(main.into_region());
        }
        self.record_iteration(collector.name(), &iteration);
        Ok(())
    }

    /// Recreates the main space, when its memory is parked, and moves the
    /// bump pointer space into it. Without a main space the objects go to
    /// the non-moving space. Mutators are suspended.
    fn compact_into_main_space(&self, spaces: &mut super::HeapSpaces) -> Result<(), HeapError> {
        let live = spaces.bump_space().bytes_allocated();
        let capacity = match (spaces.main_space(), &spaces.parked_main) {
            (Some(main), _) => main.capacity().saturating_sub(main.bytes_allocated()),
            (None, Some(region)) => region.size(),
            (None, None) => {
                let non_moving = spaces.non_moving_space();
                non_moving.capacity().saturating_sub(non_moving.bytes_allocated())
            }
        };
        if live > capacity {
            return Err(HeapError::TransitionTooLarge { live, capacity });
        }
        if spaces.main.is_none()
            && let Some(region) = spaces.parked_main.take()
        {
            let kind = if self.settings.use_rosalloc {
                MallocKind::RosAlloc
            } else {
                MallocKind::DlMalloc
            };
            let main = MallocSpace::new(
                region.renamed(MAIN_SPACE_NAME),
                kind,
                self.growth_limit.load(Ordering::Relaxed),
                self.settings.low_memory_mode,
                true,
            );
            main.set_footprint_limit(main.capacity());
            let id = spaces.table.add(Space::Malloc(main));
            spaces.main = Some(id);
            spaces.add_remembered_set(id, "Main space remembered set");
        }
        let to = spaces.primary_malloc_id();
        let collector = SemiSpace::new(SemiSpaceMode::Normal, vec![spaces.bump_pointer], to);
        let iteration = collector.run_paused(self, spaces, GcCause::CollectorTransition, false);
        self.record_iteration(collector.name(), &iteration);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        heap::{
            AllocatorType,
            tests::{alloc_test_object, create_test_env, create_test_settings, install_classes},
        },
        settings::HeapSettings,
        testing::ref_slot,
    };

    #[test]
    fn test_round_trip_between_collector_families() {
        let (heap, mut mutator, runtime) = create_test_env(create_test_settings());
        let classes = install_classes(&mut mutator, &runtime);
        let holder = alloc_test_object(&mut mutator, classes.normal, 1, 0).expect("holder");
        let target = alloc_test_object(&mut mutator, classes.normal, 0, 40).expect("target");
        // SAFETY: holder has one reference slot
        mutator.write_field(holder, unsafe { ref_slot(holder, 0) }, Some(target));
        let index = runtime.push(holder);
        let _garbage = alloc_test_object(&mut mutator, classes.normal, 0, 40).expect("garbage");
        assert!(heap.spaces.read().main_space().is_some_and(|main| main.contains(holder)));

        mutator
            .blocking(|heap| heap.transition_collector(CollectorType::Ss))
            .expect("to semispace");
        assert_eq!(heap.collector_type(), CollectorType::Ss);
        assert_eq!(heap.current_allocator(), AllocatorType::Tlab);
        let compacted = runtime.root(index);
        {
            let spaces = heap.spaces.read();
            assert!(spaces.main.is_none(), "main space parked");
            assert!(spaces.parked_main.is_some());
            assert!(spaces.bump_space().contains(compacted));
            assert_eq!(spaces.bump_space().objects_allocated(), 2, "garbage left behind");
        }

        mutator
            .blocking(|heap| heap.transition_collector(CollectorType::Ms))
            .expect("back to mark sweep");
        assert_eq!(heap.collector_type(), CollectorType::Ms);
        let restored = runtime.root(index);
        let spaces = heap.spaces.read();
        let main = spaces.main_space().expect("main space recreated");
        assert!(main.contains(restored));
        assert!(spaces.bump_space().is_empty());
        assert!(spaces.table.remembered_sets.contains_key(&spaces.main.expect("main")));
        // SAFETY: restored is the copy of holder
        let field = unsafe { ref_slot(restored, 0) }.load().expect("field kept");
        assert!(main.contains(field));
        assert_eq!(heap.gcs_completed(), 2);
    }

    #[test]
    fn test_transition_without_main_space_fails() {
        let settings = HeapSettings {
            background_collector: CollectorType::Ms,
            ..create_test_settings()
        };
        let (heap, mut mutator, _runtime) = create_test_env(settings);
        let result = mutator.blocking(|heap| heap.transition_collector(CollectorType::Ss));
        assert!(matches!(result, Err(HeapError::UnsupportedTransition { .. })));
        assert_eq!(heap.collector_type(), CollectorType::Ms, "collector unchanged");
        assert_eq!(
            heap.wait_for_gc_to_complete(GcCause::Explicit),
            GcType::None,
            "running slot released"
        );
    }

    #[test]
    fn test_transition_larger_than_the_bump_pointer_space_fails() {
        let settings = HeapSettings {
            initial_size: 1024 * 1024,
            growth_limit: 1024 * 1024,
            bump_pointer_capacity: 1024 * 1024,
            ..create_test_settings()
        };
        let (heap, mut mutator, runtime) = create_test_env(settings);
        let classes = install_classes(&mut mutator, &runtime);
        heap.clear_growth_limit();
        let payload = 8 * 1024;
        let mut held = Vec::new();
        while heap.spaces.read().main_space().map_or(0, MallocSpace::bytes_allocated)
            <= 1024 * 1024
        {
            let obj = alloc_test_object(&mut mutator, classes.normal, 0, payload)
                .expect("fits the cleared growth limit");
            held.push(runtime.push(obj));
        }
        let gcs = heap.gcs_completed();

        let result = mutator.blocking(|heap| heap.transition_collector(CollectorType::Ss));
        assert!(
            matches!(result, Err(HeapError::TransitionTooLarge { capacity, .. }) if capacity == 1024 * 1024),
            "expected a capacity error, got {result:?}"
        );
        assert_eq!(heap.collector_type(), CollectorType::Ms, "collector unchanged");
        assert_eq!(heap.gcs_completed(), gcs, "nothing collected");
        assert_eq!(heap.wait_for_gc_to_complete(GcCause::Explicit), GcType::None);
        let spaces = heap.spaces.read();
        let main = spaces.main_space().expect("main space kept");
        assert!(held.iter().all(|&index| main.contains(runtime.root(index))));
        assert!(spaces.bump_space().is_empty());
    }

    #[test]
    fn test_transition_gives_up_while_moving_gc_is_disabled() {
        let (heap, mut mutator, _runtime) = create_test_env(create_test_settings());
        let disabled = mutator.disable_moving_gc();
        let start = Instant::now();
        let result = mutator.blocking(|heap| heap.transition_collector(CollectorType::Ss));
        assert!(matches!(result, Err(HeapError::TransitionBlocked)), "got {result:?}");
        assert!(start.elapsed() >= DISABLED_MOVING_GC_TIMEOUT);
        assert_eq!(heap.collector_type(), CollectorType::Ms);
        assert_eq!(heap.wait_for_gc_to_complete(GcCause::Explicit), GcType::None);

        drop(disabled);
        mutator
            .blocking(|heap| heap.transition_collector(CollectorType::Ss))
            .expect("enabled again");
        assert_eq!(heap.collector_type(), CollectorType::Ss);
    }

    #[test]
    fn test_transition_inside_a_family_keeps_spaces() {
        let (heap, mut mutator, _runtime) = create_test_env(create_test_settings());
        let main_before = heap.spaces.read().main;
        mutator
            .blocking(|heap| heap.transition_collector(CollectorType::Cms))
            .expect("ms to cms");
        assert_eq!(heap.collector_type(), CollectorType::Cms);
        assert_eq!(heap.spaces.read().main, main_before);
        assert!(heap.concurrent_start_bytes() < usize::MAX);
    }

    #[test]
    fn test_process_state_requests_transitions() {
        let (heap, _mutator, _runtime) = create_test_env(create_test_settings());
        heap.update_process_state(ProcessState::JankImperceptible);
        assert!(!heap.care_about_pause_times());
        assert_eq!(heap.tasks.lock().desired_collector, CollectorType::Ss);
        heap.update_process_state(ProcessState::JankPerceptible);
        assert_eq!(heap.tasks.lock().desired_collector, CollectorType::Ms);
        assert_eq!(heap.process_state(), ProcessState::JankPerceptible);
    }
}

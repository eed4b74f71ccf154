//! Counters, dumps and heap walks.

use std::{fmt::Write, sync::atomic::Ordering};

use crate::{
    accounting::visit_all_slots,
    collector::{
        CollectorType, GcCause, GcType,
        timing::{pretty_duration, pretty_size},
    },
    object::{OBJECT_ALIGNMENT, ObjectRef},
    space::{Space, region::RegionState},
};

use super::{HeapInner, HeapSpaces};

impl HeapInner {
    // ── Counters ──────────────────────────────────────────────────────

    /// Footprint the heap may use before the next collection.
    pub fn total_memory(&self) -> usize {
        self.max_allowed_footprint().max(self.bytes_allocated())
    }

    pub fn free_memory(&self) -> usize {
        self.total_memory().saturating_sub(self.bytes_allocated())
    }

    /// Bytes left until the growth limit raises an out of memory error.
    pub fn free_memory_until_oome(&self) -> usize {
        self.growth_limit().saturating_sub(self.bytes_allocated())
    }

    pub fn percent_free(&self) -> usize {
        let total = self.total_memory();
        if total == 0 {
            return 100;
        }
        self.free_memory() * 100 / total
    }

    /// Objects in every space. Objects in unrevoked thread-local buffers
    /// are not counted.
    pub fn objects_allocated(&self) -> usize {
        let spaces = self.spaces.read();
        spaces
            .table
            .iter()
            .map(|(_, space)| space.objects_allocated())
            .sum()
    }

    pub fn objects_freed_ever(&self) -> usize {
        self.total_objects_freed_ever.load(Ordering::Relaxed)
    }

    pub fn bytes_freed_ever(&self) -> usize {
        self.total_bytes_freed_ever.load(Ordering::Relaxed)
    }

    pub fn objects_allocated_ever(&self) -> usize {
        self.objects_allocated() + self.objects_freed_ever()
    }

    pub fn bytes_allocated_ever(&self) -> usize {
        self.bytes_allocated() + self.bytes_freed_ever()
    }

    // ── Dumps ─────────────────────────────────────────────────────────

    pub fn dump_spaces(&self) -> String {
        let spaces = self.spaces.read();
        let mut out = String::new();
        for (_, space) in spaces.table.iter() {
            let _ = writeln!(out, "{}", space.dump());
        }
        for table in spaces.table.mod_union_tables.values() {
            let _ = writeln!(out, "{}", table.dump());
        }
        for set in spaces.table.remembered_sets.values() {
            let _ = writeln!(out, "{}", set.dump());
        }
        out
    }

    pub fn dump_gc_performance_info(&self) -> String {
        let mut out = String::from("Dumping cumulative Gc timings\n");
        let (total_duration, total_paused) = {
            let stats = self.stats.lock();
            let mut duration = std::time::Duration::ZERO;
            let mut paused = std::time::Duration::ZERO;
            for (name, collector) in stats.iter().filter(|(_, stats)| stats.iterations > 0) {
                out.push_str(&collector.dump(name));
                duration += collector.total_duration;
                paused += collector.total_paused;
            }
            (duration, paused)
        };
        if !total_duration.is_zero() {
            let seconds = total_duration.as_secs_f64();
            let _ = writeln!(out, "Total time spent in GC: {}", pretty_duration(total_duration));
            let _ = writeln!(
                out,
                "Mean GC size throughput: {}/s",
                pretty_size((self.bytes_freed_ever() as f64 / seconds) as i64)
            );
            let _ = writeln!(
                out,
                "Mean GC object throughput: {:.0} objects/s",
                self.objects_freed_ever() as f64 / seconds
            );
        }
        let _ = writeln!(out, "Total number of allocations {}", self.objects_allocated_ever());
        let _ = writeln!(
            out,
            "Total bytes allocated {}",
            pretty_size(self.bytes_allocated_ever() as i64)
        );
        let _ = writeln!(out, "Free memory {}", pretty_size(self.free_memory() as i64));
        let _ = writeln!(
            out,
            "Free memory until GC {}",
            pretty_size(self.max_allowed_footprint().saturating_sub(self.bytes_allocated()) as i64)
        );
        let _ = writeln!(
            out,
            "Free memory until OOME {}",
            pretty_size(self.free_memory_until_oome() as i64)
        );
        let _ = writeln!(out, "Total memory {}", pretty_size(self.total_memory() as i64));
        let _ = writeln!(out, "Max memory {}", pretty_size(self.growth_limit() as i64));
        let _ = writeln!(out, "Total mutator paused time: {}", pretty_duration(total_paused));
        let _ = writeln!(
            out,
            "Total time waiting for GC to complete: {}",
            pretty_duration(self.total_wait_time())
        );
        out
    }

    pub fn dump_for_sigquit(&self) -> String {
        let mut out = format!(
            "Heap: {}% free, {}/{}; {} objects\n",
            self.percent_free(),
            pretty_size(self.bytes_allocated() as i64),
            pretty_size(self.total_memory() as i64),
            self.objects_allocated()
        );
        out.push_str(&self.dump_gc_performance_info());
        out
    }

    // ── Queries ───────────────────────────────────────────────────────

    /// Null, or an aligned address inside one of the spaces.
    pub fn is_valid_object_address(&self, addr: usize) -> bool {
        if addr == 0 {
            return true;
        }
        addr.is_multiple_of(OBJECT_ALIGNMENT)
            && self
                .spaces
                .read()
                .table
                .find_space_from_address(addr)
                .is_some()
    }

    /// Whether `obj` is live: below the cursor of a moving space, marked
    /// in its space's live bitmap, or on one of the searched stacks.
    ///
    /// The caller must keep collections from running (hold its mutator
    /// guard or the running slot).
    pub fn is_live_object_locked(
        &self,
        obj: ObjectRef,
        search_allocation_stack: bool,
        search_live_stack: bool,
    ) -> bool {
        let spaces = self.spaces.read();
        let marked = match spaces.table.find_space(obj) {
            Some((_, Space::BumpPointer(bump))) => return bump.contains(obj),
            Some((_, Space::Region(region))) => {
                return region
                    .region_state(obj.addr())
                    .is_some_and(|state| state != RegionState::Free);
            }
            Some((_, Space::LargeObject(los))) => los.live_objects().test(obj),
            Some((_, space)) => space.live_bitmap().is_some_and(|live| live.test(obj)),
            None => return false,
        };
        marked
            || (search_allocation_stack && self.allocation_stack().contains(obj))
            || (search_live_stack && self.live_stack().contains(obj))
    }

    /// Whether a collection may move `obj`.
    pub fn is_movable_object(&self, obj: ObjectRef) -> bool {
        self.spaces
            .read()
            .table
            .find_space(obj)
            .is_some_and(|(_, space)| space.can_move_objects())
    }

    // ── Walks ─────────────────────────────────────────────────────────

    /// Runs `f` with no collection running and every mutator suspended.
    fn with_world_stopped<R>(&self, f: impl FnOnce(&HeapSpaces) -> R) -> R {
        {
            let mut state = self.gc.lock();
            self.wait_for_gc_to_complete_locked(&mut state, GcCause::Explicit);
            state.collector_type_running = CollectorType::CriticalSection;
        }
        let result = {
            let _suspended = self.thread_list.suspend_all();
            let spaces = self.spaces.read();
            self.revoke_all_thread_local_buffers(&spaces);
            f(&spaces)
        };
        self.finish_gc(GcType::None);
        result
    }

    /// Calls `visitor` for every object in the heap, including objects
    /// that died since the last collection. The visitor must not allocate.
    ///
    /// Must not be called by a mutator holding its guard.
    pub fn visit_objects(&self, visitor: &mut dyn FnMut(ObjectRef)) {
        self.with_world_stopped(|spaces| {
            self.visit_candidate_objects(spaces, &mut |obj| {
                // SAFETY: candidates are initialized, a null class marks
                // an allocation that was never finished
                if unsafe { obj.class() }.is_some() {
                    visitor(obj);
                }
            });
        });
    }

    /// Number of instances of each of `classes`, subclasses included with
    /// `use_is_assignable_from`.
    pub fn count_instances(&self, classes: &[ObjectRef], use_is_assignable_from: bool) -> Vec<usize> {
        let model = self.model();
        let mut counts = vec![0; classes.len()];
        self.visit_objects(&mut |obj| {
            // SAFETY: visited objects are initialized
            let Some(class) = (unsafe { obj.class() }) else {
                return;
            };
            for (count, &wanted) in counts.iter_mut().zip(classes) {
                // SAFETY: classes are initialized objects
                let matches = if use_is_assignable_from {
                    unsafe { model.is_assignable_from(wanted, class) }
                } else {
                    class == wanted
                };
                if matches {
                    *count += 1;
                }
            }
        });
        counts
    }

    /// Up to `max_count` instances of `class`, every instance when
    /// `max_count` is zero.
    pub fn get_instances(&self, class: ObjectRef, max_count: usize) -> Vec<ObjectRef> {
        let mut instances = Vec::new();
        self.visit_objects(&mut |obj| {
            // SAFETY: visited objects are initialized
            if (max_count == 0 || instances.len() < max_count)
                && unsafe { obj.class() } == Some(class)
            {
                instances.push(obj);
            }
        });
        instances
    }

    /// Up to `max_count` objects holding a reference to `target`, every
    /// one of them when `max_count` is zero.
    pub fn get_referring_objects(&self, target: ObjectRef, max_count: usize) -> Vec<ObjectRef> {
        let model = self.model();
        let mut referring = Vec::new();
        self.visit_objects(&mut |obj| {
            if max_count != 0 && referring.len() >= max_count {
                return;
            }
            let mut refers = false;
            // SAFETY: visited objects are initialized
            unsafe {
                visit_all_slots(model, obj, &mut |slot| refers |= slot.load() == Some(target));
            }
            if refers {
                referring.push(obj);
            }
        });
        referring
    }
}

//! Freezing the heap before the zygote forks its first child.

use std::sync::atomic::Ordering;

use crate::{
    OS_PAGE_SIZE,
    accounting::ModUnionTable,
    collector::{CollectorType, GcCause, GcType, SemiSpace},
    error::fatal,
    memory_region::MemoryRegion,
    space::{BumpPointerSpace, MallocKind, MallocSpace, Space},
    system::align_up,
};

use super::{HeapInner, HeapSpaces, MAIN_SPACE_NAME};

impl HeapInner {
    /// Compacts every movable object into the non-moving space and turns
    /// that space into the zygote space. Afterwards the heap runs the
    /// foreground collector with a fresh main and non-moving space, and
    /// large objects go to the large object space again.
    ///
    /// Does nothing outside of zygote mode or when the zygote space
    /// already exists. Must not be called by a mutator holding its guard.
    pub fn pre_zygote_fork(&self) {
        if !self.is_zygote_mode() || self.have_zygote_space() {
            return;
        }
        self.collect_garbage_internal(GcType::Full, GcCause::Background, false);
        {
            let mut state = self.gc.lock();
            self.wait_for_gc_to_complete_locked(&mut state, GcCause::CollectorTransition);
            if self.have_zygote_space() {
                return;
            }
            state.collector_type_running = CollectorType::Ss;
        }
        log::debug!(target: "heap", "starting pre zygote fork");

        let suspended = self.thread_list.suspend_all();
        let mut spaces = self.spaces.write();
        self.revoke_all_thread_local_buffers(&spaces);
        let trimmed = spaces.non_moving_space().trim();

        let zygote_end = self.compact_zygote(&spaces);
        self.change_collector(self.settings.foreground_collector);
        self.split_non_moving_space(&mut spaces, zygote_end);

        let bytes_allocated = spaces
            .table
            .iter()
            .map(|(_, space)| space.bytes_allocated())
            .sum::<usize>();
        self.num_bytes_allocated
            .store(bytes_allocated, Ordering::SeqCst);
        self.zygote_mode.store(false, Ordering::Release);
        self.have_zygote_space.store(true, Ordering::Release);
        self.large_object_threshold
            .store(self.settings.large_object_threshold, Ordering::Relaxed);
        let (_, zygote) = spaces
            .table
            .zygote_space()
            .unwrap_or_else(|| fatal("zygote space missing after the split"));
        log::debug!(
            target: "heap",
            "zygote space {:#x}-{:#x} holds {} objects, trimmed {trimmed} bytes",
            zygote.begin(),
            zygote.end(),
            zygote.objects_allocated()
        );
        drop(spaces);
        drop(suspended);
        self.finish_gc(GcType::None);
    }

    /// Packs the movable objects into the holes of the non-moving space
    /// and past its end. Returns the end of the packed objects.
    fn compact_zygote(&self, spaces: &HeapSpaces) -> usize {
        let non_moving = spaces.non_moving_space();
        let overflow_begin = align_up(non_moving.end(), OS_PAGE_SIZE).min(non_moving.limit());
        // SAFETY: the range is the unused tail of the non-moving space,
        // which lives inside the heap reservation
        let overflow = BumpPointerSpace::new(unsafe {
            MemoryRegion::view(
                "zygote bump space",
                overflow_begin,
                non_moving.limit() - overflow_begin,
            )
        });
        let mut from = vec![spaces.bump_pointer];
        if !self.collector_type().is_compacting()
            && let Some(main) = spaces.main
        {
            from.push(main);
        }
        let collector = SemiSpace::zygote(from, overflow);
        let iteration = collector.run_paused(self, spaces, GcCause::CollectorTransition, false);
        debug_assert!(spaces.temp_space().is_empty(), "temp space in use at the fork");
        self.record_iteration(collector.name(), &iteration);
        collector
            .overflow_end()
            .unwrap_or(overflow_begin)
            .max(non_moving.end())
    }

    fn split_non_moving_space(&self, spaces: &mut HeapSpaces, zygote_end: usize) {
        let Some(Space::Malloc(old)) = spaces.table.remove(spaces.non_moving) else {
            fatal("non-moving space missing at the zygote fork");
        };
        let kind = if self.settings.use_rosalloc {
            MallocKind::RosAlloc
        } else {
            MallocKind::DlMalloc
        };
        let (zygote, main) =
            old.create_zygote_space(zygote_end, "zygote space", MAIN_SPACE_NAME, kind, true);
        main.set_footprint_limit(main.capacity());
        let (zygote_begin, zygote_limit) = (zygote.begin(), zygote.limit());
        let zygote = spaces.table.add(Space::Zygote(zygote));
        let main = spaces.table.add(Space::Malloc(main));

        let region = spaces
            .post_zygote_non_moving
            .take()
            .unwrap_or_else(|| fatal("zygote heap without a post-zygote non-moving space"));
        let non_moving = MallocSpace::new(
            region,
            MallocKind::DlMalloc,
            self.settings.non_moving_capacity,
            self.settings.low_memory_mode,
            false,
        );
        non_moving.set_footprint_limit(non_moving.capacity());
        let non_moving = spaces.table.add(Space::Malloc(non_moving));

        // nobody card marked the compacted objects, so every card counts
        let table =
            ModUnionTable::card_cache("zygote space mod-union table", zygote, zygote_begin, zygote_limit);
        table.set_cards();
        spaces.table.mod_union_tables.insert(zygote, table);
        spaces.main = Some(main);
        spaces.non_moving = non_moving;
        spaces.add_remembered_set(main, "Main space remembered set");
        spaces.add_remembered_set(non_moving, "Post-zygote non-moving space remembered set");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        heap::{
            AllocatorType, NON_MOVING_SPACE_NAME,
            tests::{alloc_test_object, create_test_env, create_test_settings, install_classes},
        },
        settings::HeapSettings,
        testing::ref_slot,
    };

    fn zygote_settings() -> HeapSettings {
        HeapSettings {
            is_zygote: true,
            ..create_test_settings()
        }
    }

    #[test]
    fn test_zygote_mode_starts_compacting_without_large_objects() {
        let (heap, _mutator, _runtime) = create_test_env(zygote_settings());
        assert!(heap.is_zygote_mode());
        assert_eq!(heap.collector_type(), CollectorType::Ss);
        assert_eq!(heap.large_object_threshold(), usize::MAX);
        let spaces = heap.spaces.read();
        assert!(spaces.main.is_none());
        assert_eq!(spaces.non_moving_space().name(), "zygote / non moving space");
        assert!(spaces.post_zygote_non_moving.is_some());
    }

    #[test]
    fn test_fork_moves_survivors_into_zygote_space() {
        let (heap, mut mutator, runtime) = create_test_env(zygote_settings());
        let classes = install_classes(&mut mutator, &runtime);
        let holder = alloc_test_object(&mut mutator, classes.normal, 1, 0).expect("holder");
        let target = alloc_test_object(&mut mutator, classes.normal, 0, 64).expect("target");
        // SAFETY: holder has one reference slot
        mutator.write_field(holder, unsafe { ref_slot(holder, 0) }, Some(target));
        let index = runtime.push(holder);
        alloc_test_object(&mut mutator, classes.normal, 0, 64).expect("garbage");
        assert!(heap.spaces.read().bump_space().contains(holder));

        mutator.blocking(|heap| heap.pre_zygote_fork());
        assert!(heap.have_zygote_space());
        assert!(!heap.is_zygote_mode());
        assert_eq!(heap.collector_type(), CollectorType::Ms);
        assert_eq!(heap.current_allocator(), AllocatorType::RosAlloc);
        assert_eq!(heap.large_object_threshold(), heap.settings.large_object_threshold);

        let frozen = runtime.root(index);
        {
            let spaces = heap.spaces.read();
            let (zygote_id, zygote) = spaces.table.zygote_space().expect("zygote space");
            assert!(zygote.live_bitmap().test(frozen), "holder frozen");
            assert!(zygote.live_bitmap().test(classes.normal), "classes frozen");
            // SAFETY: frozen is the copy of holder
            let field = unsafe { ref_slot(frozen, 0) }.load().expect("field kept");
            assert!(zygote.live_bitmap().test(field));
            assert!(spaces.table.mod_union_tables.contains_key(&zygote_id));
            assert_eq!(spaces.main_space().map(MallocSpace::name), Some(MAIN_SPACE_NAME));
            assert_eq!(spaces.non_moving_space().name(), NON_MOVING_SPACE_NAME);
            assert!(spaces.post_zygote_non_moving.is_none());
            assert_eq!(spaces.table.remembered_sets.len(), 2);
            assert!(spaces.bump_space().is_empty());
        }
        // a second fork is a no-op
        let completed = heap.gcs_completed();
        mutator.blocking(|heap| heap.pre_zygote_fork());
        assert_eq!(heap.gcs_completed(), completed);
    }

    #[test]
    fn test_partial_collection_runs_after_the_fork() {
        let (heap, mut mutator, runtime) = create_test_env(zygote_settings());
        let classes = install_classes(&mut mutator, &runtime);
        let old = alloc_test_object(&mut mutator, classes.normal, 1, 0).expect("old");
        let index = runtime.push(old);
        mutator.blocking(|heap| heap.pre_zygote_fork());
        let old = runtime.root(index);

        let young = alloc_test_object(&mut mutator, classes.normal, 0, 32).expect("young");
        // SAFETY: old has one reference slot
        mutator.write_field(old, unsafe { ref_slot(old, 0) }, Some(young));
        let garbage = alloc_test_object(&mut mutator, classes.normal, 0, 32).expect("garbage");
        let ran = mutator.blocking(|heap| {
            heap.collect_garbage_internal(GcType::Partial, GcCause::Explicit, false)
        });
        assert_eq!(ran, GcType::Partial);
        let spaces = heap.spaces.read();
        let live = spaces.table.live_bitmap();
        assert!(live.test(young), "kept alive through the zygote mod-union table");
        assert!(!live.test(garbage));
    }

    #[test]
    fn test_fork_outside_zygote_mode_does_nothing() {
        let (heap, mut mutator, _runtime) = create_test_env(create_test_settings());
        mutator.blocking(|heap| heap.pre_zygote_fork());
        assert!(!heap.have_zygote_space());
        assert_eq!(heap.gcs_completed(), 0);
    }
}

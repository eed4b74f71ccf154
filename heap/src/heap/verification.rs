//! Heap verification around collections, enabled per phase through
//! [`VerifyFlags`].

use std::collections::HashSet;

use crate::{
    accounting::{ObjectStack, card_table::CARD_AGED, visit_all_slots},
    error::fatal,
    object::ObjectRef,
    settings::VerifyFlags,
    space::{MallocKind, Space, region::RegionState},
};

use super::{HeapInner, HeapSpaces};

impl HeapInner {
    /// Calls `visitor` once for every object the heap knows about: marked
    /// in a bitmap, on one of the stacks or inside a moving space.
    ///
    /// Mutators must be suspended with their buffers revoked.
    pub(crate) fn visit_candidate_objects(&self, spaces: &HeapSpaces, visitor: &mut dyn FnMut(ObjectRef)) {
        let mut seen = HashSet::new();
        let mut visit = |obj: ObjectRef| {
            if seen.insert(obj) {
                visitor(obj);
            }
        };
        spaces.table.live_bitmap().walk(&mut visit);
        spaces.table.mark_bitmap().walk(&mut visit);
        self.allocation_stack().for_each(&mut visit);
        self.live_stack().for_each(&mut visit);
        for id in spaces.moving_space_ids() {
            // SAFETY: mutators are suspended and their buffers revoked
            unsafe { spaces.space(id).walk(self.model(), &mut visit) };
        }
    }

    /// Checks that every reference held by an object accepted by `is_live`
    /// points at an object accepted by `is_live`. Returns the number of
    /// broken references, each of which is logged.
    pub(crate) fn verify_heap_references(
        &self,
        spaces: &HeapSpaces,
        is_live: &dyn Fn(ObjectRef) -> bool,
    ) -> usize {
        let model = self.model();
        let mut failures = 0;
        self.visit_candidate_objects(spaces, &mut |holder| {
            if !is_live(holder) {
                return;
            }
            // SAFETY: live objects are initialized
            unsafe {
                visit_all_slots(model, holder, &mut |slot| {
                    if let Some(target) = slot.load()
                        && !is_live(target)
                    {
                        failures += 1;
                        let space = spaces
                            .table
                            .find_space(target)
                            .map_or("no space", |(_, space)| space.name());
                        log::error!(
                            target: "verify",
                            "{holder:?} references dead object {target:?} ({space}) through {slot:?}, card {:#x}",
                            self.card_table.get_card(holder.addr())
                        );
                    }
                });
            }
        });
        failures
    }

    /// Checks that every object referencing something on the live stack
    /// sits on a card that was dirtied or aged since the last collection.
    /// Sticky collections rely on these cards to find their roots.
    pub(crate) fn verify_missing_card_marks(&self, spaces: &HeapSpaces) -> bool {
        let live_stack = self.live_stack();
        live_stack.sort();
        let model = self.model();
        let mut failures = 0;
        let mut check = |holder: ObjectRef| {
            if !self.card_table.covers(holder.addr())
                || self.is_in_moving_range(holder.addr())
                || self.card_table.get_card(holder.addr()) >= CARD_AGED
            {
                return;
            }
            // SAFETY: live objects are initialized
            unsafe {
                visit_all_slots(model, holder, &mut |slot| {
                    if let Some(target) = slot.load()
                        && live_stack.contains_sorted(target)
                    {
                        failures += 1;
                        log::error!(
                            target: "verify",
                            "{holder:?} references new object {target:?} from a clean card"
                        );
                    }
                });
            }
        };
        spaces.table.live_bitmap().walk(&mut check);
        live_stack.for_each(&mut check);
        failures == 0
    }

    /// Liveness outside of a collection: marked live, on a stack, or
    /// below the cursor of a moving space.
    fn is_live_for_verification(&self, spaces: &HeapSpaces, stacks: &[&ObjectStack], obj: ObjectRef) -> bool {
        let on_stack = || stacks.iter().any(|stack| stack.contains(obj));
        match spaces.table.find_space(obj) {
            Some((_, Space::BumpPointer(bump))) => bump.contains(obj),
            Some((_, Space::Region(region))) => region
                .region_state(obj.addr())
                .is_some_and(|state| state != RegionState::Free),
            Some((_, Space::LargeObject(los))) => los.live_objects().test(obj) || on_stack(),
            Some((_, space)) => space.live_bitmap().is_some_and(|live| live.test(obj)) || on_stack(),
            None => false,
        }
    }

    /// Verifies the whole heap. Mutators must be suspended with their
    /// buffers revoked. Returns the number of problems found.
    pub(crate) fn verify_heap_locked(&self, spaces: &HeapSpaces) -> usize {
        let stacks = [self.allocation_stack(), self.live_stack()];
        self.verify_heap_references(spaces, &|obj| {
            self.is_live_for_verification(spaces, &stacks, obj)
        })
    }

    fn verify_rosalloc(&self, spaces: &HeapSpaces) -> usize {
        let mut failures = 0;
        for (_, malloc) in spaces.table.malloc_spaces() {
            if malloc.kind() != MallocKind::RosAlloc {
                continue;
            }
            for error in malloc.verify() {
                failures += 1;
                log::error!(target: "verify", "{}: {error}", malloc.name());
            }
        }
        failures
    }

    fn verify_mod_union_tables(&self, spaces: &HeapSpaces) -> usize {
        let mut failures = 0;
        for (id, table) in &spaces.table.mod_union_tables {
            let Some(live) = spaces.table.get(*id).and_then(Space::live_bitmap) else {
                continue;
            };
            for error in table.verify(&live, self.model(), &self.card_table) {
                failures += 1;
                log::error!(target: "verify", "{error}");
            }
        }
        failures
    }

    /// Runs the enabled pre-collection checks. Mutators must be suspended.
    pub(crate) fn pre_gc_verification(&self, spaces: &HeapSpaces) {
        let verify = self.settings.verify;
        if verify.contains(VerifyFlags::PRE_GC_HEAP) && self.verify_heap_locked(spaces) > 0 {
            fatal("pre gc heap verification failed");
        }
        if verify.contains(VerifyFlags::MOD_UNION_TABLES) && self.verify_mod_union_tables(spaces) > 0 {
            fatal("pre gc mod-union table verification failed");
        }
        if verify.contains(VerifyFlags::PRE_GC_ROSALLOC) && self.verify_rosalloc(spaces) > 0 {
            fatal("pre gc rosalloc verification failed");
        }
    }

    /// Runs the enabled post-collection checks. Mutators must be suspended.
    pub(crate) fn post_gc_verification(&self, spaces: &HeapSpaces) {
        let verify = self.settings.verify;
        if verify.contains(VerifyFlags::POST_GC_HEAP) && self.verify_heap_locked(spaces) > 0 {
            fatal("post gc heap verification failed");
        }
        if verify.contains(VerifyFlags::POST_GC_ROSALLOC) && self.verify_rosalloc(spaces) > 0 {
            fatal("post gc rosalloc verification failed");
        }
    }

    /// Suspends the world for the pre or post checks of a collector that
    /// takes its own pauses. Does nothing when no check is enabled.
    pub(crate) fn run_paused_verification(&self, pre: bool) {
        let flags = if pre {
            VerifyFlags::PRE_GC_HEAP | VerifyFlags::MOD_UNION_TABLES | VerifyFlags::PRE_GC_ROSALLOC
        } else {
            VerifyFlags::POST_GC_HEAP | VerifyFlags::POST_GC_ROSALLOC
        };
        if !self.settings.verify.intersects(flags) {
            return;
        }
        let _suspended = self.thread_list.suspend_all();
        let spaces = self.spaces.read();
        self.revoke_all_thread_local_buffers(&spaces);
        if pre {
            self.pre_gc_verification(&spaces);
        } else {
            self.post_gc_verification(&spaces);
        }
    }

    /// Suspends the world and verifies every reference in the heap.
    /// Returns the number of broken references.
    pub fn verify_heap(&self) -> usize {
        let _suspended = self.thread_list.suspend_all();
        let spaces = self.spaces.read();
        self.revoke_all_thread_local_buffers(&spaces);
        self.verify_heap_locked(&spaces)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        collector::CollectorType,
        heap::tests::{alloc_test_object, create_test_env, create_test_settings, install_classes},
        settings::HeapSettings,
        testing::ref_slot,
    };

    fn verifying_settings(collector: CollectorType) -> HeapSettings {
        HeapSettings {
            foreground_collector: collector,
            verify: VerifyFlags::PRE_GC_HEAP
                | VerifyFlags::POST_GC_HEAP
                | VerifyFlags::PRE_SWEEPING_HEAP
                | VerifyFlags::PRE_GC_ROSALLOC
                | VerifyFlags::POST_GC_ROSALLOC
                | VerifyFlags::MISSING_CARD_MARKS,
            ..create_test_settings()
        }
    }

    #[test]
    fn test_verified_collections_pass_on_a_sound_heap() {
        for collector in [CollectorType::Ms, CollectorType::Cms, CollectorType::Ss] {
            let (heap, mut mutator, runtime) = create_test_env(verifying_settings(collector));
            let classes = install_classes(&mut mutator, &runtime);
            let mut previous = None;
            for _ in 0..32 {
                let obj = alloc_test_object(&mut mutator, classes.normal, 1, 16).expect("allocation");
                if let Some(previous) = previous {
                    // SAFETY: every object has one reference slot
                    mutator.write_field(obj, unsafe { ref_slot(obj, 0) }, Some(previous));
                }
                previous = Some(obj);
            }
            runtime.push(previous.expect("chain head"));
            mutator.collect_garbage(false);
            mutator.collect_garbage(false);
            assert_eq!(mutator.blocking(|heap| heap.verify_heap()), 0, "{collector} left broken references");
            assert!(heap.gcs_completed() >= 2);
        }
    }

    #[test]
    fn test_dangling_reference_is_reported() {
        let (_heap, mut mutator, runtime) = create_test_env(create_test_settings());
        let classes = install_classes(&mut mutator, &runtime);
        let holder = alloc_test_object(&mut mutator, classes.normal, 1, 0).expect("holder");
        runtime.push(holder);
        mutator.collect_garbage(false);
        // plant a reference to an address no space owns
        let bogus = ObjectRef::from_addr(0x10).expect("aligned");
        // SAFETY: holder has one reference slot
        unsafe { ref_slot(holder, 0) }.store(Some(bogus));
        let failures = mutator.blocking(|heap| heap.verify_heap());
        // SAFETY: as above
        unsafe { ref_slot(holder, 0) }.store(None);
        assert_eq!(failures, 1);
    }
}

//! Background work of the heap: concurrent collections, collector
//! transitions and trims, run by a [`HeapDaemon`] thread.

use std::{
    sync::atomic::Ordering,
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use crate::{
    collector::{CollectorType, GcCause, GcType, timing::pretty_duration},
    error::{HeapError, fatal},
    space::MallocKind,
};

use super::{Heap, HeapInner};

/// Minimum time between two heap trims.
const HEAP_TRIM_WAIT: Duration = Duration::from_secs(5);
/// Delay before retrying a transition blocked by disabled moving GC.
pub(crate) const TRANSITION_RETRY_WAIT: Duration = Duration::from_millis(50);

/// Work requested from the daemon. Guarded by `HeapInner::tasks`.
#[derive(Debug)]
pub(crate) struct PendingTasks {
    pub desired_collector: CollectorType,
    /// Transitions and trims wait until this instant.
    pub target_time: Instant,
    pub heap_trim_pending: bool,
    pub last_trim: Option<Instant>,
    pub concurrent_gc_pending: bool,
    pub shutdown: bool,
}

impl PendingTasks {
    pub fn new(collector: CollectorType) -> Self {
        Self {
            desired_collector: collector,
            target_time: Instant::now(),
            heap_trim_pending: false,
            last_trim: None,
            concurrent_gc_pending: false,
            shutdown: false,
        }
    }
}

impl HeapInner {
    /// Asks the daemon for a background collection. Allocations stop
    /// requesting until the next collection moves the start bytes again.
    pub fn request_concurrent_gc(&self) {
        self.concurrent_start_bytes.store(usize::MAX, Ordering::Relaxed);
        let mut tasks = self.tasks.lock();
        if tasks.concurrent_gc_pending {
            return;
        }
        tasks.concurrent_gc_pending = true;
        self.tasks_changed.notify_all();
    }

    /// Asks the daemon to trim, at most once every few seconds.
    pub fn request_heap_trim(&self) {
        if !self.runtime.is_started() || self.is_zygote_mode() {
            return;
        }
        let now = Instant::now();
        let mut tasks = self.tasks.lock();
        if tasks
            .last_trim
            .is_some_and(|last| now.duration_since(last) < HEAP_TRIM_WAIT)
        {
            return;
        }
        tasks.heap_trim_pending = true;
        tasks.target_time = tasks.target_time.max(now + HEAP_TRIM_WAIT);
        self.tasks_changed.notify_all();
    }

    /// Returns free pages of the malloc spaces to the OS. Dlmalloc spaces
    /// are only walked when pauses do not matter. Returns the bytes
    /// released.
    pub fn trim(&self) -> usize {
        {
            let mut state = self.gc.lock();
            self.wait_for_gc_to_complete_locked(&mut state, GcCause::Background);
            state.collector_type_running = CollectorType::HeapTrim;
        }
        let start = Instant::now();
        let care_about_pause_times = self.care_about_pause_times();
        let (released, allocated, footprint) = {
            let spaces = self.spaces.read();
            let mut released = 0;
            let mut allocated = 0;
            let mut footprint = 0;
            for (_, malloc) in spaces.table.malloc_spaces() {
                if malloc.kind() == MallocKind::RosAlloc || !care_about_pause_times {
                    released += malloc.trim();
                }
                allocated += malloc.bytes_allocated();
                footprint += malloc.footprint();
            }
            (released, allocated, footprint)
        };
        self.tasks.lock().last_trim = Some(Instant::now());
        self.finish_gc(GcType::None);

        let utilization = if footprint == 0 {
            0.0
        } else {
            allocated as f64 * 100.0 / footprint as f64
        };
        log::debug!(
            target: "heap",
            "Heap trim of managed (duration={}, advised={released} bytes) heap with utilization of {utilization:.0}%",
            pretty_duration(start.elapsed())
        );
        released
    }
}

/// Thread running the heap's background tasks until dropped.
#[derive(Debug)]
pub struct HeapDaemon {
    heap: Heap,
    handle: Option<JoinHandle<()>>,
}

impl HeapDaemon {
    pub fn start(heap: &Heap) -> Self {
        let worker = heap.clone();
        let handle = thread::Builder::new()
            .name("heap daemon".to_string())
            .spawn(move || run_daemon(&worker))
            .unwrap_or_else(|err| fatal(&format!("failed to spawn the heap daemon: {err}")));
        Self {
            heap: heap.clone(),
            handle: Some(handle),
        }
    }
}

impl Drop for HeapDaemon {
    fn drop(&mut self) {
        self.heap.tasks.lock().shutdown = true;
        self.heap.tasks_changed.notify_all();
        if let Some(handle) = self.handle.take()
            && handle.join().is_err()
        {
            log::error!(target: "heap", "heap daemon panicked");
        }
    }
}

enum Task {
    ConcurrentGc,
    Transition(CollectorType),
    Trim,
}

fn next_task(heap: &HeapInner) -> Option<Task> {
    let mut tasks = heap.tasks.lock();
    loop {
        if tasks.shutdown {
            return None;
        }
        if tasks.concurrent_gc_pending {
            tasks.concurrent_gc_pending = false;
            return Some(Task::ConcurrentGc);
        }
        let transition = tasks.desired_collector != heap.collector_type();
        if !transition && !tasks.heap_trim_pending {
            heap.tasks_changed.wait(&mut tasks);
            continue;
        }
        let target_time = tasks.target_time;
        if Instant::now() < target_time {
            heap.tasks_changed.wait_until(&mut tasks, target_time);
            continue;
        }
        if transition {
            return Some(Task::Transition(tasks.desired_collector));
        }
        tasks.heap_trim_pending = false;
        return Some(Task::Trim);
    }
}

fn run_daemon(heap: &HeapInner) {
    log::debug!(target: "heap", "heap daemon started");
    while let Some(task) = next_task(heap) {
        match task {
            Task::ConcurrentGc => heap.concurrent_gc(),
            Task::Transition(collector) => {
                match heap.transition_collector(collector) {
                    Ok(()) => {}
                    Err(HeapError::TransitionBlocked) => {
                        log::debug!(target: "heap", "collector transition to {collector} delayed");
                        let mut tasks = heap.tasks.lock();
                        tasks.target_time = Instant::now() + TRANSITION_RETRY_WAIT;
                    }
                    Err(err) => {
                        log::error!(target: "heap", "collector transition failed: {err}");
                        // only retry once something asks again
                        heap.tasks.lock().desired_collector = heap.collector_type();
                    }
                }
            }
            Task::Trim => {
                heap.trim();
            }
        }
    }
    log::debug!(target: "heap", "heap daemon stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        heap::tests::{alloc_test_object, create_test_env, create_test_settings, install_classes},
        settings::HeapSettings,
    };

    fn wait_until(timeout: Duration, condition: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        condition()
    }

    #[test]
    fn test_trim_requests_are_rate_limited() {
        let (heap, _mutator, _runtime) = create_test_env(create_test_settings());
        heap.request_heap_trim();
        assert!(heap.tasks.lock().heap_trim_pending);
        heap.tasks.lock().heap_trim_pending = false;
        heap.tasks.lock().last_trim = Some(Instant::now());
        heap.request_heap_trim();
        assert!(!heap.tasks.lock().heap_trim_pending, "trimmed moments ago");
    }

    #[test]
    fn test_trim_is_not_requested_before_start() {
        let (heap, _mutator, runtime) = create_test_env(create_test_settings());
        runtime.not_started.store(true, Ordering::Relaxed);
        heap.request_heap_trim();
        assert!(!heap.tasks.lock().heap_trim_pending);
    }

    #[test]
    fn test_trim_releases_the_running_slot() {
        let settings = HeapSettings {
            use_rosalloc: false,
            ..create_test_settings()
        };
        let (heap, mut mutator, runtime) = create_test_env(settings);
        let classes = install_classes(&mut mutator, &runtime);
        for _ in 0..64 {
            alloc_test_object(&mut mutator, classes.normal, 0, 1024).expect("allocation");
        }
        mutator.collect_garbage(false);
        mutator.blocking(|heap| heap.trim());
        assert!(heap.tasks.lock().last_trim.is_some());
        assert_eq!(heap.wait_for_gc_to_complete(GcCause::Explicit), GcType::None);
        assert_eq!(heap.gcs_completed(), 1, "a trim is not a collection");
    }

    #[test]
    fn test_daemon_runs_concurrent_collections() {
        let settings = HeapSettings {
            foreground_collector: CollectorType::Cms,
            ..create_test_settings()
        };
        let (heap, mut mutator, _runtime) = create_test_env(settings);
        let daemon = HeapDaemon::start(&heap);
        heap.request_concurrent_gc();
        let collected = mutator.blocking(|heap| {
            wait_until(Duration::from_secs(5), || heap.gcs_completed() > 0)
        });
        assert!(collected, "daemon never collected");
        assert!(!heap.tasks.lock().concurrent_gc_pending);
        drop(daemon);
    }

    #[test]
    fn test_daemon_transitions_collectors() {
        let (heap, mut mutator, _runtime) = create_test_env(create_test_settings());
        let daemon = HeapDaemon::start(&heap);
        heap.request_collector_transition(CollectorType::Ss, Duration::ZERO);
        let transitioned = mutator.blocking(|heap| {
            wait_until(Duration::from_secs(5), || heap.collector_type() == CollectorType::Ss)
        });
        assert!(transitioned, "daemon never transitioned");
        drop(daemon);
        assert!(heap.tasks.lock().shutdown);
    }

    #[test]
    fn test_daemon_retries_transitions_blocked_by_disabled_moving_gc() {
        let (heap, mut mutator, _runtime) = create_test_env(create_test_settings());
        let disabled = mutator.disable_moving_gc();
        let daemon = HeapDaemon::start(&heap);
        heap.request_collector_transition(CollectorType::Ss, Duration::ZERO);
        mutator.blocking(|_| thread::sleep(TRANSITION_RETRY_WAIT * 4));
        assert_eq!(heap.collector_type(), CollectorType::Ms, "moving GC still disabled");
        assert_eq!(
            heap.tasks.lock().desired_collector,
            CollectorType::Ss,
            "request kept for a retry"
        );

        drop(disabled);
        let transitioned = mutator.blocking(|heap| {
            wait_until(Duration::from_secs(5), || heap.collector_type() == CollectorType::Ss)
        });
        assert!(transitioned, "blocked transition never retried");
        drop(daemon);
    }
}

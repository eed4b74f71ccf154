//! Work sharing for parallel marking.
//!
//! Every worker drains a local queue and donates half of it when it grows
//! while others are starving. The pool is done once all workers are idle
//! and nothing is left to share.

use std::thread;

use parking_lot::{Condvar, Mutex};

/// Local items above which a worker offers work to idle threads.
const DONATE_THRESHOLD: usize = 64;
/// Items a worker takes from the shared list at once.
const STEAL_BATCH: usize = 32;

struct Shared<T> {
    items: Vec<T>,
    idle: usize,
    done: bool,
}

struct Pool<T> {
    shared: Mutex<Shared<T>>,
    work_available: Condvar,
    threads: usize,
}

/// Queue of a single worker. Items pushed here are processed by the same
/// worker unless they get donated.
pub struct LocalQueue<'a, T> {
    items: Vec<T>,
    pool: Option<&'a Pool<T>>,
}

impl<T> LocalQueue<'_, T> {
    pub fn push(&mut self, item: T) {
        self.items.push(item);
        if self.items.len() > DONATE_THRESHOLD
            && let Some(pool) = self.pool
            && let Some(mut shared) = pool.shared.try_lock()
            && shared.items.is_empty()
            && shared.idle > 0
        {
            let half = self.items.len() / 2;
            shared.items.extend(self.items.drain(..half));
            pool.work_available.notify_all();
        }
    }
}

/// Processes `initial` and everything `work` pushes, on `threads` threads.
///
/// Runs on the calling thread when `threads <= 1`.
pub fn process<T: Send>(
    threads: usize,
    initial: Vec<T>,
    work: impl Fn(T, &mut LocalQueue<'_, T>) + Sync,
) {
    if threads <= 1 {
        let mut queue = LocalQueue {
            items: initial,
            pool: None,
        };
        while let Some(item) = queue.items.pop() {
            work(item, &mut queue);
        }
        return;
    }

    let pool = Pool {
        shared: Mutex::new(Shared {
            items: initial,
            idle: 0,
            done: false,
        }),
        work_available: Condvar::new(),
        threads,
    };
    thread::scope(|scope| {
        for index in 0..threads {
            let pool = &pool;
            let work = &work;
            thread::Builder::new()
                .name(format!("gc worker {index}"))
                .spawn_scoped(scope, move || run_worker(pool, work))
                .unwrap_or_else(|err| {
                    crate::error::fatal(&format!("failed to spawn gc worker: {err}"))
                });
        }
    });
    log::trace!(target: "gc", "worker pool of {} threads finished", pool.threads);
}

fn run_worker<T: Send>(pool: &Pool<T>, work: &(impl Fn(T, &mut LocalQueue<'_, T>) + Sync)) {
    let mut queue = LocalQueue {
        items: Vec::new(),
        pool: Some(pool),
    };
    loop {
        while let Some(item) = queue.items.pop() {
            work(item, &mut queue);
        }
        let mut shared = pool.shared.lock();
        loop {
            if shared.done {
                return;
            }
            if !shared.items.is_empty() {
                let take = shared.items.len().min(STEAL_BATCH);
                let start = shared.items.len() - take;
                queue.items.extend(shared.items.drain(start..));
                break;
            }
            shared.idle += 1;
            if shared.idle == pool.threads {
                shared.done = true;
                pool.work_available.notify_all();
                return;
            }
            pool.work_available.wait(&mut shared);
            shared.idle -= 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Each item `n` fans out into `n - 1` and `n - 2` until zero, the
    /// number of processed items is a Fibonacci related count.
    fn fan_out(threads: usize, start: usize) -> usize {
        let processed = AtomicUsize::new(0);
        process(threads, vec![start], |n: usize, queue| {
            processed.fetch_add(1, Ordering::Relaxed);
            if n >= 1 {
                queue.push(n - 1);
            }
            if n >= 2 {
                queue.push(n - 2);
            }
        });
        processed.into_inner()
    }

    #[test]
    fn test_inline_and_parallel_agree() {
        let inline = fan_out(1, 18);
        assert_eq!(inline, fan_out(4, 18));
        assert_eq!(inline, fan_out(8, 18));
    }

    #[test]
    fn test_empty_input_terminates() {
        let processed = AtomicUsize::new(0);
        process(4, Vec::<usize>::new(), |_, _| {
            processed.fetch_add(1, Ordering::Relaxed);
        });
        assert_eq!(processed.into_inner(), 0);
    }
}

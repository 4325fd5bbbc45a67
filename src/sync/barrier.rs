use crate::sync::monitor::Monitor;

struct BarrierState {
    n_workers: usize,
    n_completed: usize,
    generation: usize,
    aborted: bool,
}

/// Reusable sync barrier for a worker gang. The overflow-restart protocol
/// uses two of these back to back: the first ensures every worker has stopped
/// touching shared marking state, the second releases them after the
/// coordinator reset it.
pub struct WorkerBarrierSync {
    mon: Monitor<BarrierState>,
}

impl WorkerBarrierSync {
    pub fn new() -> Self {
        Self {
            mon: Monitor::new(BarrierState {
                n_workers: 0,
                n_completed: 0,
                generation: 0,
                aborted: false,
            }),
        }
    }

    pub fn set_n_workers(&self, n_workers: usize) {
        let mut g = self.mon.lock();
        g.n_workers = n_workers;
        g.n_completed = 0;
        g.aborted = false;
    }

    /// Blocks until all `n_workers` have entered. Returns false if the
    /// barrier was aborted, either before or while waiting.
    pub fn enter(&self) -> bool {
        let mut g = self.mon.lock();
        if g.aborted {
            return false;
        }
        g.n_completed += 1;
        if g.n_completed == g.n_workers {
            g.n_completed = 0;
            g.generation += 1;
            drop(g);
            self.mon.notify_all();
            true
        } else {
            let generation = g.generation;
            while g.generation == generation && !g.aborted {
                g.wait();
            }
            !g.aborted
        }
    }

    /// Wakes all waiters and makes every subsequent enter() fail until the
    /// barrier is re-armed with set_n_workers().
    pub fn abort(&self) {
        let mut g = self.mon.lock();
        g.aborted = true;
        drop(g);
        self.mon.notify_all();
    }
}

impl Default for WorkerBarrierSync {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_all_enter_and_release() {
        let barrier = WorkerBarrierSync::new();
        barrier.set_n_workers(4);
        let released = AtomicUsize::new(0);
        std::thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| {
                    assert!(barrier.enter());
                    released.fetch_add(1, Ordering::Relaxed);
                });
            }
        });
        assert_eq!(released.load(Ordering::Relaxed), 4);
    }

    #[test]
    fn test_abort_releases_waiters() {
        let barrier = WorkerBarrierSync::new();
        barrier.set_n_workers(2);
        std::thread::scope(|s| {
            let h = s.spawn(|| barrier.enter());
            // Let the waiter park, then abort instead of joining it.
            std::thread::sleep(std::time::Duration::from_millis(10));
            barrier.abort();
            assert!(!h.join().unwrap());
        });
    }

    #[test]
    fn test_reusable_across_generations() {
        let barrier = WorkerBarrierSync::new();
        barrier.set_n_workers(2);
        for _ in 0..3 {
            std::thread::scope(|s| {
                s.spawn(|| assert!(barrier.enter()));
                s.spawn(|| assert!(barrier.enter()));
            });
        }
    }
}

use crate::heap::shared_vars::SharedFlag;
use crate::sync::monitor::Monitor;

/// Cooperative yield point for marking workers. The embedder raises the
/// request (e.g. ahead of an evacuation pause); workers notice it at their
/// next clock check, abort the current step and park here between steps
/// until resumed. Workers are never suspended mid-step.
pub struct YieldSync {
    requested: SharedFlag,
    parked: Monitor<usize>,
}

impl YieldSync {
    pub fn new() -> Self {
        Self {
            requested: SharedFlag::new(),
            parked: Monitor::new(0),
        }
    }

    #[inline]
    pub fn should_yield(&self) -> bool {
        self.requested.is_set()
    }

    pub fn request_yield(&self) {
        self.requested.set();
    }

    pub fn resume(&self) {
        self.requested.unset();
        let g = self.parked.lock();
        drop(g);
        self.parked.notify_all();
    }

    /// Called by workers between completed marking steps.
    pub fn yield_if_requested(&self) {
        if !self.requested.is_set() {
            return;
        }
        let mut g = self.parked.lock();
        *g += 1;
        while self.requested.is_set() {
            g.wait();
        }
        *g -= 1;
    }

    /// Number of workers currently parked at the yield point.
    pub fn parked_workers(&self) -> usize {
        *self.parked.lock()
    }
}

impl Default for YieldSync {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_yield_and_resume() {
        let ys = YieldSync::new();
        assert!(!ys.should_yield());
        ys.request_yield();
        std::thread::scope(|s| {
            let h = s.spawn(|| ys.yield_if_requested());
            while ys.parked_workers() == 0 {
                std::thread::yield_now();
            }
            ys.resume();
            h.join().unwrap();
        });
        assert_eq!(ys.parked_workers(), 0);
    }

    #[test]
    fn test_no_request_is_a_noop() {
        let ys = YieldSync::new();
        ys.yield_if_requested();
    }
}

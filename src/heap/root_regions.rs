use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::heap::memory_region::MemRegion;
use crate::heap::shared_vars::SharedFlag;
use crate::sync::monitor::Monitor;

/// Regions enumerated as roots during the pause that starts a cycle. They
/// must be fully scanned before region-by-region marking can be trusted, so
/// workers claim them one at a time off an atomic index until exhaustion.
pub struct RootRegions {
    regions: Mutex<Vec<MemRegion>>,
    claimed: AtomicUsize,
    num_regions: AtomicUsize,
    scan_state: Monitor<bool>,
    should_abort: SharedFlag,
}

impl RootRegions {
    pub fn new() -> Self {
        Self {
            regions: Mutex::new(Vec::new()),
            claimed: AtomicUsize::new(0),
            num_regions: AtomicUsize::new(0),
            scan_state: Monitor::new(false),
            should_abort: SharedFlag::new(),
        }
    }

    pub fn reset(&self) {
        debug_assert!(!self.scan_in_progress());
        self.regions.lock().clear();
        self.num_regions.store(0, Ordering::Relaxed);
        self.claimed.store(0, Ordering::Relaxed);
    }

    /// Registers a root region. Called during the pause only.
    pub fn add(&self, mr: MemRegion) {
        debug_assert!(!mr.is_empty());
        let mut regions = self.regions.lock();
        regions.push(mr);
        self.num_regions.store(regions.len(), Ordering::Relaxed);
    }

    pub fn num_root_regions(&self) -> usize {
        self.num_regions.load(Ordering::Relaxed)
    }

    pub fn prepare_for_scan(&self) {
        debug_assert!(!self.scan_in_progress());
        *self.scan_state.lock() = self.num_root_regions() > 0;
        self.claimed.store(0, Ordering::Relaxed);
        self.should_abort.unset();
    }

    /// Claims the next unscanned root region, or None when all are claimed
    /// or the scan is being aborted.
    pub fn claim_next(&self) -> Option<MemRegion> {
        if self.should_abort.is_set() {
            return None;
        }
        if self.claimed.load(Ordering::Relaxed) >= self.num_root_regions() {
            return None;
        }
        let idx = self.claimed.fetch_add(1, Ordering::Relaxed);
        self.regions.lock().get(idx).copied()
    }

    pub fn scan_in_progress(&self) -> bool {
        *self.scan_state.lock()
    }

    fn notify_scan_done(&self) {
        let mut g = self.scan_state.lock();
        *g = false;
        drop(g);
        self.scan_state.notify_all();
    }

    pub fn scan_finished(&self) {
        debug_assert!(self.scan_in_progress());
        if !self.should_abort.is_set() {
            debug_assert!(
                self.claimed.load(Ordering::Relaxed) >= self.num_root_regions(),
                "all root regions should have been claimed"
            );
        }
        self.notify_scan_done();
    }

    /// Forces claimants to bail out and wakes any waiter.
    pub fn cancel_scan(&self) {
        self.should_abort.set();
        self.notify_scan_done();
    }

    /// Blocks until the scan completes. Returns false if no scan was in
    /// progress to begin with.
    pub fn wait_until_scan_finished(&self) -> bool {
        if !self.scan_in_progress() {
            return false;
        }
        let mut g = self.scan_state.lock();
        while *g {
            g.wait();
        }
        true
    }
}

impl Default for RootRegions {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_claim_each_once() {
        let rr = RootRegions::new();
        for i in 0..3 {
            rr.add(MemRegion::new(0x1000 * (i + 1), 0x1000 * (i + 1) + 0x800));
        }
        rr.prepare_for_scan();
        assert!(rr.scan_in_progress());
        let mut claimed = Vec::new();
        while let Some(mr) = rr.claim_next() {
            claimed.push(mr.start());
        }
        assert_eq!(claimed.len(), 3);
        rr.scan_finished();
        assert!(!rr.scan_in_progress());
    }

    #[test]
    fn test_no_regions_means_no_scan() {
        let rr = RootRegions::new();
        rr.prepare_for_scan();
        assert!(!rr.scan_in_progress());
        assert!(!rr.wait_until_scan_finished());
    }

    #[test]
    fn test_cancel_blocks_claims() {
        let rr = RootRegions::new();
        rr.add(MemRegion::new(0x1000, 0x2000));
        rr.prepare_for_scan();
        rr.cancel_scan();
        assert!(rr.claim_next().is_none());
    }
}

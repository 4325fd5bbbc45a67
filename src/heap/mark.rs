use std::time::{Duration, Instant};

use crate::heap::concurrent_mark::ConcurrentMark;
use crate::heap::mark_stack::{EntryBuffer, EMPTY_BUFFER, ENTRIES_PER_CHUNK};
use crate::heap::memory_region::MemRegion;
use crate::heap::object_graph::ObjectGraph;
use crate::heap::region::HeapRegion;
use crate::heap::{Address, BYTES_PER_WORD};
use crate::heap::mark_stats::MarkStatsCache;
use crate::utils::log2_ceil;
use crate::utils::taskqueue::{TaskEntry, TaskQueue, TerminatorTerminator};

/// Per-worker marking task. `do_marking_step` is the re-entrant building
/// block of the whole marking phase: it is driven in a loop by the
/// concurrent workers, by the remark pause, and (with a huge time target)
/// wherever marking must run to exhaustion. A step aborts cooperatively at
/// clock checks; the fields below carry enough state (claimed region, local
/// finger, region limit) for the next invocation to resume where this one
/// stopped.
pub struct MarkingTask<'a> {
    worker_id: usize,
    cm: &'a ConcurrentMark,
    graph: &'a dyn ObjectGraph,
    task_queue: &'a TaskQueue,
    stats_cache: MarkStatsCache,

    /// Region this task currently owns, with the scan position inside it.
    curr_region: Option<u32>,
    finger: Address,
    region_limit: Address,

    // Work-based clock. The real limits are what recalculate_limits sets;
    // the active ones are lowered after expensive operations so the clock
    // fires early.
    words_scanned: usize,
    words_scanned_limit: usize,
    real_words_scanned_limit: usize,
    refs_reached: usize,
    refs_reached_limit: usize,
    real_refs_reached_limit: usize,

    step_start: Instant,
    time_target: Duration,

    has_aborted: bool,
    has_timed_out: bool,
    draining_satb_buffers: bool,

    calls: usize,
}

impl<'a> MarkingTask<'a> {
    pub fn new(worker_id: usize, cm: &'a ConcurrentMark, graph: &'a dyn ObjectGraph) -> Self {
        Self {
            worker_id,
            cm,
            graph,
            task_queue: cm.task_queue(worker_id),
            stats_cache: MarkStatsCache::new(cm.options().stats_cache_entries),
            curr_region: None,
            finger: 0,
            region_limit: 0,
            words_scanned: 0,
            words_scanned_limit: 0,
            real_words_scanned_limit: 0,
            refs_reached: 0,
            refs_reached_limit: 0,
            real_refs_reached_limit: 0,
            step_start: Instant::now(),
            time_target: Duration::ZERO,
            has_aborted: false,
            has_timed_out: false,
            draining_satb_buffers: false,
            calls: 0,
        }
    }

    #[inline]
    pub fn worker_id(&self) -> usize {
        self.worker_id
    }

    #[inline]
    pub fn has_aborted(&self) -> bool {
        self.has_aborted
    }

    #[inline]
    pub fn set_has_aborted(&mut self) {
        self.has_aborted = true;
    }

    pub fn calls(&self) -> usize {
        self.calls
    }

    /// Evicts the whole liveness cache into the shared per-region counters.
    /// Totals are only complete once every task has flushed.
    pub fn flush_mark_stats_cache(&mut self) -> (usize, usize) {
        self.stats_cache.evict_all(self.cm.live_data())
    }

    fn recalculate_limits(&mut self) {
        let opts = self.cm.options();
        self.real_words_scanned_limit = self.words_scanned + opts.words_scanned_period;
        self.words_scanned_limit = self.real_words_scanned_limit;
        self.real_refs_reached_limit = self.refs_reached + opts.refs_reached_period;
        self.refs_reached_limit = self.real_refs_reached_limit;
    }

    /// Called around infrequent, expensive operations (chunk transfers, SATB
    /// drains): lowers the active limits so the clock runs early.
    fn decrease_limits(&mut self) {
        let opts = self.cm.options();
        self.words_scanned_limit =
            self.real_words_scanned_limit - 3 * opts.words_scanned_period / 4;
        self.refs_reached_limit = self.real_refs_reached_limit - 3 * opts.refs_reached_period / 4;
    }

    #[inline]
    fn check_limits(&mut self) {
        if self.words_scanned >= self.words_scanned_limit
            || self.refs_reached >= self.refs_reached_limit
        {
            self.abort_marking_if_regular_check_fail();
        }
    }

    /// The periodic clock check. Returns false when the current step must
    /// abort. Outside the concurrent phase only the overflow flag matters.
    fn regular_clock_call(&mut self) -> bool {
        if self.has_aborted {
            return false;
        }
        self.recalculate_limits();

        let cm = self.cm;
        if cm.has_overflown() {
            return false;
        }
        if !cm.concurrent() {
            return true;
        }
        if cm.has_aborted() {
            return false;
        }
        if cm.yielding().should_yield() {
            return false;
        }
        if self.step_start.elapsed() > self.time_target {
            self.has_timed_out = true;
            return false;
        }
        if !self.draining_satb_buffers && cm.satb().process_completed_buffers() {
            return false;
        }
        true
    }

    fn abort_marking_if_regular_check_fail(&mut self) {
        if !self.has_aborted && !self.regular_clock_call() {
            self.set_has_aborted();
        }
    }

    fn setup_for_region(&mut self, region: &HeapRegion) {
        self.curr_region = Some(region.index());
        self.finger = region.bottom();
        self.update_region_limit();
    }

    fn update_region_limit(&mut self) {
        let Some(region_idx) = self.curr_region else {
            return;
        };
        let region = self.cm.regions().region(region_idx);
        let bottom = region.bottom();
        let limit = region.top_at_mark_start();
        if limit == bottom {
            // The region was emptied underneath our feet; park the finger at
            // bottom so the bitmap iteration is a no-op.
            self.finger = bottom;
        }
        self.region_limit = limit;
    }

    fn giveup_current_region(&mut self) {
        debug_assert!(self.curr_region.is_some());
        self.clear_region_fields();
    }

    pub(crate) fn clear_region_fields(&mut self) {
        self.curr_region = None;
        self.finger = 0;
        self.region_limit = 0;
    }

    #[inline]
    fn move_finger_to(&mut self, addr: Address) {
        debug_assert!(addr >= self.finger);
        self.finger = addr;
    }

    /// Decides whether a freshly marked object must be pushed, or whether
    /// the bitmap scan is guaranteed to come past it later. The local check
    /// against our own claimed region is tried first: it is more precise and
    /// saves pushes.
    fn is_below_finger(&self, obj: Address, global_finger: Address) -> bool {
        if self.curr_region.is_some() {
            if obj < self.finger {
                return true;
            }
            if obj < self.region_limit {
                return false;
            }
        }
        obj < global_finger
    }

    /// Grays `r`: idempotent bitmap mark; on the fresh mark, account
    /// liveness and push the object if it lies behind the scan wavefront.
    pub(crate) fn make_reference_grey(&mut self, r: Address) {
        let cm = self.cm;
        let Some(region) = cm.regions().region_containing(r) else {
            debug_assert!(false, "grey reference {:#x} outside the heap", r);
            return;
        };
        if region.obj_allocated_since_mark_start(r) {
            // Implicitly live this cycle.
            return;
        }
        if !cm.next_mark_bitmap().par_mark(r) {
            return;
        }
        let region_idx = region.index();
        let words = self.graph.size_in_words(r);
        self.stats_cache
            .add_live(cm.live_data(), region_idx, words, 1);

        let global_finger = cm.finger();
        if self.is_below_finger(r, global_finger) {
            self.push(TaskEntry::Obj(r));
        }
    }

    /// Pushes onto the local queue, spilling a chunk's worth of entries to
    /// the global stack when full.
    pub fn push(&mut self, entry: TaskEntry) {
        if !self.task_queue.push(entry) {
            self.move_entries_to_global_stack();
            let pushed = self.task_queue.push(entry);
            debug_assert!(pushed, "local queue must have room after a bulk move");
        }
    }

    fn move_entries_to_global_stack(&mut self) {
        let mut buffer: EntryBuffer = EMPTY_BUFFER;
        let mut n = 0;
        while n < ENTRIES_PER_CHUNK {
            match self.task_queue.pop_local(0) {
                Some(entry) => {
                    buffer[n] = Some(entry);
                    n += 1;
                }
                None => break,
            }
        }
        if n > 0 && !self.cm.mark_stack_push(&buffer) {
            // Overflow. The entries in `buffer` are dropped; the bitmap, not
            // the queues, is authoritative for rediscovery after restart.
            self.set_has_aborted();
        }
        self.decrease_limits();
    }

    fn get_entries_from_global_stack(&mut self) -> bool {
        let mut buffer: EntryBuffer = EMPTY_BUFFER;
        if !self.cm.mark_stack_pop(&mut buffer) {
            return false;
        }
        for slot in buffer.iter() {
            let Some(entry) = slot else { break };
            // Only called with a near-empty local queue, which is sized to
            // take a full chunk.
            let pushed = self.task_queue.push(*entry);
            debug_assert!(pushed);
        }
        self.decrease_limits();
        true
    }

    /// Processes local-queue entries down to a target size: partial draining
    /// keeps entries around for thieves, the final drain empties everything.
    fn drain_local_queue(&mut self, partially: bool) {
        if self.has_aborted {
            return;
        }
        let target = if partially {
            self.cm
                .options()
                .local_drain_target
                .min(self.task_queue.max_elems() / 3)
        } else {
            0
        };
        loop {
            if self.has_aborted {
                break;
            }
            match self.task_queue.pop_local(target) {
                Some(entry) => self.scan_task_entry(entry),
                None => break,
            }
        }
    }

    fn drain_global_stack(&mut self, partially: bool) {
        if self.has_aborted {
            return;
        }
        debug_assert!(partially || self.task_queue.is_empty());
        let cm = self.cm;
        if partially {
            let target = cm.partial_mark_stack_size_target();
            while !self.has_aborted && cm.mark_stack_size() > target {
                if self.get_entries_from_global_stack() {
                    self.drain_local_queue(partially);
                } else {
                    break;
                }
            }
        } else {
            while !self.has_aborted && self.get_entries_from_global_stack() {
                self.drain_local_queue(partially);
            }
        }
    }

    /// Consumes completed write-barrier log buffers, graying every recorded
    /// reference. The clock is told not to abort us for SATB backlog while
    /// we are the ones draining it.
    fn drain_satb_buffers(&mut self) {
        if self.has_aborted {
            return;
        }
        // Tell the clock we are the ones draining, so it does not abort us
        // for the very backlog we are working on.
        self.draining_satb_buffers = true;
        let cm = self.cm;
        while !self.has_aborted
            && cm.satb().apply_to_completed_buffer(&mut |obj| {
                self.refs_reached += 1;
                self.make_reference_grey(obj);
            })
        {
            self.abort_marking_if_regular_check_fail();
        }
        // No emptiness assert here: mutators may still be enqueueing, and a
        // racing task may hold the last buffer without having counted it.
        self.draining_satb_buffers = false;
        self.decrease_limits();
    }

    /// Scans one task entry: a whole object, or one slice of a large array.
    pub fn scan_task_entry(&mut self, entry: TaskEntry) {
        match entry {
            TaskEntry::Obj(obj) => {
                debug_assert!(self.cm.next_mark_bitmap().is_marked(obj));
                if self.graph.is_reference_array(obj)
                    && self.graph.reference_array_len(obj) > self.cm.options().array_slice_stride
                {
                    self.words_scanned += self.process_obj_array(obj);
                } else {
                    self.words_scanned += self.scan_object(obj);
                }
            }
            TaskEntry::Slice { obj, chunk, pow } => {
                self.words_scanned += self.process_slice(obj, chunk, pow);
            }
        }
        self.check_limits();
    }

    fn scan_object(&mut self, obj: Address) -> usize {
        let graph = self.graph;
        graph.visit_references(obj, &mut |r| {
            self.refs_reached += 1;
            self.make_reference_grey(r);
        });
        graph.size_in_words(obj)
    }

    /// First encounter of an oversized reference array: split off
    /// power-of-two chunks for other workers, keep the leftmost piece.
    fn process_obj_array(&mut self, obj: Address) -> usize {
        let len = self.graph.reference_array_len(obj);
        debug_assert!(len > 0);
        let pow = log2_ceil(len) as u8;
        self.split_and_scan_slice(obj, 1, pow, len)
    }

    fn process_slice(&mut self, obj: Address, chunk: u32, pow: u8) -> usize {
        let len = self.graph.reference_array_len(obj);
        self.split_and_scan_slice(obj, chunk, pow, len)
    }

    fn split_and_scan_slice(&mut self, obj: Address, mut chunk: u32, mut pow: u8, len: usize) -> usize {
        let stride = self.cm.options().array_slice_stride;
        while (1usize << pow) > stride {
            pow -= 1;
            self.push(TaskEntry::Slice {
                obj,
                chunk: 2 * chunk,
                pow,
            });
            chunk = 2 * chunk - 1;
        }
        let from = (((chunk as usize) - 1) << pow).min(len);
        let to = ((chunk as usize) << pow).min(len);
        self.scan_array_range(obj, from, to)
    }

    fn scan_array_range(&mut self, obj: Address, from: usize, to: usize) -> usize {
        if from >= to {
            return 0;
        }
        let graph = self.graph;
        graph.visit_array_slice(obj, from, to, &mut |r| {
            self.refs_reached += 1;
            self.make_reference_grey(r);
        });
        to - from
    }

    /// One bounded marking step. See the type-level comment; the caller
    /// retries while `has_aborted()` is set (and the cycle itself is not
    /// being abandoned).
    pub fn do_marking_step(&mut self, time_target: Duration, do_termination: bool, is_serial: bool) {
        self.step_start = Instant::now();
        self.time_target = time_target;

        // Stealing only makes sense together with the termination protocol,
        // and never when running serially.
        let do_stealing = do_termination && !is_serial;

        self.words_scanned = 0;
        self.refs_reached = 0;
        self.recalculate_limits();
        self.has_aborted = false;
        self.has_timed_out = false;
        self.draining_satb_buffers = false;
        self.calls += 1;

        let cm = self.cm;
        if cm.has_overflown() {
            // Restarted after a yield with the overflow still pending: abort
            // straight into the overflow protocol at the bottom.
            self.set_has_aborted();
        }

        // First the write-barrier log, then a partial drain of whatever is
        // already queued, keeping steal-able work available.
        self.drain_satb_buffers();
        self.drain_local_queue(true);
        self.drain_global_stack(true);

        loop {
            if !self.has_aborted && self.curr_region.is_some() {
                // Re-read the limit: it may have moved since we claimed the
                // region (or since the step that aborted half-way through).
                self.update_region_limit();
                let mr = MemRegion::new(self.finger, self.region_limit);
                if mr.is_empty() {
                    self.giveup_current_region();
                    self.abort_marking_if_regular_check_fail();
                } else {
                    let bitmap = cm.next_mark_bitmap();
                    let finished = bitmap.iterate(mr, |addr| {
                        debug_assert!(addr < cm.finger());
                        self.move_finger_to(addr);
                        self.scan_task_entry(TaskEntry::Obj(addr));
                        // Keep the queues short while scanning.
                        self.drain_local_queue(true);
                        self.drain_global_stack(true);
                        !self.has_aborted
                    });
                    if finished {
                        self.giveup_current_region();
                        self.abort_marking_if_regular_check_fail();
                    } else {
                        debug_assert!(self.has_aborted);
                        // The iteration stopped at the object under the local
                        // finger; skip past it so a resumed step does not
                        // scan it twice.
                        let new_finger =
                            self.finger + self.graph.size_in_words(self.finger) * BYTES_PER_WORD;
                        if new_finger >= self.region_limit {
                            self.giveup_current_region();
                        } else {
                            self.move_finger_to(new_finger);
                        }
                    }
                }
            }

            self.drain_local_queue(true);
            self.drain_global_stack(true);

            // claim_region() can return None while regions remain (a raced
            // claim, or an empty region), so out_of_regions() is what ends
            // the loop.
            while !self.has_aborted && self.curr_region.is_none() && !cm.out_of_regions() {
                if let Some(region) = cm.claim_region(self.worker_id) {
                    self.setup_for_region(region);
                }
                // Claiming can walk a long run of empty regions; keep the
                // clock ticking.
                self.abort_marking_if_regular_check_fail();
            }

            if self.has_aborted || self.curr_region.is_none() {
                break;
            }
        }

        if !self.has_aborted {
            debug_assert!(cm.out_of_regions());
            // Take more SATB work now so remark has less to do.
            self.drain_satb_buffers();
        }

        // No regions left for us; drain everything.
        self.drain_local_queue(false);
        self.drain_global_stack(false);

        if do_stealing && !self.has_aborted {
            debug_assert!(cm.out_of_regions() && self.task_queue.size() == 0);
            while !self.has_aborted {
                match cm.try_stealing(self.worker_id) {
                    Some(entry) => {
                        self.scan_task_entry(entry);
                        self.drain_local_queue(false);
                        self.drain_global_stack(false);
                    }
                    None => break,
                }
            }
        }

        if do_termination && !self.has_aborted {
            debug_assert!(cm.out_of_regions());
            debug_assert!(self.task_queue.size() == 0);
            let finished = is_serial || cm.terminator().offer_termination(self);
            if finished {
                // Everyone is done; the shared structures must be empty.
                debug_assert!(cm.mark_stack_is_empty());
                debug_assert!(!cm.has_overflown());
            } else {
                // New work appeared somewhere; abort so the caller retries.
                self.set_has_aborted();
            }
        }

        if self.has_aborted && cm.has_overflown() {
            // Global overflow: sync up with every other task, let the
            // coordinator reset the shared state, then resume. Two barriers
            // make the restart safe.
            if !is_serial {
                cm.enter_first_sync_barrier(self.worker_id);
                // Every task has stopped touching shared structures now.
            }

            self.clear_region_fields();
            self.flush_mark_stats_cache();

            if !is_serial {
                if cm.concurrent() && self.worker_id == 0 {
                    // During the concurrent phase the first worker resets the
                    // marking state; during remark the coordinator does it
                    // after the pause loop observes the overflow.
                    cm.reset_marking_for_restart();
                }
                cm.enter_second_sync_barrier(self.worker_id);
            }
        }
    }
}

impl TerminatorTerminator for MarkingTask<'_> {
    /// While waiting in the termination protocol: leave it if the clock
    /// demands an abort or if the global stack has work for us again.
    fn should_exit_termination(&mut self) -> bool {
        if !self.regular_clock_call() {
            return true;
        }
        !self.cm.mark_stack_is_empty() || self.has_aborted
    }
}

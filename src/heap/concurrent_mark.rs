use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use once_cell::sync::Lazy;
use scoped_thread_pool::Pool;

use crate::heap::bitmap::MarkBitmap;
use crate::heap::mark::MarkingTask;
use crate::heap::mark_stack::{EntryBuffer, MarkStack, ENTRIES_PER_CHUNK};
use crate::heap::mark_stats::RegionLiveData;
use crate::heap::memory_region::MemRegion;
use crate::heap::object_graph::ObjectGraph;
use crate::heap::region::{HeapRegion, RegionTable};
use crate::heap::root_regions::RootRegions;
use crate::heap::satb::SatbQueueSet;
use crate::heap::shared_vars::SharedFlag;
use crate::heap::{Address, BYTES_PER_WORD};
use crate::sync::barrier::WorkerBarrierSync;
use crate::sync::suspend::YieldSync;
use crate::utils::is_power_of_two;
use crate::utils::taskqueue::{TaskEntry, TaskQueue, TaskQueueSet, TaskTerminator};

static DEFAULT_WORKERS: Lazy<usize> = Lazy::new(num_cpus::get);

/// The STW remark phase runs marking steps with no time bound.
const REMARK_STEP_TARGET: Duration = Duration::MAX;

/// Tunables of the marking engine. The drain thresholds and clock periods
/// trade abort latency against per-object overhead; none of them affect
/// correctness.
#[derive(Clone, Debug)]
pub struct MarkingOptions {
    /// Worker threads in the marking gang.
    pub max_workers: usize,
    /// Per-worker queue ring size; power of two, and large enough to absorb
    /// a whole overflow-stack chunk on refill.
    pub task_queue_capacity: usize,
    /// Partial drains stop once the local queue is down to this many
    /// entries, keeping work around for thieves.
    pub local_drain_target: usize,
    /// Partial drains of the global stack stop at this many chunks.
    pub global_stack_partial_drain_target_chunks: usize,
    pub initial_chunk_capacity: usize,
    pub max_chunk_capacity: usize,
    /// Words scanned between clock checks.
    pub words_scanned_period: usize,
    /// References visited between clock checks.
    pub refs_reached_period: usize,
    /// Time budget of one concurrent marking step.
    pub step_time_target: Duration,
    pub satb_buffer_capacity: usize,
    /// Completed SATB buffers that trigger a drain-first abort.
    pub satb_process_threshold: usize,
    /// Reference arrays longer than this are scanned as chunked slice
    /// tasks; also the per-slice bound. Power of two.
    pub array_slice_stride: usize,
    /// Lines in each task's liveness stats cache. Power of two.
    pub stats_cache_entries: usize,
}

impl Default for MarkingOptions {
    fn default() -> Self {
        Self {
            max_workers: *DEFAULT_WORKERS,
            task_queue_capacity: 1 << 13,
            local_drain_target: 64,
            global_stack_partial_drain_target_chunks: 1,
            initial_chunk_capacity: 16,
            max_chunk_capacity: 1024,
            words_scanned_period: 12 * 1024,
            refs_reached_period: 1024,
            step_time_target: Duration::from_millis(10),
            satb_buffer_capacity: 1024,
            satb_process_threshold: 4,
            array_slice_stride: 512,
            stats_cache_entries: 1024,
        }
    }
}

/// Fatal condition: the overflow stack is at its hard maximum and a full
/// restart made no forward progress. The embedder must abort the cycle the
/// way it would handle an out-of-memory condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MarkStackExhausted;

impl fmt::Display for MarkStackExhausted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "mark stack at maximum capacity with no marking progress"
        )
    }
}

impl std::error::Error for MarkStackExhausted {}

/// The concurrent marking orchestrator. Owns every piece of shared marking
/// state — the finger, the bitmaps, the global overflow stack, the queue
/// set, the termination detector, the restart barriers, the SATB log and the
/// per-region liveness counters — and drives worker gangs across the phases
/// of a cycle:
///
/// 1. `pre_concurrent_start` / root registration / `post_concurrent_mark_start`
///    during the initial pause,
/// 2. `scan_root_regions` and `mark_from_roots` concurrently with mutators,
/// 3. `finalize_marking` at the remark pause, restarting internally if the
///    overflow stack fills up,
/// 4. `cleanup_for_next_mark` to ready the next cycle's bitmap.
pub struct ConcurrentMark {
    options: MarkingOptions,
    regions: RegionTable,

    bitmaps: [MarkBitmap; 2],
    next_bitmap_idx: AtomicUsize,

    global_mark_stack: MarkStack,
    /// Claimed/unclaimed boundary; CAS-advanced one region at a time and
    /// monotonically non-decreasing within a discovery pass.
    finger: AtomicUsize,

    task_queues: TaskQueueSet,
    terminator: TaskTerminator,

    first_overflow_barrier: WorkerBarrierSync,
    second_overflow_barrier: WorkerBarrierSync,

    has_overflown_flag: SharedFlag,
    concurrent_flag: SharedFlag,
    has_aborted_flag: SharedFlag,

    satb: SatbQueueSet,
    root_regions: RootRegions,
    live_data: Box<[RegionLiveData]>,
    yield_sync: YieldSync,

    workers: Pool,
    num_active_tasks: AtomicUsize,
    restarts: AtomicUsize,
}

impl ConcurrentMark {
    pub fn new(regions: RegionTable, options: MarkingOptions) -> Self {
        assert!(options.max_workers > 0);
        assert!(is_power_of_two(options.task_queue_capacity));
        assert!(
            options.task_queue_capacity >= 2 * (ENTRIES_PER_CHUNK + 1),
            "task queues must absorb a full overflow chunk"
        );
        assert!(is_power_of_two(options.array_slice_stride));
        assert!(is_power_of_two(options.stats_cache_entries));

        let heap_start = regions.heap_start();
        let heap_bytes = regions.heap_bytes();
        let num_regions = regions.num_regions();

        let this = Self {
            bitmaps: [
                MarkBitmap::new(heap_start, heap_bytes),
                MarkBitmap::new(heap_start, heap_bytes),
            ],
            next_bitmap_idx: AtomicUsize::new(0),
            global_mark_stack: MarkStack::new(
                options.initial_chunk_capacity,
                options.max_chunk_capacity,
            ),
            finger: AtomicUsize::new(heap_start),
            task_queues: TaskQueueSet::new(options.max_workers, options.task_queue_capacity),
            terminator: TaskTerminator::new(options.max_workers),
            first_overflow_barrier: WorkerBarrierSync::new(),
            second_overflow_barrier: WorkerBarrierSync::new(),
            has_overflown_flag: SharedFlag::new(),
            concurrent_flag: SharedFlag::new(),
            has_aborted_flag: SharedFlag::new(),
            satb: SatbQueueSet::new(
                options.satb_buffer_capacity,
                options.satb_process_threshold,
            ),
            root_regions: RootRegions::new(),
            live_data: (0..num_regions).map(|_| RegionLiveData::new()).collect(),
            yield_sync: YieldSync::new(),
            workers: Pool::new(options.max_workers),
            num_active_tasks: AtomicUsize::new(0),
            restarts: AtomicUsize::new(0),
            regions,
            options,
        };
        this.reset_at_marking_complete();
        this
    }

    // --- accessors -------------------------------------------------------

    #[inline]
    pub fn options(&self) -> &MarkingOptions {
        &self.options
    }

    #[inline]
    pub fn regions(&self) -> &RegionTable {
        &self.regions
    }

    #[inline]
    pub fn next_mark_bitmap(&self) -> &MarkBitmap {
        &self.bitmaps[self.next_bitmap_idx.load(Ordering::Acquire)]
    }

    #[inline]
    pub fn prev_mark_bitmap(&self) -> &MarkBitmap {
        &self.bitmaps[self.next_bitmap_idx.load(Ordering::Acquire) ^ 1]
    }

    #[inline]
    pub fn satb(&self) -> &SatbQueueSet {
        &self.satb
    }

    #[inline]
    pub fn root_regions(&self) -> &RootRegions {
        &self.root_regions
    }

    #[inline]
    pub fn yielding(&self) -> &YieldSync {
        &self.yield_sync
    }

    #[inline]
    pub(crate) fn terminator(&self) -> &TaskTerminator {
        &self.terminator
    }

    #[inline]
    pub(crate) fn live_data(&self) -> &[RegionLiveData] {
        &self.live_data
    }

    #[inline]
    pub(crate) fn task_queue(&self, worker_id: usize) -> &TaskQueue {
        self.task_queues.queue(worker_id)
    }

    #[inline]
    pub fn task_queues(&self) -> &TaskQueueSet {
        &self.task_queues
    }

    #[inline]
    pub fn global_mark_stack(&self) -> &MarkStack {
        &self.global_mark_stack
    }

    #[inline]
    pub fn finger(&self) -> Address {
        self.finger.load(Ordering::Acquire)
    }

    #[inline]
    pub fn concurrent(&self) -> bool {
        self.concurrent_flag.is_set()
    }

    #[inline]
    pub fn has_overflown(&self) -> bool {
        self.has_overflown_flag.is_set()
    }

    pub(crate) fn set_has_overflown(&self) {
        self.has_overflown_flag.set();
    }

    /// True once the cycle has been abandoned for a full-GC takeover.
    #[inline]
    pub fn has_aborted(&self) -> bool {
        self.has_aborted_flag.is_set()
    }

    /// Overflow restarts performed so far in this cycle.
    pub fn restarts(&self) -> usize {
        self.restarts.load(Ordering::Relaxed)
    }

    pub fn num_workers(&self) -> usize {
        self.options.max_workers
    }

    // --- liveness queries ------------------------------------------------

    pub fn live_words(&self, region_index: u32) -> usize {
        self.live_data[region_index as usize].live_words()
    }

    pub fn live_bytes(&self, region_index: u32) -> usize {
        self.live_words(region_index) * BYTES_PER_WORD
    }

    pub fn live_objects(&self, region_index: u32) -> usize {
        self.live_data[region_index as usize].live_objs()
    }

    pub fn total_live_words(&self) -> usize {
        self.live_data.iter().map(|d| d.live_words()).sum()
    }

    pub fn total_live_objects(&self) -> usize {
        self.live_data.iter().map(|d| d.live_objs()).sum()
    }

    // --- global mark stack ----------------------------------------------

    pub(crate) fn mark_stack_push(&self, buffer: &EntryBuffer) -> bool {
        if !self.global_mark_stack.par_push_chunk(buffer) {
            self.set_has_overflown();
            log::debug!(target: "gc-marking", "global mark stack overflow");
            return false;
        }
        true
    }

    pub(crate) fn mark_stack_pop(&self, buffer: &mut EntryBuffer) -> bool {
        self.global_mark_stack.par_pop_chunk(buffer)
    }

    /// Entry estimate of the global stack contents.
    pub fn mark_stack_size(&self) -> usize {
        self.global_mark_stack.size_in_entries()
    }

    pub fn mark_stack_is_empty(&self) -> bool {
        self.global_mark_stack.is_empty()
    }

    pub(crate) fn partial_mark_stack_size_target(&self) -> usize {
        self.options.global_stack_partial_drain_target_chunks * ENTRIES_PER_CHUNK
    }

    // --- region claiming -------------------------------------------------

    #[inline]
    pub fn out_of_regions(&self) -> bool {
        self.finger() >= self.regions.heap_end()
    }

    /// Claims the region under the finger by CAS-advancing the finger to the
    /// region's end. None means this particular attempt lost the race or hit
    /// an empty region; the caller must consult out_of_regions() before
    /// concluding the heap is exhausted.
    pub fn claim_region(&self, worker_id: usize) -> Option<&HeapRegion> {
        let mut finger = self.finger();
        let heap_end = self.regions.heap_end();

        while finger < heap_end {
            let curr_region = self.regions.region_containing(finger)?;
            let end = curr_region.end();

            match self
                .finger
                .compare_exchange(finger, end, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => {
                    let bottom = curr_region.bottom();
                    let limit = curr_region.top_at_mark_start();
                    if limit > bottom {
                        log::trace!(
                            target: "gc-marking",
                            "worker {} claimed region {}",
                            worker_id,
                            curr_region.index()
                        );
                        return Some(curr_region);
                    }
                    // Empty at mark start; the claim still consumed it.
                    debug_assert!(limit == bottom);
                    return None;
                }
                Err(observed) => {
                    debug_assert!(observed > finger, "the finger only moves forward");
                    finger = observed;
                }
            }
        }
        None
    }

    pub fn try_stealing(&self, worker_id: usize) -> Option<TaskEntry> {
        self.task_queues.steal(worker_id)
    }

    // --- cycle lifecycle -------------------------------------------------

    /// Resets every marking data structure for a fresh discovery pass:
    /// finger to the heap bottom, queues and overflow stack emptied, liveness
    /// counters and root regions cleared. Requires quiescent workers.
    pub fn reset(&self) {
        self.reset_marking_for_restart();
        for data in self.live_data.iter() {
            data.clear();
        }
        self.root_regions.reset();
    }

    /// Readies the engine for a new cycle. Part of the pause that starts the
    /// cycle.
    pub fn pre_concurrent_start(&self) {
        self.has_aborted_flag.unset();
        self.restarts.store(0, Ordering::Relaxed);
        self.reset();
    }

    /// Arms the write barrier and the root region scan. The tail end of the
    /// pause that starts the cycle.
    pub fn post_concurrent_mark_start(&self) {
        self.satb.set_active_all_threads(true);
        self.root_regions.prepare_for_scan();
    }

    /// Shared-state reset used both at cycle start and between the two
    /// overflow barriers. Requires every worker to be quiescent.
    pub(crate) fn reset_marking_for_restart(&self) {
        self.global_mark_stack.set_empty();
        if self.has_overflown() {
            self.global_mark_stack.expand();
            self.restarts.fetch_add(1, Ordering::Relaxed);
            log::info!(
                target: "gc-marking",
                "marking reset for overflow, restart {}",
                self.restarts()
            );
        }
        self.has_overflown_flag.unset();
        self.finger
            .store(self.regions.heap_start(), Ordering::Release);
        self.task_queues.set_empty_all();
        // Shared per-region live data is kept: it was recorded when objects
        // were freshly marked, and marks survive the restart.
    }

    fn reset_at_marking_complete(&self) {
        self.reset_marking_for_restart();
        self.num_active_tasks.store(0, Ordering::Relaxed);
    }

    pub fn set_concurrency(&self, active_tasks: usize) {
        debug_assert!(active_tasks <= self.options.max_workers);
        self.num_active_tasks.store(active_tasks, Ordering::Relaxed);
        self.terminator.reset_for_reuse(active_tasks);
        self.first_overflow_barrier.set_n_workers(active_tasks);
        self.second_overflow_barrier.set_n_workers(active_tasks);
    }

    /// Workers the next gang will run with: whatever `set_concurrency`
    /// installed, or the full pool after a completed cycle reset it to zero.
    fn active_workers(&self) -> usize {
        match self.num_active_tasks.load(Ordering::Relaxed) {
            0 => self.options.max_workers,
            n => n,
        }
    }

    fn set_concurrency_and_phase(&self, active_tasks: usize, concurrent: bool) {
        self.set_concurrency(active_tasks);
        if concurrent {
            self.concurrent_flag.set();
        } else {
            self.concurrent_flag.unset();
        }
    }

    pub(crate) fn enter_first_sync_barrier(&self, worker_id: usize) {
        log::trace!(target: "gc-marking", "worker {} at first overflow barrier", worker_id);
        // An aborted barrier means the whole cycle is being abandoned; the
        // caller just unwinds with its abort flag still set.
        let _ = self.first_overflow_barrier.enter();
    }

    pub(crate) fn enter_second_sync_barrier(&self, worker_id: usize) {
        log::trace!(target: "gc-marking", "worker {} at second overflow barrier", worker_id);
        let _ = self.second_overflow_barrier.enter();
    }

    // --- root marking ----------------------------------------------------

    /// Marks a root object found during the initial pause. Not pushed: the
    /// finger starts at the heap bottom, so the region scan will come past
    /// every marked root.
    pub fn mark_root(&self, graph: &dyn ObjectGraph, obj: Address) -> bool {
        let Some(region) = self.regions.region_containing(obj) else {
            debug_assert!(false, "root {:#x} outside the heap", obj);
            return false;
        };
        if region.obj_allocated_since_mark_start(obj) {
            return false;
        }
        if !self.next_mark_bitmap().par_mark(obj) {
            return false;
        }
        self.live_data[region.index() as usize].add(graph.size_in_words(obj), 1);
        true
    }

    /// Walks the objects of one root region and greys everything they point
    /// at. The objects themselves sit above this cycle's top-at-mark-start
    /// and stay implicitly live.
    pub fn scan_root_region(&self, graph: &dyn ObjectGraph, mr: MemRegion, worker_id: usize) {
        let mut cur = mr.start();
        while cur < mr.end() {
            graph.visit_references(cur, &mut |r| {
                self.mark_root(graph, r);
            });
            cur += graph.size_in_words(cur) * BYTES_PER_WORD;
        }
        log::trace!(
            target: "gc-marking",
            "worker {} scanned root region {:#x}..{:#x}",
            worker_id,
            mr.start(),
            mr.end()
        );
    }

    /// Scans all registered root regions to completion. Must finish before
    /// ordinary region-by-region marking can be trusted, and before the next
    /// pause (which waits via `root_regions().wait_until_scan_finished()`).
    pub fn scan_root_regions(&self, graph: &dyn ObjectGraph) {
        if !self.root_regions.scan_in_progress() {
            return;
        }
        debug_assert!(!self.has_aborted());
        let n_workers = self
            .active_workers()
            .min(self.root_regions.num_root_regions())
            .max(1);
        log::debug!(
            target: "gc-marking",
            "root region scan using {} workers for {} regions",
            n_workers,
            self.root_regions.num_root_regions()
        );
        self.workers.scoped(|scope| {
            for worker_id in 0..n_workers {
                scope.execute(move || {
                    while let Some(mr) = self.root_regions.claim_next() {
                        self.scan_root_region(graph, mr, worker_id);
                    }
                });
            }
        });
        self.root_regions.scan_finished();
    }

    // --- the concurrent phase -------------------------------------------

    /// Drives the worker gang through concurrent marking until natural
    /// completion or cancellation. Overflow restarts happen internally,
    /// behind the two barriers.
    pub fn mark_from_roots(&self, graph: &dyn ObjectGraph) {
        let active_workers = self.active_workers();
        self.set_concurrency_and_phase(active_workers, true);
        log::info!(
            target: "gc-marking",
            "using {} workers for concurrent marking",
            active_workers
        );

        self.workers.scoped(|scope| {
            for worker_id in 0..active_workers {
                scope.execute(move || {
                    let mut task = MarkingTask::new(worker_id, self, graph);
                    while !self.has_aborted() {
                        task.do_marking_step(self.options.step_time_target, true, false);
                        self.yield_sync.yield_if_requested();
                        if !task.has_aborted() {
                            break;
                        }
                    }
                    debug_assert!(!task.has_aborted() || self.has_aborted());
                    let (hits, misses) = task.flush_mark_stats_cache();
                    log::debug!(
                        target: "gc-stats",
                        "worker {}: {} marking steps, stats cache {} hits {} misses",
                        worker_id,
                        task.calls(),
                        hits,
                        misses
                    );
                });
            }
        });
    }

    // --- remark ----------------------------------------------------------

    /// The STW remark phase: flushes the write-barrier log and drains all
    /// marking structures to exhaustion. Mutators must be stopped. If the
    /// overflow stack fills even here, remark degrades to "reset and redo
    /// discovery", looping until the closure completes — the bitmap makes
    /// rediscovery safe. Gives up only when the stack is at its hard
    /// maximum and a whole restart produced no new live words.
    pub fn finalize_marking(&self, graph: &dyn ObjectGraph) -> Result<(), MarkStackExhausted> {
        if self.has_aborted() {
            // Cancelled cycle; nothing to finalize.
            return Ok(());
        }

        let mut last_live_words = self.total_live_words();
        loop {
            self.satb.flush_all_queues();
            let active_workers = self.active_workers();
            self.set_concurrency_and_phase(active_workers, false);

            self.workers.scoped(|scope| {
                for worker_id in 0..active_workers {
                    scope.execute(move || {
                        let mut task = MarkingTask::new(worker_id, self, graph);
                        loop {
                            task.do_marking_step(REMARK_STEP_TARGET, true, false);
                            if !(task.has_aborted() && !self.has_overflown()) {
                                break;
                            }
                        }
                        task.flush_mark_stats_cache();
                    });
                }
            });

            if !self.has_overflown() {
                break;
            }

            let live_now = self.total_live_words();
            log::warn!(
                target: "gc-marking",
                "mark stack overflow during remark, restarting (capacity {} chunks)",
                self.global_mark_stack.capacity()
            );
            if self.global_mark_stack.at_max_capacity() && live_now == last_live_words {
                return Err(MarkStackExhausted);
            }
            last_live_words = live_now;
            self.reset_marking_for_restart();
        }

        debug_assert!(
            self.satb.completed_buffers_num() == 0,
            "remark must consume the whole write-barrier log"
        );
        self.satb.set_active_all_threads(false);
        self.swap_mark_bitmaps();
        self.reset_at_marking_complete();
        log::info!(
            target: "gc-marking",
            "marking finalized: {} live objects, {} live words, {} restarts",
            self.total_live_objects(),
            self.total_live_words(),
            self.restarts()
        );
        Ok(())
    }

    fn swap_mark_bitmaps(&self) {
        self.next_bitmap_idx.fetch_xor(1, Ordering::AcqRel);
    }

    /// Clears the (new) next bitmap for the coming cycle, yielding between
    /// regions if asked to.
    pub fn cleanup_for_next_mark(&self) {
        let bitmap = self.next_mark_bitmap();
        for region in self.regions.iter() {
            bitmap.clear_range(MemRegion::new(region.bottom(), region.end()));
            self.yield_sync.yield_if_requested();
        }
    }

    /// Abandons the cycle for a full-GC takeover. Cooperative: workers
    /// observe the flag at their next clock check and unwind; barriers and
    /// the root scan are aborted so nobody waits forever. Partial marking
    /// state is discarded.
    pub fn concurrent_cycle_abort(&self) {
        if self.has_aborted() {
            return;
        }
        self.has_aborted_flag.set();
        self.first_overflow_barrier.abort();
        self.second_overflow_barrier.abort();
        if self.root_regions.scan_in_progress() {
            self.root_regions.cancel_scan();
        }
        self.yield_sync.resume();
        self.satb.abandon_partial_marking();
        self.satb.set_active_all_threads(false);
        log::info!(target: "gc-marking", "concurrent mark abort");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_table() -> RegionTable {
        RegionTable::new(0x1000_0000, 1024, 8)
    }

    fn small_options() -> MarkingOptions {
        MarkingOptions {
            max_workers: 2,
            ..Default::default()
        }
    }

    #[test]
    fn test_claim_region_advances_finger() {
        let cm = ConcurrentMark::new(small_table(), small_options());
        cm.pre_concurrent_start();
        // Mark every region non-empty at mark start.
        for r in cm.regions().iter() {
            r.set_top_at_mark_start(r.end());
        }
        let first = cm.claim_region(0).expect("first region");
        assert_eq!(first.index(), 0);
        let second = cm.claim_region(0).expect("second region");
        assert_eq!(second.index(), 1);
        assert!(!cm.out_of_regions());
    }

    #[test]
    fn test_claim_skips_consumed_empty_region() {
        let cm = ConcurrentMark::new(small_table(), small_options());
        cm.pre_concurrent_start();
        // Region 0 stays empty (tams == bottom), region 1 has contents.
        let r1 = cm.regions().region(1);
        r1.set_top_at_mark_start(r1.end());
        assert!(cm.claim_region(0).is_none());
        let claimed = cm.claim_region(0).expect("region 1");
        assert_eq!(claimed.index(), 1);
    }

    #[test]
    fn test_out_of_regions_after_all_claimed() {
        let cm = ConcurrentMark::new(small_table(), small_options());
        cm.pre_concurrent_start();
        while !cm.out_of_regions() {
            let _ = cm.claim_region(0);
        }
        assert!(cm.claim_region(0).is_none());
        assert!(cm.out_of_regions());
    }
}

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crossbeam_queue::SegQueue;
use parking_lot::Mutex;
use thread_local::ThreadLocal;

use crate::heap::Address;

/// Per-mutator-thread write-barrier buffer.
struct SatbQueue {
    buf: Vec<Address>,
    active: bool,
}

impl SatbQueue {
    fn new(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
            active: false,
        }
    }
}

/// The snapshot-at-the-beginning log. Mutator threads enqueue the old value
/// of every overwritten reference while marking is active; full buffers move
/// onto a shared completed list that marking tasks drain. Everything recorded
/// here was reachable when the cycle started, so graying it preserves the
/// snapshot invariant.
pub struct SatbQueueSet {
    queues: ThreadLocal<Mutex<SatbQueue>>,
    completed: SegQueue<Vec<Address>>,
    buffer_capacity: usize,
    process_threshold: AtomicUsize,
    all_active: AtomicBool,
}

impl SatbQueueSet {
    pub fn new(buffer_capacity: usize, process_threshold: usize) -> Self {
        assert!(buffer_capacity > 0);
        Self {
            queues: ThreadLocal::new(),
            completed: SegQueue::new(),
            buffer_capacity,
            process_threshold: AtomicUsize::new(process_threshold),
            all_active: AtomicBool::new(false),
        }
    }

    pub fn buffer_capacity(&self) -> usize {
        self.buffer_capacity
    }

    pub fn is_active(&self) -> bool {
        self.all_active.load(Ordering::Acquire)
    }

    /// Flips the barrier for every thread. Called at the pauses that start
    /// and finish a marking cycle.
    pub fn set_active_all_threads(&self, active: bool) {
        self.all_active.store(active, Ordering::Release);
        for q in self.queues.iter() {
            let mut q = q.lock();
            debug_assert!(!active || q.buf.is_empty(), "queues should be empty when activated");
            q.active = active;
        }
    }

    /// Mutator-side entry point. Cheap no-op while marking is inactive.
    pub fn enqueue(&self, obj: Address) {
        if !self.is_active() {
            return;
        }
        let q = self
            .queues
            .get_or(|| Mutex::new(SatbQueue::new(self.buffer_capacity)));
        let mut q = q.lock();
        if !q.active {
            // Raced with activation; adopt the global state.
            q.active = self.is_active();
            if !q.active {
                return;
            }
        }
        q.buf.push(obj);
        if q.buf.len() >= self.buffer_capacity {
            let full = std::mem::replace(&mut q.buf, Vec::with_capacity(self.buffer_capacity));
            self.completed.push(full);
        }
    }

    /// Racy count, good enough for the backlog heuristic.
    pub fn completed_buffers_num(&self) -> usize {
        self.completed.len()
    }

    /// True when enough completed buffers have piled up that marking tasks
    /// should interrupt scanning and drain them.
    pub fn process_completed_buffers(&self) -> bool {
        self.completed.len() >= self.process_threshold.load(Ordering::Relaxed)
    }

    pub fn set_process_threshold(&self, threshold: usize) {
        self.process_threshold.store(threshold, Ordering::Relaxed);
    }

    /// Claims one completed buffer and applies `cl` to each entry. Returns
    /// false when no completed buffer was available.
    pub fn apply_to_completed_buffer(&self, cl: &mut dyn FnMut(Address)) -> bool {
        match self.completed.pop() {
            Some(buffer) => {
                for entry in buffer {
                    cl(entry);
                }
                true
            }
            None => false,
        }
    }

    /// Moves every thread's partial buffer onto the completed list. Used by
    /// the remark pause, where all logged entries must be visible.
    pub fn flush_all_queues(&self) {
        for q in self.queues.iter() {
            let mut q = q.lock();
            if !q.buf.is_empty() {
                let partial =
                    std::mem::replace(&mut q.buf, Vec::with_capacity(self.buffer_capacity));
                self.completed.push(partial);
            }
        }
    }

    /// Throws away all recorded entries, completed and partial. Only valid
    /// once the cycle itself has been abandoned.
    pub fn abandon_partial_marking(&self) {
        while self.completed.pop().is_some() {}
        for q in self.queues.iter() {
            q.lock().buf.clear();
        }
    }
}

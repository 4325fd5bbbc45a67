use std::{
    cell::{Cell, UnsafeCell},
    mem::MaybeUninit,
    sync::atomic::{AtomicU64, AtomicUsize, Ordering},
    thread,
    time::Duration,
};

use rand::Rng;

use crate::heap::Address;
use crate::utils::is_power_of_two;

/// A unit of marking work. Either a plain heap object, or one power-of-two
/// chunk of a large reference array (`chunk` is 1-based, the chunk covers
/// indices `[(chunk - 1) << pow, chunk << pow)`).
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum TaskEntry {
    Obj(Address),
    Slice { obj: Address, chunk: u32, pow: u8 },
}

impl TaskEntry {
    #[inline]
    pub const fn obj(&self) -> Address {
        match *self {
            TaskEntry::Obj(obj) => obj,
            TaskEntry::Slice { obj, .. } => obj,
        }
    }

    #[inline]
    pub const fn is_slice(&self) -> bool {
        matches!(*self, TaskEntry::Slice { .. })
    }
}

pub enum PopResult<T> {
    Empty,
    Contended,
    Success(T),
}

// (top, tag) pair packed into one CAS-able word. The tag is bumped whenever
// the queue logically empties so a stale pop_global cannot claim a slot that
// has since been reused.
#[inline(always)]
const fn make_age(top: u32, tag: u32) -> u64 {
    ((tag as u64) << 32) | top as u64
}

#[inline(always)]
const fn age_top(age: u64) -> u32 {
    age as u32
}

#[inline(always)]
const fn age_tag(age: u64) -> u32 {
    (age >> 32) as u32
}

/// Bounded work-stealing deque in the Arora-Blumofe-Plaxton style, with
/// wrap-around over a fixed power-of-two ring.
///
/// The owner pushes and pops at `bottom`; thieves pop at `top` (kept inside
/// the age word together with its tag). All operations are non-blocking. At
/// most `capacity - 2` elements are admitted so that a full queue can be
/// distinguished from the underflow produced by a racing pop_local/pop_global
/// pair.
pub struct TaskQueue {
    bottom: AtomicUsize,
    age: AtomicU64,
    elems: Box<[UnsafeCell<MaybeUninit<TaskEntry>>]>,
    mask: usize,
    // Owner-only steal bookkeeping.
    last_stolen: Cell<usize>,
}

// Thieves only touch `bottom`, `age` and read slots that the algorithm
// guarantees are not concurrently written; `last_stolen` is owner-only.
unsafe impl Send for TaskQueue {}
unsafe impl Sync for TaskQueue {}

impl TaskQueue {
    pub const INVALID_QUEUE_ID: usize = usize::MAX;

    pub fn new(capacity: usize) -> Self {
        assert!(is_power_of_two(capacity), "queue capacity must be a power of two");
        let elems = (0..capacity)
            .map(|_| UnsafeCell::new(MaybeUninit::uninit()))
            .collect::<Box<[_]>>();
        Self {
            bottom: AtomicUsize::new(0),
            age: AtomicU64::new(0),
            elems,
            mask: capacity - 1,
            last_stolen: Cell::new(Self::INVALID_QUEUE_ID),
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.mask + 1
    }

    /// Two less than the ring size, see the type-level comment.
    #[inline]
    pub fn max_elems(&self) -> usize {
        self.capacity() - 2
    }

    #[inline]
    fn increment_index(&self, ind: usize) -> usize {
        (ind + 1) & self.mask
    }

    #[inline]
    fn decrement_index(&self, ind: usize) -> usize {
        ind.wrapping_sub(1) & self.mask
    }

    #[inline]
    fn dirty_size(&self, bot: usize, top: usize) -> usize {
        bot.wrapping_sub(top) & self.mask
    }

    // A dirty size of capacity - 1 can only be the leftover of a pop_local
    // racing a pop_global on a single-element queue; both sides see it as
    // empty and the owner later restores the canonical representation.
    #[inline]
    fn clean_size(&self, bot: usize, top: usize) -> usize {
        let sz = self.dirty_size(bot, top);
        if sz == self.capacity() - 1 {
            0
        } else {
            sz
        }
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.clean_size(
            self.bottom.load(Ordering::Relaxed),
            age_top(self.age.load(Ordering::Relaxed)) as usize,
        )
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Owner-only. Valid only while no concurrent pushers or thieves exist.
    pub fn set_empty(&self) {
        self.bottom.store(0, Ordering::Relaxed);
        self.age.store(0, Ordering::Relaxed);
    }

    #[inline]
    unsafe fn write_elem(&self, index: usize, t: TaskEntry) {
        (*self.elems[index].get()).write(t);
    }

    #[inline]
    unsafe fn read_elem(&self, index: usize) -> TaskEntry {
        (*self.elems[index].get()).assume_init()
    }

    /// Owner-only. Returns false when the queue is full.
    pub fn push(&self, t: TaskEntry) -> bool {
        let local_bot = self.bottom.load(Ordering::Relaxed);
        let top = age_top(self.age.load(Ordering::Relaxed)) as usize;
        let dirty_n_elems = self.dirty_size(local_bot, top);
        debug_assert!(dirty_n_elems <= self.max_elems(), "n_elems out of range");

        if dirty_n_elems < self.max_elems() {
            // SAFETY: the slot at bottom is outside the [top, bottom) window
            // every thief reads from; only the owner writes here.
            unsafe {
                self.write_elem(local_bot, t);
            }
            self.bottom
                .store(self.increment_index(local_bot), Ordering::Release);
            true
        } else {
            false
        }
    }

    /// Owner-only attempt to claim the last remaining element, competing
    /// against any concurrent pop_global. Either way the queue is logically
    /// empty afterwards, so install an age with a bumped tag.
    #[cold]
    fn pop_local_slow(&self, local_bot: usize, old_age: u64) -> bool {
        let new_age = make_age(local_bot as u32, age_tag(old_age) + 1);

        if local_bot == age_top(old_age) as usize {
            // No thief has incremented top yet; try to claim the element by
            // installing new_age ourselves.
            if self
                .age
                .compare_exchange(old_age, new_age, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                return true;
            }
        }

        // A competing pop_global won the element. Restore the canonical
        // empty-queue representation for this value of bottom.
        self.age.store(new_age, Ordering::Relaxed);
        false
    }

    /// Owner-only. Pops nothing unless more than `threshold` elements appear
    /// to be present.
    pub fn pop_local(&self, threshold: usize) -> Option<TaskEntry> {
        let mut local_bot = self.bottom.load(Ordering::Relaxed);
        let dirty_n_elems = self.dirty_size(
            local_bot,
            age_top(self.age.load(Ordering::Relaxed)) as usize,
        );

        if dirty_n_elems <= threshold {
            return None;
        }

        local_bot = self.decrement_index(local_bot);
        self.bottom.store(local_bot, Ordering::Relaxed);
        // The store to bottom must be visible before we examine the age word,
        // otherwise a thief and the owner could both claim the same slot.
        std::sync::atomic::fence(Ordering::SeqCst);

        // SAFETY: after publishing the decremented bottom, the slot is either
        // ours or contended for via pop_local_slow; nobody writes it.
        let t = unsafe { self.read_elem(local_bot) };
        let top = age_top(self.age.load(Ordering::Relaxed)) as usize;
        if self.clean_size(local_bot, top) > 0 {
            return Some(t);
        }
        if self.pop_local_slow(local_bot, self.age.load(Ordering::Relaxed)) {
            Some(t)
        } else {
            None
        }
    }

    /// Thief-side pop. Tolerates concurrent thieves and a concurrent owner.
    pub fn pop_global(&self) -> PopResult<TaskEntry> {
        let old_age = self.age.load(Ordering::Acquire);
        // bottom must not be read older than age on weakly ordered machines.
        std::sync::atomic::fence(Ordering::SeqCst);
        let local_bot = self.bottom.load(Ordering::Acquire);
        if self.clean_size(local_bot, age_top(old_age) as usize) == 0 {
            return PopResult::Empty;
        }

        // SAFETY: the slot at top is inside the window the owner does not
        // write; the age CAS below tells us whether our read was valid.
        let t = unsafe { self.read_elem(age_top(old_age) as usize) };
        let new_top = self.increment_index(age_top(old_age) as usize);
        let new_tag = age_tag(old_age) + u32::from(new_top == 0);
        let new_age = make_age(new_top as u32, new_tag);

        if self
            .age
            .compare_exchange(old_age, new_age, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
        {
            PopResult::Success(t)
        } else {
            PopResult::Contended
        }
    }

    fn last_stolen_queue_id(&self) -> usize {
        self.last_stolen.get()
    }

    fn set_last_stolen_queue_id(&self, id: usize) {
        self.last_stolen.set(id);
    }

    fn invalidate_last_stolen_queue_id(&self) {
        self.last_stolen.set(Self::INVALID_QUEUE_ID);
    }
}

/// One queue per worker; thieves go through the set.
pub struct TaskQueueSet {
    queues: Box<[TaskQueue]>,
}

impl TaskQueueSet {
    pub fn new(n: usize, capacity: usize) -> Self {
        Self {
            queues: (0..n).map(|_| TaskQueue::new(capacity)).collect(),
        }
    }

    #[inline]
    pub fn queue(&self, queue_num: usize) -> &TaskQueue {
        &self.queues[queue_num]
    }

    pub fn n_queues(&self) -> usize {
        self.queues.len()
    }

    pub fn total_size(&self) -> usize {
        self.queues.iter().map(|q| q.size()).sum()
    }

    pub fn set_empty_all(&self) {
        for q in self.queues.iter() {
            q.set_empty();
        }
    }

    /// Pick two victims, steal from the fuller one. Remembers the last
    /// successful victim, which tends to drain an imbalanced queue quickly.
    fn steal_best_of_2(&self, queue_num: usize) -> PopResult<TaskEntry> {
        let n = self.queues.len();
        let local = self.queue(queue_num);
        if n > 2 {
            let mut rng = rand::thread_rng();
            let mut k1 = local.last_stolen_queue_id();
            if k1 == TaskQueue::INVALID_QUEUE_ID {
                k1 = queue_num;
                while k1 == queue_num {
                    k1 = rng.gen_range(0..n);
                }
            }
            let mut k2 = queue_num;
            while k2 == queue_num || k2 == k1 {
                k2 = rng.gen_range(0..n);
            }

            let sel_k = if self.queue(k2).size() > self.queue(k1).size() {
                k2
            } else {
                k1
            };
            let res = self.queue(sel_k).pop_global();
            if matches!(res, PopResult::Success(_)) {
                local.set_last_stolen_queue_id(sel_k);
            } else {
                local.invalidate_last_stolen_queue_id();
            }
            res
        } else if n == 2 {
            self.queue((queue_num + 1) % 2).pop_global()
        } else {
            PopResult::Empty
        }
    }

    pub fn steal(&self, queue_num: usize) -> Option<TaskEntry> {
        for _ in 0..2 * self.queues.len() {
            if let PopResult::Success(t) = self.steal_best_of_2(queue_num) {
                return Some(t);
            }
        }
        None
    }
}

/// Implemented by marking tasks: consulted while a worker sits in the
/// termination protocol, to decide whether it should go back to work.
pub trait TerminatorTerminator {
    fn should_exit_termination(&mut self) -> bool;
}

/// Distributed termination detector. Idle workers announce themselves by
/// decrementing the counter; termination is reached once it hits zero. A
/// waiting worker that notices new work withdraws its announcement with a
/// CAS, racing safely against the (terminal) zero state.
pub struct TaskTerminator {
    n_workers: AtomicUsize,
    active: AtomicUsize,
}

impl TaskTerminator {
    pub fn new(n_workers: usize) -> Self {
        Self {
            n_workers: AtomicUsize::new(n_workers),
            active: AtomicUsize::new(n_workers),
        }
    }

    pub fn reset_for_reuse(&self, n_workers: usize) {
        self.n_workers.store(n_workers, Ordering::Relaxed);
        self.active.store(n_workers, Ordering::Relaxed);
    }

    pub fn offer_termination(&self, task: &mut dyn TerminatorTerminator) -> bool {
        if self.n_workers.load(Ordering::Relaxed) == 1 {
            return true;
        }

        if self.active.fetch_sub(1, Ordering::SeqCst) == 1 {
            // We were the last active worker.
            return true;
        }

        loop {
            if self.active.load(Ordering::SeqCst) == 0 {
                return true;
            }

            if task.should_exit_termination() {
                // Withdraw, unless termination went through in the meantime.
                let mut n = self.active.load(Ordering::SeqCst);
                loop {
                    if n == 0 {
                        return true;
                    }
                    match self.active.compare_exchange(
                        n,
                        n + 1,
                        Ordering::SeqCst,
                        Ordering::SeqCst,
                    ) {
                        Ok(_) => return false,
                        Err(observed) => n = observed,
                    }
                }
            }

            thread::sleep(Duration::from_micros(1));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Mutex;

    #[test]
    fn test_push_pop_local() {
        let q = TaskQueue::new(64);
        assert!(q.is_empty());
        for i in 0..32 {
            assert!(q.push(TaskEntry::Obj(i * 8)));
        }
        assert_eq!(q.size(), 32);
        // LIFO on the owner side.
        assert_eq!(q.pop_local(0), Some(TaskEntry::Obj(31 * 8)));
        assert_eq!(q.size(), 31);
        // Threshold keeps a tail for thieves.
        assert_eq!(q.pop_local(31), None);
    }

    #[test]
    fn test_bounded_capacity() {
        let q = TaskQueue::new(16);
        let mut accepted = 0;
        for i in 0..16 {
            if q.push(TaskEntry::Obj(i)) {
                accepted += 1;
            }
        }
        assert_eq!(accepted, q.max_elems());
    }

    #[test]
    fn test_pop_global_fifo() {
        let q = TaskQueue::new(64);
        q.push(TaskEntry::Obj(8));
        q.push(TaskEntry::Obj(16));
        match q.pop_global() {
            PopResult::Success(TaskEntry::Obj(a)) => assert_eq!(a, 8),
            _ => panic!("expected oldest element"),
        }
    }

    #[test]
    fn test_concurrent_steal_no_dup_no_loss() {
        let q = TaskQueue::new(1 << 10);
        let n = q.max_elems();
        for i in 0..n {
            assert!(q.push(TaskEntry::Obj(i)));
        }
        let seen = Mutex::new(HashSet::new());
        std::thread::scope(|s| {
            for _ in 0..3 {
                s.spawn(|| loop {
                    match q.pop_global() {
                        PopResult::Success(TaskEntry::Obj(v)) => {
                            assert!(seen.lock().unwrap().insert(v), "duplicate steal");
                        }
                        PopResult::Contended => continue,
                        PopResult::Empty => break,
                        _ => unreachable!(),
                    }
                });
            }
            s.spawn(|| {
                while let Some(TaskEntry::Obj(v)) = q.pop_local(0) {
                    assert!(seen.lock().unwrap().insert(v), "duplicate pop");
                }
            });
        });
        assert_eq!(seen.lock().unwrap().len(), n);
        assert!(q.is_empty());
    }

    struct NeverExit;
    impl TerminatorTerminator for NeverExit {
        fn should_exit_termination(&mut self) -> bool {
            false
        }
    }

    #[test]
    fn test_terminator_all_idle() {
        let t = TaskTerminator::new(4);
        std::thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| {
                    assert!(t.offer_termination(&mut NeverExit));
                });
            }
        });
    }

    #[test]
    fn test_terminator_single_worker() {
        let t = TaskTerminator::new(1);
        assert!(t.offer_termination(&mut NeverExit));
    }
}

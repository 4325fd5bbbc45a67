use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::utils::taskqueue::TaskEntry;

/// Entries per chunk; one slot's worth of space is left for the link so a
/// chunk stays within an 8 KiB allocation.
pub const ENTRIES_PER_CHUNK: usize = 512 - 1;

/// Chunk-sized transfer buffer. Unused trailing slots are None; no None hole
/// ever precedes a valid entry.
pub type EntryBuffer = [Option<TaskEntry>; ENTRIES_PER_CHUNK];

pub const EMPTY_BUFFER: EntryBuffer = [None; ENTRIES_PER_CHUNK];

const NO_CHUNK: u32 = u32::MAX;

#[derive(Clone)]
struct Chunk {
    next: u32,
    data: EntryBuffer,
}

impl Chunk {
    fn new() -> Self {
        Self {
            next: NO_CHUNK,
            data: EMPTY_BUFFER,
        }
    }
}

struct ChunkList {
    head: u32,
    count: usize,
}

/// Global overflow stack for marking work that does not fit into the
/// per-worker queues. Chunk-granular: workers only ever push or pop whole
/// chunks. Chunks live in one backing slab, handed out by a lock-free
/// high-water-mark bump allocator and recycled through a free list; the two
/// list heads are guarded by separate locks that are held only for the O(1)
/// splice, never while a chunk's contents are copied.
///
/// A chunk is exclusively owned by exactly one of: the free list, the chunk
/// list, or the single worker currently copying into/out of it. That
/// ownership protocol is what makes the interior mutability below sound.
pub struct MarkStack {
    base: UnsafeCell<Box<[Chunk]>>,
    capacity: AtomicUsize,
    max_capacity: usize,
    hwm: AtomicUsize,
    chunk_list: Mutex<ChunkList>,
    free_list: Mutex<u32>,
    chunks_in_list: AtomicUsize,
    pushes: AtomicUsize,
}

unsafe impl Send for MarkStack {}
unsafe impl Sync for MarkStack {}

fn allocate_slab(capacity: usize) -> Box<[Chunk]> {
    (0..capacity).map(|_| Chunk::new()).collect()
}

impl MarkStack {
    pub fn new(initial_capacity: usize, max_capacity: usize) -> Self {
        assert!(initial_capacity > 0 && initial_capacity <= max_capacity);
        Self {
            base: UnsafeCell::new(allocate_slab(initial_capacity)),
            capacity: AtomicUsize::new(initial_capacity),
            max_capacity,
            hwm: AtomicUsize::new(0),
            chunk_list: Mutex::new(ChunkList {
                head: NO_CHUNK,
                count: 0,
            }),
            free_list: Mutex::new(NO_CHUNK),
            chunks_in_list: AtomicUsize::new(0),
            pushes: AtomicUsize::new(0),
        }
    }

    /// Cumulative number of chunks ever pushed; cheap cycle diagnostics.
    pub fn pushed_chunks(&self) -> usize {
        self.pushes.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity.load(Ordering::Acquire)
    }

    #[inline]
    pub fn max_capacity(&self) -> usize {
        self.max_capacity
    }

    #[inline]
    pub fn at_max_capacity(&self) -> bool {
        self.capacity() == self.max_capacity
    }

    /// Number of populated chunks. Racy, used for drain heuristics.
    #[inline]
    pub fn size_in_chunks(&self) -> usize {
        self.chunks_in_list.load(Ordering::Relaxed)
    }

    /// Upper estimate of the number of stacked entries.
    #[inline]
    pub fn size_in_entries(&self) -> usize {
        self.size_in_chunks() * ENTRIES_PER_CHUNK
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.size_in_chunks() == 0
    }

    #[inline]
    fn chunk_ptr(&self, idx: u32) -> *mut Chunk {
        // SAFETY: idx came from the bump allocator or a list, so it is below
        // the slab length; the slab is only replaced while the stack is
        // provably idle (see expand()).
        unsafe { (*self.base.get()).as_ptr().cast_mut().add(idx as usize) }
    }

    fn remove_chunk_from_free_list(&self) -> Option<u32> {
        let mut head = self.free_list.lock();
        let result = *head;
        if result == NO_CHUNK {
            return None;
        }
        // SAFETY: the list head owns this chunk; we hold the list lock.
        *head = unsafe { (*self.chunk_ptr(result)).next };
        Some(result)
    }

    fn add_chunk_to_free_list(&self, idx: u32) {
        let mut head = self.free_list.lock();
        unsafe {
            (*self.chunk_ptr(idx)).next = *head;
        }
        *head = idx;
    }

    fn remove_chunk_from_chunk_list(&self) -> Option<u32> {
        let mut list = self.chunk_list.lock();
        let result = list.head;
        if result == NO_CHUNK {
            return None;
        }
        list.head = unsafe { (*self.chunk_ptr(result)).next };
        list.count -= 1;
        self.chunks_in_list.store(list.count, Ordering::Relaxed);
        Some(result)
    }

    fn add_chunk_to_chunk_list(&self, idx: u32) {
        let mut list = self.chunk_list.lock();
        unsafe {
            (*self.chunk_ptr(idx)).next = list.head;
        }
        list.head = idx;
        list.count += 1;
        self.chunks_in_list.store(list.count, Ordering::Relaxed);
    }

    fn allocate_new_chunk(&self) -> Option<u32> {
        // The dirty read is fine: hwm only grows in parallel code, and the
        // early test bounds it to capacity + #threads, avoiding wraparound.
        if self.hwm.load(Ordering::Relaxed) >= self.capacity() {
            return None;
        }
        let cur_idx = self.hwm.fetch_add(1, Ordering::Relaxed);
        if cur_idx >= self.capacity() {
            return None;
        }
        Some(cur_idx as u32)
    }

    /// Pushes one chunk's worth of entries. Returns false when neither the
    /// free list nor the backing slab can provide a chunk: the overflow
    /// signal.
    pub fn par_push_chunk(&self, entries: &EntryBuffer) -> bool {
        let idx = match self.remove_chunk_from_free_list() {
            Some(idx) => idx,
            None => match self.allocate_new_chunk() {
                Some(idx) => idx,
                None => return false,
            },
        };

        // SAFETY: the chunk is exclusively ours until it is spliced onto the
        // chunk list below; the copy happens outside any lock.
        unsafe {
            (*self.chunk_ptr(idx)).data = *entries;
        }
        self.add_chunk_to_chunk_list(idx);
        self.pushes.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Pops one chunk's worth of entries into `entries`. Returns false when
    /// the stack is empty.
    pub fn par_pop_chunk(&self, entries: &mut EntryBuffer) -> bool {
        let idx = match self.remove_chunk_from_chunk_list() {
            Some(idx) => idx,
            None => return false,
        };

        // SAFETY: exclusively ours between the two list splices.
        unsafe {
            *entries = (*self.chunk_ptr(idx)).data;
        }
        self.add_chunk_to_free_list(idx);
        true
    }

    /// Resets the stack to empty. Only valid while no concurrent pushers or
    /// poppers exist (cycle start, overflow restart).
    pub fn set_empty(&self) {
        let mut list = self.chunk_list.lock();
        list.head = NO_CHUNK;
        list.count = 0;
        self.chunks_in_list.store(0, Ordering::Relaxed);
        drop(list);
        *self.free_list.lock() = NO_CHUNK;
        self.hwm.store(0, Ordering::Relaxed);
    }

    /// Doubles the capacity, up to the hard maximum. Only valid while the
    /// stack is empty. Returns false when already at the maximum.
    pub fn expand(&self) -> bool {
        assert!(self.is_empty(), "only expand when the stack is empty");
        let old_capacity = self.capacity();
        if old_capacity == self.max_capacity {
            log::debug!(
                target: "gc-marking",
                "cannot expand overflow stack beyond {} chunks",
                old_capacity
            );
            return false;
        }
        let new_capacity = (old_capacity * 2).min(self.max_capacity);
        // SAFETY: emptiness plus the caller's quiescence contract mean no
        // other thread can touch the slab during the swap.
        unsafe {
            *self.base.get() = allocate_slab(new_capacity);
        }
        self.capacity.store(new_capacity, Ordering::Release);
        self.hwm.store(0, Ordering::Relaxed);
        log::debug!(
            target: "gc-marking",
            "expanded overflow stack from {} to {} chunks",
            old_capacity,
            new_capacity
        );
        true
    }
}

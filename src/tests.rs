//! End-to-end marking scenarios over a simulated word-addressed heap.

use std::collections::{HashMap, HashSet};

use rand::{Rng, SeedableRng};

use crate::heap::concurrent_mark::{ConcurrentMark, MarkingOptions};
use crate::heap::memory_region::MemRegion;
use crate::heap::object_graph::ObjectGraph;
use crate::heap::region::RegionTable;
use crate::heap::{Address, BYTES_PER_WORD};

const HEAP_BASE: Address = 0x4000_0000;

fn init_logs() {
    let _ = env_logger::builder().is_test(true).try_init();
}

struct TestObject {
    size_words: usize,
    refs: Vec<Address>,
    is_array: bool,
}

/// Bump-allocated fake heap: objects are records in a table, addresses are
/// real region-table addresses, and the marking engine sees it only through
/// the ObjectGraph trait.
struct TestHeap {
    region_words: usize,
    num_regions: usize,
    tops: Vec<Address>,
    objects: HashMap<Address, TestObject>,
}

impl TestHeap {
    fn new(num_regions: usize, region_words: usize) -> Self {
        let tops = (0..num_regions)
            .map(|i| HEAP_BASE + i * region_words * BYTES_PER_WORD)
            .collect();
        Self {
            region_words,
            num_regions,
            tops,
            objects: HashMap::new(),
        }
    }

    fn region_bottom(&self, region: usize) -> Address {
        HEAP_BASE + region * self.region_words * BYTES_PER_WORD
    }

    fn region_end(&self, region: usize) -> Address {
        self.region_bottom(region) + self.region_words * BYTES_PER_WORD
    }

    fn alloc_raw(&mut self, region: usize, size_words: usize, refs: Vec<Address>, is_array: bool) -> Address {
        assert!(size_words > 0);
        let addr = self.tops[region];
        assert!(
            addr + size_words * BYTES_PER_WORD <= self.region_end(region),
            "region {} full",
            region
        );
        self.tops[region] += size_words * BYTES_PER_WORD;
        self.objects.insert(
            addr,
            TestObject {
                size_words,
                refs,
                is_array,
            },
        );
        addr
    }

    fn alloc(&mut self, region: usize, size_words: usize, refs: Vec<Address>) -> Address {
        self.alloc_raw(region, size_words, refs, false)
    }

    /// A reference array: header word plus one word per element.
    fn alloc_array(&mut self, region: usize, refs: Vec<Address>) -> Address {
        let size = refs.len() + 1;
        self.alloc_raw(region, size, refs, true)
    }

    fn build_mark(&self, options: MarkingOptions) -> ConcurrentMark {
        let table = RegionTable::new(HEAP_BASE, self.region_words, self.num_regions);
        for (i, &top) in self.tops.iter().enumerate() {
            table.region(i as u32).set_top_at_mark_start(top);
        }
        ConcurrentMark::new(table, options)
    }

    /// Reachable set by plain BFS over the object table.
    fn reachable_from(&self, roots: &[Address]) -> HashSet<Address> {
        let mut seen: HashSet<Address> = roots.iter().copied().collect();
        let mut work: Vec<Address> = roots.to_vec();
        while let Some(obj) = work.pop() {
            for &r in &self.objects[&obj].refs {
                if seen.insert(r) {
                    work.push(r);
                }
            }
        }
        seen
    }
}

impl ObjectGraph for TestHeap {
    fn size_in_words(&self, obj: Address) -> usize {
        self.objects[&obj].size_words
    }

    fn visit_references(&self, obj: Address, f: &mut dyn FnMut(Address)) {
        for &r in &self.objects[&obj].refs {
            f(r);
        }
    }

    fn is_reference_array(&self, obj: Address) -> bool {
        self.objects[&obj].is_array
    }

    fn reference_array_len(&self, obj: Address) -> usize {
        self.objects[&obj].refs.len()
    }

    fn visit_array_slice(&self, obj: Address, from: usize, to: usize, f: &mut dyn FnMut(Address)) {
        for &r in &self.objects[&obj].refs[from..to] {
            f(r);
        }
    }
}

fn run_cycle(heap: &TestHeap, cm: &ConcurrentMark, roots: &[Address]) {
    cm.pre_concurrent_start();
    for &r in roots {
        cm.mark_root(heap, r);
    }
    cm.post_concurrent_mark_start();
    cm.scan_root_regions(heap);
    cm.mark_from_roots(heap);
    cm.finalize_marking(heap).expect("marking storage exhausted");
}

/// After finalize_marking the completed marks live in the prev bitmap.
fn assert_all_marked(cm: &ConcurrentMark, objs: impl IntoIterator<Item = Address>) {
    let bitmap = cm.prev_mark_bitmap();
    for obj in objs {
        assert!(bitmap.is_marked(obj), "object {:#x} not marked", obj);
    }
}

#[test]
fn scenario_independent_roots_two_workers() {
    init_logs();
    let mut h = TestHeap::new(8, 1024);
    let roots: Vec<Address> = (0..4).map(|i| h.alloc(i, 4, vec![])).collect();
    let cm = h.build_mark(MarkingOptions {
        max_workers: 2,
        ..Default::default()
    });
    run_cycle(&h, &cm, &roots);

    assert_all_marked(&cm, roots.iter().copied());
    assert_eq!(cm.total_live_objects(), 4);
    assert_eq!(cm.total_live_words(), 16);
    assert!(cm.mark_stack_is_empty());
    assert_eq!(cm.task_queues().total_size(), 0);
    assert!(!cm.has_overflown());
    assert_eq!(cm.restarts(), 0);
}

#[test]
fn scenario_long_chain_exact_marks() {
    init_logs();
    const N: usize = 100_000;
    let mut h = TestHeap::new(64, 4096);
    let per_region = 4096 / 2;
    let mut prev: Option<Address> = None;
    let mut all = Vec::with_capacity(N);
    for i in 0..N {
        let refs = prev.map(|p| vec![p]).unwrap_or_default();
        let obj = h.alloc(i / per_region, 2, refs);
        all.push(obj);
        prev = Some(obj);
    }
    // The head of the chain sits at the highest address; every link points
    // downward, behind the wavefront, so traversal flows through the queues.
    let root = *all.last().unwrap();
    let cm = h.build_mark(MarkingOptions {
        max_workers: 2,
        local_drain_target: 4,
        ..Default::default()
    });
    run_cycle(&h, &cm, &[root]);

    assert_eq!(cm.total_live_objects(), N);
    assert_eq!(cm.total_live_words(), 2 * N);
    assert_all_marked(&cm, all.iter().copied());
    assert!(cm.mark_stack_is_empty());
    assert!(!cm.has_overflown());
    assert_eq!(cm.restarts(), 0);
}

#[test]
fn scenario_overflow_restart_completes() {
    init_logs();
    let mut h = TestHeap::new(16, 8192);
    // Four hub objects whose combined fan-out cannot fit a one-chunk global
    // stack once the local queues spill.
    let mut hubs = Vec::new();
    let mut targets = Vec::new();
    for w in 0..4 {
        let leaves: Vec<Address> = (0..2500).map(|_| h.alloc(w, 1, vec![])).collect();
        targets.extend(leaves.iter().copied());
        hubs.push(h.alloc(12 + w, 2502, leaves));
    }
    let cm = h.build_mark(MarkingOptions {
        max_workers: 4,
        task_queue_capacity: 2048,
        initial_chunk_capacity: 1,
        max_chunk_capacity: 8,
        ..Default::default()
    });
    run_cycle(&h, &cm, &hubs);

    assert!(cm.restarts() >= 1, "expected an overflow restart");
    assert_eq!(cm.total_live_objects(), 4 + 4 * 2500);
    assert_all_marked(&cm, hubs.iter().copied());
    assert_all_marked(&cm, targets.iter().copied());
    assert!(cm.mark_stack_is_empty());
}

#[test]
fn scenario_region_claim_exclusion() {
    init_logs();
    let mut h = TestHeap::new(4, 1024);
    for region in 0..4 {
        h.alloc(region, 2, vec![]);
    }
    let cm = h.build_mark(MarkingOptions {
        max_workers: 2,
        ..Default::default()
    });
    cm.pre_concurrent_start();

    let claims = parking_lot::Mutex::new(Vec::new());
    std::thread::scope(|s| {
        for worker_id in 0..8 {
            let cm = &cm;
            let claims = &claims;
            s.spawn(move || loop {
                match cm.claim_region(worker_id) {
                    Some(region) => claims.lock().push(region.index()),
                    None => {
                        if cm.out_of_regions() {
                            break;
                        }
                    }
                }
            });
        }
    });

    let mut claimed = claims.into_inner();
    claimed.sort_unstable();
    assert_eq!(claimed, vec![0, 1, 2, 3], "each region claimed exactly once");
}

#[test]
fn scenario_small_subtree_single_worker() {
    init_logs();
    let mut h = TestHeap::new(2, 1024);
    let b = h.alloc(0, 2, vec![]);
    let a = h.alloc(0, 2, vec![b]);
    let root = h.alloc(1, 2, vec![a]);
    let cm = h.build_mark(MarkingOptions {
        max_workers: 1,
        ..Default::default()
    });
    run_cycle(&h, &cm, &[root]);

    assert_eq!(cm.total_live_objects(), 3);
    assert_all_marked(&cm, [root, a, b]);
    // No contention, no spills: the global stack was never touched.
    assert_eq!(cm.global_mark_stack().pushed_chunks(), 0);
    assert_eq!(cm.task_queues().total_size(), 0);
}

#[test]
fn wide_fanout_exercises_global_stack() {
    init_logs();
    let mut h = TestHeap::new(8, 8192);
    let leaves: Vec<Address> = (0..3000).map(|_| h.alloc(0, 1, vec![])).collect();
    let hub = h.alloc(6, 3002, leaves.clone());
    let cm = h.build_mark(MarkingOptions {
        max_workers: 2,
        task_queue_capacity: 2048,
        initial_chunk_capacity: 8,
        max_chunk_capacity: 64,
        ..Default::default()
    });
    run_cycle(&h, &cm, &[hub]);

    assert!(
        cm.global_mark_stack().pushed_chunks() >= 1,
        "fan-out should spill to the global stack"
    );
    assert!(!cm.has_overflown());
    assert_eq!(cm.restarts(), 0);
    assert_eq!(cm.total_live_objects(), 3001);
    assert_all_marked(&cm, leaves.iter().copied());
}

#[test]
fn reference_array_is_sliced_and_fully_marked() {
    init_logs();
    let mut h = TestHeap::new(8, 8192);
    let leaves: Vec<Address> = (0..5000).map(|i| h.alloc(i % 4, 1, vec![])).collect();
    let arr = h.alloc_array(6, leaves.clone());
    let root = h.alloc(7, 2, vec![arr]);
    let cm = h.build_mark(MarkingOptions {
        max_workers: 4,
        ..Default::default()
    });
    run_cycle(&h, &cm, &[root]);

    assert_eq!(cm.total_live_objects(), 5002);
    assert_all_marked(&cm, leaves.iter().copied());
    assert_all_marked(&cm, [arr, root]);
}

#[test]
fn satb_entries_survive_into_the_closure() {
    init_logs();
    let mut h = TestHeap::new(4, 2048);
    let root = h.alloc(0, 2, vec![]);
    // Reachable at mark start, but the only path to them is overwritten
    // before marking ever sees it; the write barrier logged the old values.
    let hidden: Vec<Address> = (0..100).map(|_| h.alloc(2, 2, vec![])).collect();
    let cm = h.build_mark(MarkingOptions {
        max_workers: 2,
        ..Default::default()
    });

    cm.pre_concurrent_start();
    cm.mark_root(&h, root);
    cm.post_concurrent_mark_start();
    for &obj in &hidden {
        cm.satb().enqueue(obj);
    }
    cm.mark_from_roots(&h);
    cm.finalize_marking(&h).unwrap();

    assert_all_marked(&cm, hidden.iter().copied());
    assert_eq!(cm.total_live_objects(), 1 + hidden.len());
}

#[test]
fn remark_overflow_degrades_to_restart() {
    init_logs();
    let mut h = TestHeap::new(8, 8192);
    let root = h.alloc(7, 2, vec![]);
    let hidden: Vec<Address> = (0..3000).map(|i| h.alloc(i % 4, 1, vec![])).collect();
    // One worker and a one-chunk stack: the second spill during the SATB
    // drain has nowhere to go.
    let cm = h.build_mark(MarkingOptions {
        max_workers: 1,
        task_queue_capacity: 2048,
        initial_chunk_capacity: 1,
        max_chunk_capacity: 8,
        satb_buffer_capacity: 4096,
        satb_process_threshold: usize::MAX,
        ..Default::default()
    });

    cm.pre_concurrent_start();
    cm.mark_root(&h, root);
    cm.post_concurrent_mark_start();
    cm.mark_from_roots(&h);
    // The log fills only after concurrent marking is done, so every entry
    // lands on remark at once.
    for &obj in &hidden {
        cm.satb().enqueue(obj);
    }
    cm.finalize_marking(&h).expect("remark should recover by restarting");

    assert!(cm.restarts() >= 1, "remark must have reset and redone discovery");
    assert_all_marked(&cm, hidden.iter().copied());
    assert_eq!(cm.total_live_objects(), 1 + hidden.len());
}

#[test]
fn root_regions_are_scanned_before_marking() {
    init_logs();
    let mut h = TestHeap::new(4, 2048);
    // Old object only reachable from a survivor-style root region.
    let old = h.alloc(0, 2, vec![]);
    let survivor = h.alloc(2, 2, vec![old]);
    let cm = h.build_mark(MarkingOptions {
        max_workers: 2,
        ..Default::default()
    });
    // Region 2 is all post-pause survivors: implicitly live, nothing below
    // its top-at-mark-start.
    let r2 = cm.regions().region(2);
    r2.set_top_at_mark_start(r2.bottom());

    cm.pre_concurrent_start();
    cm.root_regions()
        .add(MemRegion::new(survivor, survivor + 2 * BYTES_PER_WORD));
    cm.post_concurrent_mark_start();
    cm.scan_root_regions(&h);
    assert!(!cm.root_regions().scan_in_progress());
    assert!(cm.next_mark_bitmap().is_marked(old));

    cm.mark_from_roots(&h);
    cm.finalize_marking(&h).unwrap();
    assert!(cm.prev_mark_bitmap().is_marked(old));
    // The survivor object itself is implicitly live, never bitmap-marked.
    assert!(!cm.prev_mark_bitmap().is_marked(survivor));
}

#[test]
fn cancellation_abandons_the_cycle() {
    init_logs();
    let mut h = TestHeap::new(4, 1024);
    let root = h.alloc(0, 2, vec![]);
    let cm = h.build_mark(MarkingOptions {
        max_workers: 2,
        ..Default::default()
    });
    cm.pre_concurrent_start();
    cm.mark_root(&h, root);
    cm.post_concurrent_mark_start();
    cm.concurrent_cycle_abort();
    cm.mark_from_roots(&h);
    assert!(cm.has_aborted());
    assert!(cm.finalize_marking(&h).is_ok());
    assert!(!cm.satb().is_active());
}

#[test]
fn closure_completeness_on_random_graphs() {
    init_logs();
    let mut rng = rand::rngs::StdRng::seed_from_u64(0x6d61726b);
    for round in 0..4 {
        let mut h = TestHeap::new(16, 4096);
        let mut objs = Vec::new();
        for i in 0..2000 {
            let region = i % 16;
            let mut refs = Vec::new();
            if !objs.is_empty() {
                for _ in 0..rng.gen_range(0..4) {
                    refs.push(objs[rng.gen_range(0..objs.len())]);
                }
            }
            objs.push(h.alloc(region, rng.gen_range(1..4), refs));
        }
        let roots: Vec<Address> = (0..8)
            .map(|_| objs[rng.gen_range(0..objs.len())])
            .collect();
        let expected = h.reachable_from(&roots);

        let cm = h.build_mark(MarkingOptions {
            max_workers: 1 + round,
            local_drain_target: 8,
            ..Default::default()
        });
        run_cycle(&h, &cm, &roots);

        let bitmap = cm.prev_mark_bitmap();
        for &obj in &objs {
            assert_eq!(
                bitmap.is_marked(obj),
                expected.contains(&obj),
                "object {:#x} mark state diverges from reachability",
                obj
            );
        }
        assert_eq!(cm.total_live_objects(), expected.len());
    }
}

#[test]
fn liveness_accounting_matches_object_sizes() {
    init_logs();
    let mut h = TestHeap::new(4, 2048);
    let a = h.alloc(0, 3, vec![]);
    let b = h.alloc(1, 5, vec![a]);
    let root = h.alloc(2, 7, vec![b, a]);
    let cm = h.build_mark(MarkingOptions {
        max_workers: 2,
        ..Default::default()
    });
    run_cycle(&h, &cm, &[root]);

    assert_eq!(cm.live_words(0), 3);
    assert_eq!(cm.live_words(1), 5);
    assert_eq!(cm.live_words(2), 7);
    assert_eq!(cm.live_bytes(1), 5 * BYTES_PER_WORD);
    assert_eq!(cm.live_objects(0), 1);
    assert_eq!(cm.total_live_words(), 15);
}

#[test]
fn repeated_cycles_reuse_the_engine() {
    init_logs();
    let mut h = TestHeap::new(4, 2048);
    let leaf = h.alloc(0, 2, vec![]);
    let root = h.alloc(1, 2, vec![leaf]);
    let cm = h.build_mark(MarkingOptions {
        max_workers: 2,
        ..Default::default()
    });

    for _ in 0..3 {
        cm.cleanup_for_next_mark();
        run_cycle(&h, &cm, &[root]);
        assert_eq!(cm.total_live_objects(), 2);
        assert!(cm.prev_mark_bitmap().is_marked(leaf));
    }
}

//! Concurrent region-based marking engine for tracing garbage collectors.
//!
//! Computes the transitive closure of reachable objects in parallel with a
//! running mutator: lock-free region claiming over a global finger,
//! work-stealing per-worker queues backed by a chunked global overflow
//! stack, SATB write-barrier log draining, and a distributed termination
//! protocol, with deterministic restart when the overflow storage fills up.
//! The object model stays on the embedder's side of the
//! [`ObjectGraph`](heap::object_graph::ObjectGraph) seam.

pub mod heap;
pub mod sync;
pub mod utils;

pub use heap::concurrent_mark::{ConcurrentMark, MarkStackExhausted, MarkingOptions};
pub use heap::mark::MarkingTask;
pub use heap::memory_region::MemRegion;
pub use heap::object_graph::ObjectGraph;
pub use heap::region::{HeapRegion, RegionTable};
pub use heap::Address;
pub use utils::taskqueue::TaskEntry;

#[cfg(test)]
pub mod tests;

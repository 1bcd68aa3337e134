// CORTEX models a NUMA machine inside a single process. Each node owns a small
// cache of fixed-size lines and runs one worker. Tasks are tiny programs whose
// data segments are scattered across every node's cache by a global
// round-robin placement cursor, so a node's worker spends most of its time
// fetching and writing bytes that live on some other node.

// There is no coherence protocol between nodes. A line lives in exactly one
// slot of exactly one cache, and every byte access goes through that node's
// lock. Each fetch and each write-back takes the home node's lock on its own,
// and the placement cursor has a lock of its own which is always dropped before
// a node lock is taken, so no code path ever waits while holding a lock.

// Workers only yield between instructions and between cycles. Cancellation is
// cooperative: the stop flag is read once per cycle and a task in flight always
// runs to completion or abort first.
pub mod cache;
pub mod engine;
pub mod error;
pub mod hex;
pub mod isa;
pub mod placement;
pub mod report;
pub mod system;
pub mod task;
pub mod worker;

/// Index of a node in the topology.
pub type NodeId = usize;

/// Index of a slot inside a node's cache.
pub type SlotIndex = usize;

/// Bytes per cache line.
pub const LINE_SIZE: usize = 32;

/// Lines per node cache (4 KiB of 32 byte lines).
pub const CACHE_CAPACITY: usize = 4096 / LINE_SIZE;

/// Maximum number of data segments a task can carry.
pub const MAX_SEGMENTS: usize = 3;

/// Maximum number of instruction words in a task's program.
pub const MAX_INSTRUCTIONS: usize = 20;

/// The only node counts a system can be built with.
pub const VALID_NODE_COUNTS: [usize; 4] = [1, 4, 8, 16];

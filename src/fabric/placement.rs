use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{trace, warn};

use super::{
    cache::{CacheLine, Topology},
    error::CacheError,
    task::SegmentRef,
    NodeId,
};

/// Scatters lines across the whole system with one global round-robin cursor.
///
/// The cursor is shared by every segment of every task on every node, which
/// is what makes most accesses remote: a worker's own node rarely homes the
/// data it executes against.
pub struct PlacementPolicy {
    topology: Arc<Topology>,
    cursor: Mutex<NodeId>,
}

impl PlacementPolicy {
    pub fn new(topology: Arc<Topology>) -> Self {
        Self::starting_at(topology, 0)
    }

    /// Creates a policy whose first placement targets `start` (modulo the
    /// node count).
    pub fn starting_at(topology: Arc<Topology>, start: NodeId) -> Self {
        let start = start % topology.len().max(1);
        Self {
            topology,
            cursor: Mutex::new(start),
        }
    }

    /// Places a line on the node under the cursor. A full node fails the
    /// placement outright; there is no retry on another node.
    pub async fn place(&self, line: CacheLine) -> Result<SegmentRef, CacheError> {
        let node = self.advance().await;
        match self.topology.node(node)?.allocate(line).await {
            Ok(slot) => {
                trace!(node, slot, "placed line");
                Ok(SegmentRef { node, slot })
            }
            Err(e) => {
                warn!("{}", e);
                Err(e)
            }
        }
    }

    /// The node the next placement will target.
    pub async fn cursor(&self) -> NodeId {
        *self.cursor.lock().await
    }

    // the cursor guard is dropped before any node lock is taken
    async fn advance(&self) -> NodeId {
        let mut cursor = self.cursor.lock().await;
        let current = *cursor;
        *cursor = (current + 1) % self.topology.len().max(1);
        current
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn consecutive_placements_walk_the_nodes_in_order() {
        for k in [1, 4, 8, 16] {
            for start in [0, k / 2, k - 1] {
                let topology = Arc::new(Topology::with_capacity(k, 64));
                let policy = PlacementPolicy::starting_at(topology, start);
                for n in 0..(3 * k) {
                    let placed = policy.place(CacheLine::zeroed()).await.unwrap();
                    assert_eq!(placed.node, (start + n) % k);
                }
            }
        }
    }

    #[tokio::test]
    async fn full_node_fails_without_trying_another() {
        let topology = Arc::new(Topology::with_capacity(2, 1));
        let policy = PlacementPolicy::new(topology.clone());

        assert_eq!(
            policy.place(CacheLine::zeroed()).await.unwrap(),
            SegmentRef { node: 0, slot: 0 }
        );
        assert_eq!(
            policy.place(CacheLine::zeroed()).await.unwrap(),
            SegmentRef { node: 1, slot: 0 }
        );
        assert_eq!(
            policy.place(CacheLine::zeroed()).await,
            Err(CacheError::OutOfMemory { node: 0 })
        );
        // the failed placement still consumed its turn
        assert_eq!(policy.cursor().await, 1);

        topology.node(1).unwrap().free(0).await.unwrap();
        assert_eq!(
            policy.place(CacheLine::zeroed()).await.unwrap(),
            SegmentRef { node: 1, slot: 0 }
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_placements_spread_evenly() {
        let topology = Arc::new(Topology::with_capacity(4, 64));
        let policy = Arc::new(PlacementPolicy::new(topology.clone()));

        let placers = (0..8).map(|_| {
            let policy = policy.clone();
            tokio::spawn(async move {
                for _ in 0..20 {
                    policy.place(CacheLine::zeroed()).await.unwrap();
                }
            })
        });
        for placer in futures::future::join_all(placers).await {
            placer.unwrap();
        }

        for node in topology.iter() {
            assert_eq!(node.occupied().await, 40);
        }
    }
}

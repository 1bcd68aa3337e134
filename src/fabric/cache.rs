use std::fmt;

use tokio::sync::Mutex;
use tracing::trace;

use super::{
    error::CacheError, hex::HexDisplayExt, NodeId, SlotIndex, CACHE_CAPACITY,
    LINE_SIZE,
};

/// One line of node memory. A line is owned by at most one slot; moving it
/// in and out of a slot is the only way to hand it over.
#[derive(Clone, PartialEq, Eq)]
pub struct CacheLine {
    bytes: [u8; LINE_SIZE],
    dirty: bool,
}

impl CacheLine {
    pub fn new(bytes: [u8; LINE_SIZE]) -> Self {
        Self {
            bytes,
            dirty: false,
        }
    }

    pub fn zeroed() -> Self {
        Self::new([0; LINE_SIZE])
    }

    pub fn bytes(&self) -> &[u8; LINE_SIZE] {
        &self.bytes
    }

    /// True once any byte has been written since the line was created.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    fn get(&self, offset: usize) -> Result<u8, CacheError> {
        self.bytes
            .get(offset)
            .copied()
            .ok_or(CacheError::OffsetOutOfRange { offset })
    }

    fn set(&mut self, offset: usize, value: u8) -> Result<(), CacheError> {
        let byte = self
            .bytes
            .get_mut(offset)
            .ok_or(CacheError::OffsetOutOfRange { offset })?;
        *byte = value;
        self.dirty = true;
        Ok(())
    }
}

impl From<[u8; LINE_SIZE]> for CacheLine {
    fn from(bytes: [u8; LINE_SIZE]) -> Self {
        Self::new(bytes)
    }
}

impl fmt::Debug for CacheLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheLine")
            .field("bytes", &self.bytes.hex())
            .field("dirty", &self.dirty)
            .finish()
    }
}

/// A node's local cache: a fixed array of slots behind one exclusive lock.
///
/// Every operation takes the lock for the duration of that single call, so
/// accesses to one node are totally ordered while different nodes never
/// contend with each other.
pub struct NodeCache {
    id: NodeId,
    slots: Mutex<Box<[Option<CacheLine>]>>,
}

impl NodeCache {
    pub fn new(id: NodeId) -> Self {
        Self::with_capacity(id, CACHE_CAPACITY)
    }

    pub fn with_capacity(id: NodeId, capacity: usize) -> Self {
        Self {
            id,
            slots: Mutex::new(vec![None; capacity].into_boxed_slice()),
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub async fn capacity(&self) -> usize {
        self.slots.lock().await.len()
    }

    /// Installs the line in the first empty slot.
    pub async fn allocate(&self, line: CacheLine) -> Result<SlotIndex, CacheError> {
        let mut slots = self.slots.lock().await;
        let (slot, empty) = slots
            .iter_mut()
            .enumerate()
            .find(|(_, s)| s.is_none())
            .ok_or(CacheError::OutOfMemory { node: self.id })?;
        *empty = Some(line);
        trace!(node = self.id, slot, "allocated line");
        Ok(slot)
    }

    /// Takes the line out of `slot`, leaving it empty. Freeing an empty slot
    /// is reported as [`CacheError::SlotEmpty`] and changes nothing.
    pub async fn free(&self, slot: SlotIndex) -> Result<CacheLine, CacheError> {
        let mut slots = self.slots.lock().await;
        let line = slots
            .get_mut(slot)
            .ok_or(CacheError::SlotOutOfRange {
                node: self.id,
                slot,
            })?
            .take()
            .ok_or(CacheError::SlotEmpty {
                node: self.id,
                slot,
            })?;
        trace!(node = self.id, slot, "freed line");
        Ok(line)
    }

    pub async fn read(
        &self,
        slot: SlotIndex,
        offset: usize,
    ) -> Result<u8, CacheError> {
        let mut slots = self.slots.lock().await;
        self.line_mut(&mut slots, slot)?.get(offset)
    }

    /// Writes one byte and marks the line dirty.
    pub async fn write(
        &self,
        slot: SlotIndex,
        offset: usize,
        value: u8,
    ) -> Result<(), CacheError> {
        let mut slots = self.slots.lock().await;
        self.line_mut(&mut slots, slot)?.set(offset, value)
    }

    /// Empties every slot, returning how many held a line.
    pub async fn release_all(&self) -> usize {
        let mut slots = self.slots.lock().await;
        slots.iter_mut().filter_map(Option::take).count()
    }

    pub async fn occupied(&self) -> usize {
        self.slots.lock().await.iter().filter(|s| s.is_some()).count()
    }

    /// Copies out every occupied slot, in slot order.
    pub async fn snapshot(&self) -> Vec<(SlotIndex, CacheLine)> {
        let slots = self.slots.lock().await;
        slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_ref().map(|line| (i, line.clone())))
            .collect()
    }

    fn line_mut<'a>(
        &self,
        slots: &'a mut [Option<CacheLine>],
        slot: SlotIndex,
    ) -> Result<&'a mut CacheLine, CacheError> {
        slots
            .get_mut(slot)
            .ok_or(CacheError::SlotOutOfRange {
                node: self.id,
                slot,
            })?
            .as_mut()
            .ok_or(CacheError::SlotEmpty {
                node: self.id,
                slot,
            })
    }
}

/// Every node cache in the system, indexed by [`NodeId`].
pub struct Topology {
    nodes: Vec<NodeCache>,
}

impl Topology {
    pub fn new(node_count: usize) -> Self {
        Self::with_capacity(node_count, CACHE_CAPACITY)
    }

    pub fn with_capacity(node_count: usize, capacity: usize) -> Self {
        Self {
            nodes: (0..node_count)
                .map(|id| NodeCache::with_capacity(id, capacity))
                .collect(),
        }
    }

    pub fn node(&self, id: NodeId) -> Result<&NodeCache, CacheError> {
        self.nodes.get(id).ok_or(CacheError::UnknownNode(id))
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &NodeCache> {
        self.nodes.iter()
    }

    /// Frees every slot of every node, one node lock at a time. Returns the
    /// number of lines released per node.
    pub async fn release_all(&self) -> Vec<usize> {
        let mut released = Vec::with_capacity(self.nodes.len());
        for node in &self.nodes {
            released.push(node.release_all().await);
        }
        released
    }

    pub async fn occupied(&self) -> usize {
        let mut total = 0;
        for node in &self.nodes {
            total += node.occupied().await;
        }
        total
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[tokio::test]
    async fn allocate_never_hands_out_an_occupied_slot() {
        let cache = NodeCache::with_capacity(0, 8);
        assert_eq!(cache.capacity().await, 8);
        let mut seen = Vec::new();
        for _ in 0..8 {
            let slot = cache.allocate(CacheLine::zeroed()).await.unwrap();
            assert!(!seen.contains(&slot));
            seen.push(slot);
        }
        assert_eq!(cache.occupied().await, 8);
    }

    #[tokio::test]
    async fn full_cache_reports_out_of_memory_until_a_slot_is_freed() {
        let cache = NodeCache::new(3);
        for _ in 0..CACHE_CAPACITY {
            cache.allocate(CacheLine::zeroed()).await.unwrap();
        }
        assert_eq!(
            cache.allocate(CacheLine::zeroed()).await,
            Err(CacheError::OutOfMemory { node: 3 })
        );

        cache.free(17).await.unwrap();
        assert_eq!(cache.allocate(CacheLine::zeroed()).await, Ok(17));
        assert_eq!(
            cache.allocate(CacheLine::zeroed()).await,
            Err(CacheError::OutOfMemory { node: 3 })
        );
    }

    #[tokio::test]
    async fn freed_slot_rejects_access_until_reallocated() {
        let cache = NodeCache::with_capacity(1, 4);
        let slot = cache.allocate(CacheLine::zeroed()).await.unwrap();
        cache.free(slot).await.unwrap();

        let empty = CacheError::SlotEmpty { node: 1, slot };
        assert_eq!(cache.read(slot, 0).await, Err(empty));
        assert_eq!(cache.write(slot, 0, 9).await, Err(empty));
        assert_eq!(cache.free(slot).await.unwrap_err(), empty);

        let again = cache.allocate(CacheLine::zeroed()).await.unwrap();
        assert_eq!(again, slot);
        assert_eq!(cache.read(slot, 0).await, Ok(0));
    }

    #[tokio::test]
    async fn ff_is_an_ordinary_byte() {
        let cache = NodeCache::with_capacity(0, 1);
        let mut bytes = [0u8; LINE_SIZE];
        bytes[5] = 0xFF;
        let slot = cache.allocate(bytes.into()).await.unwrap();
        assert_eq!(cache.read(slot, 5).await, Ok(0xFF));
    }

    #[tokio::test]
    async fn write_marks_line_dirty() {
        let cache = NodeCache::with_capacity(0, 2);
        let slot = cache.allocate(CacheLine::zeroed()).await.unwrap();
        assert!(!cache.snapshot().await[0].1.is_dirty());

        cache.write(slot, 31, 0xAB).await.unwrap();
        let (_, line) = cache.snapshot().await.remove(0);
        assert!(line.is_dirty());
        assert_eq!(line.bytes()[31], 0xAB);
    }

    #[tokio::test]
    async fn out_of_range_accesses_are_errors() {
        let cache = NodeCache::with_capacity(2, 2);
        let slot = cache.allocate(CacheLine::zeroed()).await.unwrap();
        assert_eq!(
            cache.read(slot, LINE_SIZE).await,
            Err(CacheError::OffsetOutOfRange { offset: LINE_SIZE })
        );
        assert_eq!(
            cache.write(9, 0, 1).await,
            Err(CacheError::SlotOutOfRange { node: 2, slot: 9 })
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_writers_to_one_line_do_not_clobber_each_other() {
        let cache = Arc::new(NodeCache::with_capacity(0, 1));
        let slot = cache.allocate(CacheLine::zeroed()).await.unwrap();

        let writers = (0..LINE_SIZE).map(|offset| {
            let cache = cache.clone();
            tokio::spawn(async move {
                for _ in 0..50 {
                    let v = cache.read(slot, offset).await.unwrap();
                    cache.write(slot, offset, v.wrapping_add(1)).await.unwrap();
                    tokio::task::yield_now().await;
                }
            })
        });
        for writer in futures::future::join_all(writers).await {
            writer.unwrap();
        }

        let (_, line) = cache.snapshot().await.remove(0);
        assert!(line.bytes().iter().all(|b| *b == 50));
    }

    #[tokio::test]
    async fn topology_release_all_empties_every_node() {
        let topology = Topology::with_capacity(4, 8);
        for id in 0..4 {
            for _ in 0..=id {
                topology
                    .node(id)
                    .unwrap()
                    .allocate(CacheLine::zeroed())
                    .await
                    .unwrap();
            }
        }
        assert_eq!(topology.occupied().await, 10);
        assert_eq!(topology.release_all().await, vec![1, 2, 3, 4]);
        assert_eq!(topology.occupied().await, 0);
        assert_eq!(
            topology.node(4).err(),
            Some(CacheError::UnknownNode(4))
        );
    }
}

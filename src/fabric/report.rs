use std::fmt;

use chrono::{DateTime, Duration, Utc};

use super::{
    cache::{CacheLine, NodeCache, Topology},
    hex::HexDisplayExt,
    worker::StatsSnapshot,
    NodeId, SlotIndex,
};

/// The occupied slots of one node at the moment its lock was taken.
#[derive(Clone, Debug)]
pub struct NodeSnapshot {
    pub node: NodeId,
    pub lines: Vec<(SlotIndex, CacheLine)>,
}

impl NodeSnapshot {
    pub async fn capture(cache: &NodeCache) -> Self {
        Self {
            node: cache.id(),
            lines: cache.snapshot().await,
        }
    }
}

impl fmt::Display for NodeSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Node {} memory contents:", self.node)?;
        for (slot, line) in &self.lines {
            writeln!(
                f,
                "{:>3}: {}   Flags: {}",
                slot,
                line.bytes().hex(),
                if line.is_dirty() { "dirty" } else { "clean" }
            )?;
        }
        Ok(())
    }
}

/// Everything a console reporter shows. Nodes are captured one after
/// another, so the report is consistent per node but not across nodes.
#[derive(Clone, Debug)]
pub struct Report {
    pub taken_at: DateTime<Utc>,
    pub started_at: DateTime<Utc>,
    pub nodes: Vec<NodeSnapshot>,
    pub workers: Vec<StatsSnapshot>,
}

impl Report {
    pub async fn capture(
        topology: &Topology,
        workers: Vec<StatsSnapshot>,
        started_at: DateTime<Utc>,
    ) -> Self {
        let mut nodes = Vec::with_capacity(topology.len());
        for cache in topology.iter() {
            nodes.push(NodeSnapshot::capture(cache).await);
        }
        Self {
            taken_at: Utc::now(),
            started_at,
            nodes,
            workers,
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.taken_at - self.started_at
    }

    pub fn occupied(&self) -> usize {
        self.nodes.iter().map(|n| n.lines.len()).sum()
    }
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "time elapsed: {}s ({})",
            self.elapsed().num_seconds(),
            self.taken_at.format("%H:%M:%S%.3f")
        )?;
        for node in &self.nodes {
            write!(f, "{}", node)?;
        }
        for stats in &self.workers {
            write!(
                f,
                "worker {}: {} cycles, {} completed, {} aborted",
                stats.node,
                stats.cycles(),
                stats.completed,
                stats.aborted_total()
            )?;
            if !stats.aborted.is_empty() {
                let mut kinds: Vec<_> = stats.aborted.iter().collect();
                kinds.sort();
                let kinds: Vec<_> = kinds
                    .into_iter()
                    .map(|(kind, n)| format!("{}={}", kind, n))
                    .collect();
                write!(f, " ({})", kinds.join(", "))?;
            }
            writeln!(
                f,
                ", {} instructions, {} placement failures",
                stats.instructions, stats.placement_failures
            )?;
        }
        Ok(())
    }
}

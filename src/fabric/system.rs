use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use chrono::{DateTime, Utc};
use futures::future::join_all;
use tokio::task::JoinHandle;
use tracing::{error, info};
use typed_builder::TypedBuilder;

use super::{
    cache::Topology,
    engine::InstructionEngine,
    error::Error,
    placement::PlacementPolicy,
    report::Report,
    task::{TaskFactory, TemplateFactory},
    worker::{NodeWorker, WorkerStats},
    VALID_NODE_COUNTS,
};

fn default_factory() -> Arc<dyn TaskFactory> {
    Arc::new(TemplateFactory::default())
}

/// Everything needed to bring a system up.
#[derive(Clone, TypedBuilder)]
pub struct SystemConfig {
    /// One of 1, 4, 8 or 16.
    pub node_count: usize,
    /// Size of each worker's task rotation.
    #[builder(default = 3)]
    pub tasks_per_node: usize,
    /// Delay after every instruction, standing in for remote access cost.
    #[builder(default = Duration::from_micros(100))]
    pub instruction_latency: Duration,
    /// Delay between two worker cycles.
    #[builder(default = Duration::from_secs(1))]
    pub cycle_interval: Duration,
    /// Delay before a worker places its first tasks.
    #[builder(default = Duration::from_secs(2))]
    pub warmup: Duration,
    #[builder(default = default_factory())]
    pub factory: Arc<dyn TaskFactory>,
}

/// Lines released per node by the shutdown sweep.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ShutdownSummary {
    pub released: Vec<usize>,
}

impl ShutdownSummary {
    pub fn total(&self) -> usize {
        self.released.iter().sum()
    }
}

/// Handle to a running (or ready to run) system of nodes.
///
/// The handle owns the shared state every worker is built from: the
/// topology, the placement cursor, the engine and the stop flag. Dropping it
/// raises the stop flag, but only [`System::request_stop`] waits for the
/// workers and empties the caches.
pub struct System {
    config: SystemConfig,
    topology: Arc<Topology>,
    placement: Arc<PlacementPolicy>,
    engine: Arc<InstructionEngine>,
    stop: Arc<AtomicBool>,
    stats: Vec<Arc<WorkerStats>>,
    workers: Vec<JoinHandle<()>>,
    started_at: Option<DateTime<Utc>>,
}

impl System {
    pub fn initialize(config: SystemConfig) -> Result<Self, Error> {
        if !VALID_NODE_COUNTS.contains(&config.node_count) {
            Err(Error::InvalidNodeCount(config.node_count))?
        }
        let topology = Arc::new(Topology::new(config.node_count));
        let placement = Arc::new(PlacementPolicy::new(topology.clone()));
        let engine = Arc::new(InstructionEngine::new(
            topology.clone(),
            config.instruction_latency,
        ));
        info!("initialized {} nodes", config.node_count);
        Ok(Self {
            config,
            topology,
            placement,
            engine,
            stop: Arc::new(AtomicBool::new(false)),
            stats: Vec::new(),
            workers: Vec::new(),
            started_at: None,
        })
    }

    /// Spawns one worker per node onto the current tokio runtime.
    pub fn start(&mut self) -> Result<(), Error> {
        if self.started_at.is_some() {
            Err(Error::AlreadyStarted)?
        }
        for node in 0..self.topology.len() {
            let worker = NodeWorker::builder()
                .node(node)
                .topology(self.topology.clone())
                .placement(self.placement.clone())
                .engine(self.engine.clone())
                .factory(self.config.factory.clone())
                .stop(self.stop.clone())
                .resident_tasks(self.config.tasks_per_node)
                .cycle_interval(self.config.cycle_interval)
                .warmup(self.config.warmup)
                .build();
            self.stats.push(worker.stats());
            self.workers.push(tokio::spawn(worker.run()));
        }
        self.started_at = Some(Utc::now());
        info!("started {} workers", self.workers.len());
        Ok(())
    }

    /// Stops every worker and frees every line in the system.
    ///
    /// The stop flag is raised first, then the workers are joined so that
    /// in-flight tasks finish and no new task can be placed, and finally each
    /// node is swept under its own lock. Calling this again releases nothing.
    pub async fn request_stop(&mut self) -> Result<ShutdownSummary, Error> {
        self.stop.store(true, Ordering::Release);
        info!("stopping {} workers", self.workers.len());

        let results = join_all(self.workers.drain(..)).await;
        let mut failure = None;
        for (node, result) in results.into_iter().enumerate() {
            if let Err(e) = result {
                let e = Error::worker_failed(node, e);
                error!("{}", e);
                failure.get_or_insert(e);
            }
        }

        let summary = ShutdownSummary {
            released: self.topology.release_all().await,
        };
        info!("released {} lines", summary.total());
        match failure {
            Some(e) => Err(e),
            None => Ok(summary),
        }
    }

    pub fn is_running(&self) -> bool {
        !self.workers.is_empty()
    }

    pub fn node_count(&self) -> usize {
        self.topology.len()
    }

    /// The node caches, for read-only inspection.
    pub fn topology(&self) -> &Arc<Topology> {
        &self.topology
    }

    pub async fn report(&self) -> Report {
        let mut workers = Vec::with_capacity(self.stats.len());
        for (node, stats) in self.stats.iter().enumerate() {
            workers.push(stats.snapshot(node).await);
        }
        let started_at = self.started_at.unwrap_or_else(Utc::now);
        Report::capture(&self.topology, workers, started_at).await
    }
}

impl Drop for System {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quick(node_count: usize) -> SystemConfig {
        SystemConfig::builder()
            .node_count(node_count)
            .instruction_latency(Duration::ZERO)
            .cycle_interval(Duration::from_millis(1))
            .warmup(Duration::ZERO)
            .build()
    }

    #[test]
    fn only_supported_node_counts_initialize() {
        for n in [0, 2, 3, 5, 12, 32] {
            assert_eq!(
                System::initialize(quick(n)).err(),
                Some(Error::InvalidNodeCount(n))
            );
        }
        for n in VALID_NODE_COUNTS {
            assert_eq!(System::initialize(quick(n)).unwrap().node_count(), n);
        }
    }

    #[test]
    fn defaults_follow_the_reference_machine() {
        let config = SystemConfig::builder().node_count(4).build();
        assert_eq!(config.tasks_per_node, 3);
        assert_eq!(config.instruction_latency, Duration::from_micros(100));
        assert_eq!(config.cycle_interval, Duration::from_secs(1));
        assert_eq!(config.warmup, Duration::from_secs(2));
    }

    #[tokio::test]
    async fn start_twice_is_rejected() {
        let mut system = System::initialize(quick(1)).unwrap();
        system.start().unwrap();
        assert!(system.is_running());
        assert_eq!(system.start(), Err(Error::AlreadyStarted));
        system.request_stop().await.unwrap();
        assert!(!system.is_running());
    }

    #[tokio::test]
    async fn stopping_an_idle_system_releases_nothing() {
        let mut system = System::initialize(quick(4)).unwrap();
        let summary = system.request_stop().await.unwrap();
        assert_eq!(summary.released, vec![0; 4]);
        assert_eq!(system.report().await.occupied(), 0);
    }
}

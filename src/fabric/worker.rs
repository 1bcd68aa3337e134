use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use hashbrown::HashMap;
use tokio::sync::Mutex;
use tracing::{debug, debug_span, Instrument};
use typed_builder::TypedBuilder;

use super::{
    cache::Topology,
    engine::{InstructionEngine, TaskOutcome},
    error::AbortKind,
    placement::PlacementPolicy,
    task::{Task, TaskFactory, TaskId},
    NodeId,
};

/// Running totals for one worker. Shared with the system handle so reports
/// can read them while the worker runs; every update and every snapshot goes
/// through one lock, so a snapshot never sees half a cycle.
#[derive(Default)]
pub struct WorkerStats {
    totals: Mutex<StatsSnapshot>,
}

impl WorkerStats {
    pub async fn record(&self, outcome: &TaskOutcome) {
        let mut totals = self.totals.lock().await;
        totals.instructions += outcome.executed() as u64;
        match outcome {
            TaskOutcome::Completed { .. } => totals.completed += 1,
            TaskOutcome::Aborted { reason, .. } => {
                *totals.aborted.entry(reason.kind()).or_insert(0) += 1;
            }
        }
    }

    pub async fn record_placement_failures(&self, failed: usize) {
        self.totals.lock().await.placement_failures += failed as u64;
    }

    pub async fn snapshot(&self, node: NodeId) -> StatsSnapshot {
        StatsSnapshot {
            node,
            ..self.totals.lock().await.clone()
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub node: NodeId,
    pub completed: u64,
    pub instructions: u64,
    pub placement_failures: u64,
    pub aborted: HashMap<AbortKind, u64>,
}

impl StatsSnapshot {
    pub fn aborted_total(&self) -> u64 {
        self.aborted.values().sum()
    }

    /// Tasks run to an outcome so far.
    pub fn cycles(&self) -> u64 {
        self.completed + self.aborted_total()
    }
}

/// Drives one node: keeps a small rotation of resident tasks, runs one per
/// cycle, and replaces it with a freshly placed task.
#[derive(TypedBuilder)]
pub struct NodeWorker {
    node: NodeId,
    topology: Arc<Topology>,
    placement: Arc<PlacementPolicy>,
    engine: Arc<InstructionEngine>,
    factory: Arc<dyn TaskFactory>,
    stop: Arc<AtomicBool>,
    #[builder(default)]
    stats: Arc<WorkerStats>,
    #[builder(default = 3)]
    resident_tasks: usize,
    #[builder(default = Duration::from_secs(1))]
    cycle_interval: Duration,
    #[builder(default = Duration::from_secs(2))]
    warmup: Duration,
    #[builder(default, setter(skip))]
    next_serial: u64,
}

impl NodeWorker {
    pub fn stats(&self) -> Arc<WorkerStats> {
        self.stats.clone()
    }

    /// Runs until the stop flag is seen at the top of a cycle. The task in
    /// flight always finishes first. Resident tasks still holding slots when
    /// the worker exits are left for the shutdown sweep.
    pub async fn run(mut self) {
        let span = debug_span!("worker", node = self.node);
        async move {
            debug!("worker started");
            if !self.warmup.is_zero() {
                tokio::time::sleep(self.warmup).await;
            }
            if self.stopped() {
                debug!("stopped before placing any tasks");
                return;
            }

            let rotation = self.resident_tasks.max(1);
            let mut resident = Vec::with_capacity(rotation);
            for _ in 0..rotation {
                let task = self.next_task().await;
                resident.push(task);
            }

            let mut current = 0;
            while !self.stopped() {
                let outcome = self.engine.run(&resident[current]).await;
                self.stats.record(&outcome).await;
                debug!(
                    "task {} finished with {:?}",
                    resident[current].id(),
                    outcome
                );
                resident[current].release(&self.topology).await;

                if self.stopped() {
                    break;
                }
                resident[current] = self.next_task().await;
                current = (current + 1) % rotation;

                tokio::time::sleep(self.cycle_interval).await;
            }
            debug!("worker stopped");
        }
        .instrument(span)
        .await
    }

    fn stopped(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    async fn next_task(&mut self) -> Task {
        let id = TaskId {
            node: self.node,
            serial: self.next_serial,
        };
        self.next_serial += 1;
        let mut task = self.factory.create(id);
        let failed = task.place(&self.placement).await;
        if failed > 0 {
            self.stats.record_placement_failures(failed).await;
        }
        task
    }
}

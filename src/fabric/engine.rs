use std::{sync::Arc, time::Duration};

use tracing::{error, trace, warn};

use super::{
    cache::Topology,
    error::{AbortKind, CacheError, TaskError},
    isa::{Instruction, Word},
    task::{SegmentRef, Task},
    MAX_INSTRUCTIONS,
};

/// How a task's run ended. Neither state is retried by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    /// Reached the halt word, or ran every instruction slot.
    Completed { executed: usize },
    Aborted { executed: usize, reason: TaskError },
}

impl TaskOutcome {
    pub fn executed(&self) -> usize {
        match self {
            TaskOutcome::Completed { executed }
            | TaskOutcome::Aborted { executed, .. } => *executed,
        }
    }
}

/// Executes task programs against whichever nodes home their segments.
///
/// Each instruction is a locked fetch from the home node, the arithmetic, and
/// a locked write-back to the same node. The two accesses take the node lock
/// separately, so other workers can interleave between them at byte
/// granularity.
pub struct InstructionEngine {
    topology: Arc<Topology>,
    latency: Duration,
}

impl InstructionEngine {
    /// `latency` is slept after every executed instruction to model the
    /// cost of reaching another node's memory.
    pub fn new(topology: Arc<Topology>, latency: Duration) -> Self {
        Self { topology, latency }
    }

    pub async fn run(&self, task: &Task) -> TaskOutcome {
        if let Some(segment) = task.unplaced() {
            let reason = TaskError::SegmentUnavailable { segment };
            warn!("task {} was never fully placed: {}", task.id(), reason);
            return TaskOutcome::Aborted {
                executed: 0,
                reason,
            };
        }

        let mut executed = 0;
        for &word in task.program().iter().take(MAX_INSTRUCTIONS) {
            let result = match Word::decode(word) {
                Ok(Word::Halt) => break,
                Ok(Word::Exec(instr)) => self.step(task, instr).await,
                Err(e) => Err(e),
            };
            if let Err(reason) = result {
                if reason.kind() == AbortKind::SegmentUnavailable {
                    error!("task {} lost its data: {}", task.id(), reason);
                } else {
                    warn!(
                        "task {} aborted at instruction {}: {}",
                        task.id(),
                        executed,
                        reason
                    );
                }
                return TaskOutcome::Aborted { executed, reason };
            }
            executed += 1;
            if !self.latency.is_zero() {
                tokio::time::sleep(self.latency).await;
            }
        }
        TaskOutcome::Completed { executed }
    }

    /// Runs one instruction, returning the byte written back.
    pub async fn step(&self, task: &Task, instr: Instruction) -> Result<u8, TaskError> {
        let index = instr.segment as usize;
        if index >= task.segment_count() {
            Err(TaskError::MalformedSegment {
                index,
                count: task.segment_count(),
            })?
        }
        let SegmentRef { node, slot } = task
            .segment(index)
            .ok_or(TaskError::SegmentUnavailable { segment: index })?;
        let cache = self
            .topology
            .node(node)
            .map_err(|e| access_error(index, e))?;
        let offset = instr.offset as usize;

        let value = cache
            .read(slot, offset)
            .await
            .map_err(|e| access_error(index, e))?;
        let new_value = instr.op.apply(value, instr.imm)?;
        cache
            .write(slot, offset, new_value)
            .await
            .map_err(|e| access_error(index, e))?;

        trace!(
            task = %task.id(),
            node,
            slot,
            "{}: {:#04X} -> {:#04X}",
            instr,
            value,
            new_value
        );
        Ok(new_value)
    }
}

fn access_error(segment: usize, error: CacheError) -> TaskError {
    match error {
        CacheError::OffsetOutOfRange { offset } => TaskError::OffsetOutOfRange { offset },
        _ => TaskError::SegmentUnavailable { segment },
    }
}

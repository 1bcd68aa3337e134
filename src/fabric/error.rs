use std::fmt;

use tokio::task::JoinError;

use super::{NodeId, SlotIndex};

/// System level failures. Only these ever reach the caller of
/// [`System`](super::system::System); everything task related is handled
/// inside the workers.
#[derive(Debug, PartialEq, Eq)]
pub enum Error {
    InvalidNodeCount(usize),
    AlreadyStarted,
    WorkerFailed { node: NodeId, reason: String },
}

impl Error {
    pub(crate) fn worker_failed(node: NodeId, error: JoinError) -> Self {
        let reason = if error.is_panic() {
            "panicked".to_string()
        } else {
            "cancelled".to_string()
        };
        Self::WorkerFailed { node, reason }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::InvalidNodeCount(n) => {
                write!(f, "can only have 1, 4, 8, or 16 nodes (got {})", n)
            }
            Error::AlreadyStarted => write!(f, "workers are already running"),
            Error::WorkerFailed { node, reason } => {
                write!(f, "worker for node {} {}", node, reason)
            }
        }
    }
}

impl std::error::Error for Error {}

/// Failures of a single node cache operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheError {
    OutOfMemory { node: NodeId },
    SlotEmpty { node: NodeId, slot: SlotIndex },
    SlotOutOfRange { node: NodeId, slot: SlotIndex },
    OffsetOutOfRange { offset: usize },
    UnknownNode(NodeId),
}

impl fmt::Display for CacheError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheError::OutOfMemory { node } => {
                write!(f, "node {} has run out of memory", node)
            }
            CacheError::SlotEmpty { node, slot } => {
                write!(f, "slot {} on node {} holds no line", slot, node)
            }
            CacheError::SlotOutOfRange { node, slot } => {
                write!(f, "slot {} is outside node {}'s cache", slot, node)
            }
            CacheError::OffsetOutOfRange { offset } => {
                write!(f, "offset {} is outside the line", offset)
            }
            CacheError::UnknownNode(node) => write!(f, "no node {}", node),
        }
    }
}

impl std::error::Error for CacheError {}

/// Why a task was aborted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskError {
    /// The instruction names a segment the task doesn't have.
    MalformedSegment { index: usize, count: usize },
    /// The segment was never placed or its line is gone.
    SegmentUnavailable { segment: usize },
    DivisionByZero,
    UnknownOpcode(u8),
    OffsetOutOfRange { offset: usize },
    TooManySegments(usize),
    ProgramTooLong(usize),
}

impl TaskError {
    pub fn kind(&self) -> AbortKind {
        match self {
            TaskError::MalformedSegment { .. } => AbortKind::MalformedSegment,
            TaskError::SegmentUnavailable { .. } => AbortKind::SegmentUnavailable,
            TaskError::DivisionByZero => AbortKind::DivisionByZero,
            TaskError::UnknownOpcode(_) => AbortKind::UnknownOpcode,
            TaskError::OffsetOutOfRange { .. } => AbortKind::OffsetOutOfRange,
            TaskError::TooManySegments(_) | TaskError::ProgramTooLong(_) => {
                AbortKind::InvalidTask
            }
        }
    }
}

impl fmt::Display for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskError::MalformedSegment { index, count } => write!(
                f,
                "instruction uses segment {} but the task has {}",
                index, count
            ),
            TaskError::SegmentUnavailable { segment } => {
                write!(f, "segment {} is not in any cache", segment)
            }
            TaskError::DivisionByZero => write!(f, "division by zero"),
            TaskError::UnknownOpcode(op) => write!(f, "unknown opcode {:X}", op),
            TaskError::OffsetOutOfRange { offset } => {
                write!(f, "offset {} is outside the line", offset)
            }
            TaskError::TooManySegments(n) => {
                write!(f, "a task can't have {} data segments", n)
            }
            TaskError::ProgramTooLong(n) => {
                write!(f, "a task can't have {} instructions", n)
            }
        }
    }
}

impl std::error::Error for TaskError {}

/// Coarse abort categories used for worker statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AbortKind {
    MalformedSegment,
    SegmentUnavailable,
    DivisionByZero,
    UnknownOpcode,
    OffsetOutOfRange,
    InvalidTask,
}

impl fmt::Display for AbortKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AbortKind::MalformedSegment => "malformed-segment",
            AbortKind::SegmentUnavailable => "segment-unavailable",
            AbortKind::DivisionByZero => "division-by-zero",
            AbortKind::UnknownOpcode => "unknown-opcode",
            AbortKind::OffsetOutOfRange => "offset-out-of-range",
            AbortKind::InvalidTask => "invalid-task",
        };
        f.write_str(name)
    }
}

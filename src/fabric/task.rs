use std::fmt;

use rand::Rng;
use tracing::{debug, warn};
use typed_builder::TypedBuilder;

use super::{
    cache::{CacheLine, Topology},
    error::TaskError,
    isa::{Instruction, Opcode, HALT},
    placement::PlacementPolicy,
    NodeId, SlotIndex, LINE_SIZE, MAX_INSTRUCTIONS, MAX_SEGMENTS,
};

/// Where a placed segment lives.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SegmentRef {
    pub node: NodeId,
    pub slot: SlotIndex,
}

/// Tasks are numbered per worker.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TaskId {
    pub node: NodeId,
    pub serial: u64,
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.node, self.serial)
    }
}

/// The initial data and program a task is stamped from.
#[derive(Clone, Debug, TypedBuilder)]
pub struct TaskTemplate {
    /// Initial bytes of each data segment.
    #[builder(default = vec![[0; LINE_SIZE]; MAX_SEGMENTS])]
    pub segments: Vec<[u8; LINE_SIZE]>,
    /// Instruction words. Execution stops at the first [`HALT`] or after
    /// [`MAX_INSTRUCTIONS`] words.
    pub program: Vec<u32>,
}

impl TaskTemplate {
    pub fn validate(&self) -> Result<(), TaskError> {
        if self.segments.len() > MAX_SEGMENTS {
            Err(TaskError::TooManySegments(self.segments.len()))?
        }
        if self.program.len() > MAX_INSTRUCTIONS {
            Err(TaskError::ProgramTooLong(self.program.len()))?
        }
        Ok(())
    }
}

impl Default for TaskTemplate {
    /// Three zeroed segments and four additions on segment 0.
    fn default() -> Self {
        Self::builder()
            .program(vec![0x0000_0145, 0x0000_2120, 0x0000_4135, 0x0000_A130, HALT])
            .build()
    }
}

/// A program plus its data segments.
///
/// Before placement a segment is only its initial bytes. Placement binds
/// each segment to a slot the task then owns exclusively until
/// [`Task::release`]; tasks are deliberately not `Clone` so a slot can never
/// be referenced by two live tasks.
pub struct Task {
    id: TaskId,
    data: Vec<[u8; LINE_SIZE]>,
    segments: Vec<Option<SegmentRef>>,
    program: Vec<u32>,
}

impl Task {
    pub fn new(id: TaskId, template: &TaskTemplate) -> Result<Self, TaskError> {
        template.validate()?;
        Ok(Self::from_parts(id, template.segments.clone(), template.program.clone()))
    }

    fn from_parts(id: TaskId, data: Vec<[u8; LINE_SIZE]>, program: Vec<u32>) -> Self {
        Self {
            id,
            segments: vec![None; data.len()],
            data,
            program,
        }
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    /// The placed location of segment `index`, if it has one.
    pub fn segment(&self, index: usize) -> Option<SegmentRef> {
        self.segments.get(index).copied().flatten()
    }

    pub fn segments(&self) -> &[Option<SegmentRef>] {
        &self.segments
    }

    pub fn program(&self) -> &[u32] {
        &self.program
    }

    /// The first segment that has no slot, if any.
    pub fn unplaced(&self) -> Option<usize> {
        self.segments.iter().position(Option::is_none)
    }

    /// Places every unplaced segment through the policy. Segments whose
    /// target node is full stay unplaced; returns how many failed.
    pub async fn place(&mut self, policy: &PlacementPolicy) -> usize {
        let mut failed = 0;
        for (index, segment) in self.segments.iter_mut().enumerate() {
            if segment.is_some() {
                continue;
            }
            match policy.place(CacheLine::new(self.data[index])).await {
                Ok(placed) => *segment = Some(placed),
                Err(e) => {
                    warn!("task {} segment {} was not placed: {}", self.id, index, e);
                    failed += 1;
                }
            }
        }
        debug!(task = %self.id, segments = ?self.segments, "placed task");
        failed
    }

    /// Frees every slot the task owns and forgets the references. Returns the
    /// number of lines freed.
    pub async fn release(&mut self, topology: &Topology) -> usize {
        let mut freed = 0;
        for segment in self.segments.iter_mut() {
            let Some(SegmentRef { node, slot }) = segment.take() else {
                continue;
            };
            let result = match topology.node(node) {
                Ok(cache) => cache.free(slot).await.map(|_| ()),
                Err(e) => Err(e),
            };
            match result {
                Ok(()) => freed += 1,
                Err(e) => warn!("task {} lost a segment: {}", self.id, e),
            }
        }
        freed
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("segments", &self.segments)
            .field("program", &self.program.len())
            .finish()
    }
}

/// Produces the tasks workers keep resident.
pub trait TaskFactory: Send + Sync {
    fn create(&self, id: TaskId) -> Task;
}

/// Stamps every task from one validated template.
pub struct TemplateFactory {
    template: TaskTemplate,
}

impl TemplateFactory {
    pub fn new(template: TaskTemplate) -> Result<Self, TaskError> {
        template.validate()?;
        Ok(Self { template })
    }
}

impl Default for TemplateFactory {
    fn default() -> Self {
        Self {
            template: TaskTemplate::default(),
        }
    }
}

impl TaskFactory for TemplateFactory {
    fn create(&self, id: TaskId) -> Task {
        Task::from_parts(
            id,
            self.template.segments.clone(),
            self.template.program.clone(),
        )
    }
}

/// Generates random data and random well formed programs. Immediates are
/// drawn from the whole byte range, so division and modulo by zero do come
/// up and exercise the abort path.
#[derive(Default)]
pub struct RandomFactory;

impl RandomFactory {
    pub fn template<R: Rng>(rng: &mut R) -> TaskTemplate {
        let segment_count = rng.gen_range(1..=MAX_SEGMENTS);
        let segments = (0..segment_count)
            .map(|_| {
                let mut line = [0u8; LINE_SIZE];
                rng.fill(&mut line[..]);
                line
            })
            .collect();
        let len = rng.gen_range(1..MAX_INSTRUCTIONS);
        let mut program: Vec<u32> = (0..len)
            .map(|_| {
                Instruction::new(
                    Opcode::ALL[rng.gen_range(0..Opcode::ALL.len())],
                    rng.gen_range(0..segment_count) as u16,
                    rng.gen_range(0..LINE_SIZE) as u8,
                    rng.gen(),
                )
                .encode()
            })
            .collect();
        program.push(HALT);
        TaskTemplate { segments, program }
    }
}

impl TaskFactory for RandomFactory {
    fn create(&self, id: TaskId) -> Task {
        let template = Self::template(&mut rand::thread_rng());
        Task::from_parts(id, template.segments, template.program)
    }
}

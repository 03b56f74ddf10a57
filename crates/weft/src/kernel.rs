//! Kernel binding metadata and the execution contract for bound kernels.

use std::sync::Arc;

use smallvec::SmallVec;
use thiserror::Error;

use crate::executor::frame::KernelContext;
use crate::graph::Node;
use crate::spec::{MemType, NodeId, ProviderId, QueueId};

/// Failure reported by a kernel's compute function.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct KernelError(String);

impl KernelError {
    pub fn new(message: impl Into<String>) -> Self {
        KernelError(message.into())
    }
}

pub type KernelResult = Result<(), KernelError>;

/// Declarative properties of a kernel binding that the planner consumes:
/// aliasing requirements, in-place opportunities, per-argument memory-type
/// hints, and the execution queue.
#[derive(Debug, Clone, Default)]
pub struct KernelInfo {
    queue_id: QueueId,
    /// `(input, output)` pairs where the output must share the input's
    /// storage (e.g. reshape).
    alias_map: SmallVec<[(usize, usize); 2]>,
    /// `(input, output)` pairs where the output may share the input's
    /// storage when sizes match and the input is on its last use.
    inplace_map: SmallVec<[(usize, usize); 2]>,
    input_mem: SmallVec<[(usize, MemType); 2]>,
    output_mem: SmallVec<[(usize, MemType); 2]>,
}

impl KernelInfo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_queue(mut self, queue: QueueId) -> Self {
        self.queue_id = queue;
        self
    }

    pub fn with_alias(mut self, input: usize, output: usize) -> Self {
        self.alias_map.push((input, output));
        self
    }

    pub fn with_inplace(mut self, input: usize, output: usize) -> Self {
        self.inplace_map.push((input, output));
        self
    }

    pub fn with_input_mem(mut self, input: usize, mem_type: MemType) -> Self {
        self.input_mem.push((input, mem_type));
        self
    }

    pub fn with_output_mem(mut self, output: usize, mem_type: MemType) -> Self {
        self.output_mem.push((output, mem_type));
        self
    }

    pub fn exec_queue_id(&self) -> QueueId {
        self.queue_id
    }

    /// `(input, output)` pairs carrying mandatory storage aliasing.
    pub fn alias_pairs(&self) -> &[(usize, usize)] {
        &self.alias_map
    }

    /// `(input, output)` pairs eligible for opportunistic in-place update.
    pub fn inplace_pairs(&self) -> &[(usize, usize)] {
        &self.inplace_map
    }

    pub fn input_memory_type(&self, input: usize) -> MemType {
        self.input_mem
            .iter()
            .find(|(i, _)| *i == input)
            .map(|(_, m)| *m)
            .unwrap_or_default()
    }

    pub fn output_memory_type(&self, output: usize) -> MemType {
        self.output_mem
            .iter()
            .find(|(o, _)| *o == output)
            .map(|(_, m)| *m)
            .unwrap_or_default()
    }
}

/// Planner-side lookup of the kernel binding for a node. A `None` return
/// aborts planning.
pub trait KernelOracle {
    fn kernel_info(&self, node: &Node) -> Option<&KernelInfo>;
}

/// A kernel instance bound to a node, ready to execute.
pub trait NodeKernel: Send + Sync {
    fn info(&self) -> &KernelInfo;

    fn provider(&self) -> ProviderId {
        ProviderId::cpu()
    }

    fn compute(&self, ctx: &mut KernelContext<'_>) -> KernelResult;
}

/// Executor-side lookup of bound kernel instances by node index.
pub trait KernelSet: Send + Sync {
    fn kernel(&self, node: NodeId) -> Option<Arc<dyn NodeKernel>>;
}

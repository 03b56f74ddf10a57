//! Device placement oracle: resolves the memory descriptor an allocator
//! would produce for a node argument, and the provider a node is bound to.

use crate::graph::Node;
use crate::spec::{DeviceMemoryInfo, MemType, ProviderId};

/// Answers placement questions during planning. Implementations typically
/// wrap a registry of per-provider allocators.
pub trait PlacementOracle {
    /// The execution provider `node` is bound to, or `None` when no binding
    /// exists (which aborts planning).
    fn provider(&self, node: &Node) -> Option<ProviderId>;

    /// The memory descriptor the bound provider's allocator would produce for
    /// argument `arg_idx` with the given memory-type hint.
    fn allocator_info(&self, node: &Node, arg_idx: usize, mem_type: MemType) -> DeviceMemoryInfo;

    fn default_cpu_memory_info(&self) -> DeviceMemoryInfo {
        DeviceMemoryInfo::cpu()
    }
}

/// Placement oracle for single-device CPU execution: every node is bound to
/// the CPU provider and every argument lands in default CPU memory.
#[derive(Debug, Clone, Copy, Default)]
pub struct CpuPlacement;

impl PlacementOracle for CpuPlacement {
    fn provider(&self, _node: &Node) -> Option<ProviderId> {
        Some(ProviderId::cpu())
    }

    fn allocator_info(&self, _node: &Node, _arg_idx: usize, _mem_type: MemType) -> DeviceMemoryInfo {
        DeviceMemoryInfo::cpu()
    }
}

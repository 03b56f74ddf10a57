//! Allocation planner: a single offline analysis over a topologically ordered
//! graph that decides, for every value, how its buffer is obtained and when
//! it may be released.
//!
//! Planning runs in four passes: initialization, use counting with placement
//! assignment, reuse planning over an LRU freelist, and fence checking plus
//! deallocation emission. The output is deterministic for identical inputs.

use std::collections::VecDeque;

use thiserror::Error;

use crate::graph::{GraphError, GraphView, Node};
use crate::kernel::KernelOracle;
use crate::placement::PlacementOracle;
use crate::spec::{DeviceMemoryInfo, MemType, TensorSpec, ValueId, ValueType};
use crate::values::UnknownValue;

mod plan;

pub use plan::{AllocKind, ExecutionPlan, PlanDump, PlanStep, ValuePlan};

/// Static type lookup per value, fed by external type inference. Values with
/// no known type are treated conservatively: they never share storage.
pub trait ShapeOracle {
    fn value_type(&self, value: ValueId) -> Option<&ValueType>;
}

/// Planning-time configuration supplied by the session.
pub trait PlannerContext {
    /// Whether the plan will be executed by the parallel dispatcher. Freelist
    /// reuse is disabled under parallel execution because two concurrently
    /// runnable nodes could otherwise alias the same buffer.
    fn is_parallel(&self) -> bool;
}

/// Minimal [`PlannerContext`] carrying just the execution mode.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlanConfig {
    pub parallel: bool,
}

impl PlannerContext for PlanConfig {
    fn is_parallel(&self) -> bool {
        self.parallel
    }
}

/// Fatal planning failures. Any of these aborts planning and discards the
/// partial plan.
#[derive(Debug, Error)]
pub enum PlanError {
    #[error(transparent)]
    UnknownValue(#[from] UnknownValue),
    #[error("no kernel bound for {op_type} node `{node}`")]
    NoKernel { node: String, op_type: String },
    #[error("no execution provider bound for node `{node}`")]
    NoProvider { node: String },
    #[error(transparent)]
    Graph(#[from] GraphError),
}

/// Everything the planner consumes. The graph's node order is taken as the
/// step sequence; the planner never reorders.
pub struct PlannerInputs<'a> {
    pub graph: &'a GraphView,
    pub kernels: &'a dyn KernelOracle,
    pub placement: &'a dyn PlacementOracle,
    pub shapes: &'a dyn ShapeOracle,
    pub context: &'a dyn PlannerContext,
    /// Set when planning a nested subgraph; enables the identity
    /// pass-through decision for loop state variables.
    pub parent_node: Option<&'a Node>,
}

/// Produces the execution plan for `inputs`.
pub fn create_plan(inputs: &PlannerInputs<'_>) -> Result<ExecutionPlan, PlanError> {
    PlannerImpl::new(inputs).create()
}

/// Auxiliary per-value state used only while planning.
struct ValueAux {
    use_count: u32,
    /// Parent pointer of the reuse forest; a value that uses its own buffer
    /// is its own root. Parents always point at earlier values, so the
    /// forest is acyclic by construction.
    reused_root: ValueId,
}

/// Freelist entry: a root buffer whose last use has completed at the given
/// step.
struct FreeBufferInfo {
    value: ValueId,
    deallocate_point: usize,
}

enum SharedKind {
    Reuse,
    Alias,
}

struct PlannerImpl<'a> {
    inputs: &'a PlannerInputs<'a>,
    aux: Vec<ValueAux>,
    /// Buffers available for recycling, most recently freed at the front.
    freelist: VecDeque<FreeBufferInfo>,
    steps: Vec<PlanStep>,
    values: Vec<ValuePlan>,
    node_has_fence: Vec<bool>,
    graph_sourced: Vec<bool>,
    is_initializer: Vec<bool>,
    is_graph_output: Vec<bool>,
}

impl<'a> PlannerImpl<'a> {
    fn new(inputs: &'a PlannerInputs<'a>) -> Self {
        let graph = inputs.graph;
        let num_values = graph.num_values();

        let mut graph_sourced = vec![false; num_values];
        let mut is_initializer = vec![false; num_values];
        let mut is_graph_output = vec![false; num_values];
        for &v in graph.inputs().iter().chain(graph.outer_scope_refs()) {
            graph_sourced[v.index()] = true;
        }
        for &v in graph.initializers() {
            graph_sourced[v.index()] = true;
            is_initializer[v.index()] = true;
        }
        for &v in graph.outputs() {
            is_graph_output[v.index()] = true;
        }

        let default_placement = inputs.placement.default_cpu_memory_info();
        Self {
            inputs,
            aux: (0..num_values)
                .map(|index| ValueAux {
                    use_count: 0,
                    reused_root: ValueId(index as u32),
                })
                .collect(),
            freelist: VecDeque::new(),
            steps: graph
                .nodes()
                .iter()
                .map(|node| PlanStep {
                    node: node.id,
                    to_free: 0..0,
                })
                .collect(),
            values: (0..num_values)
                .map(|_| ValuePlan {
                    kind: AllocKind::Fresh,
                    placement: default_placement.clone(),
                    fence_if_async: false,
                })
                .collect(),
            node_has_fence: vec![false; graph.max_node_index()],
            graph_sourced,
            is_initializer,
            is_graph_output,
        }
    }

    fn create(mut self) -> Result<ExecutionPlan, PlanError> {
        self.compute_use_counts()?;
        self.compute_reuse_plan()?;
        self.compute_fence_check();
        let to_be_freed = self.generate_deallocation_plan();
        Ok(ExecutionPlan {
            steps: self.steps,
            values: self.values,
            node_has_fence: self.node_has_fence,
            to_be_freed,
        })
    }

    /// Resets per-value state at a definition site.
    fn process_def(&mut self, value: ValueId) {
        let aux = &mut self.aux[value.index()];
        aux.use_count = 0;
        aux.reused_root = value;
    }

    fn root_of(&self, value: ValueId) -> ValueId {
        let mut current = value;
        loop {
            let parent = self.aux[current.index()].reused_root;
            if parent == current {
                return current;
            }
            current = parent;
        }
    }

    fn tensor_spec(&self, value: ValueId) -> Option<&'a TensorSpec> {
        self.inputs.shapes.value_type(value)?.as_tensor()
    }

    fn same_size(&self, a: ValueId, b: ValueId) -> bool {
        match (self.tensor_spec(a), self.tensor_spec(b)) {
            (Some(spec_a), Some(spec_b)) => spec_a.same_size(spec_b),
            _ => false,
        }
    }

    fn no_kernel(node: &Node) -> PlanError {
        PlanError::NoKernel {
            node: node.name.clone(),
            op_type: node.op_type.clone(),
        }
    }

    fn no_provider(node: &Node) -> PlanError {
        PlanError::NoProvider {
            node: node.name.clone(),
        }
    }

    /// Pass B: static reference counts, definition sites, and placements.
    ///
    /// Graph inputs, outer-scope references, initializers, and graph outputs
    /// each receive one extra sentinel use so their buffers are never
    /// recycled out from under the caller.
    fn compute_use_counts(&mut self) -> Result<(), PlanError> {
        let graph = self.inputs.graph;

        for &v in graph.inputs() {
            self.process_def(v);
            self.aux[v.index()].use_count += 1;
        }
        for &v in graph.outer_scope_refs() {
            self.process_def(v);
            self.aux[v.index()].use_count += 1;
        }
        for &v in graph.initializers() {
            self.process_def(v);
            self.aux[v.index()].use_count += 1;
        }

        for node in graph.nodes() {
            let kinfo = self
                .inputs
                .kernels
                .kernel_info(node)
                .ok_or_else(|| Self::no_kernel(node))?;
            if self.inputs.placement.provider(node).is_none() {
                return Err(Self::no_provider(node));
            }

            for (idx, slot) in node.inputs.iter().enumerate() {
                let Some(v) = *slot else { continue };
                self.aux[v.index()].use_count += 1;
                if self.graph_sourced[v.index()] {
                    self.values[v.index()].placement =
                        self.inputs
                            .placement
                            .allocator_info(node, idx, kinfo.input_memory_type(idx));
                }
            }
            for (idx, slot) in node.implicit_inputs.iter().enumerate() {
                let Some(v) = *slot else { continue };
                self.aux[v.index()].use_count += 1;
                if self.graph_sourced[v.index()] {
                    self.values[v.index()].placement =
                        self.inputs
                            .placement
                            .allocator_info(node, idx, kinfo.input_memory_type(idx));
                }
            }

            for (idx, slot) in node.outputs.iter().enumerate() {
                let Some(v) = *slot else { continue };
                self.process_def(v);
                self.aux[v.index()].use_count += 1;
                self.values[v.index()].placement =
                    self.inputs
                        .placement
                        .allocator_info(node, idx, kinfo.output_memory_type(idx));
            }

            if !kinfo.exec_queue_id().is_default() {
                for v in node.all_args() {
                    self.values[v.index()].fence_if_async = true;
                }
            }
        }

        for &v in graph.outputs() {
            self.aux[v.index()].use_count += 1;
        }

        Ok(())
    }

    /// Initializer placement sub-pass: gather every consumption site of each
    /// initializer; if all sites agree on a location the initializer lives
    /// there, otherwise it falls back to default CPU memory and downstream
    /// kernels insert copies.
    fn plan_initializers(&mut self) -> Result<(), PlanError> {
        let graph = self.inputs.graph;
        let mut locations: Vec<Vec<DeviceMemoryInfo>> = vec![Vec::new(); self.values.len()];

        for node in graph.nodes() {
            for (idx, slot) in node.inputs.iter().enumerate() {
                let Some(v) = *slot else { continue };
                if !self.is_initializer[v.index()] {
                    continue;
                }
                locations[v.index()].push(self.location_for_node_input(node, idx)?);
            }
        }

        for (index, locs) in locations.iter().enumerate() {
            let Some(first) = locs.first() else { continue };
            self.values[index].kind = AllocKind::Static;
            self.values[index].placement = if locs.iter().all(|loc| loc == first) {
                first.clone()
            } else {
                self.inputs.placement.default_cpu_memory_info()
            };
        }
        Ok(())
    }

    fn location_for_node_input(
        &self,
        node: &Node,
        input_idx: usize,
    ) -> Result<DeviceMemoryInfo, PlanError> {
        let kinfo = self
            .inputs
            .kernels
            .kernel_info(node)
            .ok_or_else(|| Self::no_kernel(node))?;
        if self.inputs.placement.provider(node).is_none() {
            return Err(Self::no_provider(node));
        }
        if kinfo.input_memory_type(input_idx) == MemType::CpuInput {
            // Initializers are not produced by any node, so pinning them to
            // the CPU provider is always valid.
            return Ok(self.inputs.placement.default_cpu_memory_info());
        }
        Ok(self
            .inputs
            .placement
            .allocator_info(node, input_idx, MemType::Default))
    }

    /// Records that `reused_for` shares the root buffer underlying `reused`,
    /// splicing its pending uses into the root's count.
    fn reuse(&mut self, reused: ValueId, reused_for: ValueId, kind: SharedKind) {
        let original = self.root_of(reused);
        self.aux[reused_for.index()].reused_root = original;
        let spliced = self.aux[reused_for.index()].use_count;
        self.aux[original.index()].use_count += spliced;
        self.values[reused_for.index()].kind = match kind {
            SharedKind::Reuse => AllocKind::Reuse(original),
            SharedKind::Alias => AllocKind::Alias(original),
        };
    }

    /// An input this node's output must or may share storage with: forced
    /// aliases first (mandatory for correctness), then in-place candidates
    /// whose root buffer is on its last use and matches the output size.
    fn find_reusable_input(&self, node: &Node, output_arg_num: usize, output: ValueId) -> Option<ValueId> {
        let kinfo = self.inputs.kernels.kernel_info(node)?;

        for &(input_idx, output_idx) in kinfo.alias_pairs() {
            if output_idx != output_arg_num {
                continue;
            }
            if let Some(Some(input)) = node.inputs.get(input_idx) {
                return Some(*input);
            }
        }

        for &(input_idx, output_idx) in kinfo.inplace_pairs() {
            if output_idx != output_arg_num {
                continue;
            }
            let Some(Some(input)) = node.inputs.get(input_idx) else {
                continue;
            };
            let original = self.root_of(*input);
            if self.aux[original.index()].use_count == 1 && self.same_size(*input, output) {
                return Some(*input);
            }
        }
        None
    }

    /// First-fit scan of the freelist for a dead buffer with the same
    /// placement and size as `output`. Values with unknown shapes are never
    /// selected, on either side of the comparison.
    fn find_reusable_tensor(&mut self, output: ValueId) -> Option<ValueId> {
        let required_spec = self.tensor_spec(output)?;
        let required_loc = self.values[output.index()].placement.clone();

        let mut found = None;
        for (position, entry) in self.freelist.iter().enumerate() {
            let candidate = entry.value;
            if self.values[candidate.index()].placement != required_loc {
                continue;
            }
            let Some(candidate_spec) = self.tensor_spec(candidate) else {
                continue;
            };
            if candidate_spec.same_size(required_spec) {
                found = Some(position);
                break;
            }
        }

        let position = found?;
        self.freelist.remove(position).map(|entry| entry.value)
    }

    /// Pass C: one decision per output of each step, in declaration order,
    /// then release bookkeeping for everything the step touches.
    fn compute_reuse_plan(&mut self) -> Result<(), PlanError> {
        let graph = self.inputs.graph;

        // Caller-owned buffers are never allocated or recycled here.
        for &v in graph.inputs().iter().chain(graph.outer_scope_refs()) {
            self.values[v.index()].kind = AllocKind::External;
        }
        self.plan_initializers()?;

        let parallel = self.inputs.context.is_parallel();
        for program_counter in 0..graph.nodes().len() {
            let node = &graph.nodes()[program_counter];
            let mut output_arg_num = 0;
            for slot in node.outputs.iter() {
                let Some(current) = *slot else { continue };
                if self.is_graph_output[current.index()] {
                    self.values[current.index()].kind = AllocKind::GraphOutput;
                    // A loop-state identity whose input is caller-owned can
                    // pass the storage straight through instead of copying.
                    let in_loop_body = self
                        .inputs
                        .parent_node
                        .is_some_and(|parent| parent.op_type == "Loop");
                    if in_loop_body && node.op_type == "Identity" {
                        if let Some(Some(input)) = node.inputs.first() {
                            if self.values[input.index()].kind == AllocKind::External {
                                self.reuse(*input, current, SharedKind::Alias);
                            }
                        }
                    }
                } else if self.is_non_tensor(current) {
                    // No sharing for opaque types.
                    self.values[current.index()].kind = AllocKind::Fresh;
                } else if let Some(reused) = self.find_reusable_input(node, output_arg_num, current)
                {
                    self.reuse(reused, current, SharedKind::Reuse);
                } else {
                    let recycled = if parallel {
                        None
                    } else {
                        self.find_reusable_tensor(current)
                    };
                    match recycled {
                        Some(reused) => self.reuse(reused, current, SharedKind::Reuse),
                        None => self.values[current.index()].kind = AllocKind::Fresh,
                    }
                }
                output_arg_num += 1;
            }

            // Inputs, implicit inputs, and outputs all drop one use of their
            // root buffer once this step completes. Outputs participate so
            // that dead outputs free immediately; caller-visible values are
            // protected by their sentinel use.
            for value in node.all_args() {
                let original = self.root_of(value);
                let count = &mut self.aux[original.index()].use_count;
                *count -= 1;
                if *count == 0 {
                    self.freelist.push_front(FreeBufferInfo {
                        value: original,
                        deallocate_point: program_counter,
                    });
                }
            }
        }
        Ok(())
    }

    fn is_non_tensor(&self, value: ValueId) -> bool {
        matches!(
            self.inputs.shapes.value_type(value),
            Some(ValueType::Opaque(_))
        )
    }

    fn value_has_fence(&self, value: ValueId) -> bool {
        let plan = &self.values[value.index()];
        if plan.fence_if_async {
            return true;
        }
        // A reused buffer shares its fence with the root it lives in.
        match plan.kind {
            AllocKind::Reuse(root) => self.values[root.index()].fence_if_async,
            _ => false,
        }
    }

    /// Pass D, first half: a step needs fence coordination when any of its
    /// arguments carries a fence, directly or through the buffer it reuses.
    fn compute_fence_check(&mut self) {
        for node in self.inputs.graph.nodes() {
            let has_fence = node.all_args().any(|value| self.value_has_fence(value));
            self.node_has_fence[node.id.index()] = has_fence;
        }
    }

    /// Pass D, second half: convert the freelist into the flat deallocation
    /// schedule. Walking the list back to front visits buffers oldest-freed
    /// first, so each step's entries form one contiguous slice.
    fn generate_deallocation_plan(&mut self) -> Vec<ValueId> {
        let mut to_be_freed = Vec::with_capacity(self.freelist.len());
        let mut prev_point: Option<usize> = None;
        let mut range_start = 0usize;

        for entry in self.freelist.iter().rev() {
            if prev_point != Some(entry.deallocate_point) {
                if let Some(point) = prev_point {
                    self.steps[point].to_free = range_start..to_be_freed.len();
                }
                prev_point = Some(entry.deallocate_point);
                range_start = to_be_freed.len();
            }
            to_be_freed.push(entry.value);
        }
        if let Some(point) = prev_point {
            self.steps[point].to_free = range_start..to_be_freed.len();
        }
        to_be_freed
    }
}

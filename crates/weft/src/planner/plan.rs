//! The planner's product: one allocation decision per value, the step
//! sequence, per-node fence flags, and the deallocation schedule.

use std::fmt;
use std::ops::Range;

use serde::{Deserialize, Serialize};

use crate::graph::GraphView;
use crate::spec::{DeviceMemoryInfo, NodeId, ValueId};
use crate::values::ValueTable;

/// How the buffer backing a value is obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AllocKind {
    /// Supplied by the caller (graph input or outer-scope reference); never
    /// reused.
    External,
    /// Long-lived constant allocated once at load time.
    Static,
    /// A new buffer allocated at the definition site.
    Fresh,
    /// Shares storage with the root buffer of an earlier value.
    Reuse(ValueId),
    /// Allocated fresh and materialized into the caller's output slot.
    GraphOutput,
    /// Identity pass-through of another value's storage; no new buffer and
    /// no copy.
    Alias(ValueId),
}

impl AllocKind {
    /// The value whose storage this decision points at, when it shares one.
    pub fn reused_value(&self) -> Option<ValueId> {
        match self {
            AllocKind::Reuse(value) | AllocKind::Alias(value) => Some(*value),
            _ => None,
        }
    }
}

impl fmt::Display for AllocKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AllocKind::External => f.write_str("External"),
            AllocKind::Static => f.write_str("Static"),
            AllocKind::Fresh => f.write_str("Fresh"),
            AllocKind::Reuse(value) => write!(f, "Reuse {value}"),
            AllocKind::GraphOutput => f.write_str("GraphOutput"),
            AllocKind::Alias(value) => write!(f, "Alias {value}"),
        }
    }
}

/// Allocation decision and placement for one value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValuePlan {
    pub kind: AllocKind,
    pub placement: DeviceMemoryInfo,
    /// True when this value is produced or consumed on a non-default
    /// execution queue and needs a fence when its provider supports one.
    pub fence_if_async: bool,
}

/// One slot in the execution order: the node to run and the slice of
/// [`ExecutionPlan::to_be_freed`] that becomes releasable once it completes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanStep {
    pub node: NodeId,
    pub to_free: Range<usize>,
}

/// Immutable execution plan: topological step sequence, per-value allocation
/// decisions, per-node fence flags, and the deallocation schedule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionPlan {
    pub(crate) steps: Vec<PlanStep>,
    pub(crate) values: Vec<ValuePlan>,
    pub(crate) node_has_fence: Vec<bool>,
    pub(crate) to_be_freed: Vec<ValueId>,
}

impl ExecutionPlan {
    pub fn steps(&self) -> &[PlanStep] {
        &self.steps
    }

    pub fn num_values(&self) -> usize {
        self.values.len()
    }

    pub fn value_plan(&self, value: ValueId) -> Option<&ValuePlan> {
        self.values.get(value.index())
    }

    pub fn value_plans(&self) -> &[ValuePlan] {
        &self.values
    }

    pub fn node_has_fence(&self, node: NodeId) -> bool {
        self.node_has_fence.get(node.index()).copied().unwrap_or(false)
    }

    pub fn to_be_freed(&self) -> &[ValueId] {
        &self.to_be_freed
    }

    /// Values eligible for release once the step at `step_idx` completes.
    pub fn freed_at_step(&self, step_idx: usize) -> &[ValueId] {
        self.steps
            .get(step_idx)
            .map(|step| &self.to_be_freed[step.to_free.clone()])
            .unwrap_or(&[])
    }

    /// Follows reuse decisions to the value whose physical storage backs
    /// `value`. Decision chains are collapsed during planning, so this
    /// normally terminates in one hop.
    pub fn root_of(&self, value: ValueId) -> ValueId {
        let mut current = value;
        while let Some(plan) = self.value_plan(current) {
            match plan.kind.reused_value() {
                Some(next) if next != current => current = next,
                _ => break,
            }
        }
        current
    }

    /// Human-readable rendering of the plan for diagnostics.
    pub fn display<'a>(&'a self, graph: &'a GraphView, values: &'a ValueTable) -> PlanDump<'a> {
        PlanDump {
            plan: self,
            graph,
            values,
        }
    }
}

/// Borrowing `Display` adapter; the textual format is informative only.
pub struct PlanDump<'a> {
    plan: &'a ExecutionPlan,
    graph: &'a GraphView,
    values: &'a ValueTable,
}

impl fmt::Display for PlanDump<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Allocation Plan:")?;
        for index in 0..self.plan.num_values() {
            let value = ValueId(index as u32);
            let name = self.values.name_of(value).unwrap_or("<unnamed>");
            let plan = &self.plan.values[index];
            write!(f, "({index}) {name} : {}", plan.kind)?;
            write!(f, ", {}", plan.placement)?;
            if plan.fence_if_async {
                write!(f, ", use fence when async")?;
            }
            writeln!(f)?;
        }

        writeln!(f, "\nExecution Plan:")?;
        for (step_idx, step) in self.plan.steps.iter().enumerate() {
            let node = self.graph.node(step.node);
            let (op_type, name) = node
                .map(|n| (n.op_type.as_str(), n.name.as_str()))
                .unwrap_or(("<unknown>", "<unknown>"));
            writeln!(f, "[{step_idx}] {op_type} ({name})")?;
            let freed = self.plan.freed_at_step(step_idx);
            if !freed.is_empty() {
                write!(f, "Free ml-values: ")?;
                for (i, value) in freed.iter().enumerate() {
                    let name = self.values.name_of(*value).unwrap_or("<unnamed>");
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "({value}) {name}")?;
                }
                writeln!(f)?;
            }
        }
        Ok(())
    }
}

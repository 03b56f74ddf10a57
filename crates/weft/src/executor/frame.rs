//! Per-run tensor storage. The frame materializes the plan's allocation
//! decisions: feeds land in caller-owned slots, reuse chains resolve to their
//! root buffers, and graph outputs are checked against any caller-provided
//! output containers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use thiserror::Error;

use crate::fence::{FenceFactory, FenceHandle};
use crate::graph::Node;
use crate::kernel::KernelError;
use crate::pattern::MemoryPattern;
use crate::planner::{AllocKind, ExecutionPlan};
use crate::spec::{DType, ValueId};
use crate::tensor::{MlValue, TensorValue};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("feed value {0} is out of range for this plan")]
    FeedOutOfRange(ValueId),
    #[error("value {0} is not available in the frame")]
    ValueUnavailable(ValueId),
    #[error("fetch value {0} was not produced by the run")]
    FetchUnavailable(ValueId),
    #[error("fetch value {0} does not match its preallocated output slot")]
    PreallocatedMismatch(ValueId),
}

impl From<FrameError> for KernelError {
    fn from(err: FrameError) -> Self {
        KernelError::new(err.to_string())
    }
}

/// Run-scoped storage manager bound to one execution plan.
pub struct ExecutionFrame {
    plan: Arc<ExecutionPlan>,
    slots: Vec<Mutex<Option<MlValue>>>,
    fences: Vec<Option<FenceHandle>>,
    fetches: Vec<ValueId>,
    preallocated: Vec<Option<TensorValue>>,
    /// Dtype and dimensions of every feed, present only when all feeds are
    /// tensors; drives memory-pattern capture.
    feed_specs: Option<Vec<(DType, Vec<usize>)>>,
}

impl ExecutionFrame {
    pub fn new(
        plan: Arc<ExecutionPlan>,
        feeds: Vec<(ValueId, MlValue)>,
        fetches: Vec<ValueId>,
        mut preallocated: Vec<Option<TensorValue>>,
        fence_factory: Option<&dyn FenceFactory>,
    ) -> Result<Self, FrameError> {
        let num_values = plan.num_values();
        let slots: Vec<Mutex<Option<MlValue>>> =
            (0..num_values).map(|_| Mutex::new(None)).collect();
        preallocated.resize(fetches.len(), None);

        let mut feed_specs = Some(Vec::with_capacity(feeds.len()));
        for (value, fed) in &feeds {
            if value.index() >= num_values {
                return Err(FrameError::FeedOutOfRange(*value));
            }
            match fed.as_tensor() {
                Some(tensor) => {
                    if let Some(specs) = feed_specs.as_mut() {
                        specs.push((tensor.dtype(), tensor.dims().to_vec()));
                    }
                }
                None => feed_specs = None,
            }
        }

        let fences = (0..num_values)
            .map(|index| {
                let value = ValueId(index as u32);
                let value_plan = plan.value_plan(value)?;
                if !value_plan.fence_if_async {
                    return None;
                }
                fence_factory.and_then(|factory| {
                    factory.create_fence(value, &value_plan.placement)
                })
            })
            .collect();

        let frame = Self {
            plan,
            slots,
            fences,
            fetches,
            preallocated,
            feed_specs,
        };
        for (value, fed) in feeds {
            *frame.slot(value).lock().expect("frame slot mutex poisoned") = Some(fed);
        }
        Ok(frame)
    }

    fn slot(&self, value: ValueId) -> &Mutex<Option<MlValue>> {
        &self.slots[self.plan.root_of(value).index()]
    }

    /// Reads the current value stored for `value`, following reuse chains to
    /// the backing buffer.
    pub fn value(&self, value: ValueId) -> Result<MlValue, FrameError> {
        if value.index() >= self.slots.len() {
            return Err(FrameError::ValueUnavailable(value));
        }
        self.slot(value)
            .lock()
            .expect("frame slot mutex poisoned")
            .clone()
            .ok_or(FrameError::ValueUnavailable(value))
    }

    /// Stores the produced value for `value`. Alias decisions are
    /// pass-throughs: the storage already lives in the aliased slot and no
    /// copy is made. Graph outputs are validated against any preallocated
    /// output container before they land.
    pub fn set_value(&self, value: ValueId, produced: MlValue) -> Result<(), FrameError> {
        if value.index() >= self.slots.len() {
            return Err(FrameError::ValueUnavailable(value));
        }
        let kind = self
            .plan
            .value_plan(value)
            .map(|plan| plan.kind)
            .unwrap_or(AllocKind::Fresh);
        if matches!(kind, AllocKind::Alias(_)) {
            return Ok(());
        }
        if kind == AllocKind::GraphOutput {
            if let Some(position) = self.fetches.iter().position(|fetch| *fetch == value) {
                if let Some(container) = &self.preallocated[position] {
                    let matches_container = produced.as_tensor().is_some_and(|tensor| {
                        tensor.dtype() == container.dtype() && tensor.dims() == container.dims()
                    });
                    if !matches_container {
                        return Err(FrameError::PreallocatedMismatch(value));
                    }
                }
            }
        }
        *self.slot(value).lock().expect("frame slot mutex poisoned") = Some(produced);
        Ok(())
    }

    /// The fence attached to `value`, if the plan flagged it and the factory
    /// produced one. A value that shares another buffer carries the fence of
    /// its root.
    pub fn fence(&self, value: ValueId) -> Option<&FenceHandle> {
        self.fences
            .get(self.plan.root_of(value).index())
            .and_then(Option::as_ref)
    }

    /// Releases every buffer the plan schedules for release after the step
    /// at `step_idx`. Intended for sequential drivers; the parallel
    /// dispatcher keeps buffers until the run settles.
    pub fn release_for_step(&self, step_idx: usize) {
        for &value in self.plan.freed_at_step(step_idx) {
            self.slot(value)
                .lock()
                .expect("frame slot mutex poisoned")
                .take();
        }
    }

    /// Copies the run's outputs out of the frame, in fetch order.
    pub fn take_fetches(&self) -> Result<Vec<MlValue>, FrameError> {
        self.fetches
            .iter()
            .map(|&value| {
                self.value(value)
                    .map_err(|_| FrameError::FetchUnavailable(value))
            })
            .collect()
    }

    pub fn feed_specs(&self) -> Option<&[(DType, Vec<usize>)]> {
        self.feed_specs.as_deref()
    }

    /// Snapshots the allocation behavior of this run: byte sizes of every
    /// freshly allocated value, aggregated per placement.
    pub fn capture_pattern(&self) -> MemoryPattern {
        let mut per_value = Vec::new();
        let mut total_bytes: Vec<(crate::spec::DeviceMemoryInfo, usize)> = Vec::new();
        for (index, value_plan) in self.plan.value_plans().iter().enumerate() {
            if !matches!(value_plan.kind, AllocKind::Fresh | AllocKind::GraphOutput) {
                continue;
            }
            let value = ValueId(index as u32);
            let guard = self.slots[index].lock().expect("frame slot mutex poisoned");
            let Some(bytes) = guard.as_ref().and_then(|v| v.as_tensor()).map(TensorValue::byte_len)
            else {
                continue;
            };
            per_value.push((value, bytes));
            match total_bytes
                .iter_mut()
                .find(|(placement, _)| *placement == value_plan.placement)
            {
                Some((_, total)) => *total += bytes,
                None => total_bytes.push((value_plan.placement.clone(), bytes)),
            }
        }
        MemoryPattern {
            per_value,
            total_bytes,
        }
    }
}

/// Kernel-facing view of the frame, bound to one node invocation.
pub struct KernelContext<'a> {
    frame: &'a ExecutionFrame,
    node: &'a Node,
    terminate: &'a AtomicBool,
}

impl<'a> KernelContext<'a> {
    pub(crate) fn new(
        frame: &'a ExecutionFrame,
        node: &'a Node,
        terminate: &'a AtomicBool,
    ) -> Self {
        Self {
            frame,
            node,
            terminate,
        }
    }

    pub fn node(&self) -> &Node {
        self.node
    }

    pub fn input_count(&self) -> usize {
        self.node.inputs.len()
    }

    pub fn output_count(&self) -> usize {
        self.node.outputs.len()
    }

    fn arg(&self, slot: Option<&Option<ValueId>>, what: &str, idx: usize) -> Result<ValueId, KernelError> {
        slot.and_then(|v| *v)
            .ok_or_else(|| KernelError::new(format!("{what} {idx} is absent on node `{}`", self.node.name)))
    }

    pub fn input(&self, idx: usize) -> Result<MlValue, KernelError> {
        let value = self.arg(self.node.inputs.get(idx), "input", idx)?;
        Ok(self.frame.value(value)?)
    }

    pub fn input_tensor(&self, idx: usize) -> Result<TensorValue, KernelError> {
        self.input(idx)?
            .into_tensor()
            .ok_or_else(|| KernelError::new(format!("input {idx} is not a tensor")))
    }

    pub fn implicit_input(&self, idx: usize) -> Result<MlValue, KernelError> {
        let value = self.arg(self.node.implicit_inputs.get(idx), "implicit input", idx)?;
        Ok(self.frame.value(value)?)
    }

    pub fn set_output(&mut self, idx: usize, produced: MlValue) -> Result<(), KernelError> {
        let value = self.arg(self.node.outputs.get(idx), "output", idx)?;
        Ok(self.frame.set_value(value, produced)?)
    }

    pub fn set_output_tensor(&mut self, idx: usize, tensor: TensorValue) -> Result<(), KernelError> {
        self.set_output(idx, MlValue::Tensor(tensor))
    }

    /// Cooperative cancellation signal; long-running kernels may poll this.
    pub fn is_cancelled(&self) -> bool {
        self.terminate.load(Ordering::Relaxed)
    }
}

//! Parallel dispatcher: consumes an execution plan, tracks node readiness
//! through input-edge counters, and runs ready nodes as chains on a bounded
//! worker pool with fence coordination around each kernel invocation.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use thiserror::Error;

use crate::env;
use crate::fence::FenceFactory;
use crate::graph::GraphView;
use crate::kernel::KernelSet;
use crate::pattern::{feed_shapes_key, MemoryPatternCache};
use crate::planner::ExecutionPlan;
use crate::spec::{MemType, NodeId, ProviderId, ValueId};
use crate::tensor::{MlValue, TensorValue};
use crate::{log_error, trace, warning};

pub mod frame;
mod pool;

use frame::{ExecutionFrame, FrameError, KernelContext};
use pool::WorkerPool;

/// Failures surfaced by a run. The first failure stops new work from being
/// enqueued; chains already in flight finish their current node first.
#[derive(Debug, Error)]
pub enum ExecError {
    #[error("execution cancelled: terminate flag set")]
    Cancelled,
    #[error("no kernel instance bound for node `{node}`")]
    NoKernel { node: String },
    #[error("compute failed for {op_type} node `{node}`: {message}")]
    KernelFailed {
        op_type: String,
        node: String,
        message: String,
    },
    #[error("multiple errors were found:{}", format_error_list(.0))]
    MultipleErrors(Vec<ExecError>),
    #[error(transparent)]
    Frame(#[from] FrameError),
}

fn format_error_list(errors: &[ExecError]) -> String {
    errors.iter().map(|err| format!("\n{err}")).collect()
}

/// One run's inputs: feeds, requested fetches, and optional hooks.
pub struct RunRequest {
    feeds: Vec<(ValueId, MlValue)>,
    fetches: Vec<ValueId>,
    preallocated: Vec<Option<TensorValue>>,
    terminate: Arc<AtomicBool>,
    fence_factory: Option<Arc<dyn FenceFactory>>,
    pattern_cache: Option<Arc<MemoryPatternCache>>,
}

impl RunRequest {
    pub fn new(feeds: Vec<(ValueId, MlValue)>, fetches: Vec<ValueId>) -> Self {
        let preallocated = vec![None; fetches.len()];
        Self {
            feeds,
            fetches,
            preallocated,
            terminate: Arc::new(AtomicBool::new(false)),
            fence_factory: None,
            pattern_cache: None,
        }
    }

    /// Supplies a caller-allocated output container for the fetch at
    /// `fetch_position`; the produced value is validated against it.
    pub fn with_preallocated_fetch(mut self, fetch_position: usize, container: TensorValue) -> Self {
        if fetch_position < self.preallocated.len() {
            self.preallocated[fetch_position] = Some(container);
        }
        self
    }

    /// Shares a cancellation flag; setting it stops chains between nodes.
    pub fn with_terminate_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.terminate = flag;
        self
    }

    pub fn with_fence_factory(mut self, factory: Arc<dyn FenceFactory>) -> Self {
        self.fence_factory = Some(factory);
        self
    }

    /// Enables memory-pattern capture into the given session cache.
    pub fn with_pattern_cache(mut self, cache: Arc<MemoryPatternCache>) -> Self {
        self.pattern_cache = Some(cache);
        self
    }
}

struct Completion {
    outstanding: usize,
    errors: Vec<ExecError>,
}

struct RunState {
    graph: Arc<GraphView>,
    plan: Arc<ExecutionPlan>,
    kernels: Arc<dyn KernelSet>,
    pool: Arc<WorkerPool>,
    frame: ExecutionFrame,
    /// Remaining unfinished predecessors per node, mutated only under this
    /// mutex so a node can never be enqueued twice.
    pending: Mutex<Vec<usize>>,
    completion: Mutex<Completion>,
    complete_cv: Condvar,
    terminate: Arc<AtomicBool>,
}

/// Dispatches plan steps onto a fixed worker pool as their inputs become
/// ready.
pub struct ParallelExecutor {
    graph: Arc<GraphView>,
    plan: Arc<ExecutionPlan>,
    kernels: Arc<dyn KernelSet>,
    pool: Arc<WorkerPool>,
}

impl ParallelExecutor {
    /// Builds an executor with its own worker pool (`WEFT_EXECUTOR_THREADS`
    /// workers, default 32).
    pub fn new(
        graph: Arc<GraphView>,
        plan: Arc<ExecutionPlan>,
        kernels: Arc<dyn KernelSet>,
    ) -> Self {
        Self {
            graph,
            plan,
            kernels,
            pool: Arc::new(WorkerPool::new("executor", env::executor_threads())),
        }
    }

    /// Runs the plan to completion and returns the fetched values in request
    /// order, or the aggregated failure.
    pub fn execute(&self, request: RunRequest) -> Result<Vec<MlValue>, ExecError> {
        trace!("begin execution: {} steps", self.plan.steps().len());
        let frame = ExecutionFrame::new(
            Arc::clone(&self.plan),
            request.feeds,
            request.fetches,
            request.preallocated,
            request.fence_factory.as_deref(),
        )?;

        let pending = (0..self.graph.max_node_index())
            .map(|index| self.graph.in_edge_count(NodeId(index)))
            .collect();
        let state = Arc::new(RunState {
            graph: Arc::clone(&self.graph),
            plan: Arc::clone(&self.plan),
            kernels: Arc::clone(&self.kernels),
            pool: Arc::clone(&self.pool),
            frame,
            pending: Mutex::new(pending),
            completion: Mutex::new(Completion {
                outstanding: 0,
                errors: Vec::new(),
            }),
            complete_cv: Condvar::new(),
            terminate: Arc::clone(&request.terminate),
        });

        for root in self.graph.root_nodes() {
            if state.kernels.kernel(root).is_none() {
                continue;
            }
            enqueue_node(&state, root);
        }

        let errors: Vec<ExecError> = {
            let mut completion = state
                .completion
                .lock()
                .expect("completion mutex poisoned");
            while completion.outstanding > 0 {
                completion = state
                    .complete_cv
                    .wait(completion)
                    .expect("completion mutex poisoned");
            }
            completion.errors.drain(..).collect()
        };

        if !errors.is_empty() {
            let mut errors = errors;
            let status = if errors.len() == 1 {
                errors.remove(0)
            } else {
                ExecError::MultipleErrors(errors)
            };
            log_error!("{status}");
            return Err(status);
        }

        trace!("fetching output");
        let fetches = state.frame.take_fetches()?;

        if let Some(cache) = &request.pattern_cache {
            if let Some(specs) = state.frame.feed_specs() {
                cache.insert(feed_shapes_key(specs), state.frame.capture_pattern());
            }
        }

        trace!("done execution");
        Ok(fetches)
    }
}

/// Registers one unit of outstanding work and hands the chain starting at
/// `node` to the pool. Once any error is recorded this becomes a no-op:
/// in-flight work drains, nothing new starts.
fn enqueue_node(state: &Arc<RunState>, node: NodeId) {
    {
        let mut completion = state.completion.lock().expect("completion mutex poisoned");
        if !completion.errors.is_empty() {
            return;
        }
        completion.outstanding += 1;
    }

    let task_state = Arc::clone(state);
    state.pool.schedule(Box::new(move || {
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| run_node_chain(&task_state, node)));
        let status = match outcome {
            Ok(status) => status,
            Err(payload) => Err(panic_status(&task_state, node, payload.as_ref())),
        };
        finish_node_run(&task_state, status);
    }));
}

fn panic_status(state: &RunState, start: NodeId, payload: &(dyn std::any::Any + Send)) -> ExecError {
    let message = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    let (op_type, node) = state
        .graph
        .node(start)
        .map(|n| (n.op_type.clone(), n.name.clone()))
        .unwrap_or_else(|| ("<unknown>".to_string(), start.to_string()));
    ExecError::KernelFailed {
        op_type,
        node,
        message: format!("panic while running node chain: {message}"),
    }
}

/// Records a chain's result and releases its unit of outstanding work,
/// waking the run's waiter when everything has settled.
fn finish_node_run(state: &RunState, status: Result<(), ExecError>) {
    let mut completion = state.completion.lock().expect("completion mutex poisoned");
    if let Err(err) = status {
        completion.errors.push(err);
    }
    completion.outstanding -= 1;
    if completion.outstanding == 0 {
        state.complete_cv.notify_all();
    }
}

/// Runs `start` and then keeps going inline: when exactly one dependent
/// becomes ready it continues on this worker, any further newly-ready
/// dependents are enqueued as fresh tasks.
fn run_node_chain(state: &Arc<RunState>, start: NodeId) -> Result<(), ExecError> {
    let mut node_index = start;
    loop {
        if state.terminate.load(Ordering::Relaxed) {
            warning!("exiting node chain: terminate flag is set");
            return Err(ExecError::Cancelled);
        }

        let node = state
            .graph
            .node(node_index)
            .ok_or_else(|| ExecError::NoKernel {
                node: node_index.to_string(),
            })?;
        let kernel = state
            .kernels
            .kernel(node_index)
            .ok_or_else(|| ExecError::NoKernel {
                node: node.name.clone(),
            })?;
        let info = kernel.info();
        let queue = info.exec_queue_id();
        let fenced = state.plan.node_has_fence(node_index);

        if fenced {
            for (idx, slot) in node.inputs.iter().enumerate() {
                let Some(value) = slot else { continue };
                if let Some(fence) = state.frame.fence(*value) {
                    let provider = if info.input_memory_type(idx) == MemType::CpuInput {
                        ProviderId::cpu()
                    } else {
                        kernel.provider()
                    };
                    fence.before_using_as_input(&provider, queue);
                }
            }
            for (idx, slot) in node.implicit_inputs.iter().enumerate() {
                let Some(value) = slot else { continue };
                if let Some(fence) = state.frame.fence(*value) {
                    let provider = if info.input_memory_type(idx) == MemType::CpuInput {
                        ProviderId::cpu()
                    } else {
                        kernel.provider()
                    };
                    fence.before_using_as_input(&provider, queue);
                }
            }
            for slot in node.outputs.iter() {
                let Some(value) = slot else { continue };
                if let Some(fence) = state.frame.fence(*value) {
                    fence.before_using_as_output(&kernel.provider(), queue);
                }
            }
        }

        trace!("computing kernel for node `{}`", node.name);
        let mut ctx = KernelContext::new(&state.frame, node, &state.terminate);
        kernel
            .compute(&mut ctx)
            .map_err(|err| ExecError::KernelFailed {
                op_type: node.op_type.clone(),
                node: node.name.clone(),
                message: err.to_string(),
            })?;

        if fenced {
            for slot in node.inputs.iter().chain(node.implicit_inputs.iter()) {
                let Some(value) = slot else { continue };
                if let Some(fence) = state.frame.fence(*value) {
                    fence.after_used_as_input(queue);
                }
            }
            for slot in node.outputs.iter() {
                let Some(value) = slot else { continue };
                if let Some(fence) = state.frame.fence(*value) {
                    fence.after_used_as_output(queue);
                }
            }
        }

        // The decrement and the ready check stay under one lock so sibling
        // completions cannot enqueue the same dependent twice.
        let mut next = None;
        {
            let mut pending = state.pending.lock().expect("readiness mutex poisoned");
            for &dependent in state.graph.out_edges(node_index) {
                let remaining = &mut pending[dependent.index()];
                *remaining -= 1;
                if *remaining == 0 {
                    if next.is_none() {
                        next = Some(dependent);
                    } else {
                        enqueue_node(state, dependent);
                    }
                }
            }
        }

        match next {
            Some(dependent) => node_index = dependent,
            None => return Ok(()),
        }
    }
}

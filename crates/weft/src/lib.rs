//! Execution planner and parallel dispatcher for DAG-shaped inference
//! workloads.
//!
//! The build stage runs the [`planner`] once over a topologically ordered
//! graph, producing an immutable [`planner::ExecutionPlan`]: one allocation
//! decision per value plus a deallocation schedule. The run stage hands the
//! plan to the [`executor`], which dispatches ready nodes onto a worker pool
//! and coordinates cross-queue fences around each kernel invocation.

mod env;
pub mod executor;
pub mod fence;
pub mod graph;
pub mod hashing;
pub mod kernel;
pub mod logging;
pub mod pattern;
pub mod placement;
pub mod planner;
pub mod spec;
pub mod tensor;
pub mod values;

pub use executor::{ExecError, ParallelExecutor, RunRequest};
pub use graph::{GraphBuilder, GraphView};
pub use planner::{create_plan, AllocKind, ExecutionPlan, PlanError, PlannerInputs};
pub use spec::{DType, NodeId, ValueId};
pub use tensor::{MlValue, TensorValue};
pub use values::ValueTable;

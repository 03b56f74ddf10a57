use std::collections::HashMap;

use weft::graph::{GraphBuilder, GraphView, Node};
use weft::kernel::{KernelInfo, KernelOracle};
use weft::placement::{CpuPlacement, PlacementOracle};
use weft::planner::{
    create_plan, AllocKind, ExecutionPlan, PlanConfig, PlanError, PlannerInputs, ShapeOracle,
};
use weft::spec::{
    DType, DeviceMemoryInfo, MemType, NodeId, ProviderId, SymShape, TensorSpec, ValueId, ValueType,
};
use weft::values::ValueTable;

struct TestKernels {
    by_node: HashMap<String, KernelInfo>,
    missing: Vec<String>,
    default_info: KernelInfo,
}

impl TestKernels {
    fn new() -> Self {
        Self {
            by_node: HashMap::new(),
            missing: Vec::new(),
            default_info: KernelInfo::new(),
        }
    }

    fn set(&mut self, node: &str, info: KernelInfo) {
        self.by_node.insert(node.to_string(), info);
    }

    fn mark_missing(&mut self, node: &str) {
        self.missing.push(node.to_string());
    }
}

impl KernelOracle for TestKernels {
    fn kernel_info(&self, node: &Node) -> Option<&KernelInfo> {
        if self.missing.iter().any(|name| name == &node.name) {
            return None;
        }
        Some(self.by_node.get(&node.name).unwrap_or(&self.default_info))
    }
}

struct TestShapes {
    types: HashMap<ValueId, ValueType>,
}

impl TestShapes {
    fn all_f32(table: &ValueTable, len: usize) -> Self {
        let mut types = HashMap::new();
        for index in 0..table.len() {
            types.insert(ValueId(index as u32), f32_vec(len));
        }
        Self { types }
    }

    fn set(&mut self, value: ValueId, ty: ValueType) {
        self.types.insert(value, ty);
    }

    fn clear(&mut self, value: ValueId) {
        self.types.remove(&value);
    }
}

impl ShapeOracle for TestShapes {
    fn value_type(&self, value: ValueId) -> Option<&ValueType> {
        self.types.get(&value)
    }
}

fn f32_vec(len: usize) -> ValueType {
    ValueType::Tensor(TensorSpec::new(DType::F32, SymShape::from_static(&[len])))
}

fn plan_with(
    graph: &GraphView,
    kernels: &dyn KernelOracle,
    shapes: &dyn ShapeOracle,
    parallel: bool,
) -> ExecutionPlan {
    create_plan(&PlannerInputs {
        graph,
        kernels,
        placement: &CpuPlacement,
        shapes,
        context: &PlanConfig { parallel },
        parent_node: None,
    })
    .expect("plan")
}

fn kind(plan: &ExecutionPlan, value: ValueId) -> AllocKind {
    plan.value_plan(value).expect("value plan").kind
}

/// Reuse decisions must point at roots with matching placement, and
/// caller-visible values must never be scheduled for release.
fn assert_plan_invariants(graph: &GraphView, plan: &ExecutionPlan) {
    for (index, value_plan) in plan.value_plans().iter().enumerate() {
        let value = ValueId(index as u32);
        if let Some(root) = value_plan.kind.reused_value() {
            assert_eq!(plan.root_of(value), root, "chain not collapsed for {value}");
            assert_eq!(
                plan.value_plan(root).expect("root plan").placement,
                value_plan.placement,
                "placement mismatch across reuse for {value}"
            );
        }
    }
    let protected: Vec<ValueId> = graph
        .inputs()
        .iter()
        .chain(graph.outputs())
        .chain(graph.outer_scope_refs())
        .copied()
        .collect();
    for value in protected {
        assert!(
            !plan.to_be_freed().contains(&value),
            "caller-visible value {value} scheduled for release"
        );
    }
}

/// x -> A -> B -> C with in-place eligible elementwise kernels; C's output is
/// the graph output.
fn chain_graph() -> (GraphView, ValueTable) {
    let mut builder = GraphBuilder::new();
    builder.add_input("x");
    builder
        .add_node("AddOne", "A", &["x"], &["a"])
        .expect("node A");
    builder
        .add_node("AddOne", "B", &["a"], &["b"])
        .expect("node B");
    builder
        .add_node("AddOne", "C", &["b"], &["c"])
        .expect("node C");
    builder.mark_output("c");
    builder.finish().expect("graph")
}

fn inplace_kernels() -> TestKernels {
    let mut kernels = TestKernels::new();
    for node in ["A", "B", "C"] {
        kernels.set(node, KernelInfo::new().with_inplace(0, 0));
    }
    kernels
}

/// x -> A -> {B, C} -> D; D's output is the graph output.
fn diamond_graph() -> (GraphView, ValueTable) {
    let mut builder = GraphBuilder::new();
    builder.add_input("x");
    builder
        .add_node("AddOne", "A", &["x"], &["a"])
        .expect("node A");
    builder
        .add_node("AddOne", "B", &["a"], &["b"])
        .expect("node B");
    builder
        .add_node("AddOne", "C", &["a"], &["c"])
        .expect("node C");
    builder
        .add_node("Add", "D", &["b", "c"], &["d"])
        .expect("node D");
    builder.mark_output("d");
    builder.finish().expect("graph")
}

#[test]
fn chain_inplace_reuses_intermediate_not_caller_input() {
    let (graph, table) = chain_graph();
    let kernels = inplace_kernels();
    let shapes = TestShapes::all_f32(&table, 4);
    let plan = plan_with(&graph, &kernels, &shapes, false);

    let x = table.index_of("x").expect("x");
    let a = table.index_of("a").expect("a");
    let b = table.index_of("b").expect("b");
    let c = table.index_of("c").expect("c");

    // The caller still holds x after the run, so A cannot update it in
    // place; B's input is on its last use and can be.
    assert_eq!(kind(&plan, x), AllocKind::External);
    assert_eq!(kind(&plan, a), AllocKind::Fresh);
    assert_eq!(kind(&plan, b), AllocKind::Reuse(a));
    assert_eq!(kind(&plan, c), AllocKind::GraphOutput);

    // a's storage backs b, which C consumes at the final step; it becomes
    // releasable only after that step.
    assert_eq!(plan.to_be_freed(), &[a]);
    assert!(plan.freed_at_step(0).is_empty());
    assert!(plan.freed_at_step(1).is_empty());
    assert_eq!(plan.freed_at_step(2), &[a]);
    assert_plan_invariants(&graph, &plan);
}

#[test]
fn diamond_sequential_recycles_dead_buffer() {
    let (graph, table) = diamond_graph();
    let kernels = TestKernels::new();
    let shapes = TestShapes::all_f32(&table, 4);
    let plan = plan_with(&graph, &kernels, &shapes, false);

    let a = table.index_of("a").expect("a");
    let b = table.index_of("b").expect("b");
    let c = table.index_of("c").expect("c");
    let d = table.index_of("d").expect("d");

    assert_eq!(kind(&plan, b), AllocKind::Fresh);
    assert_eq!(kind(&plan, c), AllocKind::Fresh);
    // a dies once C has consumed it and is the first-fit freelist hit when D
    // plans its output.
    assert_eq!(kind(&plan, d), AllocKind::Reuse(a));
    assert_eq!(plan.to_be_freed(), &[b, c]);
    assert_eq!(plan.freed_at_step(3), &[b, c]);
    assert_plan_invariants(&graph, &plan);
}

#[test]
fn diamond_parallel_never_recycles_from_freelist() {
    let (graph, table) = diamond_graph();
    let kernels = TestKernels::new();
    let shapes = TestShapes::all_f32(&table, 4);
    let plan = plan_with(&graph, &kernels, &shapes, true);

    let a = table.index_of("a").expect("a");
    let b = table.index_of("b").expect("b");
    let c = table.index_of("c").expect("c");
    let d = table.index_of("d").expect("d");

    assert_eq!(kind(&plan, d), AllocKind::Fresh);
    for value in [a, b, c, d] {
        assert!(
            kind(&plan, value).reused_value().is_none(),
            "freelist reuse fired in parallel mode for {value}"
        );
    }
    assert_eq!(plan.to_be_freed(), &[a, b, c]);
    assert_eq!(plan.freed_at_step(2), &[a]);
    assert_eq!(plan.freed_at_step(3), &[b, c]);
    assert_plan_invariants(&graph, &plan);
}

#[test]
fn forced_alias_fires_even_when_inplace_would_not() {
    let mut builder = GraphBuilder::new();
    builder.add_input("x");
    builder
        .add_node("AddOne", "A", &["x"], &["a"])
        .expect("node A");
    builder
        .add_node("Reshape", "R", &["a"], &["r"])
        .expect("node R");
    builder
        .add_node("AddOne", "C", &["r"], &["c"])
        .expect("node C");
    builder.mark_output("c");
    let (graph, table) = builder.finish().expect("graph");

    let mut kernels = TestKernels::new();
    kernels.set("R", KernelInfo::new().with_alias(0, 0));
    // a is also still referenced when R plans, so the in-place rule alone
    // would not share storage here.
    let shapes = TestShapes::all_f32(&table, 4);
    let plan = plan_with(&graph, &kernels, &shapes, false);

    let a = table.index_of("a").expect("a");
    let r = table.index_of("r").expect("r");
    assert_eq!(kind(&plan, r), AllocKind::Reuse(a));
    assert_plan_invariants(&graph, &plan);
}

#[test]
fn loop_identity_passthrough_aliases_outer_scope_input() {
    let mut builder = GraphBuilder::new();
    builder.add_outer_scope_ref("state");
    builder
        .add_node("Identity", "carry", &["state"], &["out"])
        .expect("identity node");
    builder.mark_output("out");
    let (graph, table) = builder.finish().expect("graph");

    let parent = Node {
        id: NodeId(0),
        op_type: "Loop".to_string(),
        name: "loop".to_string(),
        inputs: Default::default(),
        implicit_inputs: Default::default(),
        outputs: Default::default(),
    };
    let kernels = TestKernels::new();
    let shapes = TestShapes::all_f32(&table, 4);
    let plan = create_plan(&PlannerInputs {
        graph: &graph,
        kernels: &kernels,
        placement: &CpuPlacement,
        shapes: &shapes,
        context: &PlanConfig { parallel: false },
        parent_node: Some(&parent),
    })
    .expect("plan");

    let state = table.index_of("state").expect("state");
    let out = table.index_of("out").expect("out");
    assert_eq!(kind(&plan, state), AllocKind::External);
    assert_eq!(kind(&plan, out), AllocKind::Alias(state));
    assert_plan_invariants(&graph, &plan);
}

#[test]
fn identity_without_loop_parent_stays_graph_output() {
    let mut builder = GraphBuilder::new();
    builder.add_outer_scope_ref("state");
    builder
        .add_node("Identity", "carry", &["state"], &["out"])
        .expect("identity node");
    builder.mark_output("out");
    let (graph, table) = builder.finish().expect("graph");

    let kernels = TestKernels::new();
    let shapes = TestShapes::all_f32(&table, 4);
    let plan = plan_with(&graph, &kernels, &shapes, false);

    let out = table.index_of("out").expect("out");
    assert_eq!(kind(&plan, out), AllocKind::GraphOutput);
}

#[test]
fn single_node_output_is_graph_output() {
    let mut builder = GraphBuilder::new();
    builder.add_input("x");
    builder
        .add_node("AddOne", "only", &["x"], &["y"])
        .expect("node");
    builder.mark_output("y");
    let (graph, table) = builder.finish().expect("graph");

    let kernels = TestKernels::new();
    let shapes = TestShapes::all_f32(&table, 4);
    let plan = plan_with(&graph, &kernels, &shapes, false);

    let y = table.index_of("y").expect("y");
    assert_eq!(kind(&plan, y), AllocKind::GraphOutput);
    assert_plan_invariants(&graph, &plan);
}

#[test]
fn empty_graph_plans_zero_steps() {
    let (graph, _table) = GraphBuilder::new().finish().expect("graph");
    let kernels = TestKernels::new();
    let shapes = TestShapes {
        types: HashMap::new(),
    };
    let plan = plan_with(&graph, &kernels, &shapes, false);
    assert!(plan.steps().is_empty());
    assert!(plan.to_be_freed().is_empty());
    assert_eq!(plan.num_values(), 0);
}

#[test]
fn unknown_shape_is_never_recycled_from_freelist() {
    let (graph, table) = diamond_graph();
    let kernels = TestKernels::new();
    let d = table.index_of("d").expect("d");

    // Unknown on the requesting side: D's output type is not known.
    let mut shapes = TestShapes::all_f32(&table, 4);
    shapes.clear(d);
    let plan = plan_with(&graph, &kernels, &shapes, false);
    assert_eq!(kind(&plan, d), AllocKind::Fresh);

    // Unknown on the candidate side: the dead buffer's type is not known.
    let a = table.index_of("a").expect("a");
    let mut shapes = TestShapes::all_f32(&table, 4);
    shapes.clear(a);
    let plan = plan_with(&graph, &kernels, &shapes, false);
    assert_eq!(kind(&plan, d), AllocKind::Fresh);
}

#[test]
fn symbolic_shapes_match_only_on_same_symbol() {
    let (graph, table) = diamond_graph();
    let kernels = TestKernels::new();
    let a = table.index_of("a").expect("a");
    let d = table.index_of("d").expect("d");

    let symbolic = |name: &str| {
        ValueType::Tensor(TensorSpec::new(
            DType::F32,
            SymShape::new(vec![weft::spec::Dimension::Dynamic(
                weft::spec::DimSymbol::new(name),
            )]),
        ))
    };

    let mut shapes = TestShapes::all_f32(&table, 4);
    shapes.set(a, symbolic("batch"));
    shapes.set(d, symbolic("batch"));
    let plan = plan_with(&graph, &kernels, &shapes, false);
    assert_eq!(kind(&plan, d), AllocKind::Reuse(a));

    let mut shapes = TestShapes::all_f32(&table, 4);
    shapes.set(a, symbolic("batch"));
    shapes.set(d, symbolic("other"));
    let plan = plan_with(&graph, &kernels, &shapes, false);
    assert_eq!(kind(&plan, d), AllocKind::Fresh);
}

#[test]
fn opaque_output_is_never_shared() {
    let (graph, table) = diamond_graph();
    let kernels = TestKernels::new();
    let d = table.index_of("d").expect("d");

    let mut shapes = TestShapes::all_f32(&table, 4);
    shapes.set(d, ValueType::Opaque("seq(tensor)".to_string()));
    let plan = plan_with(&graph, &kernels, &shapes, false);
    assert_eq!(kind(&plan, d), AllocKind::Fresh);
}

#[test]
fn graph_outputs_never_freed() {
    let (graph, table) = diamond_graph();
    let kernels = TestKernels::new();
    let shapes = TestShapes::all_f32(&table, 4);
    for parallel in [false, true] {
        let plan = plan_with(&graph, &kernels, &shapes, parallel);
        let d = table.index_of("d").expect("d");
        let x = table.index_of("x").expect("x");
        assert!(!plan.to_be_freed().contains(&d));
        assert!(!plan.to_be_freed().contains(&x));
    }
}

#[test]
fn missing_kernel_aborts_planning() {
    let (graph, table) = chain_graph();
    let mut kernels = inplace_kernels();
    kernels.mark_missing("B");
    let shapes = TestShapes::all_f32(&table, 4);
    let err = create_plan(&PlannerInputs {
        graph: &graph,
        kernels: &kernels,
        placement: &CpuPlacement,
        shapes: &shapes,
        context: &PlanConfig { parallel: false },
        parent_node: None,
    })
    .expect_err("planning should fail");
    assert!(matches!(err, PlanError::NoKernel { node, .. } if node == "B"));
}

#[test]
fn missing_provider_aborts_planning() {
    struct NoProviderPlacement;

    impl PlacementOracle for NoProviderPlacement {
        fn provider(&self, _node: &Node) -> Option<ProviderId> {
            None
        }

        fn allocator_info(
            &self,
            _node: &Node,
            _arg_idx: usize,
            _mem_type: MemType,
        ) -> DeviceMemoryInfo {
            DeviceMemoryInfo::cpu()
        }
    }

    let (graph, table) = chain_graph();
    let kernels = inplace_kernels();
    let shapes = TestShapes::all_f32(&table, 4);
    let err = create_plan(&PlannerInputs {
        graph: &graph,
        kernels: &kernels,
        placement: &NoProviderPlacement,
        shapes: &shapes,
        context: &PlanConfig { parallel: false },
        parent_node: None,
    })
    .expect_err("planning should fail");
    assert!(matches!(err, PlanError::NoProvider { node } if node == "A"));
}

struct NodePlacement {
    per_node: HashMap<String, DeviceMemoryInfo>,
}

impl PlacementOracle for NodePlacement {
    fn provider(&self, _node: &Node) -> Option<ProviderId> {
        Some(ProviderId::cpu())
    }

    fn allocator_info(&self, node: &Node, _arg_idx: usize, _mem_type: MemType) -> DeviceMemoryInfo {
        self.per_node
            .get(&node.name)
            .cloned()
            .unwrap_or_else(DeviceMemoryInfo::cpu)
    }
}

fn weight_graph() -> (GraphView, ValueTable) {
    let mut builder = GraphBuilder::new();
    builder.add_input("x");
    builder.add_initializer("w");
    builder
        .add_node("MatMul", "A", &["x", "w"], &["a"])
        .expect("node A");
    builder
        .add_node("MatMul", "B", &["a", "w"], &["b"])
        .expect("node B");
    builder.mark_output("b");
    builder.finish().expect("graph")
}

#[test]
fn initializer_placed_where_all_consumers_agree() {
    let (graph, table) = weight_graph();
    let kernels = TestKernels::new();
    let shapes = TestShapes::all_f32(&table, 4);
    let accel = DeviceMemoryInfo::new(ProviderId::new("accel"), MemType::Default);
    let placement = NodePlacement {
        per_node: HashMap::from([
            ("A".to_string(), accel.clone()),
            ("B".to_string(), accel.clone()),
        ]),
    };
    let plan = create_plan(&PlannerInputs {
        graph: &graph,
        kernels: &kernels,
        placement: &placement,
        shapes: &shapes,
        context: &PlanConfig { parallel: false },
        parent_node: None,
    })
    .expect("plan");

    let w = table.index_of("w").expect("w");
    let value_plan = plan.value_plan(w).expect("w plan");
    assert_eq!(value_plan.kind, AllocKind::Static);
    assert_eq!(value_plan.placement, accel);
}

#[test]
fn initializer_falls_back_to_cpu_when_consumers_disagree() {
    let (graph, table) = weight_graph();
    let kernels = TestKernels::new();
    let shapes = TestShapes::all_f32(&table, 4);
    let accel = DeviceMemoryInfo::new(ProviderId::new("accel"), MemType::Default);
    let placement = NodePlacement {
        per_node: HashMap::from([("A".to_string(), accel)]),
    };
    let plan = create_plan(&PlannerInputs {
        graph: &graph,
        kernels: &kernels,
        placement: &placement,
        shapes: &shapes,
        context: &PlanConfig { parallel: false },
        parent_node: None,
    })
    .expect("plan");

    let w = table.index_of("w").expect("w");
    let value_plan = plan.value_plan(w).expect("w plan");
    assert_eq!(value_plan.kind, AllocKind::Static);
    assert_eq!(value_plan.placement, DeviceMemoryInfo::cpu());
}

#[test]
fn planning_twice_yields_identical_plans() {
    let (graph, table) = diamond_graph();
    let kernels = TestKernels::new();
    let shapes = TestShapes::all_f32(&table, 4);

    let plan_a = plan_with(&graph, &kernels, &shapes, false);
    let plan_b = plan_with(&graph, &kernels, &shapes, false);
    assert_eq!(plan_a, plan_b);

    let json_a = serde_json::to_string(&plan_a).expect("serialize plan a");
    let json_b = serde_json::to_string(&plan_b).expect("serialize plan b");
    assert_eq!(json_a, json_b);
}

#[test]
fn plan_dump_renders_decisions_and_free_list() {
    let (graph, table) = chain_graph();
    let kernels = inplace_kernels();
    let shapes = TestShapes::all_f32(&table, 4);
    let plan = plan_with(&graph, &kernels, &shapes, false);

    let dump = plan.display(&graph, &table).to_string();
    assert!(dump.starts_with("Allocation Plan:\n"), "dump: {dump}");
    assert!(dump.contains("(0) x : External, cpu"), "dump: {dump}");
    assert!(dump.contains("(2) b : Reuse 1, cpu"), "dump: {dump}");
    assert!(dump.contains("(3) c : GraphOutput, cpu"), "dump: {dump}");
    assert!(dump.contains("\nExecution Plan:\n"), "dump: {dump}");
    assert!(dump.contains("[1] AddOne (B)"), "dump: {dump}");
    assert!(dump.contains("Free ml-values: (1) a"), "dump: {dump}");
}

#[test]
fn unknown_value_lookup_maps_into_plan_error() {
    let (_graph, table) = chain_graph();
    let err: PlanError = table.index_of("ghost").expect_err("unknown name").into();
    assert!(matches!(err, PlanError::UnknownValue(_)));
    assert_eq!(err.to_string(), "unknown value `ghost`");
}

#[test]
fn duplicate_producer_is_rejected_at_build_time() {
    let mut builder = GraphBuilder::new();
    builder.add_input("x");
    builder
        .add_node("AddOne", "A", &["x"], &["a"])
        .expect("node A");
    let err = builder
        .add_node("AddOne", "B", &["x"], &["a"])
        .expect_err("second producer of a");
    assert!(
        matches!(err, weft::graph::GraphError::DuplicateProducer { value, node }
            if value == "a" && node == "B")
    );
}

#[test]
fn use_before_def_is_rejected_at_build_time() {
    let mut builder = GraphBuilder::new();
    builder.add_input("x");
    let err = builder
        .add_node("AddOne", "A", &["ghost"], &["a"])
        .expect_err("undefined input");
    assert!(
        matches!(err, weft::graph::GraphError::UseBeforeDef { value, .. } if value == "ghost")
    );
}

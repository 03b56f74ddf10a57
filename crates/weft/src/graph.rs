//! Graph description consumed by the planner and the executor: nodes in
//! topological order, value provenance, and the edge structure that drives
//! readiness counting.

use smallvec::SmallVec;
use thiserror::Error;

use crate::spec::{NodeId, ValueId};
use crate::values::ValueTable;

/// Errors raised while assembling or validating a graph.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    #[error("value `{value}` is consumed by node `{node}` before it is defined")]
    UseBeforeDef { value: String, node: String },
    #[error("value `{value}` already has a definition; node `{node}` cannot produce it")]
    DuplicateProducer { value: String, node: String },
    #[error("graph output `{0}` is not defined anywhere in the graph")]
    UndefinedOutput(String),
}

/// One operator invocation. Argument slots may be empty (`None`) when an
/// optional argument is not supplied.
#[derive(Debug, Clone)]
pub struct Node {
    pub id: NodeId,
    pub op_type: String,
    pub name: String,
    pub inputs: SmallVec<[Option<ValueId>; 4]>,
    /// Inputs consumed by nested subgraph bodies rather than the node itself.
    pub implicit_inputs: SmallVec<[Option<ValueId>; 4]>,
    pub outputs: SmallVec<[Option<ValueId>; 2]>,
}

impl Node {
    /// All argument values of this node (inputs, implicit inputs, outputs)
    /// that are actually present.
    pub fn all_args(&self) -> impl Iterator<Item = ValueId> + '_ {
        self.inputs
            .iter()
            .chain(self.implicit_inputs.iter())
            .chain(self.outputs.iter())
            .flatten()
            .copied()
    }
}

/// Immutable view of a graph: the topologically ordered node sequence plus
/// value provenance and edge structure.
#[derive(Debug, Clone)]
pub struct GraphView {
    nodes: Vec<Node>,
    inputs: Vec<ValueId>,
    outputs: Vec<ValueId>,
    initializers: Vec<ValueId>,
    outer_scope: Vec<ValueId>,
    num_values: usize,
    out_edges: Vec<Vec<NodeId>>,
    in_edge_counts: Vec<usize>,
}

impl GraphView {
    /// Nodes in topological order; position in this slice is the step index.
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id.index())
    }

    pub fn inputs(&self) -> &[ValueId] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[ValueId] {
        &self.outputs
    }

    pub fn initializers(&self) -> &[ValueId] {
        &self.initializers
    }

    pub fn outer_scope_refs(&self) -> &[ValueId] {
        &self.outer_scope
    }

    /// Total number of distinct values referenced by the graph.
    pub fn num_values(&self) -> usize {
        self.num_values
    }

    /// Upper bound (exclusive) on node indices; arrays indexed by node are
    /// sized by this.
    pub fn max_node_index(&self) -> usize {
        self.nodes.len()
    }

    /// Downstream nodes that consume at least one output of `node`, one entry
    /// per consumed edge.
    pub fn out_edges(&self, node: NodeId) -> &[NodeId] {
        self.out_edges
            .get(node.index())
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Number of edges arriving at `node` from other nodes.
    pub fn in_edge_count(&self, node: NodeId) -> usize {
        self.in_edge_counts.get(node.index()).copied().unwrap_or(0)
    }

    /// Nodes with no graph predecessors, in topological order.
    pub fn root_nodes(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.nodes
            .iter()
            .filter(|node| self.in_edge_count(node.id) == 0)
            .map(|node| node.id)
    }
}

/// Incremental graph assembly with construction-time topology validation:
/// every consumed value must be graph-sourced or produced by an earlier node.
#[derive(Debug, Default)]
pub struct GraphBuilder {
    values: ValueTable,
    nodes: Vec<Node>,
    inputs: Vec<ValueId>,
    outputs: Vec<String>,
    initializers: Vec<ValueId>,
    outer_scope: Vec<ValueId>,
    producer: Vec<Option<NodeId>>,
    defined: Vec<bool>,
}

impl GraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a value name without defining it.
    pub fn value(&mut self, name: &str) -> ValueId {
        let id = self.values.add(name);
        if id.index() >= self.defined.len() {
            self.defined.resize(id.index() + 1, false);
            self.producer.resize(id.index() + 1, None);
        }
        id
    }

    pub fn add_input(&mut self, name: &str) -> ValueId {
        let id = self.value(name);
        self.defined[id.index()] = true;
        self.inputs.push(id);
        id
    }

    pub fn add_initializer(&mut self, name: &str) -> ValueId {
        let id = self.value(name);
        self.defined[id.index()] = true;
        self.initializers.push(id);
        id
    }

    pub fn add_outer_scope_ref(&mut self, name: &str) -> ValueId {
        let id = self.value(name);
        self.defined[id.index()] = true;
        self.outer_scope.push(id);
        id
    }

    /// Declares `name` as a graph output; the value must be defined by the
    /// time [`GraphBuilder::finish`] runs.
    pub fn mark_output(&mut self, name: &str) {
        self.outputs.push(name.to_string());
    }

    /// Appends a node whose arguments are all present.
    pub fn add_node(
        &mut self,
        op_type: &str,
        name: &str,
        inputs: &[&str],
        outputs: &[&str],
    ) -> Result<NodeId, GraphError> {
        let inputs = inputs.iter().map(|n| Some(n.to_string())).collect();
        let outputs = outputs.iter().map(|n| Some(n.to_string())).collect();
        self.add_node_full(op_type, name, inputs, Vec::new(), outputs)
    }

    /// Appends a node with optional argument slots and implicit inputs.
    pub fn add_node_full(
        &mut self,
        op_type: &str,
        name: &str,
        inputs: Vec<Option<String>>,
        implicit_inputs: Vec<Option<String>>,
        outputs: Vec<Option<String>>,
    ) -> Result<NodeId, GraphError> {
        let id = NodeId(self.nodes.len());
        let inputs = self.resolve_consumed(name, inputs)?;
        let implicit_inputs = self.resolve_consumed(name, implicit_inputs)?;

        let mut output_ids: SmallVec<[Option<ValueId>; 2]> = SmallVec::new();
        for slot in outputs {
            match slot {
                Some(output_name) => {
                    let value = self.value(&output_name);
                    if self.defined[value.index()] {
                        return Err(GraphError::DuplicateProducer {
                            value: output_name,
                            node: name.to_string(),
                        });
                    }
                    self.defined[value.index()] = true;
                    self.producer[value.index()] = Some(id);
                    output_ids.push(Some(value));
                }
                None => output_ids.push(None),
            }
        }

        self.nodes.push(Node {
            id,
            op_type: op_type.to_string(),
            name: name.to_string(),
            inputs,
            implicit_inputs,
            outputs: output_ids,
        });
        Ok(id)
    }

    fn resolve_consumed(
        &mut self,
        node_name: &str,
        args: Vec<Option<String>>,
    ) -> Result<SmallVec<[Option<ValueId>; 4]>, GraphError> {
        let mut out = SmallVec::new();
        for slot in args {
            match slot {
                Some(arg_name) => {
                    let value = self.value(&arg_name);
                    if !self.defined[value.index()] {
                        return Err(GraphError::UseBeforeDef {
                            value: arg_name,
                            node: node_name.to_string(),
                        });
                    }
                    out.push(Some(value));
                }
                None => out.push(None),
            }
        }
        Ok(out)
    }

    /// Finalizes the graph: resolves declared outputs and derives the edge
    /// structure used for readiness counting.
    pub fn finish(self) -> Result<(GraphView, ValueTable), GraphError> {
        let mut outputs = Vec::with_capacity(self.outputs.len());
        for name in &self.outputs {
            let id = self
                .values
                .index_of(name)
                .map_err(|_| GraphError::UndefinedOutput(name.clone()))?;
            if !self.defined[id.index()] {
                return Err(GraphError::UndefinedOutput(name.clone()));
            }
            outputs.push(id);
        }

        let mut out_edges = vec![Vec::new(); self.nodes.len()];
        let mut in_edge_counts = vec![0usize; self.nodes.len()];
        for node in &self.nodes {
            let consumed = node.inputs.iter().chain(node.implicit_inputs.iter());
            for value in consumed.flatten() {
                if let Some(producer) = self.producer[value.index()] {
                    out_edges[producer.index()].push(node.id);
                    in_edge_counts[node.id.index()] += 1;
                }
            }
        }

        let view = GraphView {
            num_values: self.values.len(),
            nodes: self.nodes,
            inputs: self.inputs,
            outputs,
            initializers: self.initializers,
            outer_scope: self.outer_scope,
            out_edges,
            in_edge_counts,
        };
        Ok((view, self.values))
    }
}

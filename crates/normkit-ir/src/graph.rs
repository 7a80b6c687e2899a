// IR Graph: values, nodes and attributes of a traced computation
//
// A small graph holding just what an operator's symbolic exporter
// needs to describe itself.
//
//   Value  : an edge; has a unique name, a type and at most one producer
//   Node   : an operation; ordered inputs, ordered outputs, attributes
//   Graph  : owns both in flat tables addressed by `ValueId` / `NodeId`
//
// Nodes are first `create`d (detached), then `append_node`ed, which fixes
// their position in the graph's execution order. Ids are only meaningful for
// the graph that issued them.

use std::collections::HashMap;
use std::fmt;

use normkit_core::{DType, Error, Result};

/// Index of a value in its graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ValueId(pub(crate) usize);

/// Index of a node in its graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub(crate) usize);

impl ValueId {
    pub fn index(&self) -> usize {
        self.0
    }
}

impl NodeId {
    pub fn index(&self) -> usize {
        self.0
    }
}

/// Static type of a value.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ValueType {
    /// Not (yet) known; placeholder outputs stay like this.
    #[default]
    Unknown,
    Tensor { dtype: DType, dims: Vec<usize> },
}

impl ValueType {
    pub fn tensor(dtype: DType, dims: impl Into<Vec<usize>>) -> Self {
        ValueType::Tensor {
            dtype,
            dims: dims.into(),
        }
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValueType::Unknown => write!(f, "?"),
            ValueType::Tensor { dtype, dims } => write!(f, "{dtype}{dims:?}"),
        }
    }
}

/// A node attribute.
#[derive(Debug, Clone, PartialEq)]
pub enum Attribute {
    Int(i64),
    Float(f64),
    String(String),
    Ints(Vec<i64>),
    Floats(Vec<f64>),
}

/// Where in user code a node was traced from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceLocation {
    pub file: String,
    pub line: u32,
}

impl SourceLocation {
    pub fn new(file: impl Into<String>, line: u32) -> Self {
        Self {
            file: file.into(),
            line,
        }
    }
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.file, self.line)
    }
}

#[derive(Debug, Clone)]
pub struct Value {
    name: String,
    ty: ValueType,
    producer: Option<(NodeId, usize)>,
}

impl Value {
    pub fn unique_name(&self) -> &str {
        &self.name
    }

    pub fn ty(&self) -> &ValueType {
        &self.ty
    }

    /// Producing node and output slot; `None` for graph inputs.
    pub fn producer(&self) -> Option<(NodeId, usize)> {
        self.producer
    }
}

#[derive(Debug, Clone)]
pub struct Node {
    op_type: String,
    name: Option<String>,
    inputs: Vec<ValueId>,
    outputs: Vec<ValueId>,
    // kept in insertion order so serialization is deterministic
    attributes: Vec<(String, Attribute)>,
    source_location: Option<SourceLocation>,
    appended: bool,
}

impl Node {
    pub fn op_type(&self) -> &str {
        &self.op_type
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn inputs(&self) -> &[ValueId] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[ValueId] {
        &self.outputs
    }

    pub fn input(&self, i: usize) -> Option<ValueId> {
        self.inputs.get(i).copied()
    }

    pub fn output(&self, i: usize) -> Option<ValueId> {
        self.outputs.get(i).copied()
    }

    pub fn attributes(&self) -> &[(String, Attribute)] {
        &self.attributes
    }

    pub fn attribute(&self, name: &str) -> Option<&Attribute> {
        self.attributes
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v)
    }

    pub fn source_location(&self) -> Option<&SourceLocation> {
        self.source_location.as_ref()
    }
}

/// A traced computation graph.
#[derive(Debug, Clone, Default)]
pub struct Graph {
    values: Vec<Value>,
    nodes: Vec<Node>,
    order: Vec<NodeId>,
    inputs: Vec<ValueId>,
    outputs: Vec<ValueId>,
    names: HashMap<String, ValueId>,
    next_name: usize,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    // ── Values ──

    fn new_value(&mut self, ty: ValueType, producer: Option<(NodeId, usize)>) -> ValueId {
        let id = ValueId(self.values.len());
        let name = loop {
            let candidate = self.next_name.to_string();
            self.next_name += 1;
            if !self.names.contains_key(&candidate) {
                break candidate;
            }
        };
        self.names.insert(name.clone(), id);
        self.values.push(Value { name, ty, producer });
        id
    }

    /// Add a graph input of type `ty`.
    pub fn add_input(&mut self, ty: ValueType) -> ValueId {
        let id = self.new_value(ty, None);
        self.inputs.push(id);
        id
    }

    /// Mark `value` as a graph output.
    pub fn add_output(&mut self, value: ValueId) {
        self.outputs.push(value);
    }

    pub fn inputs(&self) -> &[ValueId] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[ValueId] {
        &self.outputs
    }

    pub fn value(&self, id: ValueId) -> &Value {
        &self.values[id.0]
    }

    pub fn num_values(&self) -> usize {
        self.values.len()
    }

    pub fn set_type(&mut self, value: ValueId, ty: ValueType) {
        self.values[value.0].ty = ty;
    }

    pub fn value_type(&self, value: ValueId) -> &ValueType {
        &self.values[value.0].ty
    }

    pub fn unique_name(&self, value: ValueId) -> &str {
        &self.values[value.0].name
    }

    /// Rename `value`. If another value already holds `name`, a numeric
    /// suffix (`name.1`, `name.2`, ...) is appended. Returns the name given.
    pub fn set_unique_name(&mut self, value: ValueId, name: &str) -> &str {
        let current = &self.values[value.0].name;
        if current != name {
            let mut candidate = name.to_string();
            let mut suffix = 1;
            while self.names.get(&candidate).is_some_and(|&v| v != value) {
                candidate = format!("{name}.{suffix}");
                suffix += 1;
            }
            let old = std::mem::replace(&mut self.values[value.0].name, candidate.clone());
            self.names.remove(&old);
            self.names.insert(candidate, value);
        }
        &self.values[value.0].name
    }

    pub fn find_value(&self, name: &str) -> Option<ValueId> {
        self.names.get(name).copied()
    }

    // ── Nodes ──

    /// Create a detached node of `op_type` with `inputs` and `num_outputs`
    /// fresh untyped outputs.
    pub fn create(&mut self, op_type: &str, inputs: &[ValueId], num_outputs: usize) -> NodeId {
        let id = NodeId(self.nodes.len());
        self.nodes.push(Node {
            op_type: op_type.to_string(),
            name: None,
            inputs: inputs.to_vec(),
            outputs: Vec::with_capacity(num_outputs),
            attributes: Vec::new(),
            source_location: None,
            appended: false,
        });
        for _ in 0..num_outputs {
            self.add_node_output(id);
        }
        id
    }

    /// Append a created node to the execution order.
    pub fn append_node(&mut self, node: NodeId) -> Result<NodeId> {
        let n = &mut self.nodes[node.0];
        if n.appended {
            return Err(Error::msg(format!(
                "node {} ({}) is already in the graph",
                node.0, n.op_type
            )));
        }
        n.appended = true;
        self.order.push(node);
        Ok(node)
    }

    pub fn add_node_input(&mut self, node: NodeId, value: ValueId) {
        self.nodes[node.0].inputs.push(value);
    }

    /// Add a fresh untyped output to `node`.
    pub fn add_node_output(&mut self, node: NodeId) -> ValueId {
        let slot = self.nodes[node.0].outputs.len();
        let value = self.new_value(ValueType::Unknown, Some((node, slot)));
        self.nodes[node.0].outputs.push(value);
        value
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.0]
    }

    /// Appended nodes in execution order.
    pub fn nodes(&self) -> impl Iterator<Item = &Node> + '_ {
        self.order.iter().map(move |id| &self.nodes[id.0])
    }

    pub fn set_node_name(&mut self, node: NodeId, name: impl Into<String>) {
        self.nodes[node.0].name = Some(name.into());
    }

    pub fn set_source_location(&mut self, node: NodeId, loc: Option<SourceLocation>) {
        self.nodes[node.0].source_location = loc;
    }

    // ── Attributes ──

    /// Set attribute `name`, replacing an earlier value of the same name.
    pub fn set_attribute(&mut self, node: NodeId, name: &str, value: Attribute) {
        let attrs = &mut self.nodes[node.0].attributes;
        match attrs.iter_mut().find(|(k, _)| k == name) {
            Some((_, v)) => *v = value,
            None => attrs.push((name.to_string(), value)),
        }
    }

    pub fn set_i(&mut self, node: NodeId, name: &str, v: i64) {
        self.set_attribute(node, name, Attribute::Int(v));
    }

    pub fn set_f(&mut self, node: NodeId, name: &str, v: f64) {
        self.set_attribute(node, name, Attribute::Float(v));
    }

    pub fn set_s(&mut self, node: NodeId, name: &str, v: impl Into<String>) {
        self.set_attribute(node, name, Attribute::String(v.into()));
    }

    pub fn set_is(&mut self, node: NodeId, name: &str, v: &[i64]) {
        self.set_attribute(node, name, Attribute::Ints(v.to_vec()));
    }
}

// TraceContext: the state of one symbolic export session
//
// Holds the graph being built, the map from live tensors (by `TensorId`) to
// the graph values that stand for them, and the per-session batch-norm
// export counter. Each trace owns its own counter, so independent traces
// never influence each other's generated names.

use std::collections::HashMap;

use normkit_core::{Backend, Error, Result, Tensor, TensorId};

use crate::graph::{Graph, ValueId, ValueType};

#[derive(Debug, Clone, Default)]
pub struct TraceContext {
    graph: Graph,
    buffer_map: HashMap<TensorId, ValueId>,
    batch_norm_count: usize,
}

impl TraceContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Continue tracing into an existing graph.
    pub fn with_graph(graph: Graph) -> Self {
        Self {
            graph,
            ..Self::default()
        }
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    pub fn graph_mut(&mut self) -> &mut Graph {
        &mut self.graph
    }

    pub fn into_graph(self) -> Graph {
        self.graph
    }

    /// Bind buffer `id` to graph value `value`, replacing an earlier binding.
    pub fn register_buffer(&mut self, id: TensorId, value: ValueId) {
        self.buffer_map.insert(id, value);
    }

    /// Add a graph input typed like `tensor` and bind the tensor to it.
    pub fn trace_input<B: Backend>(&mut self, tensor: &Tensor<B>) -> ValueId {
        let value = self
            .graph
            .add_input(ValueType::tensor(tensor.dtype(), tensor.dims()));
        self.register_buffer(tensor.id(), value);
        value
    }

    /// The graph value registered for buffer `id`.
    pub fn buffer_trace(&self, id: TensorId) -> Result<ValueId> {
        self.buffer_map
            .get(&id)
            .copied()
            .ok_or_else(|| Error::TraceLookupFailure {
                buffer: id.to_string(),
            })
    }

    /// Number of batch-norm nodes exported in this session.
    pub fn batch_norm_count(&self) -> usize {
        self.batch_norm_count
    }

    /// Take the next batch-norm export index.
    pub(crate) fn next_batch_norm(&mut self) -> usize {
        let n = self.batch_norm_count;
        self.batch_norm_count += 1;
        n
    }
}

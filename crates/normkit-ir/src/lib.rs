//! # normkit-ir
//!
//! Symbolic export of batch normalization into a traced graph.
//!
//! - [`Graph`]: values, nodes and attributes of a traced computation
//! - [`TraceContext`]: one export session: the graph, the buffer map and
//!   the session's batch-norm counter
//! - [`export_batch_norm`]: appends a `BatchNormalization` node whose output
//!   arity follows the training flag (5 outputs when training, 1 otherwise)
//! - [`onnx`]: ONNX protobuf serialization of a traced graph

pub mod graph;
pub mod onnx;
pub mod symbolic;
pub mod trace;

pub use graph::{Attribute, Graph, Node, NodeId, SourceLocation, Value, ValueId, ValueType};
pub use symbolic::{export_batch_norm, BatchNormSymbolic, BATCH_NORMALIZATION, DEAD_OUTPUT_PREFIX};
pub use trace::TraceContext;

//! Deferred-execution IR recorded by lazy tensors.
//!
//! Nodes are immutable and reference-counted; a [`Value`] names one output of a node.
//! Executors walk the graph from the values they are asked to materialize, so sharing a
//! node between tensors is how duplicate work gets collapsed.

mod node;
pub mod ops;

pub use node::{dump, graph_size, post_order, BinaryOp, Node, NodePtr, OpKind, Value};

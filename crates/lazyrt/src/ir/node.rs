//! IR nodes and the values that reference their outputs.

use std::collections::HashSet;
use std::fmt::{self, Write as _};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::backend::BackendDataRef;
use crate::tensor::{DType, ScalarValue, TensorSpec};
use crate::view::SelectInfo;

/// Shared pointer to an immutable IR node. Node identity is pointer identity.
pub type NodePtr = Arc<Node>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
}

/// Operation recorded by a node.
#[derive(Debug, Clone)]
pub enum OpKind {
    /// Leaf wrapping device-resident data.
    DeviceData(BackendDataRef),
    /// Leaf constant broadcast to the node's rank-0 spec.
    Scalar(ScalarValue),
    Cast(DType),
    Binary(BinaryOp),
    /// Same elements under the output spec's dimensions.
    Reshape,
    /// Truncates or zero-extends the flat element sequence to the output spec.
    Resize,
    Permute(Vec<usize>),
    /// Contiguous sub-block starting at `offsets`, sized by the output spec.
    Narrow { offsets: Vec<usize> },
    /// Writes operand 1 into the `offsets` block of operand 0.
    NarrowUpdate { offsets: Vec<usize> },
    /// Strided slice along one dimension.
    Select(SelectInfo),
    /// Writes operand 1 into the strided slice of operand 0.
    SelectUpdate(SelectInfo),
}

impl OpKind {
    /// Short operator name used in dumps and logs.
    pub fn name(&self) -> &'static str {
        match self {
            OpKind::DeviceData(_) => "device_data",
            OpKind::Scalar(_) => "scalar",
            OpKind::Cast(_) => "cast",
            OpKind::Binary(BinaryOp::Add) => "add",
            OpKind::Binary(BinaryOp::Sub) => "sub",
            OpKind::Binary(BinaryOp::Mul) => "mul",
            OpKind::Binary(BinaryOp::Div) => "div",
            OpKind::Reshape => "reshape",
            OpKind::Resize => "resize",
            OpKind::Permute(_) => "permute",
            OpKind::Narrow { .. } => "narrow",
            OpKind::NarrowUpdate { .. } => "narrow_update",
            OpKind::Select(_) => "select",
            OpKind::SelectUpdate(_) => "select_update",
        }
    }
}

/// A traced operation together with its operands and output specs.
pub struct Node {
    op: OpKind,
    operands: SmallVec<[Value; 2]>,
    specs: SmallVec<[TensorSpec; 1]>,
}

impl Node {
    pub fn new(
        op: OpKind,
        operands: impl IntoIterator<Item = Value>,
        specs: impl IntoIterator<Item = TensorSpec>,
    ) -> NodePtr {
        let node = Node {
            op,
            operands: operands.into_iter().collect(),
            specs: specs.into_iter().collect(),
        };
        assert!(!node.specs.is_empty(), "IR node must produce an output");
        Arc::new(node)
    }

    pub fn op(&self) -> &OpKind {
        &self.op
    }

    pub fn operands(&self) -> &[Value] {
        &self.operands
    }

    pub fn num_outputs(&self) -> usize {
        self.specs.len()
    }

    pub fn spec(&self, index: usize) -> &TensorSpec {
        &self.specs[index]
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("op", &self.op.name())
            .field("operands", &self.operands.len())
            .field("specs", &self.specs)
            .finish()
    }
}

/// One output of an IR node.
#[derive(Clone)]
pub struct Value {
    node: NodePtr,
    index: usize,
}

impl Value {
    pub fn new(node: NodePtr, index: usize) -> Self {
        assert!(
            index < node.num_outputs(),
            "output {index} out of range for {} node",
            node.op().name()
        );
        Value { node, index }
    }

    pub fn node(&self) -> &NodePtr {
        &self.node
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// Static type of this output.
    pub fn spec(&self) -> &TensorSpec {
        self.node.spec(self.index)
    }
}

impl From<NodePtr> for Value {
    fn from(node: NodePtr) -> Self {
        Value::new(node, 0)
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.node, &other.node) && self.index == other.index
    }
}

impl Eq for Value {}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}@{:p}.{} : {}",
            self.node.op().name(),
            Arc::as_ptr(&self.node),
            self.index,
            self.spec()
        )
    }
}

/// Counts the unique nodes reachable from `roots`.
pub fn graph_size(roots: &[&Node]) -> usize {
    let mut visited: HashSet<*const Node> = HashSet::new();
    let mut stack: Vec<&Node> = roots.to_vec();
    while let Some(node) = stack.pop() {
        if !visited.insert(node as *const Node) {
            continue;
        }
        for operand in node.operands() {
            stack.push(operand.node().as_ref());
        }
    }
    visited.len()
}

/// Nodes reachable from `roots`, operands before users.
pub fn post_order(roots: &[Value]) -> Vec<NodePtr> {
    let mut order = Vec::new();
    let mut visited: HashSet<*const Node> = HashSet::new();
    // (node, operands_pushed)
    let mut stack: Vec<(NodePtr, bool)> = roots
        .iter()
        .rev()
        .map(|value| (Arc::clone(value.node()), false))
        .collect();
    while let Some((node, expanded)) = stack.pop() {
        let key = Arc::as_ptr(&node);
        if expanded {
            if visited.insert(key) {
                order.push(node);
            }
            continue;
        }
        if visited.contains(&key) {
            continue;
        }
        stack.push((Arc::clone(&node), true));
        for operand in node.operands().iter().rev() {
            if !visited.contains(&Arc::as_ptr(operand.node())) {
                stack.push((Arc::clone(operand.node()), false));
            }
        }
    }
    order
}

/// Text listing of the graph rooted at `roots`, one node per line.
pub fn dump(roots: &[Value]) -> String {
    let order = post_order(roots);
    let ids: std::collections::HashMap<*const Node, usize> = order
        .iter()
        .enumerate()
        .map(|(id, node)| (Arc::as_ptr(node), id))
        .collect();
    let mut out = String::new();
    for (id, node) in order.iter().enumerate() {
        let operands = node
            .operands()
            .iter()
            .map(|operand| format!("%{}.{}", ids[&Arc::as_ptr(operand.node())], operand.index()))
            .collect::<Vec<_>>()
            .join(", ");
        let specs = (0..node.num_outputs())
            .map(|index| node.spec(index).to_string())
            .collect::<Vec<_>>()
            .join(", ");
        let _ = writeln!(out, "%{id} = {}({operands}) : {specs}", node.op().name());
    }
    out
}

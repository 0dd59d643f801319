//! Host tensors, dtypes, shapes, and the lazy tensor handle built on top of them.

mod dtype;
mod host_tensor;
mod lazy_tensor;
mod shape;

pub use dtype::DType;
pub use host_tensor::{ScalarValue, Storage, Tensor};
pub use lazy_tensor::{
    DetachedView, LazyTensor, SYNC_TENSORS_GRAPH_SCOPE, TENSOR_TO_DATA_HANDLE_SCOPE,
    TRIM_IR_GRAPH_COUNTER,
};
pub use shape::{Shape, TensorSpec};

//! Lazy tensor runtime: deferred tensor values recorded as IR, executed on demand by a
//! pluggable graph executor, with view aliasing and a bytecode interpreter for operator
//! version upgraders.

pub mod backend;
pub mod config;
pub mod context;
pub mod executor;
pub mod ir;
pub mod profiling;
pub mod tensor;
pub mod upgrader;
pub mod view;

pub use backend::{BackendData, BackendDataRef, BackendDevice, BackendImpl};
pub use config::LazyConfig;
pub use context::{LazyContext, TensorId};
pub use executor::GraphExecutor;
pub use tensor::{DType, DetachedView, LazyTensor, ScalarValue, Shape, Tensor, TensorSpec};

//! Contract between lazy tensors and the graph executor that runs their IR.

use anyhow::Result;

use crate::backend::{BackendDataRef, BackendDevice};
use crate::context::TensorId;
use crate::tensor::{LazyTensor, Tensor};

/// Schedules and runs traced graphs on behalf of a [`LazyContext`](crate::LazyContext).
///
/// Implementations may call back into the tensors they are handed (reading
/// [`LazyTensor::current_ir_value`], installing results with
/// [`LazyTensor::set_data_handle_with_sync`]); the context never holds its internal lock
/// while calling an executor method.
pub trait GraphExecutor: Send + Sync {
    /// Called exactly once when a tensor record is created.
    fn register_tensor(&self, id: TensorId);

    /// Called exactly once when the last handle to a tensor record drops.
    fn unregister_tensor(&self, id: TensorId);

    /// Blocks until asynchronous work queued for `device` has completed.
    fn device_barrier(&self, device: &BackendDevice);

    /// Materializes the pending IR of `tensors` and installs the resulting device data on
    /// each of them. `sync_data` asks for views and host copies to be dropped as well.
    fn sync_tensors_graph(
        &self,
        tensors: &[LazyTensor],
        devices: &[BackendDevice],
        wait: bool,
        sync_data: bool,
    ) -> Result<()>;

    /// Device data for a single-element host tensor; implementations may cache by value.
    fn get_device_data(&self, tensor: &Tensor, device: &BackendDevice) -> Result<BackendDataRef>;

    /// Increments and returns the trim counter consulted by graph-size limiting.
    fn inc_trim_counter(&self) -> u64;
}

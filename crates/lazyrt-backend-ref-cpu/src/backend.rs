//! Host-memory backend: device data is an independent host tensor.

use std::sync::Arc;

use anyhow::{anyhow, Result};
use lazyrt::{BackendData, BackendDataRef, BackendDevice, BackendImpl, DType, Tensor};

/// Backend whose "device" buffers are host tensors owned by the backend.
#[derive(Debug, Default, Clone, Copy)]
pub struct CpuBackend;

impl CpuBackend {
    pub fn new() -> Self {
        CpuBackend
    }

    /// Wraps a computed tensor as ready device data.
    pub fn wrap(&self, tensor: Tensor, device: &BackendDevice) -> BackendDataRef {
        BackendData::new(device.clone(), tensor.spec(), Arc::new(tensor))
    }
}

impl BackendImpl for CpuBackend {
    fn backend_name(&self) -> &str {
        "cpu"
    }

    fn tensor_to_data_handle(
        &self,
        tensor: &Tensor,
        device: &BackendDevice,
    ) -> Result<BackendDataRef> {
        Ok(self.wrap(tensor.deep_copy(), device))
    }

    fn data_handle_to_tensor(&self, data: &BackendData, dtype: DType) -> Result<Tensor> {
        let tensor = data
            .downcast::<Tensor>()
            .ok_or_else(|| anyhow!("backend data {} holds no cpu buffer", data.spec()))?;
        Ok(tensor.deep_copy().to_dtype(dtype))
    }
}

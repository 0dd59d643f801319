//! Device identifiers, device-resident data handles, and the backend conversion contract.

use std::any::Any;
use std::fmt;
use std::sync::{Arc, Mutex};

use anyhow::{bail, Result};
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};

use crate::context::TensorId;
use crate::tensor::{DType, Tensor, TensorSpec};

/// Names a device a lazy tensor is bound to (e.g. `cpu:0`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BackendDevice {
    kind: String,
    ordinal: usize,
}

impl BackendDevice {
    pub fn new(kind: impl Into<String>, ordinal: usize) -> Self {
        BackendDevice {
            kind: kind.into(),
            ordinal,
        }
    }

    pub fn cpu(ordinal: usize) -> Self {
        Self::new("cpu", ordinal)
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn ordinal(&self) -> usize {
        self.ordinal
    }
}

impl fmt::Display for BackendDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.ordinal)
    }
}

/// Opaque backend payload; each backend downcasts to its own buffer type.
pub type DeviceHandle = Arc<dyn Any + Send + Sync>;

/// Shared pointer to device-resident data.
pub type BackendDataRef = Arc<BackendData>;

/// Provenance stamped on data wrapped into an IR device-data node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceDataInfo {
    pub tensor_id: TensorId,
    pub read_only: bool,
}

/// Device-resident buffer that may still be waiting on an asynchronous producer.
///
/// A placeholder has a device and spec but no payload until [`BackendData::assign`]
/// runs; reading it before that is a protocol violation on the caller's side.
pub struct BackendData {
    device: BackendDevice,
    spec: TensorSpec,
    handle: OnceCell<DeviceHandle>,
    info: Mutex<Option<DeviceDataInfo>>,
}

impl BackendData {
    /// Wraps an already-produced payload.
    pub fn new(device: BackendDevice, spec: TensorSpec, handle: DeviceHandle) -> BackendDataRef {
        let data = BackendData {
            device,
            spec,
            handle: OnceCell::new(),
            info: Mutex::new(None),
        };
        let _ = data.handle.set(handle);
        Arc::new(data)
    }

    /// Data whose payload will be assigned later by an in-flight computation.
    pub fn placeholder(device: BackendDevice, spec: TensorSpec) -> BackendDataRef {
        Arc::new(BackendData {
            device,
            spec,
            handle: OnceCell::new(),
            info: Mutex::new(None),
        })
    }

    pub fn device(&self) -> &BackendDevice {
        &self.device
    }

    pub fn spec(&self) -> &TensorSpec {
        &self.spec
    }

    /// True once the payload has been produced.
    pub fn has_value(&self) -> bool {
        self.handle.get().is_some()
    }

    pub fn handle(&self) -> Option<&DeviceHandle> {
        self.handle.get()
    }

    /// Borrows the payload as a concrete backend buffer type.
    pub fn downcast<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.handle.get().and_then(|handle| handle.downcast_ref::<T>())
    }

    /// Completes a placeholder. Fails if a payload is already present.
    pub fn assign(&self, handle: DeviceHandle) -> Result<()> {
        if self.handle.set(handle).is_err() {
            bail!("backend data for {} already holds a value", self.spec);
        }
        Ok(())
    }

    pub fn set_info(&self, info: DeviceDataInfo) {
        *self.info.lock().expect("backend data info poisoned") = Some(info);
    }

    pub fn info(&self) -> Option<DeviceDataInfo> {
        *self.info.lock().expect("backend data info poisoned")
    }
}

impl fmt::Debug for BackendData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendData")
            .field("device", &self.device)
            .field("spec", &self.spec)
            .field("has_value", &self.has_value())
            .field("info", &self.info())
            .finish()
    }
}

/// Host/device conversion services a backend provides to the lazy core.
pub trait BackendImpl: Send + Sync {
    /// Returns a human-readable backend identifier (e.g., `"cpu"`).
    fn backend_name(&self) -> &str;

    /// Uploads a host tensor, producing ready device data.
    fn tensor_to_data_handle(
        &self,
        tensor: &Tensor,
        device: &BackendDevice,
    ) -> Result<BackendDataRef>;

    /// Downloads device data into a host tensor of `dtype`.
    fn data_handle_to_tensor(&self, data: &BackendData, dtype: DType) -> Result<Tensor>;

    /// Allocates data to be filled by a later computation.
    fn create_placeholder(&self, device: &BackendDevice, spec: TensorSpec) -> BackendDataRef {
        BackendData::placeholder(device.clone(), spec)
    }
}

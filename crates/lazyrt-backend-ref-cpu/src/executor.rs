//! Synchronous graph executor that evaluates lazy IR on the host.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use anyhow::Result;
use lazyrt::ir::dump;
use lazyrt::{
    BackendDataRef, BackendDevice, BackendImpl, DType, GraphExecutor, LazyTensor, Tensor,
    TensorId,
};
use log::{debug, trace};

use crate::backend::CpuBackend;
use crate::kernels::evaluate;

/// Runs every sync immediately on the calling thread.
///
/// Also keeps the bookkeeping a real executor would: the set of live tensors, the trim
/// counter, and a cache of device data for single-element constants.
#[derive(Debug, Default)]
pub struct CpuGraphExecutor {
    backend: CpuBackend,
    live: Mutex<HashSet<TensorId>>,
    trim_counter: AtomicU64,
    barriers: AtomicU64,
    syncs: AtomicU64,
    scalar_cache: Mutex<HashMap<(DType, u64, BackendDevice), BackendDataRef>>,
}

impl CpuGraphExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of tensors registered and not yet unregistered.
    pub fn live_tensors(&self) -> usize {
        self.live.lock().expect("live tensor set poisoned").len()
    }

    pub fn is_registered(&self, id: TensorId) -> bool {
        self.live
            .lock()
            .expect("live tensor set poisoned")
            .contains(&id)
    }

    /// Number of `sync_tensors_graph` calls that executed IR.
    pub fn sync_count(&self) -> u64 {
        self.syncs.load(Ordering::Relaxed)
    }

    pub fn barrier_count(&self) -> u64 {
        self.barriers.load(Ordering::Relaxed)
    }
}

impl GraphExecutor for CpuGraphExecutor {
    fn register_tensor(&self, id: TensorId) {
        let inserted = self
            .live
            .lock()
            .expect("live tensor set poisoned")
            .insert(id);
        debug_assert!(inserted, "tensor {id} registered twice");
    }

    fn unregister_tensor(&self, id: TensorId) {
        let removed = self
            .live
            .lock()
            .expect("live tensor set poisoned")
            .remove(&id);
        debug_assert!(removed, "tensor {id} unregistered without registration");
    }

    fn device_barrier(&self, device: &BackendDevice) {
        trace!("device barrier on {device}");
        self.barriers.fetch_add(1, Ordering::Relaxed);
    }

    fn sync_tensors_graph(
        &self,
        tensors: &[LazyTensor],
        devices: &[BackendDevice],
        wait: bool,
        sync_data: bool,
    ) -> Result<()> {
        let pending: Vec<_> = tensors
            .iter()
            .filter_map(|tensor| tensor.current_ir_value().map(|value| (tensor, value)))
            .collect();
        if pending.is_empty() {
            return Ok(());
        }
        debug!(
            "syncing {} tensors (devices {:?}, wait {wait}, sync_data {sync_data})",
            pending.len(),
            devices
        );
        self.syncs.fetch_add(1, Ordering::Relaxed);
        let roots: Vec<_> = pending.iter().map(|(_, value)| value.clone()).collect();
        trace!("executing graph:\n{}", dump(&roots));
        let results = evaluate(&roots)?;
        for ((tensor, _), result) in pending.into_iter().zip(results) {
            let handle = self.backend.wrap(result, &tensor.device());
            tensor.set_data_handle_with_sync(handle, sync_data);
        }
        Ok(())
    }

    fn get_device_data(&self, tensor: &Tensor, device: &BackendDevice) -> Result<BackendDataRef> {
        let value = tensor.item()?.to_f64();
        let key = (tensor.dtype(), value.to_bits(), device.clone());
        let mut cache = self.scalar_cache.lock().expect("scalar cache poisoned");
        if let Some(data) = cache.get(&key) {
            return Ok(BackendDataRef::clone(data));
        }
        let data = self.backend.tensor_to_data_handle(tensor, device)?;
        cache.insert(key, BackendDataRef::clone(&data));
        Ok(data)
    }

    fn inc_trim_counter(&self) -> u64 {
        self.trim_counter.fetch_add(1, Ordering::Relaxed) + 1
    }
}

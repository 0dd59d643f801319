//! Lazy tensor handles.
//!
//! A [`LazyTensor`] is a cheap, clonable handle onto a tensor record owned by a
//! [`LazyContext`]. The record's current value comes from whichever source is authoritative,
//! in this order:
//!
//! 1. a view onto an alias, when the record has one and it is up to date;
//! 2. resident device data (`handle`);
//! 3. a pending IR value;
//! 4. host tensor data.
//!
//! Reads pull the value forward: IR is executed through the context's [`GraphExecutor`],
//! host data is uploaded through the [`BackendImpl`](crate::backend::BackendImpl). Writes
//! replace the record's source and bump its generation. Writes made while the record has
//! a view are queued on the view's alias and become visible to every tensor sharing it.
//!
//! The internal lock is released before any executor or backend call, so executors are
//! free to call back into the tensors they were given.

use std::fmt;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use log::{debug, trace};

use crate::backend::{BackendDataRef, BackendDevice, DeviceDataInfo};
use crate::context::{ContextState, LazyContext, TensorId, TensorRecord};
use crate::executor::GraphExecutor;
use crate::ir::{graph_size, ops, NodePtr, Value};
use crate::view::{AliasArena, AliasId, View, ViewInfo};

use super::{DType, ScalarValue, Tensor, TensorSpec};

/// Counter bumped each time a pending graph is materialized for being too large.
pub const TRIM_IR_GRAPH_COUNTER: &str = "TrimIrGraph";
/// Timed scope around host-to-device conversion of non-scalar tensors.
pub const TENSOR_TO_DATA_HANDLE_SCOPE: &str = "IrValueTensorToDataHandle";
/// Timed scope around executor syncs triggered by a tensor read.
pub const SYNC_TENSORS_GRAPH_SCOPE: &str = "SyncTensorsGraph";

struct TensorHandle {
    ctx: Arc<LazyContext>,
    id: TensorId,
}

impl Drop for TensorHandle {
    fn drop(&mut self) {
        self.ctx.release_tensor(self.id);
    }
}

/// Handle onto a lazily evaluated tensor. Clones share the same record.
#[derive(Clone)]
pub struct LazyTensor {
    inner: Arc<TensorHandle>,
}

impl LazyTensor {
    fn create(
        ctx: &Arc<LazyContext>,
        device: BackendDevice,
        init: impl FnOnce(&mut TensorRecord),
    ) -> Self {
        let id = ctx.insert_record(device, init);
        LazyTensor {
            inner: Arc::new(TensorHandle {
                ctx: Arc::clone(ctx),
                id,
            }),
        }
    }

    /// Wraps host data that will be uploaded on first use.
    pub fn from_tensor(ctx: &Arc<LazyContext>, tensor: Tensor, device: BackendDevice) -> Self {
        Self::create(ctx, device, |record| record.tensor_data = Some(tensor))
    }

    /// Wraps a pending IR value; large graphs may be materialized immediately.
    pub fn from_ir_value(
        ctx: &Arc<LazyContext>,
        ir_value: Value,
        device: BackendDevice,
    ) -> Result<Self> {
        let tensor = Self::create(ctx, device, |record| record.ir_value = Some(ir_value));
        tensor.try_limit_graph_size()?;
        Ok(tensor)
    }

    /// Wraps a view produced by [`create_view`](Self::create_view).
    pub fn from_view(
        ctx: &Arc<LazyContext>,
        mut view: DetachedView,
        device: BackendDevice,
    ) -> Self {
        let tensor = Self::create(ctx, device, |_| {});
        if let Some(view) = view.view.take() {
            ctx.install_view(tensor.unique_id(), view);
        }
        tensor
    }

    /// Wraps resident device data.
    pub fn from_data_handle(ctx: &Arc<LazyContext>, handle: BackendDataRef) -> Self {
        let device = handle.device().clone();
        Self::create(ctx, device, |record| record.handle = Some(handle))
    }

    pub fn context(&self) -> &Arc<LazyContext> {
        &self.inner.ctx
    }

    pub fn unique_id(&self) -> TensorId {
        self.inner.id
    }

    fn executor(&self) -> &Arc<dyn GraphExecutor> {
        self.context().executor()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, ContextState> {
        self.context().state()
    }

    pub fn device(&self) -> BackendDevice {
        self.state().record(self.unique_id()).device.clone()
    }

    /// Bumped on every change of the record's source of truth.
    pub fn generation(&self) -> u64 {
        self.state().record(self.unique_id()).generation
    }

    pub fn shape(&self) -> TensorSpec {
        record_spec(self.state().record(self.unique_id()))
    }

    pub fn dtype(&self) -> DType {
        self.shape().dtype
    }

    /// Extent of `dim`; negative dims count from the end.
    pub fn size(&self, dim: i64) -> usize {
        let spec = self.shape();
        let dim = spec.shape.canonical_dim(dim);
        spec.shape.dims()[dim]
    }

    /// Id of the alias backing this tensor's view, or 0 when it has none.
    pub fn view_alias_id(&self) -> u64 {
        self.state()
            .record(self.unique_id())
            .view
            .as_ref()
            .map_or(0, |view| view.alias_id().0)
    }

    // ---- device data -------------------------------------------------------------------

    /// Returns device data for the current value, executing pending IR or uploading host
    /// data as needed.
    ///
    /// Panics when resident data is still being produced asynchronously.
    pub fn get_data_handle(&self) -> Result<BackendDataRef> {
        let id = self.unique_id();
        let pending = {
            let mut state = self.state();
            let (record, aliases) = state.split(id);
            let from_view = view_update(record, aliases);
            let up_to_date = from_view.as_ref().map_or(true, |(_, updated)| !updated);
            if up_to_date {
                if let Some(handle) = &record.handle {
                    assert!(
                        handle.has_value(),
                        "Trying to access data while an async operation is in flight: {}",
                        handle.spec()
                    );
                    return Ok(Arc::clone(handle));
                }
            }
            if let Some((ir_value, _)) = from_view {
                record.assign_ir_value(Some(ir_value));
            }
            if record.ir_value.is_some() {
                None
            } else {
                let tensor = record.tensor_data.clone().unwrap_or_else(|| {
                    panic!("tensor {id} has neither device data, IR, nor host data")
                });
                Some((tensor, record.device.clone()))
            }
        };
        match pending {
            None => self.apply_pending_graph()?,
            Some((tensor, device)) => {
                let handle = self
                    .context()
                    .backend()
                    .tensor_to_data_handle(&tensor, &device)?;
                self.state().record_mut(id).handle = Some(handle);
            }
        }
        self.current_data_handle()
            .ok_or_else(|| anyhow!("graph execution produced no device data for tensor {id}"))
    }

    pub fn current_data_handle(&self) -> Option<BackendDataRef> {
        self.state().record(self.unique_id()).handle.clone()
    }

    /// Installs device data and drops the view and host data along with the IR value.
    pub fn set_data_handle(&self, handle: BackendDataRef) {
        self.set_data_handle_with_sync(handle, true);
    }

    /// Installs device data. The IR value is always cleared; with `sync` the view and host
    /// data are dropped too.
    pub fn set_data_handle_with_sync(&self, handle: BackendDataRef, sync: bool) {
        let id = self.unique_id();
        let mut state = self.state();
        let record = state.record_mut(id);
        record.handle = Some(handle);
        record.assign_ir_value(None);
        if sync {
            record.tensor_data = None;
            state.set_view(id, None);
        }
    }

    // ---- IR ----------------------------------------------------------------------------

    /// Replaces the current value with `ir_value`. On a view, the value is written through
    /// to the alias instead.
    pub fn set_ir_value(&self, ir_value: Value) -> Result<()> {
        let id = self.unique_id();
        let has_view = {
            let mut state = self.state();
            let record = state.record_mut(id);
            record.handle = None;
            record.tensor_data = None;
            if record.view.is_some() {
                update_view(&mut state, id, ir_value);
                state.record_mut(id).generation += 1;
                true
            } else {
                record.assign_ir_value(Some(ir_value));
                false
            }
        };
        if !has_view {
            self.try_limit_graph_size()?;
        }
        Ok(())
    }

    /// Like [`set_ir_value`](Self::set_ir_value), casting to this tensor's dtype first.
    pub fn set_in_place_ir_value(&self, ir_value: Value) -> Result<()> {
        let dtype = self.dtype();
        let ir_value = if ir_value.spec().dtype != dtype {
            ops::cast(ir_value, dtype)
        } else {
            ir_value
        };
        self.set_ir_value(ir_value)
    }

    /// Materializes the pending IR when it has grown past the configured size limit.
    /// Only checked on every `trim_graph_check_frequency`th call.
    pub fn try_limit_graph_size(&self) -> Result<()> {
        let Some(ir_value) = self.state().record(self.unique_id()).ir_value.clone() else {
            return Ok(());
        };
        let config = self.context().config();
        let frequency = config.trim_graph_check_frequency.max(1);
        if self.executor().inc_trim_counter() % frequency != 0 {
            return Ok(());
        }
        let size = graph_size(&[ir_value.node().as_ref()]);
        if size > config.trim_graph_size {
            debug!(
                "trimming IR graph of tensor {}: {size} nodes > {}",
                self.unique_id(),
                config.trim_graph_size
            );
            self.context().counters().increment(TRIM_IR_GRAPH_COUNTER, 1);
            self.apply_pending_graph()?;
        }
        Ok(())
    }

    /// IR for the current value, creating a device-data leaf from resident or host data
    /// when no IR is pending.
    pub fn get_ir_value(&self) -> Result<Value> {
        let id = self.unique_id();
        let (tensor, device) = {
            let mut state = self.state();
            if let Some(ir_value) = current_ir_value(&mut state, id) {
                return Ok(ir_value);
            }
            let (record, aliases) = state.split(id);
            if let Some(handle) = record.handle.clone() {
                let ir_value = self.create_tensor_node(handle, false);
                record.assign_ir_value(Some(ir_value.clone()));
                return Ok(ir_value);
            }
            let tensor = current_tensor_data(record, aliases)
                .unwrap_or_else(|| panic!("tensor {id} has no data to build IR from"));
            (tensor, record.device.clone())
        };
        let ir_value = self.ir_value_for_tensor(&tensor, &device)?;
        self.state()
            .record_mut(id)
            .assign_ir_value(Some(ir_value.clone()));
        Ok(ir_value)
    }

    /// Pending IR, if any; for views this is the (possibly recomputed) view value.
    pub fn current_ir_value(&self) -> Option<Value> {
        current_ir_value(&mut self.state(), self.unique_id())
    }

    /// IR leaf for a host tensor.
    pub fn ir_value_for_tensor(&self, tensor: &Tensor, device: &BackendDevice) -> Result<Value> {
        let (data, read_only) = if tensor.shape().rank() == 0 && tensor.len() == 1 {
            let value = tensor.item()?;
            let special = !matches!(value, ScalarValue::Bool(_))
                && self.context().config().is_special_scalar(value.to_f64());
            if special {
                trace!("tensor {} folds special scalar {value:?}", self.unique_id());
                return Ok(ops::scalar(value, tensor.dtype()));
            }
            (self.executor().get_device_data(tensor, device)?, true)
        } else {
            let _scope = self.context().counters().timed(TENSOR_TO_DATA_HANDLE_SCOPE);
            let data = self
                .context()
                .backend()
                .tensor_to_data_handle(tensor, device)?;
            (data, false)
        };
        Ok(self.create_tensor_node(data, read_only))
    }

    fn create_tensor_node(&self, data: BackendDataRef, read_only: bool) -> Value {
        data.set_info(DeviceDataInfo {
            tensor_id: self.unique_id(),
            read_only,
        });
        ops::device_data(data)
    }

    // ---- host data ---------------------------------------------------------------------

    pub fn set_tensor_data(&self, tensor: Tensor) {
        self.state().record_mut(self.unique_id()).tensor_data = Some(tensor);
    }

    /// Host data, unless a view has moved past it.
    pub fn current_tensor_data(&self) -> Option<Tensor> {
        let mut state = self.state();
        let (record, aliases) = state.split(self.unique_id());
        current_tensor_data(record, aliases)
    }

    /// Host copy of the current value. With `detached` the result is independent of this
    /// tensor; otherwise it is also cached as the tensor's host data.
    pub fn to_tensor(&self, detached: bool) -> Result<Tensor> {
        let id = self.unique_id();
        let cached = {
            let mut state = self.state();
            let (record, aliases) = state.split(id);
            match current_tensor_data(record, aliases) {
                Some(tensor) if detached => {
                    if record.ir_value.is_some() || record.handle.is_some() || record.view.is_some()
                    {
                        record.tensor_data = None;
                        Some(tensor)
                    } else {
                        Some(tensor.deep_copy())
                    }
                }
                other => other,
            }
        };
        if let Some(tensor) = cached {
            return Ok(tensor);
        }

        let device = self.device();
        self.executor().device_barrier(&device);
        let handle = self.get_data_handle()?;
        let tensor = self
            .context()
            .backend()
            .data_handle_to_tensor(&handle, self.dtype())?;
        if !detached {
            self.set_tensor_data(tensor.clone());
        }
        Ok(tensor)
    }

    /// Replaces every source of truth with host data.
    pub fn set_tensor(&self, tensor: Tensor) {
        let id = self.unique_id();
        let mut state = self.state();
        let record = state.record_mut(id);
        record.tensor_data = Some(tensor);
        record.handle = None;
        record.assign_ir_value(None);
        state.set_view(id, None);
    }

    /// Overwrites the tensor from host data. With `sync` the data is converted to IR right
    /// away; otherwise it is kept on host and, for views, written through to the alias.
    pub fn update_from_tensor(&self, tensor: Tensor, sync: bool) -> Result<()> {
        let id = self.unique_id();
        let device = self.device();
        if sync {
            let typed = tensor.to_dtype(self.dtype());
            let ir_value = self.ir_value_for_tensor(&typed, &device)?;
            return self.set_ir_value(ir_value);
        }
        let has_view = {
            let mut state = self.state();
            let record = state.record_mut(id);
            record.tensor_data = Some(tensor.clone());
            record.handle = None;
            record.assign_ir_value(None);
            record.view.is_some()
        };
        if has_view {
            let ir_value = self.ir_value_for_tensor(&tensor, &device)?;
            update_view(&mut self.state(), id, ir_value);
        }
        Ok(())
    }

    /// Out-variant update: a view whose element count differs from `tensor` is dropped
    /// rather than written through.
    pub fn update_from_tensor_out(&self, tensor: Tensor) -> Result<()> {
        self.drop_view_if_numel_differs(tensor.len());
        self.update_from_tensor(tensor, false)
    }

    /// Out-variant update from another lazy tensor's value.
    pub fn update_from_lazy_tensor_out(&self, other: &LazyTensor) -> Result<()> {
        self.drop_view_if_numel_differs(other.shape().num_elements());
        self.set_ir_value(other.get_ir_value()?)
    }

    fn drop_view_if_numel_differs(&self, num_elements: usize) {
        let id = self.unique_id();
        let mut state = self.state();
        let record = state.record(id);
        if record.view.is_some() && record_spec(record).num_elements() != num_elements {
            debug!("tensor {id}: out update changes the element count, dropping its view");
            state.set_view(id, None);
        }
    }

    /// Makes `dest` take this tensor's current IR value.
    pub fn shallow_copy_to(&self, dest: &LazyTensor) -> Result<()> {
        dest.set_ir_value(self.get_ir_value()?)
    }

    /// One tensor per output of `node`, on this tensor's device.
    pub fn make_output_tensors(&self, node: &NodePtr) -> Result<Vec<LazyTensor>> {
        let device = self.device();
        (0..node.num_outputs())
            .map(|index| {
                Self::from_ir_value(
                    self.context(),
                    Value::new(Arc::clone(node), index),
                    device.clone(),
                )
            })
            .collect()
    }

    /// Detached copy of this tensor's value placed on `device`.
    pub fn copy_tensor_to_device(&self, device: BackendDevice) -> Result<LazyTensor> {
        let tensor = self.to_tensor(true)?;
        Ok(Self::from_tensor(self.context(), tensor, device))
    }

    /// Runs the pending IR through the executor unless device data is already resident.
    pub fn apply_pending_graph(&self) -> Result<()> {
        let device = self.device();
        self.executor().device_barrier(&device);
        if self.current_data_handle().is_none() {
            let _scope = self.context().counters().timed(SYNC_TENSORS_GRAPH_SCOPE);
            self.executor()
                .sync_tensors_graph(&[self.clone()], &[], true, false)?;
        }
        Ok(())
    }

    // ---- views -------------------------------------------------------------------------

    /// Creates a view of this tensor described by `info`. The first view promotes this
    /// tensor itself to an identity view of a fresh alias, so both observe each other's
    /// writes.
    pub fn create_view(&self, info: ViewInfo) -> Result<DetachedView> {
        let id = self.unique_id();
        {
            let mut state = self.state();
            let (record, aliases) = state.split(id);
            if let Some(view) = &record.view {
                let sub_view = view.create_sub_view(info.shape.clone(), info);
                aliases.retain(sub_view.alias_id());
                return Ok(DetachedView::new(self.context(), sub_view));
            }
        }
        let ir_value = self.get_ir_value()?;
        let mut state = self.state();
        let alias = state.aliases.create(ir_value.clone());
        let identity = ViewInfo::no_op(ir_value.spec().clone());
        state.set_view(id, Some(View::new(ir_value.spec().clone(), alias, identity)));
        state.record_mut(id).assign_ir_value(None);
        state.aliases.retain(alias);
        Ok(DetachedView::new(self.context(), View::new(info.shape.clone(), alias, info)))
    }

    pub fn create_view_tensor(&self, info: ViewInfo) -> Result<LazyTensor> {
        let view = self.create_view(info)?;
        Ok(Self::from_view(self.context(), view, self.device()))
    }

    /// Turns this tensor into a view of its own current value, or extends its view chain.
    pub fn modify_current_view(&self, info: ViewInfo) -> Result<()> {
        let id = self.unique_id();
        if self.state().record(id).view.is_some() {
            self.set_sub_view(info);
            return Ok(());
        }
        let ir_value = self.get_ir_value()?;
        let mut state = self.state();
        let alias = state.aliases.create(ir_value);
        state.set_view(id, Some(View::new(info.shape.clone(), alias, info)));
        state.record_mut(id).assign_ir_value(None);
        Ok(())
    }

    /// Extends this tensor's view chain with `info`. Panics if it has no view.
    pub fn set_sub_view(&self, info: ViewInfo) {
        let id = self.unique_id();
        let mut state = self.state();
        let sub_view = state
            .record(id)
            .view
            .as_ref()
            .unwrap_or_else(|| panic!("set_sub_view on tensor {id} without a view"))
            .create_sub_view(info.shape.clone(), info);
        state.set_view(id, Some(sub_view));
        state.record_mut(id).generation += 1;
    }
}

/// A view not yet wrapped in a tensor. It keeps its alias alive until it is passed to
/// [`LazyTensor::from_view`] or dropped.
pub struct DetachedView {
    ctx: Arc<LazyContext>,
    alias: AliasId,
    view: Option<View>,
}

impl DetachedView {
    /// `view`'s alias must already carry a reference for this handle.
    fn new(ctx: &Arc<LazyContext>, view: View) -> Self {
        DetachedView {
            ctx: Arc::clone(ctx),
            alias: view.alias_id(),
            view: Some(view),
        }
    }

    pub fn alias_id(&self) -> AliasId {
        self.alias
    }

    pub fn shape(&self) -> Option<&TensorSpec> {
        self.view.as_ref().map(View::shape)
    }
}

impl Drop for DetachedView {
    fn drop(&mut self) {
        self.ctx.release_alias(self.alias);
    }
}

impl fmt::Debug for DetachedView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DetachedView")
            .field("alias", &self.alias.0)
            .field("view", &self.view)
            .finish()
    }
}

impl fmt::Debug for LazyTensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LazyTensor")
            .field("id", &self.unique_id())
            .finish_non_exhaustive()
    }
}

fn record_spec(record: &TensorRecord) -> TensorSpec {
    if let Some(view) = &record.view {
        return view.shape().clone();
    }
    if let Some(handle) = &record.handle {
        return handle.spec().clone();
    }
    if let Some(ir_value) = &record.ir_value {
        return ir_value.spec().clone();
    }
    match &record.tensor_data {
        Some(tensor) => tensor.spec(),
        None => panic!("tensor {} has no value to take a shape from", record.unique_id),
    }
}

/// View IR plus whether it was recomputed; recomputation invalidates handle and host data.
fn view_update(record: &mut TensorRecord, aliases: &mut AliasArena) -> Option<(Value, bool)> {
    let (ir_value, updated) = record.view.as_mut()?.get_view_ir_node(aliases);
    if updated {
        record.handle = None;
        record.tensor_data = None;
    }
    Some((ir_value, updated))
}

fn current_ir_value(state: &mut ContextState, id: TensorId) -> Option<Value> {
    let (record, aliases) = state.split(id);
    if record.view.is_some() {
        return view_update(record, aliases).map(|(ir_value, _)| ir_value);
    }
    record.ir_value.clone()
}

fn current_tensor_data(record: &TensorRecord, aliases: &AliasArena) -> Option<Tensor> {
    match &record.view {
        Some(view) if !view.is_up_to_date(aliases) => None,
        _ => record.tensor_data.clone(),
    }
}

/// Writes `ir_value` through the record's view. A value with different dimensions but the
/// same element count goes through a reshape sub-view.
fn update_view(state: &mut ContextState, id: TensorId, ir_value: Value) {
    let (record, aliases) = state.split(id);
    let view = record
        .view
        .as_ref()
        .unwrap_or_else(|| panic!("tensor {id} has no view to update"));
    if ir_value.spec().shape == view.shape().shape {
        view.update(aliases, ir_value);
        return;
    }
    assert_eq!(
        view.shape().num_elements(),
        ir_value.spec().num_elements(),
        "update of view {} with {} changes the element count",
        view.shape(),
        ir_value.spec()
    );
    let info = ViewInfo::reshape(ir_value.spec().clone(), view.shape().clone());
    let sub_view = view.create_sub_view(info.shape.clone(), info);
    sub_view.update(aliases, ir_value);
    state.set_view(id, Some(sub_view));
}

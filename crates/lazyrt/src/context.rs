//! Execution context owning every tensor record and alias of a process.
//!
//! A [`LazyContext`] replaces the process-wide graph executor singleton: it is created once
//! with [`LazyContext::new`], threaded through every tensor constructor, and retired with
//! [`LazyContext::shutdown`]. Tensor records live in an arena keyed by [`TensorId`]; handles
//! ([`LazyTensor`](crate::LazyTensor)) only carry the id.
//!
//! ## Ownership rules
//!
//! - A record is owned by the arena and kept alive by its handles; dropping the last handle
//!   removes the record and unregisters it from the executor.
//! - A record's view holds an [`AliasId`](crate::view::AliasId) into the alias arena; the
//!   alias is retained when a view is installed in a record and released when it is replaced
//!   or the record goes away. A [`DetachedView`](crate::DetachedView) holds one more
//!   reference until it is installed or dropped.
//! - Mutating one tensor record from several threads at once is a caller error. The
//!   context mutex keeps the arenas consistent but does not order competing writers; the
//!   generation counter only detects staleness.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::{debug, trace};
use serde::{Deserialize, Serialize};

use crate::backend::{BackendDataRef, BackendDevice, BackendImpl};
use crate::config::LazyConfig;
use crate::executor::GraphExecutor;
use crate::ir::Value;
use crate::profiling::Counters;
use crate::tensor::Tensor;
use crate::view::{AliasArena, AliasId, View};

/// Unique, monotonically increasing tensor identifier. Ids start at 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TensorId(pub u64);

impl fmt::Display for TensorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Per-tensor state. At most one of `tensor_data`, `handle`, `ir_value` is authoritative;
/// a valid `view` takes precedence over all of them.
pub(crate) struct TensorRecord {
    pub(crate) tensor_data: Option<Tensor>,
    pub(crate) handle: Option<BackendDataRef>,
    pub(crate) ir_value: Option<Value>,
    pub(crate) view: Option<View>,
    pub(crate) device: BackendDevice,
    pub(crate) unique_id: TensorId,
    pub(crate) generation: u64,
}

impl TensorRecord {
    pub(crate) fn new(unique_id: TensorId, device: BackendDevice) -> Self {
        TensorRecord {
            tensor_data: None,
            handle: None,
            ir_value: None,
            view: None,
            device,
            unique_id,
            generation: 1,
        }
    }

    /// Replaces the pending IR value and bumps the generation.
    pub(crate) fn assign_ir_value(&mut self, ir_value: Option<Value>) {
        self.ir_value = ir_value;
        self.generation += 1;
    }
}

/// Everything guarded by the context mutex.
pub(crate) struct ContextState {
    tensors: HashMap<TensorId, TensorRecord>,
    pub(crate) aliases: AliasArena,
}

impl ContextState {
    fn new() -> Self {
        ContextState {
            tensors: HashMap::new(),
            aliases: AliasArena::new(),
        }
    }

    pub(crate) fn record(&self, id: TensorId) -> &TensorRecord {
        self.tensors
            .get(&id)
            .unwrap_or_else(|| panic!("trying to access a null tensor record (id {id})"))
    }

    pub(crate) fn record_mut(&mut self, id: TensorId) -> &mut TensorRecord {
        self.tensors
            .get_mut(&id)
            .unwrap_or_else(|| panic!("trying to access a null tensor record (id {id})"))
    }

    /// Borrows a record and the alias arena at the same time.
    pub(crate) fn split(&mut self, id: TensorId) -> (&mut TensorRecord, &mut AliasArena) {
        let ContextState { tensors, aliases } = self;
        let record = tensors
            .get_mut(&id)
            .unwrap_or_else(|| panic!("trying to access a null tensor record (id {id})"));
        (record, aliases)
    }

    /// Installs or clears the view of a record, keeping alias reference counts in step.
    pub(crate) fn set_view(&mut self, id: TensorId, view: Option<View>) {
        let (record, aliases) = self.split(id);
        if let Some(view) = &view {
            aliases.retain(view.alias_id());
        }
        if let Some(previous) = std::mem::replace(&mut record.view, view) {
            aliases.release(previous.alias_id());
        }
    }
}

/// Process-level owner of the executor, backend, configuration, and tensor arenas.
pub struct LazyContext {
    executor: Arc<dyn GraphExecutor>,
    backend: Arc<dyn BackendImpl>,
    config: LazyConfig,
    state: Mutex<ContextState>,
    counters: Counters,
    next_tensor_id: AtomicU64,
    shut_down: AtomicBool,
}

impl LazyContext {
    /// Creates the context. Callers are expected to create one per process and pass it to
    /// every tensor constructor.
    pub fn new(
        executor: Arc<dyn GraphExecutor>,
        backend: Arc<dyn BackendImpl>,
        config: LazyConfig,
    ) -> Arc<Self> {
        debug!(
            "initializing lazy context on backend {} ({:?})",
            backend.backend_name(),
            config
        );
        Arc::new(LazyContext {
            executor,
            backend,
            config,
            state: Mutex::new(ContextState::new()),
            counters: Counters::new(),
            next_tensor_id: AtomicU64::new(1),
            shut_down: AtomicBool::new(false),
        })
    }

    pub fn executor(&self) -> &Arc<dyn GraphExecutor> {
        &self.executor
    }

    pub fn backend(&self) -> &Arc<dyn BackendImpl> {
        &self.backend
    }

    pub fn config(&self) -> &LazyConfig {
        &self.config
    }

    /// Event counters recorded by tensors of this context.
    pub fn counters(&self) -> &Counters {
        &self.counters
    }

    /// Number of live tensor records.
    pub fn live_tensors(&self) -> usize {
        self.state().tensors.len()
    }

    /// Number of live aliases.
    pub fn live_aliases(&self) -> usize {
        self.state().aliases.len()
    }

    /// Detaches the context from its executor. Idempotent; records dropped afterwards are
    /// removed without calling back into the executor.
    pub fn shutdown(&self) {
        if !self.shut_down.swap(true, Ordering::SeqCst) {
            debug!("lazy context shut down with {} live tensors", self.live_tensors());
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    pub(crate) fn state(&self) -> MutexGuard<'_, ContextState> {
        self.state.lock().expect("lazy context state poisoned")
    }

    /// Inserts a fresh record and registers it with the executor.
    pub(crate) fn insert_record(
        &self,
        device: BackendDevice,
        init: impl FnOnce(&mut TensorRecord),
    ) -> TensorId {
        assert!(
            !self.is_shut_down(),
            "tensor created on a lazy context that has been shut down"
        );
        let id = TensorId(self.next_tensor_id.fetch_add(1, Ordering::Relaxed));
        let mut record = TensorRecord::new(id, device);
        init(&mut record);
        self.state().tensors.insert(id, record);
        self.executor.register_tensor(id);
        trace!("registered lazy tensor {id}");
        id
    }

    /// Installs `view` on a freshly inserted record.
    pub(crate) fn install_view(&self, id: TensorId, view: View) {
        self.state().set_view(id, Some(view));
    }

    /// Drops a reference taken on an alias outside of any record. Runs from `Drop`.
    pub(crate) fn release_alias(&self, alias: AliasId) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.aliases.release(alias);
    }

    /// Removes a record once its last handle is gone. Runs from `Drop`, so a lock poisoned
    /// by a failed invariant check is recovered rather than re-panicking.
    pub(crate) fn release_tensor(&self, id: TensorId) {
        {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            state.set_view(id, None);
            state.tensors.remove(&id);
        }
        if self.is_shut_down() {
            trace!("skipping unregister of tensor {id}: context shut down");
            return;
        }
        self.executor.unregister_tensor(id);
    }
}

impl fmt::Debug for LazyContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LazyContext")
            .field("backend", &self.backend.backend_name())
            .field("config", &self.config)
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}

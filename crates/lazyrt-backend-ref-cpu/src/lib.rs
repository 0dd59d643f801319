//! Reference host backend and graph executor for `lazyrt`.
//!
//! Everything runs synchronously on the calling thread, which makes this the executor of
//! choice for tests and for checking other backends against.

mod backend;
mod executor;
mod kernels;

use std::sync::Arc;

use lazyrt::{LazyConfig, LazyContext};

pub use backend::CpuBackend;
pub use executor::CpuGraphExecutor;

/// Creates a context wired to a fresh [`CpuGraphExecutor`], returning both.
pub fn cpu_context(config: LazyConfig) -> (Arc<LazyContext>, Arc<CpuGraphExecutor>) {
    let executor = Arc::new(CpuGraphExecutor::new());
    let ctx = LazyContext::new(executor.clone(), Arc::new(CpuBackend::new()), config);
    (ctx, executor)
}

//! Global runtime instance. One per process, created on first use.

use std::sync::OnceLock;

use crate::config::PreConfig;
use crate::error::RuntimeError;
use crate::runtime::RuntimeState;

static RUNTIME: OnceLock<RuntimeState> = OnceLock::new();

/// The process-wide runtime. Its allocator table starts with the build's
/// defaults; [`global_initialize`] may still replace them while no domain has
/// served a request.
pub fn runtime() -> &'static RuntimeState {
    RUNTIME.get_or_init(|| {
        log::debug!("creating process-wide runtime state");
        RuntimeState::new()
    })
}

/// Run every start phase of the global runtime with `config`.
///
/// Debug-wrapped mem and object domains start requiring the runtime's
/// execution lock from here on, unless the build is `free-threaded`.
pub fn global_initialize(config: PreConfig) -> Result<&'static RuntimeState, RuntimeError> {
    let runtime = runtime();
    runtime.start(config)?;
    runtime.allocators().require_exec_lock(runtime.exec_lock());
    Ok(runtime)
}

/// Finalize the global runtime. Safe to call any number of times.
pub fn global_finalize() -> Result<(), RuntimeError> {
    runtime().finalize()
}

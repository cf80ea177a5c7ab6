use thiserror::Error;

use crate::allocator::Domain;
use crate::runtime::Phase;

/// A domain call returned null.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum MemoryError {
    #[error("out of memory: {domain} domain could not serve {size} bytes")]
    NoMemory { domain: Domain, size: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AllocatorError {
    #[error("the {0} allocator domain already served a request and can no longer be replaced")]
    DomainInUse(Domain),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("unknown allocator name {0:?}")]
    UnknownAllocator(String),
    #[error("allocator {0:?} requires the pool-alloc feature")]
    PoolAllocatorDisabled(&'static str),
    #[error(transparent)]
    Allocator(#[from] AllocatorError),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RuntimeError {
    #[error("runtime is in phase {found:?}, expected {expected:?}")]
    InvalidPhase { expected: Phase, found: Phase },
    #[error("runtime core is not initialized")]
    NotInitialized,
    #[error("exit callback registry is full ({capacity} entries)")]
    ExitFuncsFull { capacity: usize },
    #[error("audit hook rejected event {event:?}: {reason}")]
    AuditRejected { event: String, reason: String },
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Reports a broken invariant of the refcount or tracking-list protocol.
///
/// Logs the violated invariant together with a backtrace and panics; callers
/// never get control back.
#[cold]
#[inline(never)]
pub fn fatal_contract_violation(what: &str, object: *const u8) -> ! {
    let trace = backtrace::Backtrace::new();
    log::error!("contract violation on object {:p}: {}\n{:?}", object, what, trace);
    panic!("contract violation: {}", what);
}

/// Checks a protocol invariant unless the crate was built with
/// `unchecked-contracts`.
macro_rules! contract_check {
    ($cond: expr, $obj: expr, $what: expr) => {
        if cfg!(not(feature = "unchecked-contracts")) && !$cond {
            $crate::error::fatal_contract_violation($what, $obj as *const u8);
        }
    };
}

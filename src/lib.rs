//! Memory-management core of a managed-object runtime.
//!
//! - [`allocator`]: the raw, mem and object allocator domains, the debug
//!   decorator and the pooling small-object allocator on top of [`arena`].
//! - [`header`], [`types`], [`object`], [`gcref`]: the object header protocol,
//!   reference counting with immortal objects, and owned/borrowed handles.
//! - [`gc`]: intrusive tracking lists used by the cycle collector.
//! - [`runtime`], [`global`]: phase machine, small-int cache, exit callbacks
//!   and audit hooks, plus the process-wide instance.
//!
//! Refcounting follows one of two regimes fixed at build time: with the
//! `free-threaded` feature refcounts are updated atomically and tracking-list
//! splices take a global list lock; without it the caller is expected to hold
//! the [`ExecutionLock`](exec_lock::ExecutionLock).

#[macro_use]
pub mod error;

pub mod allocator;
pub mod arena;
pub mod config;
pub mod exec_lock;
pub mod gc;
pub mod gcref;
pub mod global;
pub mod globals;
pub mod header;
pub mod mem;
pub mod object;
pub mod runtime;
pub mod small_ints;
pub mod types;
pub mod util;

pub use allocator::{Allocators, Domain, MemoryAllocator};
pub use config::{AllocatorName, PreConfig};
pub use error::{AllocatorError, ConfigError, MemoryError, RuntimeError};
pub use gcref::{Borrowed, ObjRef, RefKind};
pub use header::{ObjectHeader, FREE_THREADED};
pub use runtime::{Phase, RuntimeState};
pub use types::{TypeFlags, TypeObject};

pub mod c_api {
    use std::os::raw::c_int;
    use std::ptr::null_mut;

    use crate::global::runtime;
    use crate::header::{self, ObjectHeader};
    use crate::{mem, object, PreConfig};

    #[no_mangle]
    pub extern "C" fn ember_initialize() -> c_int {
        match crate::global::global_initialize(PreConfig::default()) {
            Ok(_) => 0,
            Err(err) => {
                log::error!("ember_initialize: {}", err);
                -1
            }
        }
    }

    #[no_mangle]
    pub extern "C" fn ember_finalize() -> c_int {
        match crate::global::global_finalize() {
            Ok(()) => 0,
            Err(err) => {
                log::error!("ember_finalize: {}", err);
                -1
            }
        }
    }

    /// Objects passed in must already have gone through `init`.
    #[no_mangle]
    pub extern "C" fn ember_incref(op: *mut ObjectHeader) {
        unsafe { header::xincref(op) }
    }

    #[no_mangle]
    pub extern "C" fn ember_decref(op: *mut ObjectHeader) {
        unsafe { header::xdecref(op) }
    }

    #[no_mangle]
    pub extern "C" fn ember_is_immortal(op: *const ObjectHeader) -> bool {
        !op.is_null() && unsafe { header::is_immortal(op) }
    }

    #[no_mangle]
    pub extern "C" fn ember_gc_track(op: *mut ObjectHeader) {
        unsafe { object::gc_track(op) }
    }

    #[no_mangle]
    pub extern "C" fn ember_gc_untrack(op: *mut ObjectHeader) {
        unsafe { object::gc_untrack(op) }
    }

    /// Returns NULL when the raw domain is out of memory.
    #[no_mangle]
    pub extern "C" fn ember_raw_malloc(size: usize) -> *mut u8 {
        mem::raw_malloc(size).map_or(null_mut(), |ptr| ptr.as_ptr())
    }

    #[no_mangle]
    pub extern "C" fn ember_raw_free(ptr: *mut u8) {
        unsafe { mem::raw_free(ptr) }
    }

    /// Returns NULL when the object domain is out of memory.
    #[no_mangle]
    pub extern "C" fn ember_object_malloc(size: usize) -> *mut u8 {
        mem::object_malloc(size).map_or(null_mut(), |ptr| ptr.as_ptr())
    }

    #[no_mangle]
    pub extern "C" fn ember_object_free(ptr: *mut u8) {
        unsafe { mem::object_free(ptr) }
    }

    /// Take the execution lock of the global runtime for the calling thread.
    #[no_mangle]
    pub extern "C" fn ember_lock_acquire() {
        std::mem::forget(runtime().exec_lock().acquire());
    }

    /// Returns -1 when the calling thread does not hold the execution lock.
    #[no_mangle]
    pub extern "C" fn ember_lock_release() -> c_int {
        if runtime().exec_lock().release_held() {
            0
        } else {
            -1
        }
    }

    /// Returns -1 once the exit callback stack is full.
    #[no_mangle]
    pub extern "C" fn ember_register_exit_func(func: extern "C" fn()) -> c_int {
        match runtime().register_exit_func(move || func()) {
            Ok(()) => 0,
            Err(_) => -1,
        }
    }
}

//! Allocator domains.
//!
//! The runtime routes every heap request through one of three domains
//! ([`Domain::Raw`], [`Domain::Mem`], [`Domain::Object`]). Each domain slot holds
//! a [`MemoryAllocator`] that can be replaced wholesale until the slot serves its
//! first request. A block must be released through the domain that produced it;
//! the [`DebugAllocator`] decorator detects violations of that rule.

pub mod debug;
pub mod pool;
pub mod raw;

use std::fmt;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{const_mutex, const_rwlock, Mutex, RwLock};

use crate::config::AllocatorName;
use crate::error::{AllocatorError, ConfigError, MemoryError};
use crate::exec_lock::ExecutionLock;

pub use debug::{DebugAllocator, DebugViolation};
pub use pool::{PoolAllocator, PoolStats};
pub use raw::MallocAllocator;

/// One allocation policy.
///
/// Implementations treat zero-sized requests as one-byte requests so that
/// every successful call yields a unique, writable block. Null means out of
/// memory.
pub trait MemoryAllocator: Send + Sync {
    fn malloc(&self, size: usize) -> *mut u8;
    /// Zero-filled `nelem * elsize` bytes. Null on overflow of the product.
    fn calloc(&self, nelem: usize, elsize: usize) -> *mut u8;
    /// # Safety
    /// `ptr` is null or a live block from this allocator. On success the old
    /// block must not be used anymore; on failure it is left untouched.
    unsafe fn realloc(&self, ptr: *mut u8, size: usize) -> *mut u8;
    /// # Safety
    /// `ptr` is null or a live block from this allocator.
    unsafe fn free(&self, ptr: *mut u8);

    fn name(&self) -> &'static str {
        "custom"
    }

    fn as_debug(&self) -> Option<&DebugAllocator> {
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Domain {
    Raw,
    Mem,
    Object,
}

impl Domain {
    pub const ALL: [Domain; 3] = [Domain::Raw, Domain::Mem, Domain::Object];

    /// Tag byte the debug wrapper stores next to every block of this domain.
    pub const fn api_id(self) -> u8 {
        match self {
            Domain::Raw => b'r',
            Domain::Mem => b'm',
            Domain::Object => b'o',
        }
    }
}

impl fmt::Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Domain::Raw => "raw",
            Domain::Mem => "mem",
            Domain::Object => "object",
        })
    }
}

pub(crate) static MALLOC: MallocAllocator = MallocAllocator;
#[cfg(feature = "pool-alloc")]
pub(crate) static POOL: PoolAllocator = PoolAllocator::new(crate::arena::ArenaBackend::DEFAULT);

/// Allocator used by the mem and object domains when nothing else is configured.
pub fn default_object_allocator() -> &'static dyn MemoryAllocator {
    #[cfg(feature = "pool-alloc")]
    {
        &POOL
    }
    #[cfg(not(feature = "pool-alloc"))]
    {
        &MALLOC
    }
}

struct AllocatorSlot {
    current: RwLock<&'static dyn MemoryAllocator>,
    used: AtomicBool,
}

impl AllocatorSlot {
    const fn new(allocator: &'static dyn MemoryAllocator) -> Self {
        Self {
            current: const_rwlock(allocator),
            used: AtomicBool::new(false),
        }
    }

    #[inline(always)]
    fn acquire(&self) -> &'static dyn MemoryAllocator {
        if !self.used.load(Ordering::Relaxed) {
            self.used.store(true, Ordering::Relaxed);
        }
        *self.current.read()
    }
}

/// The three domain slots of one runtime.
pub struct Allocators {
    raw: AllocatorSlot,
    mem: AllocatorSlot,
    obj: AllocatorSlot,
    name: Mutex<Option<AllocatorName>>,
}

impl Allocators {
    /// Direct heap for the raw domain, the build's default object allocator for
    /// the other two.
    pub fn new() -> Self {
        let this = Self::with(&MALLOC, default_object_allocator());
        *this.name.lock() = Some(AllocatorName::Default);
        if cfg!(feature = "debug-alloc") {
            this.install_debug_hooks();
            *this.name.lock() = Some(AllocatorName::Debug);
        }
        this
    }

    /// A table with the given allocators and no name.
    pub const fn with(
        raw: &'static dyn MemoryAllocator,
        object: &'static dyn MemoryAllocator,
    ) -> Self {
        Self {
            raw: AllocatorSlot::new(raw),
            mem: AllocatorSlot::new(object),
            obj: AllocatorSlot::new(object),
            name: const_mutex(None),
        }
    }

    fn slot(&self, domain: Domain) -> &AllocatorSlot {
        match domain {
            Domain::Raw => &self.raw,
            Domain::Mem => &self.mem,
            Domain::Object => &self.obj,
        }
    }

    /// The allocator currently installed for `domain`.
    pub fn get(&self, domain: Domain) -> &'static dyn MemoryAllocator {
        *self.slot(domain).current.read()
    }

    /// Whether `domain` already served at least one request.
    pub fn is_used(&self, domain: Domain) -> bool {
        self.slot(domain).used.load(Ordering::Relaxed)
    }

    /// Replace the allocator of `domain`. Only allowed before its first use.
    pub fn set(
        &self,
        domain: Domain,
        allocator: &'static dyn MemoryAllocator,
    ) -> Result<(), AllocatorError> {
        let slot = self.slot(domain);
        if slot.used.load(Ordering::Relaxed) {
            log::warn!("refusing to replace the {} allocator after first use", domain);
            return Err(AllocatorError::DomainInUse(domain));
        }
        *slot.current.write() = allocator;
        *self.name.lock() = None;
        log::debug!("{} domain now uses the {} allocator", domain, allocator.name());
        Ok(())
    }

    fn ensure_unused(&self) -> Result<(), AllocatorError> {
        match Domain::ALL.iter().find(|domain| self.is_used(**domain)) {
            Some(domain) => Err(AllocatorError::DomainInUse(*domain)),
            None => Ok(()),
        }
    }

    fn install_debug_hooks(&self) {
        for domain in Domain::ALL {
            let slot = self.slot(domain);
            let mut current = slot.current.write();
            if current.as_debug().is_none() {
                let wrapped: &'static DebugAllocator =
                    Box::leak(Box::new(DebugAllocator::new(domain, *current)));
                *current = wrapped;
            }
        }
    }

    /// Wrap every domain that is not wrapped yet with a [`DebugAllocator`].
    pub fn setup_debug_hooks(&self) -> Result<(), AllocatorError> {
        self.ensure_unused()?;
        self.install_debug_hooks();
        let mut name = self.name.lock();
        *name = match *name {
            Some(AllocatorName::Default) => Some(AllocatorName::Debug),
            Some(AllocatorName::Malloc) => Some(AllocatorName::MallocDebug),
            Some(AllocatorName::PyMalloc) => Some(AllocatorName::PyMallocDebug),
            other => other,
        };
        log::debug!("debug hooks installed on all allocator domains");
        Ok(())
    }

    /// Bind every debug-wrapped mem and object domain to `lock`, see
    /// [`DebugAllocator::require_exec_lock`]. Unwrapped domains are left alone.
    pub fn require_exec_lock(&self, lock: &'static ExecutionLock) {
        for domain in [Domain::Mem, Domain::Object] {
            if let Some(debug) = self.get(domain).as_debug() {
                debug.require_exec_lock(lock);
            }
        }
    }

    /// Install a named allocator configuration.
    pub fn setup(&self, name: AllocatorName) -> Result<(), ConfigError> {
        self.ensure_unused()?;
        let object: &'static dyn MemoryAllocator = match name {
            AllocatorName::NotSet => return Ok(()),
            AllocatorName::Default | AllocatorName::Debug => default_object_allocator(),
            AllocatorName::Malloc | AllocatorName::MallocDebug => &MALLOC,
            AllocatorName::PyMalloc | AllocatorName::PyMallocDebug => {
                #[cfg(feature = "pool-alloc")]
                {
                    &POOL
                }
                #[cfg(not(feature = "pool-alloc"))]
                {
                    return Err(ConfigError::PoolAllocatorDisabled(name.as_str()));
                }
            }
        };
        *self.raw.current.write() = &MALLOC;
        *self.mem.current.write() = object;
        *self.obj.current.write() = object;
        if name.is_debug() {
            self.install_debug_hooks();
        }
        *self.name.lock() = Some(name);
        log::debug!("allocators set up as {:?}", name.as_str());
        Ok(())
    }

    /// Name of the installed configuration, `None` once a custom allocator was set.
    pub fn current_name(&self) -> Option<&'static str> {
        self.name.lock().map(AllocatorName::as_str)
    }

    pub fn malloc(&self, domain: Domain, size: usize) -> Result<NonNull<u8>, MemoryError> {
        let ptr = self.slot(domain).acquire().malloc(size);
        NonNull::new(ptr).ok_or(MemoryError::NoMemory { domain, size })
    }

    pub fn calloc(
        &self,
        domain: Domain,
        nelem: usize,
        elsize: usize,
    ) -> Result<NonNull<u8>, MemoryError> {
        let size = nelem.checked_mul(elsize).ok_or(MemoryError::NoMemory {
            domain,
            size: usize::MAX,
        })?;
        let ptr = self.slot(domain).acquire().calloc(nelem, elsize);
        NonNull::new(ptr).ok_or(MemoryError::NoMemory { domain, size })
    }

    /// # Safety
    /// `ptr` is null or a live block of `domain`.
    pub unsafe fn realloc(
        &self,
        domain: Domain,
        ptr: *mut u8,
        size: usize,
    ) -> Result<NonNull<u8>, MemoryError> {
        let new = self.slot(domain).acquire().realloc(ptr, size);
        NonNull::new(new).ok_or(MemoryError::NoMemory { domain, size })
    }

    /// # Safety
    /// `ptr` is null or a live block of `domain`.
    pub unsafe fn free(&self, domain: Domain, ptr: *mut u8) {
        if ptr.is_null() {
            return;
        }
        self.slot(domain).acquire().free(ptr);
    }
}

impl Default for Allocators {
    fn default() -> Self {
        Self::new()
    }
}

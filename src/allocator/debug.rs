//! Debug decorator for allocator domains.
//!
//! Every block handed out by a [`DebugAllocator`] is laid out as
//!
//! ```text
//! +-----------+--------+------------------+--------+-----------------+--------+
//! | size (S)  | api id | FORBIDDEN (S-1)  | data   | FORBIDDEN (S)   | serial |
//! +-----------+--------+------------------+--------+-----------------+--------+
//! ^ block from the wrapped allocator       ^ pointer returned to the caller
//! ```
//!
//! where `S` is the machine word size. Fresh data is filled with [`CLEANBYTE`],
//! released data with [`DEADBYTE`]. The api id names the domain that produced
//! the block; releasing it through another domain, or with damaged guard bytes,
//! is reported and the call is not forwarded. Wrappers of the mem and object
//! domains can additionally be bound to an [`ExecutionLock`]; requests made
//! without holding it are reported and refused the same way.

use std::ptr::{self, null_mut};
use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam_utils::atomic::AtomicCell;
use parking_lot::Mutex;

use super::{Domain, MemoryAllocator};
use crate::exec_lock::ExecutionLock;
use crate::globals::SST;
use crate::header::FREE_THREADED;

pub const CLEANBYTE: u8 = 0xCD;
pub const DEADBYTE: u8 = 0xDD;
pub const FORBIDDENBYTE: u8 = 0xFD;

const HEAD_BYTES: usize = 2 * SST;
const EXTRA_BYTES: usize = 4 * SST;

/// Bumped by every debug malloc/calloc/realloc of the process.
static SERIALNO: AtomicUsize = AtomicUsize::new(0);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DebugViolation {
    /// Block allocated through one domain, released or resized through another.
    ApiMismatch {
        ptr: usize,
        allocated_with: char,
        verified_with: char,
    },
    /// Guard bytes in front of the data were overwritten.
    Underwrite { ptr: usize },
    /// Guard bytes after the data were overwritten.
    Overwrite {
        ptr: usize,
        size: usize,
        serial: usize,
    },
    /// Mem or object request made without holding the execution lock.
    LockNotHeld { api: char },
}

pub struct DebugAllocator {
    api_id: u8,
    inner: &'static dyn MemoryAllocator,
    violations: Mutex<Vec<DebugViolation>>,
    exec_lock: AtomicCell<Option<&'static ExecutionLock>>,
}

impl DebugAllocator {
    pub fn new(domain: Domain, inner: &'static dyn MemoryAllocator) -> Self {
        Self {
            api_id: domain.api_id(),
            inner,
            violations: Mutex::new(Vec::new()),
            exec_lock: AtomicCell::new(None),
        }
    }

    /// Refuse mem and object requests from callers that do not hold `lock`.
    /// No-op for the raw domain and in `free-threaded` builds.
    pub fn require_exec_lock(&self, lock: &'static ExecutionLock) {
        if FREE_THREADED || self.api_id == Domain::Raw.api_id() {
            return;
        }
        self.exec_lock.store(Some(lock));
    }

    pub fn requires_exec_lock(&self) -> bool {
        self.exec_lock.load().is_some()
    }

    pub fn api_id(&self) -> u8 {
        self.api_id
    }

    pub fn inner(&self) -> &'static dyn MemoryAllocator {
        self.inner
    }

    /// Violations reported so far, oldest first.
    pub fn violations(&self) -> Vec<DebugViolation> {
        self.violations.lock().clone()
    }

    /// Serial number stamped on the block at its last (re)allocation.
    ///
    /// # Safety
    /// `ptr` must be a live block of this allocator.
    pub unsafe fn serial_of(&self, ptr: *const u8) -> usize {
        let size = read_word(ptr.sub(HEAD_BYTES));
        read_word(ptr.add(size + SST))
    }

    fn report(&self, violation: DebugViolation) {
        let trace = backtrace::Backtrace::new();
        match &violation {
            DebugViolation::ApiMismatch {
                ptr,
                allocated_with,
                verified_with,
            } => log::error!(
                "debug allocator: bad ID for block {:#x}: allocated using API '{}', verified using API '{}'\n{:?}",
                ptr,
                allocated_with,
                verified_with,
                trace
            ),
            DebugViolation::Underwrite { ptr } => log::error!(
                "debug allocator: block {:#x} has bad leading pad bytes\n{:?}",
                ptr,
                trace
            ),
            DebugViolation::Overwrite { ptr, size, serial } => log::error!(
                "debug allocator: block {:#x} ({} bytes, serial {}) has bad trailing pad bytes\n{:?}",
                ptr,
                size,
                serial,
                trace
            ),
            DebugViolation::LockNotHeld { api } => log::error!(
                "debug allocator: API '{}' called without holding the execution lock\n{:?}",
                api,
                trace
            ),
        }
        self.violations.lock().push(violation);
    }

    /// Check tag and guard bytes of `data`. Reports and returns false on damage.
    unsafe fn verify(&self, data: *mut u8) -> bool {
        let base = data.sub(HEAD_BYTES);
        let id = *base.add(SST);
        if id != self.api_id {
            self.report(DebugViolation::ApiMismatch {
                ptr: data as usize,
                allocated_with: id as char,
                verified_with: self.api_id as char,
            });
            return false;
        }
        // the size word is only trusted once the leading guard is intact
        let head = std::slice::from_raw_parts(base.add(SST + 1), SST - 1);
        if head.iter().any(|b| *b != FORBIDDENBYTE) {
            self.report(DebugViolation::Underwrite { ptr: data as usize });
            return false;
        }
        let size = read_word(base);
        let tail = std::slice::from_raw_parts(data.add(size), SST);
        if tail.iter().any(|b| *b != FORBIDDENBYTE) {
            self.report(DebugViolation::Overwrite {
                ptr: data as usize,
                size,
                serial: read_word(data.add(size + SST)),
            });
            return false;
        }
        true
    }

    /// Reports and returns false when a bound execution lock is not held by
    /// the caller.
    fn check_exec_lock(&self) -> bool {
        match self.exec_lock.load() {
            Some(lock) if !lock.is_held_by_current() => {
                self.report(DebugViolation::LockNotHeld {
                    api: self.api_id as char,
                });
                false
            }
            _ => true,
        }
    }

    /// Write header and trailer around a block of `size` data bytes at `base`.
    unsafe fn stamp(&self, base: *mut u8, size: usize) -> *mut u8 {
        write_word(base, size);
        *base.add(SST) = self.api_id;
        ptr::write_bytes(base.add(SST + 1), FORBIDDENBYTE, SST - 1);
        let data = base.add(HEAD_BYTES);
        let tail = data.add(size);
        ptr::write_bytes(tail, FORBIDDENBYTE, SST);
        let serial = SERIALNO.fetch_add(1, Ordering::Relaxed) + 1;
        write_word(tail.add(SST), serial);
        data
    }

    fn alloc(&self, zeroed: bool, size: usize) -> *mut u8 {
        if !self.check_exec_lock() || size > isize::MAX as usize - EXTRA_BYTES {
            return null_mut();
        }
        let total = size + EXTRA_BYTES;
        let base = if zeroed {
            self.inner.calloc(1, total)
        } else {
            self.inner.malloc(total)
        };
        if base.is_null() {
            return null_mut();
        }
        unsafe {
            let data = self.stamp(base, size);
            if !zeroed {
                ptr::write_bytes(data, CLEANBYTE, size);
            }
            data
        }
    }
}

impl MemoryAllocator for DebugAllocator {
    fn malloc(&self, size: usize) -> *mut u8 {
        self.alloc(false, size)
    }

    fn calloc(&self, nelem: usize, elsize: usize) -> *mut u8 {
        match nelem.checked_mul(elsize) {
            Some(size) => self.alloc(true, size),
            None => null_mut(),
        }
    }

    unsafe fn realloc(&self, ptr: *mut u8, size: usize) -> *mut u8 {
        if ptr.is_null() {
            return self.malloc(size);
        }
        if !self.check_exec_lock() || !self.verify(ptr) {
            return null_mut();
        }
        if size > isize::MAX as usize - EXTRA_BYTES {
            return null_mut();
        }
        let base = ptr.sub(HEAD_BYTES);
        let original = read_word(base);
        let mut erased = Vec::new();
        if size < original {
            erased.extend_from_slice(std::slice::from_raw_parts(ptr.add(size), original - size));
            ptr::write_bytes(ptr.add(size), DEADBYTE, original - size);
        }
        let new_base = self.inner.realloc(base, size + EXTRA_BYTES);
        if new_base.is_null() {
            // the old block is still the caller's
            ptr::copy_nonoverlapping(erased.as_ptr(), ptr.add(size), erased.len());
            return null_mut();
        }
        let data = self.stamp(new_base, size);
        if size > original {
            ptr::write_bytes(data.add(original), CLEANBYTE, size - original);
        }
        data
    }

    unsafe fn free(&self, ptr: *mut u8) {
        if ptr.is_null() {
            return;
        }
        if !self.check_exec_lock() || !self.verify(ptr) {
            return;
        }
        let base = ptr.sub(HEAD_BYTES);
        let size = read_word(base);
        ptr::write_bytes(base, DEADBYTE, size + EXTRA_BYTES);
        self.inner.free(base);
    }

    fn name(&self) -> &'static str {
        "debug"
    }

    fn as_debug(&self) -> Option<&DebugAllocator> {
        Some(self)
    }
}

#[inline(always)]
unsafe fn read_word(at: *const u8) -> usize {
    at.cast::<usize>().read_unaligned()
}

#[inline(always)]
unsafe fn write_word(at: *mut u8, value: usize) {
    at.cast::<usize>().write_unaligned(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::MALLOC;

    fn wrapped(domain: Domain) -> &'static DebugAllocator {
        Box::leak(Box::new(DebugAllocator::new(domain, &MALLOC)))
    }

    /// Serves fresh blocks from the C heap but can never resize one.
    struct FixedSize;

    impl MemoryAllocator for FixedSize {
        fn malloc(&self, size: usize) -> *mut u8 {
            MALLOC.malloc(size)
        }

        fn calloc(&self, nelem: usize, elsize: usize) -> *mut u8 {
            MALLOC.calloc(nelem, elsize)
        }

        unsafe fn realloc(&self, _ptr: *mut u8, _size: usize) -> *mut u8 {
            null_mut()
        }

        unsafe fn free(&self, ptr: *mut u8) {
            MALLOC.free(ptr)
        }
    }

    static FIXED_SIZE: FixedSize = FixedSize;

    #[test]
    fn fresh_blocks_are_filled_and_guarded() {
        let alloc = wrapped(Domain::Mem);
        unsafe {
            let p = alloc.malloc(10);
            assert!((0..10).all(|i| *p.add(i) == CLEANBYTE));
            assert!((0..SST).all(|i| *p.add(10 + i) == FORBIDDENBYTE));
            assert_eq!(*p.sub(SST), b'm');
            let z = alloc.calloc(3, 4);
            assert!((0..12).all(|i| *z.add(i) == 0));
            assert!(alloc.serial_of(z) > alloc.serial_of(p));
            alloc.free(p);
            alloc.free(z);
        }
        assert!(alloc.violations().is_empty());
    }

    #[test]
    fn realloc_keeps_contents_and_restamps() {
        let alloc = wrapped(Domain::Object);
        unsafe {
            let p = alloc.malloc(4);
            p.copy_from_nonoverlapping([1u8, 2, 3, 4].as_ptr(), 4);
            let before = alloc.serial_of(p);
            let q = alloc.realloc(p, 64);
            assert_eq!(std::slice::from_raw_parts(q, 4), &[1, 2, 3, 4]);
            assert!((4..64).all(|i| *q.add(i) == CLEANBYTE));
            assert!(alloc.serial_of(q) > before);
            let r = alloc.realloc(q, 2);
            assert_eq!(std::slice::from_raw_parts(r, 2), &[1, 2]);
            alloc.free(r);
        }
        assert!(alloc.violations().is_empty());
    }

    #[test]
    fn failed_realloc_leaves_the_block_intact() {
        let alloc: &'static DebugAllocator =
            Box::leak(Box::new(DebugAllocator::new(Domain::Mem, &FIXED_SIZE)));
        let contents: Vec<u8> = (1..=16).collect();
        unsafe {
            let p = alloc.malloc(16);
            p.copy_from_nonoverlapping(contents.as_ptr(), 16);
            let serial = alloc.serial_of(p);
            assert!(alloc.realloc(p, 4).is_null());
            assert_eq!(std::slice::from_raw_parts(p, 16), contents.as_slice());
            assert!(alloc.realloc(p, 64).is_null());
            assert_eq!(std::slice::from_raw_parts(p, 16), contents.as_slice());
            assert_eq!(alloc.serial_of(p), serial);
            alloc.free(p);
        }
        assert!(alloc.violations().is_empty());
    }

    #[test]
    fn cross_domain_free_is_reported_not_executed() {
        let raw = wrapped(Domain::Raw);
        let obj = wrapped(Domain::Object);
        unsafe {
            let p = raw.malloc(16);
            p.write(42);
            obj.free(p);
            assert_eq!(
                obj.violations(),
                vec![DebugViolation::ApiMismatch {
                    ptr: p as usize,
                    allocated_with: 'r',
                    verified_with: 'o',
                }]
            );
            // the block was left alone and still belongs to the raw domain
            assert_eq!(*p, 42);
            assert!(obj.realloc(p, 32).is_null());
            raw.free(p);
        }
        assert!(raw.violations().is_empty());
    }

    #[test]
    fn trailing_overwrite_is_reported() {
        let alloc = wrapped(Domain::Raw);
        unsafe {
            let p = alloc.malloc(8);
            *p.add(8) = 0;
            alloc.free(p);
            match alloc.violations().as_slice() {
                [DebugViolation::Overwrite { size: 8, .. }] => {}
                other => panic!("unexpected violations {:?}", other),
            }
            *p.add(8) = FORBIDDENBYTE;
            alloc.free(p);
        }
        assert_eq!(alloc.violations().len(), 1);
    }

    #[test]
    fn leading_underwrite_is_reported_before_the_size_is_read() {
        let alloc = wrapped(Domain::Object);
        unsafe {
            let p = alloc.malloc(8);
            *p.sub(1) = 0;
            // a size word this large would point the serial read far outside the block
            write_word(p.sub(HEAD_BYTES), usize::MAX / 2);
            alloc.free(p);
            assert_eq!(
                alloc.violations(),
                vec![DebugViolation::Underwrite { ptr: p as usize }]
            );
            *p.sub(1) = FORBIDDENBYTE;
            write_word(p.sub(HEAD_BYTES), 8);
            alloc.free(p);
        }
        assert_eq!(alloc.violations().len(), 1);
    }

    #[cfg(not(feature = "free-threaded"))]
    #[test]
    fn bound_domains_require_the_execution_lock() {
        let lock: &'static ExecutionLock = Box::leak(Box::new(ExecutionLock::new()));
        let alloc = wrapped(Domain::Object);
        alloc.require_exec_lock(lock);
        assert!(alloc.requires_exec_lock());
        assert!(alloc.malloc(8).is_null());
        assert_eq!(alloc.violations(), vec![DebugViolation::LockNotHeld { api: 'o' }]);

        let guard = lock.acquire();
        let p = alloc.malloc(8);
        assert!(!p.is_null());
        drop(guard);
        unsafe { alloc.free(p) };
        assert_eq!(alloc.violations().len(), 2);

        let _guard = lock.acquire();
        unsafe { alloc.free(p) };
        assert_eq!(alloc.violations().len(), 2);
    }

    #[test]
    fn raw_domain_never_requires_the_execution_lock() {
        let lock: &'static ExecutionLock = Box::leak(Box::new(ExecutionLock::new()));
        let alloc = wrapped(Domain::Raw);
        alloc.require_exec_lock(lock);
        assert!(!alloc.requires_exec_lock());
        let p = alloc.malloc(8);
        assert!(!p.is_null());
        unsafe { alloc.free(p) };
        assert!(alloc.violations().is_empty());
    }

    #[test]
    fn zero_sized_debug_blocks_are_distinct() {
        let alloc = wrapped(Domain::Raw);
        let a = alloc.malloc(0);
        let b = alloc.calloc(0, 5);
        assert!(!a.is_null() && !b.is_null());
        assert_ne!(a, b);
        unsafe {
            alloc.free(a);
            alloc.free(b);
        }
    }
}

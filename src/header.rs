use std::mem::size_of;
use std::sync::atomic::AtomicIsize;

use atomic::Ordering;

use crate::types::{TypeFlags, TypeObject};

// ObjectHeader is the fixed prefix of every object.
//
// +------------+-------+----------------------------------------------+
// | name       | bits  |                                              |
// +------------+-------+----------------------------------------------+
// | refcnt     | word  | live count, or >= IMMORTAL_BIT when immortal |
// | ob_type    | word  | type descriptor                              |
// +------------+-------+----------------------------------------------+
// | ob_size    | word  | element count, VarObjectHeader only          |
// +------------+-------+----------------------------------------------+
//
// Notes:
// - GC-aware objects carry a GcHead right in front of the header, see `gc`.
// - The immortal bit leaves the sign bit and two more high bits clear so the
//   collector may shift a copied refcount left by two without overflowing.
#[repr(C)]
pub struct ObjectHeader {
    refcnt: AtomicIsize,
    pub(crate) ob_type: *const TypeObject,
}

#[repr(C)]
pub struct VarObjectHeader {
    pub ob_base: ObjectHeader,
    pub ob_size: isize,
}

unsafe impl Sync for ObjectHeader {}
unsafe impl Send for ObjectHeader {}

pub const IMMORTAL_BIT: isize = 1 << (8 * size_of::<isize>() - 4);
/// Refcount stamped on immortal objects. Sits in the middle of the immortal
/// range so stray increments or decrements never leave it.
pub const IMMORTAL_INIT_REFCNT: isize = IMMORTAL_BIT + IMMORTAL_BIT / 2;

/// Whether refcount traffic is atomic (`free-threaded`) or relies on the
/// execution lock.
pub const FREE_THREADED: bool = cfg!(feature = "free-threaded");

impl ObjectHeader {
    /// Header for an object placed in static storage. Static objects are immortal.
    pub const fn new_static(tp: *const TypeObject) -> Self {
        Self {
            refcnt: AtomicIsize::new(IMMORTAL_INIT_REFCNT),
            ob_type: tp,
        }
    }

    pub(crate) fn new_counted(tp: *const TypeObject) -> Self {
        count_refs(1);
        Self {
            refcnt: AtomicIsize::new(1),
            ob_type: tp,
        }
    }

    #[inline(always)]
    pub fn ob_type(&self) -> *const TypeObject {
        self.ob_type
    }

    #[inline(always)]
    pub fn refcount(&self) -> isize {
        self.refcnt.load(Ordering::Relaxed)
    }

    #[inline(always)]
    pub fn is_immortal(&self) -> bool {
        self.refcount() & IMMORTAL_BIT != 0
    }

    #[inline(always)]
    pub fn type_name(&self) -> &'static str {
        unsafe { (*self.ob_type).name }
    }
}

impl VarObjectHeader {
    pub const fn new_static(tp: *const TypeObject, size: isize) -> Self {
        Self {
            ob_base: ObjectHeader::new_static(tp),
            ob_size: size,
        }
    }
}

/// Stamp a freshly allocated object: type, type reference, refcount.
///
/// # Safety
/// `op` points to writable memory of at least `(*tp).basic_size` bytes and
/// `tp` is a live type.
pub unsafe fn init(op: *mut ObjectHeader, tp: *const TypeObject) {
    std::ptr::addr_of_mut!((*op).ob_type).write(tp);
    let flags = (*tp).flags;
    if flags.contains(TypeFlags::HEAP_TYPE) {
        incref(tp as *mut ObjectHeader);
    }
    let initial = if flags.contains(TypeFlags::IMMORTAL_INSTANCES) {
        IMMORTAL_INIT_REFCNT
    } else {
        count_refs(1);
        1
    };
    std::ptr::addr_of_mut!((*op).refcnt).write(AtomicIsize::new(initial));
}

/// [`init`] for variable-size objects; records the element count first.
///
/// # Safety
/// See [`init`].
pub unsafe fn init_var(op: *mut VarObjectHeader, tp: *const TypeObject, size: isize) {
    std::ptr::addr_of_mut!((*op).ob_size).write(size);
    init(op.cast(), tp);
}

/// # Safety
/// `op` is a live object.
#[inline(always)]
pub unsafe fn refcount(op: *const ObjectHeader) -> isize {
    (*op).refcount()
}

/// # Safety
/// `op` is a live object.
#[inline(always)]
pub unsafe fn is_immortal(op: *const ObjectHeader) -> bool {
    (*op).is_immortal()
}

/// Make `op` live for the rest of the process. There is no way back.
///
/// # Safety
/// `op` is a live object that nothing else is mutating.
pub unsafe fn set_immortal(op: *mut ObjectHeader) {
    (*op).refcnt.store(IMMORTAL_INIT_REFCNT, Ordering::Relaxed);
}

/// Acquire a reference.
///
/// # Safety
/// `op` is a live object.
#[inline(always)]
pub unsafe fn incref(op: *mut ObjectHeader) {
    let refcnt = &(*op).refcnt;
    let current = refcnt.load(Ordering::Relaxed);
    if current & IMMORTAL_BIT != 0 {
        return;
    }
    contract_check!(
        current + 1 < IMMORTAL_BIT,
        op,
        "reference count overflowed into the immortal range"
    );
    count_refs(1);
    #[cfg(feature = "free-threaded")]
    {
        refcnt.fetch_add(1, Ordering::Relaxed);
    }
    #[cfg(not(feature = "free-threaded"))]
    {
        refcnt.store(current + 1, Ordering::Relaxed);
    }
}

/// Release a reference, running the type's destructor when it was the last one.
///
/// # Safety
/// `op` is a live object and the caller owns one of its references.
#[inline(always)]
pub unsafe fn decref(op: *mut ObjectHeader) {
    let refcnt = &(*op).refcnt;
    let current = refcnt.load(Ordering::Relaxed);
    if current & IMMORTAL_BIT != 0 {
        return;
    }
    contract_check!(current > 0, op, "decref of an object whose refcount is not positive");
    count_refs(-1);
    #[cfg(feature = "free-threaded")]
    let remaining = {
        let previous = refcnt.fetch_sub(1, Ordering::Release);
        contract_check!(previous > 0, op, "decref of an object whose refcount is not positive");
        previous - 1
    };
    #[cfg(not(feature = "free-threaded"))]
    let remaining = {
        refcnt.store(current - 1, Ordering::Relaxed);
        current - 1
    };
    if remaining == 0 {
        #[cfg(feature = "free-threaded")]
        std::sync::atomic::fence(Ordering::Acquire);
        dealloc(op);
    }
}

/// Null-tolerant [`incref`].
///
/// # Safety
/// `op` is null or a live object.
#[inline(always)]
pub unsafe fn xincref(op: *mut ObjectHeader) {
    if !op.is_null() {
        incref(op);
    }
}

/// Null-tolerant [`decref`].
///
/// # Safety
/// `op` is null or a live object the caller owns a reference to.
#[inline(always)]
pub unsafe fn xdecref(op: *mut ObjectHeader) {
    if !op.is_null() {
        decref(op);
    }
}

// Reference totals. Each thread tallies its own traffic and hands the tally
// over to MERGED_REFS when it exits.
#[cfg(not(feature = "unchecked-contracts"))]
mod ref_total {
    use std::cell::Cell;
    use std::sync::atomic::{AtomicIsize, Ordering};

    pub(super) static MERGED_REFS: AtomicIsize = AtomicIsize::new(0);

    struct ThreadRefs(Cell<isize>);

    impl Drop for ThreadRefs {
        fn drop(&mut self) {
            MERGED_REFS.fetch_add(self.0.get(), Ordering::Relaxed);
        }
    }

    thread_local! {
        static THREAD_REFS: ThreadRefs = ThreadRefs(Cell::new(0));
    }

    #[inline(always)]
    pub(super) fn add(delta: isize) {
        let counted = THREAD_REFS.try_with(|refs| refs.0.set(refs.0.get() + delta));
        if counted.is_err() {
            // thread-local storage is already torn down
            MERGED_REFS.fetch_add(delta, Ordering::Relaxed);
        }
    }

    pub(super) fn thread() -> isize {
        THREAD_REFS.try_with(|refs| refs.0.get()).unwrap_or(0)
    }
}

#[inline(always)]
fn count_refs(_delta: isize) {
    #[cfg(not(feature = "unchecked-contracts"))]
    ref_total::add(_delta);
}

/// References acquired minus references released by the calling thread.
/// Immortal objects do not count. Always zero with `unchecked-contracts`.
pub fn thread_ref_total() -> isize {
    #[cfg(not(feature = "unchecked-contracts"))]
    {
        ref_total::thread()
    }
    #[cfg(feature = "unchecked-contracts")]
    {
        0
    }
}

/// Live references of the process as far as they are known: the tallies of
/// exited threads plus the calling thread's. Always zero with
/// `unchecked-contracts`.
pub fn total_refs() -> isize {
    #[cfg(not(feature = "unchecked-contracts"))]
    {
        ref_total::MERGED_REFS.load(Ordering::Relaxed) + ref_total::thread()
    }
    #[cfg(feature = "unchecked-contracts")]
    {
        0
    }
}

#[cold]
#[inline(never)]
unsafe fn dealloc(op: *mut ObjectHeader) {
    let tp = (*op).ob_type;
    ((*tp).dealloc)(op);
}

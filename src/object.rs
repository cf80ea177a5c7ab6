//! Object construction and destruction on top of the object domain.
//!
//! Instances of GC-aware types are laid out as
//!
//! ```text
//! +--------+--------------+------------------+
//! | GcHead | ObjectHeader | type-specific    |
//! +--------+--------------+------------------+
//! ^ block of the object domain
//!          ^ object pointer
//! ```
//!
//! All other instances start directly with their header.

use std::mem::size_of;

use crate::allocator::Domain;
use crate::error::MemoryError;
use crate::gc::{self, GC_HEAD_SIZE};
use crate::gcref::ObjRef;
use crate::global::runtime;
use crate::globals::SST;
use crate::header::{self, ObjectHeader, VarObjectHeader};
use crate::mem;
use crate::types::{type_of, TypeObject};
use crate::util::align_up;

#[inline(always)]
fn presize(tp: &TypeObject) -> usize {
    if tp.has_gc() {
        GC_HEAD_SIZE
    } else {
        0
    }
}

fn allocate(tp: &TypeObject, size: usize) -> Result<*mut ObjectHeader, MemoryError> {
    contract_check!(
        tp.basic_size >= size_of::<ObjectHeader>(),
        tp.as_object(),
        "type instances are smaller than an object header"
    );
    let too_big = MemoryError::NoMemory {
        domain: Domain::Object,
        size: usize::MAX,
    };
    let total = presize(tp)
        .checked_add(size)
        .filter(|total| *total <= isize::MAX as usize - SST)
        .ok_or(too_big)?;
    // zeroed memory leaves the GcHead untracked
    let block = mem::object_calloc(1, align_up(total, SST))?;
    Ok(unsafe { block.as_ptr().add(presize(tp)).cast() })
}

/// Allocate and initialize a fixed-size instance of `tp`. The body past the
/// header is zeroed.
pub fn new_object(tp: &TypeObject) -> Result<ObjRef, MemoryError> {
    let op = allocate(tp, tp.basic_size)?;
    unsafe {
        header::init(op, tp);
        Ok(ObjRef::from_new(op))
    }
}

/// Allocate and initialize an instance of `tp` with `nitems` trailing elements.
pub fn new_var_object(tp: &TypeObject, nitems: usize) -> Result<ObjRef, MemoryError> {
    let size = nitems
        .checked_mul(tp.item_size)
        .and_then(|items| items.checked_add(tp.basic_size))
        .filter(|_| nitems <= isize::MAX as usize)
        .ok_or(MemoryError::NoMemory {
            domain: Domain::Object,
            size: usize::MAX,
        })?;
    let op = allocate(tp, size)?;
    unsafe {
        header::init_var(op.cast::<VarObjectHeader>(), tp, nitems as isize);
        Ok(ObjRef::from_new(op))
    }
}

/// Destructor for types whose instances own nothing but their memory.
/// Untracks the object when needed, returns the block to the object domain and
/// drops the instance's reference to a heap type.
///
/// # Safety
/// `op` was made by [`new_object`] or [`new_var_object`] and its refcount
/// reached zero.
pub unsafe fn generic_dealloc(op: *mut ObjectHeader) {
    let tp = type_of(op);
    let block = if (*tp).has_gc() {
        gc::untrack_if_tracked(op);
        gc::as_gc(op).cast::<u8>()
    } else {
        op.cast::<u8>()
    };
    mem::object_free(block);
    if (*tp).is_heap_type() {
        header::decref((*tp).as_object());
    }
}

/// Whether the collector should look at `op`.
///
/// # Safety
/// `op` is a live object.
pub unsafe fn is_gc(op: *const ObjectHeader) -> bool {
    let tp = type_of(op);
    (*tp).has_gc() && (*tp).is_gc.map_or(true, |predicate| predicate(op))
}

/// Slot holding the head of `op`'s weak-reference list.
///
/// # Safety
/// `op` is a live instance of a weakly referenceable type.
pub unsafe fn weakrefs_listptr(op: *mut ObjectHeader) -> *mut *mut ObjectHeader {
    let offset = (*type_of(op)).weaklist_offset;
    contract_check!(offset > 0, op, "type does not support weak references");
    op.cast::<u8>().offset(offset).cast()
}

/// Track `op` in the youngest generation of the global runtime.
///
/// # Safety
/// `op` is a live instance of a GC-aware type made by [`new_object`] or
/// [`new_var_object`].
pub unsafe fn gc_track(op: *mut ObjectHeader) {
    let mut state = runtime().gc().lock();
    state.track(op);
    state.note_allocation();
}

/// Counterpart of [`gc_track`]. Touches only `op`'s neighbours.
///
/// # Safety
/// `op` is a tracked instance of a GC-aware type.
pub unsafe fn gc_untrack(op: *mut ObjectHeader) {
    gc::untrack(op);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{TypeFlags, TYPE_TYPE};

    #[repr(C)]
    struct Pair {
        ob_base: ObjectHeader,
        weaklist: *mut ObjectHeader,
        left: usize,
    }

    static PAIR_TYPE: TypeObject = TypeObject::new_static(
        "pair",
        size_of::<Pair>(),
        0,
        TypeFlags::HAVE_GC,
        generic_dealloc,
    )
    .with_metatype(&TYPE_TYPE)
    .with_weaklist_offset(size_of::<ObjectHeader>() as isize);

    static BYTES_TYPE: TypeObject = TypeObject::new_static(
        "bytes",
        size_of::<VarObjectHeader>(),
        1,
        TypeFlags::empty(),
        generic_dealloc,
    )
    .with_metatype(&TYPE_TYPE);

    unsafe fn never_gc(_op: *const ObjectHeader) -> bool {
        false
    }

    #[test]
    fn new_objects_start_zeroed_and_untracked() {
        let obj = new_object(&PAIR_TYPE).unwrap();
        assert_eq!(obj.refcount(), 1);
        assert_eq!(obj.type_name(), "pair");
        unsafe {
            let pair = obj.as_ptr().cast::<Pair>();
            assert!((*pair).weaklist.is_null());
            assert_eq!((*pair).left, 0);
            assert!(!gc::is_tracked(obj.as_ptr()));
            assert!(is_gc(obj.as_ptr()));
            assert_eq!(
                weakrefs_listptr(obj.as_ptr()),
                std::ptr::addr_of_mut!((*pair).weaklist)
            );
        }
    }

    #[test]
    fn var_objects_record_their_length() {
        let obj = new_var_object(&BYTES_TYPE, 100).unwrap();
        unsafe {
            assert_eq!((*obj.as_ptr().cast::<VarObjectHeader>()).ob_size, 100);
            assert!(!is_gc(obj.as_ptr()));
        }
        assert!(new_var_object(&BYTES_TYPE, usize::MAX).is_err());
    }

    #[test]
    fn dealloc_untracks_tracked_objects() {
        let _exec = runtime().exec_lock().acquire();
        let obj = new_object(&PAIR_TYPE).unwrap();
        let ptr = obj.as_ptr();
        unsafe {
            gc_track(ptr);
            assert!(gc::is_tracked(ptr));
        }
        drop(obj);
        let state = runtime().gc().lock();
        assert!(state.iter(0).all(|tracked| tracked != ptr));
    }

    #[test]
    fn heap_type_lives_as_long_as_its_instances() {
        let tp = TypeObject::new_heap(
            TypeObject::new_static(
                "Cell",
                size_of::<Pair>(),
                0,
                TypeFlags::HAVE_GC,
                generic_dealloc,
            )
            .with_gc_predicate(never_gc),
        );
        let raw_type = tp.as_ptr().cast::<TypeObject>();
        let first = new_object(unsafe { &*raw_type }).unwrap();
        let second = new_object(unsafe { &*raw_type }).unwrap();
        assert_eq!(tp.refcount(), 3);
        unsafe { assert!(!is_gc(first.as_ptr())) };
        drop(first);
        assert_eq!(tp.refcount(), 2);
        drop(second);
        assert_eq!(tp.refcount(), 1);
    }
}

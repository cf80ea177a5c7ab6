//! Type descriptors.
//!
//! A [`TypeObject`] is itself an object: static types live in static storage
//! and are immortal, heap types are reference counted and kept alive by every
//! one of their instances.

use std::mem::size_of;
use std::ptr::{null, NonNull};

use crate::gcref::ObjRef;
use crate::header::{ObjectHeader, VarObjectHeader};

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct TypeFlags: u32 {
        /// Allocated at runtime; instances hold a reference to the type.
        const HEAP_TYPE = 1 << 0;
        /// Instances carry a tracking-list node in front of their header.
        const HAVE_GC = 1 << 1;
        /// Instances are stamped immortal at construction.
        const IMMORTAL_INSTANCES = 1 << 2;
    }
}

/// Runs when the last reference to an object goes away. Owns the object's
/// memory from then on.
pub type Destructor = unsafe fn(*mut ObjectHeader);
/// Per-instance refinement of [`TypeFlags::HAVE_GC`].
pub type GcPredicate = unsafe fn(*const ObjectHeader) -> bool;

#[repr(C)]
pub struct TypeObject {
    pub ob_base: VarObjectHeader,
    pub name: &'static str,
    /// Bytes of a fixed-size instance, header included.
    pub basic_size: usize,
    /// Bytes per element of a variable-size instance.
    pub item_size: usize,
    pub flags: TypeFlags,
    pub dealloc: Destructor,
    pub is_gc: Option<GcPredicate>,
    /// Byte offset of the weak-reference list slot inside an instance, zero when
    /// instances are not weakly referenceable.
    pub weaklist_offset: isize,
}

unsafe impl Sync for TypeObject {}
unsafe impl Send for TypeObject {}

/// The type of type objects.
pub static TYPE_TYPE: TypeObject = TypeObject::new_static(
    "type",
    size_of::<TypeObject>(),
    0,
    TypeFlags::empty(),
    type_dealloc,
)
.with_metatype(&TYPE_TYPE);

impl TypeObject {
    /// A type for static storage. Combine with [`TypeObject::with_metatype`]
    /// to point its header at [`TYPE_TYPE`].
    pub const fn new_static(
        name: &'static str,
        basic_size: usize,
        item_size: usize,
        flags: TypeFlags,
        dealloc: Destructor,
    ) -> Self {
        Self {
            ob_base: VarObjectHeader::new_static(null(), 0),
            name,
            basic_size,
            item_size,
            flags,
            dealloc,
            is_gc: None,
            weaklist_offset: 0,
        }
    }

    pub const fn with_metatype(mut self, metatype: &'static TypeObject) -> Self {
        self.ob_base.ob_base.ob_type = metatype;
        self
    }

    pub const fn with_gc_predicate(mut self, predicate: GcPredicate) -> Self {
        self.is_gc = Some(predicate);
        self
    }

    pub const fn with_weaklist_offset(mut self, offset: isize) -> Self {
        self.weaklist_offset = offset;
        self
    }

    /// Allocate a reference-counted type. The returned reference is the only
    /// one; instances add their own.
    pub fn new_heap(template: TypeObject) -> ObjRef {
        let mut tp = Box::new(template);
        tp.flags |= TypeFlags::HEAP_TYPE;
        tp.ob_base.ob_base = ObjectHeader::new_counted(&TYPE_TYPE);
        let raw = NonNull::from(Box::leak(tp)).cast::<ObjectHeader>();
        log::trace!("created heap type at {:p}", raw);
        unsafe { ObjRef::from_new(raw.as_ptr()) }
    }

    #[inline(always)]
    pub fn as_object(&self) -> *mut ObjectHeader {
        self as *const Self as *mut ObjectHeader
    }

    #[inline(always)]
    pub fn is_heap_type(&self) -> bool {
        self.flags.contains(TypeFlags::HEAP_TYPE)
    }

    #[inline(always)]
    pub fn has_gc(&self) -> bool {
        self.flags.contains(TypeFlags::HAVE_GC)
    }
}

/// Type of `op`.
///
/// # Safety
/// `op` is a live object.
#[inline(always)]
pub unsafe fn type_of(op: *const ObjectHeader) -> *const TypeObject {
    (*op).ob_type()
}

unsafe fn type_dealloc(op: *mut ObjectHeader) {
    let tp = op as *mut TypeObject;
    contract_check!(
        (*tp).is_heap_type(),
        op,
        "static type reached a reference count of zero"
    );
    log::trace!("releasing heap type {:?}", (*tp).name);
    drop(Box::from_raw(tp));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::{refcount, IMMORTAL_INIT_REFCNT};

    unsafe fn leak(_op: *mut ObjectHeader) {}

    #[test]
    fn static_types_are_immortal() {
        assert_eq!(TYPE_TYPE.ob_base.ob_base.refcount(), IMMORTAL_INIT_REFCNT);
        unsafe {
            assert_eq!(type_of(TYPE_TYPE.as_object()), &TYPE_TYPE as *const _);
        }
    }

    #[test]
    fn heap_types_are_counted() {
        let tp = TypeObject::new_heap(
            TypeObject::new_static("Point", size_of::<ObjectHeader>(), 0, TypeFlags::empty(), leak)
                .with_weaklist_offset(16),
        );
        unsafe {
            let raw = tp.as_ptr() as *const TypeObject;
            assert!((*raw).is_heap_type());
            assert_eq!((*raw).weaklist_offset, 16);
            assert_eq!(refcount(tp.as_ptr()), 1);
            assert_eq!(type_of(tp.as_ptr()), &TYPE_TYPE as *const _);
            let second = tp.clone();
            assert_eq!(refcount(tp.as_ptr()), 2);
            drop(second);
            assert_eq!(refcount(tp.as_ptr()), 1);
        }
    }
}

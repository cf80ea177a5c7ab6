use std::fmt;
use std::marker::PhantomData;
use std::ptr::NonNull;

use crate::header::{self, ObjectHeader};

/// How a handle relates to the reference count of its object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefKind {
    /// The handle owns one reference.
    Counted,
    /// The object is immortal; the handle neither adds nor drops references.
    Immortal,
    /// The handle owns nothing and is valid for a lexical scope.
    Borrowed,
}

/// Owned reference to an object.
///
/// Cloning acquires a reference and dropping releases it, except when the
/// object is immortal, in which case both are no-ops decided once when the
/// handle is made.
pub struct ObjRef {
    ptr: NonNull<ObjectHeader>,
    kind: RefKind,
}

impl ObjRef {
    /// Take over a reference the caller already owns, e.g. the one a
    /// constructor returned.
    ///
    /// # Safety
    /// `ptr` is a live object and the caller transfers one reference.
    #[inline]
    pub unsafe fn from_new(ptr: *mut ObjectHeader) -> Self {
        let ptr = NonNull::new_unchecked(ptr);
        let kind = if ptr.as_ref().is_immortal() {
            RefKind::Immortal
        } else {
            RefKind::Counted
        };
        Self { ptr, kind }
    }

    /// Acquire a fresh reference to `ptr`.
    ///
    /// # Safety
    /// `ptr` is a live object.
    #[inline]
    pub unsafe fn from_borrowed(ptr: *mut ObjectHeader) -> Self {
        header::incref(ptr);
        Self::from_new(ptr)
    }

    #[inline(always)]
    pub fn as_ptr(&self) -> *mut ObjectHeader {
        self.ptr.as_ptr()
    }

    #[inline(always)]
    pub fn kind(&self) -> RefKind {
        self.kind
    }

    #[inline(always)]
    pub fn borrow(&self) -> Borrowed<'_> {
        Borrowed {
            ptr: self.ptr,
            marker: PhantomData,
        }
    }

    pub fn refcount(&self) -> isize {
        unsafe { self.ptr.as_ref().refcount() }
    }

    pub fn is_immortal(&self) -> bool {
        unsafe { self.ptr.as_ref().is_immortal() }
    }

    pub fn type_name(&self) -> &'static str {
        unsafe { self.ptr.as_ref().type_name() }
    }

    /// Give up the handle without releasing its reference.
    pub fn into_raw(self) -> *mut ObjectHeader {
        let ptr = self.ptr.as_ptr();
        std::mem::forget(self);
        ptr
    }
}

impl Clone for ObjRef {
    #[inline]
    fn clone(&self) -> Self {
        if self.kind == RefKind::Counted {
            unsafe { header::incref(self.ptr.as_ptr()) };
        }
        Self {
            ptr: self.ptr,
            kind: self.kind,
        }
    }
}

impl Drop for ObjRef {
    #[inline]
    fn drop(&mut self) {
        if self.kind == RefKind::Counted {
            unsafe { header::decref(self.ptr.as_ptr()) };
        }
    }
}

impl PartialEq for ObjRef {
    fn eq(&self, other: &Self) -> bool {
        self.ptr == other.ptr
    }
}

impl Eq for ObjRef {}

impl fmt::Debug for ObjRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjRef({} @ {:p}, {:?})", self.type_name(), self.ptr, self.kind)
    }
}

#[cfg(feature = "free-threaded")]
unsafe impl Send for ObjRef {}
#[cfg(feature = "free-threaded")]
unsafe impl Sync for ObjRef {}

/// Non-owning handle valid for `'a`.
#[derive(Clone, Copy)]
pub struct Borrowed<'a> {
    ptr: NonNull<ObjectHeader>,
    marker: PhantomData<&'a ObjectHeader>,
}

impl<'a> Borrowed<'a> {
    /// # Safety
    /// `ptr` stays alive for `'a`.
    pub unsafe fn from_raw(ptr: *mut ObjectHeader) -> Self {
        Self {
            ptr: NonNull::new_unchecked(ptr),
            marker: PhantomData,
        }
    }

    #[inline(always)]
    pub fn as_ptr(self) -> *mut ObjectHeader {
        self.ptr.as_ptr()
    }

    pub fn kind(self) -> RefKind {
        RefKind::Borrowed
    }

    pub fn refcount(self) -> isize {
        unsafe { self.ptr.as_ref().refcount() }
    }

    /// Acquire an owned reference.
    pub fn to_owned(self) -> ObjRef {
        unsafe { ObjRef::from_borrowed(self.ptr.as_ptr()) }
    }
}

impl fmt::Debug for Borrowed<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Borrowed({:p})", self.ptr)
    }
}

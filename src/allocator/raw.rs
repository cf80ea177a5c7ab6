use super::MemoryAllocator;

/// Thin layer over the C heap.
///
/// Zero-sized requests are bumped to one byte: some platforms answer
/// `malloc(0)` with null, which would read as out-of-memory, and others with a
/// pointer that has no writable memory behind it.
#[derive(Debug, Default, Clone, Copy)]
pub struct MallocAllocator;

impl MemoryAllocator for MallocAllocator {
    #[inline]
    fn malloc(&self, size: usize) -> *mut u8 {
        let size = if size == 0 { 1 } else { size };
        unsafe { libc::malloc(size).cast() }
    }

    #[inline]
    fn calloc(&self, nelem: usize, elsize: usize) -> *mut u8 {
        let (nelem, elsize) = if nelem == 0 || elsize == 0 {
            (1, 1)
        } else {
            (nelem, elsize)
        };
        unsafe { libc::calloc(nelem, elsize).cast() }
    }

    #[inline]
    unsafe fn realloc(&self, ptr: *mut u8, size: usize) -> *mut u8 {
        let size = if size == 0 { 1 } else { size };
        libc::realloc(ptr.cast(), size).cast()
    }

    #[inline]
    unsafe fn free(&self, ptr: *mut u8) {
        libc::free(ptr.cast());
    }

    fn name(&self) -> &'static str {
        "malloc"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_sizes_are_bumped() {
        let a = MallocAllocator.malloc(0);
        let b = MallocAllocator.calloc(0, 0);
        assert!(!a.is_null());
        assert!(!b.is_null());
        assert_ne!(a, b);
        unsafe {
            assert_eq!(*b, 0);
            let a = MallocAllocator.realloc(a, 0);
            assert!(!a.is_null());
            MallocAllocator.free(a);
            MallocAllocator.free(b);
            MallocAllocator.free(std::ptr::null_mut());
        }
    }

    #[test]
    fn calloc_overflow_returns_null() {
        assert!(MallocAllocator.calloc(usize::MAX, 16).is_null());
    }
}

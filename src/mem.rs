//! Process-wide allocation entry points.
//!
//! Each function routes through the matching domain of the global runtime's
//! allocator table. Blocks must be released through the family that produced
//! them.

use std::ptr::NonNull;

use crate::allocator::Domain;
use crate::error::MemoryError;
use crate::global::runtime;

macro_rules! domain_entry_points {
    ($domain: expr, $malloc: ident, $calloc: ident, $realloc: ident, $free: ident) => {
        pub fn $malloc(size: usize) -> Result<NonNull<u8>, MemoryError> {
            runtime().allocators().malloc($domain, size)
        }

        pub fn $calloc(nelem: usize, elsize: usize) -> Result<NonNull<u8>, MemoryError> {
            runtime().allocators().calloc($domain, nelem, elsize)
        }

        /// # Safety
        /// `ptr` is null or a live block of this domain.
        pub unsafe fn $realloc(ptr: *mut u8, size: usize) -> Result<NonNull<u8>, MemoryError> {
            runtime().allocators().realloc($domain, ptr, size)
        }

        /// # Safety
        /// `ptr` is null or a live block of this domain.
        pub unsafe fn $free(ptr: *mut u8) {
            runtime().allocators().free($domain, ptr)
        }
    };
}

domain_entry_points!(Domain::Raw, raw_malloc, raw_calloc, raw_realloc, raw_free);
domain_entry_points!(Domain::Mem, mem_malloc, mem_calloc, mem_realloc, mem_free);
domain_entry_points!(
    Domain::Object,
    object_malloc,
    object_calloc,
    object_realloc,
    object_free
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn each_family_round_trips() {
        unsafe {
            let raw = raw_malloc(0).unwrap();
            let mem = mem_calloc(4, 4).unwrap();
            let obj = object_malloc(48).unwrap();
            assert!((0..16).all(|i| *mem.as_ptr().add(i) == 0));
            let obj = object_realloc(obj.as_ptr(), 600).unwrap();
            raw_free(raw.as_ptr());
            mem_free(mem.as_ptr());
            object_free(obj.as_ptr());
            object_free(std::ptr::null_mut());
        }
    }
}

use std::mem::size_of;

use crate::error::MemoryError;
use crate::gcref::ObjRef;
use crate::global::runtime;
use crate::globals::{NSMALLNEGINTS, NSMALLPOSINTS, SMALL_INT_CACHE_LEN};
use crate::header::ObjectHeader;
use crate::object::{generic_dealloc, new_object};
use crate::types::{TypeFlags, TypeObject, TYPE_TYPE};

#[repr(C)]
pub struct LongObject {
    pub ob_base: ObjectHeader,
    pub value: i64,
}

pub static LONG_TYPE: TypeObject = TypeObject::new_static(
    "int",
    size_of::<LongObject>(),
    0,
    TypeFlags::empty(),
    generic_dealloc,
)
.with_metatype(&TYPE_TYPE);

impl LongObject {
    /// An int object for `value`: the cached immortal instance when the
    /// global runtime has one, a fresh object otherwise.
    pub fn from_i64(value: i64) -> Result<ObjRef, MemoryError> {
        if let Ok(Some(cached)) = runtime().small_int(value) {
            return Ok(cached);
        }
        let obj = new_object(&LONG_TYPE)?;
        unsafe { (*obj.as_ptr().cast::<LongObject>()).value = value };
        Ok(obj)
    }

    /// # Safety
    /// `op` is an instance of [`LONG_TYPE`].
    pub unsafe fn value_of(op: *const ObjectHeader) -> i64 {
        (*op.cast::<LongObject>()).value
    }
}

/// Position of `value` in the cache, if it is cached at all.
pub fn cache_index(value: i64) -> Option<usize> {
    let lowest = -(NSMALLNEGINTS as i64);
    if value >= lowest && value < NSMALLPOSINTS as i64 {
        Some((value - lowest) as usize)
    } else {
        None
    }
}

/// Immortal int objects for `-NSMALLNEGINTS..NSMALLPOSINTS`. Built once and
/// never resized, so handed-out pointers stay valid for the process.
pub struct SmallIntCache {
    values: Box<[LongObject]>,
}

impl SmallIntCache {
    pub fn new() -> Self {
        let values = (0..SMALL_INT_CACHE_LEN)
            .map(|index| LongObject {
                ob_base: ObjectHeader::new_static(&LONG_TYPE),
                value: index as i64 - NSMALLNEGINTS as i64,
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();
        log::trace!("small int cache built with {} entries", values.len());
        Self { values }
    }

    pub fn get(&self, value: i64) -> Option<ObjRef> {
        let entry = &self.values[cache_index(value)?];
        let op = entry as *const LongObject as *mut ObjectHeader;
        Some(unsafe { ObjRef::from_new(op) })
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl Default for SmallIntCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gcref::RefKind;
    use crate::header::IMMORTAL_INIT_REFCNT;

    #[test]
    fn cache_covers_the_documented_range() {
        assert_eq!(cache_index(-5), Some(0));
        assert_eq!(cache_index(0), Some(5));
        assert_eq!(cache_index(256), Some(261));
        assert_eq!(cache_index(-6), None);
        assert_eq!(cache_index(257), None);
    }

    #[test]
    fn cached_entries_are_immortal() {
        let cache = SmallIntCache::new();
        assert_eq!(cache.len(), SMALL_INT_CACHE_LEN);
        let seven = cache.get(7).unwrap();
        assert_eq!(seven.kind(), RefKind::Immortal);
        assert_eq!(seven.refcount(), IMMORTAL_INIT_REFCNT);
        assert_eq!(unsafe { LongObject::value_of(seven.as_ptr()) }, 7);
        let again = cache.get(7).unwrap();
        assert_eq!(seven, again);
        drop(seven.clone());
        assert_eq!(again.refcount(), IMMORTAL_INIT_REFCNT);
        assert!(cache.get(1000).is_none());
    }

    #[test]
    fn large_values_get_fresh_objects() {
        let big = LongObject::from_i64(1 << 40).unwrap();
        assert_eq!(big.kind(), RefKind::Counted);
        assert_eq!(unsafe { LongObject::value_of(big.as_ptr()) }, 1 << 40);
    }
}

use std::mem::size_of;

/// Number of cached non-negative small integers: `0..NSMALLPOSINTS`.
pub const NSMALLPOSINTS: usize = 257;
/// Number of cached negative small integers: `-NSMALLNEGINTS..0`.
pub const NSMALLNEGINTS: usize = 5;
pub const SMALL_INT_CACHE_LEN: usize = NSMALLPOSINTS + NSMALLNEGINTS;

/// Capacity of the exit callback stack.
pub const NEXITFUNCS: usize = 32;

/// Size of one arena requested from the arena backend.
pub const ARENA_SIZE: usize = 256 * 1024;
pub const POOL_SIZE: usize = 4 * 1024;
/// Size-class granularity of the pooling allocator.
pub const ALIGNMENT: usize = 16;
pub const ALIGNMENT_SHIFT: usize = 4;
/// Requests above this size bypass the pools.
pub const SMALL_REQUEST_THRESHOLD: usize = 512;
pub const NB_SMALL_SIZE_CLASSES: usize = SMALL_REQUEST_THRESHOLD / ALIGNMENT;

/// Width of a machine word, used for debug-wrapper bookkeeping.
pub const SST: usize = size_of::<usize>();

pub const GC_GENERATIONS: usize = 3;
pub const GC_THRESHOLDS: [usize; GC_GENERATIONS] = [700, 10, 10];

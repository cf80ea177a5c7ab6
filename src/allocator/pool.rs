//! Pooling allocator for small objects.
//!
//! Requests up to [`SMALL_REQUEST_THRESHOLD`] bytes are rounded to a multiple of
//! [`ALIGNMENT`] and carved out of [`POOL_SIZE`] pools. Pools live in
//! [`ARENA_SIZE`] arenas reserved from an [`ArenaBackend`]. Everything else goes
//! straight to the C heap.
//!
//! A pool serves exactly one size class. It keeps a free list threaded through
//! its released blocks and lazily extends that list into never-used space, so
//! a null `freeblock` always means the pool is full.

use std::collections::BTreeMap;
use std::mem::size_of;
use std::ptr::{self, null_mut};

use parking_lot::{const_mutex, Mutex};

use super::{MemoryAllocator, MALLOC};
use crate::arena::ArenaBackend;
use crate::globals::{
    ALIGNMENT, ALIGNMENT_SHIFT, ARENA_SIZE, NB_SMALL_SIZE_CLASSES, POOL_SIZE,
    SMALL_REQUEST_THRESHOLD,
};
use crate::util::{align_down, align_up};

#[repr(C)]
struct PoolHeader {
    /// Blocks currently handed out.
    ref_count: usize,
    /// Head of the free block list, null when the pool is full.
    freeblock: *mut u8,
    next_pool: *mut PoolHeader,
    prev_pool: *mut PoolHeader,
    arena_index: usize,
    size_class: usize,
    /// Offset of the first never-used block.
    next_offset: usize,
    max_next_offset: usize,
}

const POOL_OVERHEAD: usize = align_up(size_of::<PoolHeader>(), ALIGNMENT);

#[inline(always)]
const fn class_size(class: usize) -> usize {
    (class + 1) << ALIGNMENT_SHIFT
}

#[inline(always)]
const fn size_to_class(size: usize) -> usize {
    let size = if size == 0 { 1 } else { size };
    (size - 1) >> ALIGNMENT_SHIFT
}

struct ArenaObject {
    /// Start of the reservation, null for a vacant slot.
    address: *mut u8,
    /// First never-carved pool.
    pool_address: *mut u8,
    nfreepools: usize,
    ntotalpools: usize,
    /// Pools that were used and emptied again.
    freepools: *mut PoolHeader,
}

struct PoolState {
    usedpools: [*mut PoolHeader; NB_SMALL_SIZE_CLASSES],
    arenas: Vec<ArenaObject>,
    /// Arena start address to index in `arenas`.
    by_address: BTreeMap<usize, usize>,
    stats: PoolStats,
}

unsafe impl Send for PoolState {}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Arenas ever reserved.
    pub arenas_allocated: usize,
    /// Arenas currently reserved.
    pub arenas_live: usize,
    /// Pools currently serving at least one block.
    pub pools_used: usize,
    pub blocks_in_use: usize,
}

pub struct PoolAllocator {
    backend: ArenaBackend,
    state: Mutex<PoolState>,
}

impl PoolAllocator {
    pub const fn new(backend: ArenaBackend) -> Self {
        Self {
            backend,
            state: const_mutex(PoolState {
                usedpools: [null_mut(); NB_SMALL_SIZE_CLASSES],
                arenas: Vec::new(),
                by_address: BTreeMap::new(),
                stats: PoolStats {
                    arenas_allocated: 0,
                    arenas_live: 0,
                    pools_used: 0,
                    blocks_in_use: 0,
                },
            }),
        }
    }

    pub fn backend(&self) -> ArenaBackend {
        self.backend
    }

    pub fn stats(&self) -> PoolStats {
        self.state.lock().stats
    }

    /// Whether `ptr` points into one of this allocator's arenas.
    pub fn owns(&self, ptr: *const u8) -> bool {
        self.state.lock().arena_of(ptr as usize).is_some()
    }

    /// Block capacity of the size class that serves `ptr`, if it is ours.
    pub fn usable_size(&self, ptr: *const u8) -> Option<usize> {
        let state = self.state.lock();
        state.arena_of(ptr as usize)?;
        let pool = align_down(ptr as usize, POOL_SIZE) as *const PoolHeader;
        Some(class_size(unsafe { (*pool).size_class }))
    }
}

impl PoolState {
    fn arena_of(&self, addr: usize) -> Option<usize> {
        let (&start, &index) = self.by_address.range(..=addr).next_back()?;
        if addr < start + ARENA_SIZE {
            Some(index)
        } else {
            None
        }
    }

    fn new_arena(&mut self, backend: ArenaBackend) -> Option<usize> {
        let address = backend.reserve(ARENA_SIZE);
        if address.is_null() {
            return None;
        }
        let first = align_up(address as usize, POOL_SIZE);
        let ntotalpools = (address as usize + ARENA_SIZE - first) / POOL_SIZE;
        let arena = ArenaObject {
            address,
            pool_address: first as *mut u8,
            nfreepools: ntotalpools,
            ntotalpools,
            freepools: null_mut(),
        };
        let index = match self.arenas.iter().position(|a| a.address.is_null()) {
            Some(vacant) => {
                self.arenas[vacant] = arena;
                vacant
            }
            None => {
                self.arenas.push(arena);
                self.arenas.len() - 1
            }
        };
        self.by_address.insert(address as usize, index);
        self.stats.arenas_allocated += 1;
        self.stats.arenas_live += 1;
        log::debug!(
            "pool allocator: new arena #{} at {:p} with {} pools",
            index,
            address,
            ntotalpools
        );
        Some(index)
    }

    /// Hand out an empty pool initialised for `class`.
    unsafe fn take_pool(&mut self, backend: ArenaBackend, class: usize) -> *mut PoolHeader {
        let index = match self
            .arenas
            .iter()
            .position(|a| !a.address.is_null() && a.nfreepools > 0)
        {
            Some(index) => index,
            None => match self.new_arena(backend) {
                Some(index) => index,
                None => return null_mut(),
            },
        };
        let arena = &mut self.arenas[index];
        let pool = if !arena.freepools.is_null() {
            let pool = arena.freepools;
            arena.freepools = (*pool).next_pool;
            pool
        } else {
            let pool = arena.pool_address.cast::<PoolHeader>();
            arena.pool_address = arena.pool_address.add(POOL_SIZE);
            pool
        };
        arena.nfreepools -= 1;

        let size = class_size(class);
        let first = pool.cast::<u8>().add(POOL_OVERHEAD);
        first.cast::<*mut u8>().write(null_mut());
        pool.write(PoolHeader {
            ref_count: 0,
            freeblock: first,
            next_pool: null_mut(),
            prev_pool: null_mut(),
            arena_index: index,
            size_class: class,
            next_offset: POOL_OVERHEAD + size,
            max_next_offset: POOL_SIZE - size,
        });
        self.stats.pools_used += 1;
        self.link(pool);
        pool
    }

    unsafe fn link(&mut self, pool: *mut PoolHeader) {
        let class = (*pool).size_class;
        let head = self.usedpools[class];
        (*pool).prev_pool = null_mut();
        (*pool).next_pool = head;
        if !head.is_null() {
            (*head).prev_pool = pool;
        }
        self.usedpools[class] = pool;
    }

    unsafe fn unlink(&mut self, pool: *mut PoolHeader) {
        let prev = (*pool).prev_pool;
        let next = (*pool).next_pool;
        if prev.is_null() {
            self.usedpools[(*pool).size_class] = next;
        } else {
            (*prev).next_pool = next;
        }
        if !next.is_null() {
            (*next).prev_pool = prev;
        }
        (*pool).next_pool = null_mut();
        (*pool).prev_pool = null_mut();
    }

    unsafe fn alloc(&mut self, backend: ArenaBackend, size: usize) -> *mut u8 {
        let class = size_to_class(size);
        let mut pool = self.usedpools[class];
        if pool.is_null() {
            pool = self.take_pool(backend, class);
            if pool.is_null() {
                return null_mut();
            }
        }
        let block = (*pool).freeblock;
        debug_assert!(!block.is_null());
        (*pool).freeblock = block.cast::<*mut u8>().read();
        (*pool).ref_count += 1;
        if (*pool).freeblock.is_null() {
            if (*pool).next_offset <= (*pool).max_next_offset {
                let virgin = pool.cast::<u8>().add((*pool).next_offset);
                virgin.cast::<*mut u8>().write(null_mut());
                (*pool).freeblock = virgin;
                (*pool).next_offset += class_size(class);
            } else {
                self.unlink(pool);
            }
        }
        self.stats.blocks_in_use += 1;
        block
    }

    /// Returns false if `ptr` is not ours.
    unsafe fn free(&mut self, backend: ArenaBackend, ptr: *mut u8) -> bool {
        let index = match self.arena_of(ptr as usize) {
            Some(index) => index,
            None => return false,
        };
        let pool = align_down(ptr as usize, POOL_SIZE) as *mut PoolHeader;
        debug_assert_eq!((*pool).arena_index, index);
        let was_full = (*pool).freeblock.is_null();
        ptr.cast::<*mut u8>().write((*pool).freeblock);
        (*pool).freeblock = ptr;
        (*pool).ref_count -= 1;
        self.stats.blocks_in_use -= 1;
        if was_full {
            self.link(pool);
        }
        if (*pool).ref_count == 0 {
            self.unlink(pool);
            self.stats.pools_used -= 1;
            let arena = &mut self.arenas[index];
            (*pool).next_pool = arena.freepools;
            arena.freepools = pool;
            arena.nfreepools += 1;
            if arena.nfreepools == arena.ntotalpools {
                let address = arena.address;
                *arena = ArenaObject {
                    address: null_mut(),
                    pool_address: null_mut(),
                    nfreepools: 0,
                    ntotalpools: 0,
                    freepools: null_mut(),
                };
                self.by_address.remove(&(address as usize));
                self.stats.arenas_live -= 1;
                backend.release(address, ARENA_SIZE);
            }
        }
        true
    }
}

impl MemoryAllocator for PoolAllocator {
    fn malloc(&self, size: usize) -> *mut u8 {
        if size <= SMALL_REQUEST_THRESHOLD {
            let ptr = unsafe { self.state.lock().alloc(self.backend, size) };
            if !ptr.is_null() {
                return ptr;
            }
        }
        MALLOC.malloc(size)
    }

    fn calloc(&self, nelem: usize, elsize: usize) -> *mut u8 {
        let size = match nelem.checked_mul(elsize) {
            Some(size) => size,
            None => return null_mut(),
        };
        if size <= SMALL_REQUEST_THRESHOLD {
            let ptr = unsafe { self.state.lock().alloc(self.backend, size) };
            if !ptr.is_null() {
                unsafe { ptr::write_bytes(ptr, 0, size) };
                return ptr;
            }
        }
        MALLOC.calloc(nelem, elsize)
    }

    unsafe fn realloc(&self, ptr: *mut u8, size: usize) -> *mut u8 {
        if ptr.is_null() {
            return self.malloc(size);
        }
        let capacity = match self.usable_size(ptr) {
            Some(capacity) => capacity,
            None => return MALLOC.realloc(ptr, size),
        };
        // shrinking by less than a quarter keeps the block
        if size <= capacity && 4 * size > 3 * capacity {
            return ptr;
        }
        let new = self.malloc(size);
        if new.is_null() {
            return null_mut();
        }
        ptr::copy_nonoverlapping(ptr, new, size.min(capacity));
        self.free(ptr);
        new
    }

    unsafe fn free(&self, ptr: *mut u8) {
        if ptr.is_null() {
            return;
        }
        if !self.state.lock().free(self.backend, ptr) {
            MALLOC.free(ptr);
        }
    }

    fn name(&self) -> &'static str {
        "pymalloc"
    }
}

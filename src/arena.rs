//! Large-block providers for the pooling allocator.
//!
//! Exactly one backend is used per build, chosen by [`ArenaBackend::DEFAULT`].
//! Every backend hands out memory readable and writable for at least the
//! requested size; [`ArenaBackend::release`] must be called with the size that
//! was passed to [`ArenaBackend::reserve`].

use std::ptr::null_mut;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArenaBackend {
    /// `VirtualAlloc` / `VirtualFree`.
    VirtualAlloc,
    /// Anonymous private `mmap` / `munmap`.
    Mmap,
    /// Plain heap `malloc` / `free`.
    Malloc,
}

impl ArenaBackend {
    #[cfg(all(windows, not(feature = "arena-malloc")))]
    pub const DEFAULT: ArenaBackend = ArenaBackend::VirtualAlloc;
    #[cfg(all(unix, not(feature = "arena-malloc")))]
    pub const DEFAULT: ArenaBackend = ArenaBackend::Mmap;
    #[cfg(any(feature = "arena-malloc", not(any(unix, windows))))]
    pub const DEFAULT: ArenaBackend = ArenaBackend::Malloc;

    pub fn name(self) -> &'static str {
        match self {
            Self::VirtualAlloc => "VirtualAlloc",
            Self::Mmap => "mmap",
            Self::Malloc => "malloc",
        }
    }

    /// Reserve `size` bytes. Returns null when the platform refuses.
    pub fn reserve(self, size: usize) -> *mut u8 {
        let ptr = match self {
            Self::VirtualAlloc => _win::reserve(size),
            Self::Mmap => _unix::reserve(size),
            Self::Malloc => unsafe { libc::malloc(size).cast::<u8>() },
        };
        log::trace!("arena reserve [{}] {} bytes -> {:p}", self.name(), size, ptr);
        #[cfg(test)]
        if !ptr.is_null() {
            ledger::RESERVED.with(|entries| entries.borrow_mut().push((ptr as usize, size)));
        }
        ptr
    }

    /// Give back a region obtained from [`reserve`](Self::reserve) on the same backend.
    ///
    /// # Safety
    /// `ptr` must come from `self.reserve(size)` and must not be used afterwards.
    pub unsafe fn release(self, ptr: *mut u8, size: usize) {
        log::trace!("arena release [{}] {:p} ({} bytes)", self.name(), ptr, size);
        #[cfg(test)]
        ledger::RELEASED.with(|entries| entries.borrow_mut().push((ptr as usize, size)));
        match self {
            Self::VirtualAlloc => _win::release(ptr, size),
            Self::Mmap => _unix::release(ptr, size),
            Self::Malloc => libc::free(ptr.cast()),
        }
    }
}

impl Default for ArenaBackend {
    fn default() -> Self {
        Self::DEFAULT
    }
}

#[cfg(windows)]
mod _win {
    use super::*;
    use winapi::um::{
        memoryapi::{VirtualAlloc, VirtualFree},
        winnt::{MEM_COMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_READWRITE},
    };

    pub fn reserve(size: usize) -> *mut u8 {
        unsafe { VirtualAlloc(null_mut(), size, MEM_COMMIT | MEM_RESERVE, PAGE_READWRITE).cast() }
    }

    pub unsafe fn release(ptr: *mut u8, _size: usize) {
        VirtualFree(ptr.cast(), 0, MEM_RELEASE);
    }
}

#[cfg(not(windows))]
mod _win {
    use super::*;

    pub fn reserve(_size: usize) -> *mut u8 {
        null_mut()
    }

    pub unsafe fn release(_ptr: *mut u8, _size: usize) {
        unreachable!("VirtualAlloc arenas are only handed out on windows")
    }
}

#[cfg(unix)]
mod _unix {
    use super::*;

    pub fn reserve(size: usize) -> *mut u8 {
        unsafe {
            let map = libc::mmap(
                null_mut(),
                size as _,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANON,
                -1,
                0,
            );
            if map == libc::MAP_FAILED {
                return null_mut();
            }
            map.cast()
        }
    }

    pub unsafe fn release(ptr: *mut u8, size: usize) {
        libc::munmap(ptr.cast(), size as _);
    }
}

#[cfg(not(unix))]
mod _unix {
    use super::*;

    pub fn reserve(_size: usize) -> *mut u8 {
        null_mut()
    }

    pub unsafe fn release(_ptr: *mut u8, _size: usize) {
        unreachable!("mmap arenas are only handed out on unix")
    }
}

/// Per-thread record of `(address, size)` pairs seen by reserve and release.
#[cfg(test)]
pub(crate) mod ledger {
    use std::cell::RefCell;

    thread_local! {
        pub(crate) static RESERVED: RefCell<Vec<(usize, usize)>> = RefCell::new(Vec::new());
        pub(crate) static RELEASED: RefCell<Vec<(usize, usize)>> = RefCell::new(Vec::new());
    }

    /// Drain both records of the calling thread.
    pub(crate) fn take() -> (Vec<(usize, usize)>, Vec<(usize, usize)>) {
        (
            RESERVED.with(|entries| entries.take()),
            RELEASED.with(|entries| entries.take()),
        )
    }
}

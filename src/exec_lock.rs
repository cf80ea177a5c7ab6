use std::num::NonZeroU64;
use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_utils::atomic::AtomicCell;
use parking_lot::lock_api::RawMutex as _;
use parking_lot::RawMutex;

/// Identity of an execution context (an OS thread). Never zero, so
/// `Option<ContextId>` fits in one word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContextId(NonZeroU64);

static NEXT_CONTEXT: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static CURRENT_CONTEXT: ContextId = ContextId::fresh();
}

impl ContextId {
    fn fresh() -> Self {
        let id = NEXT_CONTEXT.fetch_add(1, Ordering::Relaxed);
        match NonZeroU64::new(id) {
            Some(id) => Self(id),
            None => panic!("execution context ids exhausted"),
        }
    }

    /// Identity of the calling thread.
    pub fn current() -> Self {
        CURRENT_CONTEXT.with(|id| *id)
    }

    pub fn get(self) -> u64 {
        self.0.get()
    }
}

/// The global execution lock. Whoever holds it is the only context allowed to
/// touch object headers when refcounting is not atomic.
pub struct ExecutionLock {
    raw: RawMutex,
    holder: AtomicCell<Option<ContextId>>,
}

impl ExecutionLock {
    pub const fn new() -> Self {
        Self {
            raw: RawMutex::INIT,
            holder: AtomicCell::new(None),
        }
    }

    pub fn acquire(&self) -> ExecutionGuard<'_> {
        self.raw.lock();
        self.holder.store(Some(ContextId::current()));
        ExecutionGuard { lock: self }
    }

    pub fn try_acquire(&self) -> Option<ExecutionGuard<'_>> {
        if !self.raw.try_lock() {
            return None;
        }
        self.holder.store(Some(ContextId::current()));
        Some(ExecutionGuard { lock: self })
    }

    pub fn is_held(&self) -> bool {
        self.raw.is_locked()
    }

    pub fn holder(&self) -> Option<ContextId> {
        self.holder.load()
    }

    pub fn is_held_by_current(&self) -> bool {
        self.holder() == Some(ContextId::current())
    }

    /// Release a lock whose guard was forgotten. Returns false, and leaves the
    /// lock alone, when the caller is not the holder.
    pub fn release_held(&self) -> bool {
        if !self.is_held_by_current() {
            return false;
        }
        self.release();
        true
    }

    fn release(&self) {
        self.holder.store(None);
        unsafe { self.raw.unlock() };
    }
}

impl Default for ExecutionLock {
    fn default() -> Self {
        Self::new()
    }
}

/// Releases the execution lock on drop.
pub struct ExecutionGuard<'a> {
    lock: &'a ExecutionLock,
}

impl ExecutionGuard<'_> {
    /// Give the lock up early.
    pub fn release(self) {}
}

impl Drop for ExecutionGuard<'_> {
    fn drop(&mut self) {
        self.lock.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn context_ids_differ_per_thread() {
        let here = ContextId::current();
        assert_eq!(here, ContextId::current());
        let there = std::thread::spawn(ContextId::current).join().unwrap();
        assert_ne!(here, there);
    }

    #[test]
    fn lock_records_its_holder() {
        let lock = Arc::new(ExecutionLock::new());
        assert!(!lock.is_held());
        let guard = lock.acquire();
        assert!(lock.is_held());
        assert!(lock.is_held_by_current());
        let other = Arc::clone(&lock);
        let contended = std::thread::spawn(move || {
            let refused = other.try_acquire().is_none();
            refused
        })
        .join()
        .unwrap();
        assert!(contended);
        guard.release();
        assert!(!lock.is_held());
        assert_eq!(lock.holder(), None);
    }

    #[test]
    fn forgotten_guard_is_released_by_its_holder_only() {
        let lock = Arc::new(ExecutionLock::new());
        std::mem::forget(lock.acquire());
        let other = Arc::clone(&lock);
        let stolen = std::thread::spawn(move || other.release_held())
            .join()
            .unwrap();
        assert!(!stolen);
        assert!(lock.is_held_by_current());
        assert!(lock.release_held());
        assert!(!lock.is_held());
        assert!(!lock.release_held());
    }
}

//! Intrusive tracking lists of the cycle collector.
//!
//! Every GC-aware object carries a [`GcHead`] directly in front of its
//! [`ObjectHeader`]. Tracked objects are threaded onto a circular doubly-linked
//! list headed by the sentinel of their generation; the collector never owns
//! the objects, only these links.
//!
//! The low bits of `GcHead::prev` hold [`CollectingBit`] and [`FinalizedBit`];
//! every read of the address goes through [`PREV_ADDR_MASK`].

use std::mem::size_of;
use std::ptr::null_mut;

use crate::globals::{GC_GENERATIONS, GC_THRESHOLDS};
use crate::header::ObjectHeader;
use crate::types::type_of;
use crate::util::{BitFieldTrait, CollectingBit, FinalizedBit, PREV_ADDR_MASK};

#[repr(C)]
pub struct GcHead {
    /// Next node, null while untracked.
    next: *mut GcHead,
    /// Previous node address with the status bits folded in.
    prev: usize,
}

pub const GC_HEAD_SIZE: usize = size_of::<GcHead>();

impl GcHead {
    pub const fn untracked() -> Self {
        Self {
            next: null_mut(),
            prev: 0,
        }
    }
}

/// # Safety
/// `op` is an instance of a GC-aware type.
#[inline(always)]
pub unsafe fn as_gc(op: *const ObjectHeader) -> *mut GcHead {
    (op as *mut GcHead).sub(1)
}

/// # Safety
/// `gc` is the head of a GC-aware object.
#[inline(always)]
pub unsafe fn from_gc(gc: *const GcHead) -> *mut ObjectHeader {
    (gc as *mut GcHead).add(1).cast()
}

#[inline(always)]
unsafe fn prev_of(gc: *const GcHead) -> *mut GcHead {
    ((*gc).prev & PREV_ADDR_MASK) as *mut GcHead
}

#[inline(always)]
unsafe fn set_prev(gc: *mut GcHead, prev: *mut GcHead) {
    (*gc).prev = ((*gc).prev & !PREV_ADDR_MASK) | (prev as usize & PREV_ADDR_MASK);
}

#[inline(always)]
unsafe fn is_collecting_node(gc: *const GcHead) -> bool {
    CollectingBit::decode((*gc).prev) != 0
}

#[cfg(feature = "free-threaded")]
static LIST_LOCK: parking_lot::Mutex<()> = parking_lot::const_mutex(());

/// Serializes list splices in the free-threaded build. Under the execution
/// lock the holder is the only mutator and nothing is taken.
#[inline(always)]
fn splice_guard() -> Option<parking_lot::MutexGuard<'static, ()>> {
    #[cfg(feature = "free-threaded")]
    {
        Some(LIST_LOCK.lock())
    }
    #[cfg(not(feature = "free-threaded"))]
    {
        None
    }
}

/// # Safety
/// `op` is an instance of a GC-aware type.
#[inline(always)]
pub unsafe fn is_tracked(op: *const ObjectHeader) -> bool {
    !(*as_gc(op)).next.is_null()
}

/// # Safety
/// `op` is an instance of a GC-aware type.
#[inline(always)]
pub unsafe fn is_finalized(op: *const ObjectHeader) -> bool {
    FinalizedBit::decode((*as_gc(op)).prev) != 0
}

/// Mark the finalizer of `op` as run. The bit is never cleared.
///
/// # Safety
/// `op` is an instance of a GC-aware type.
pub unsafe fn set_finalized(op: *mut ObjectHeader) {
    let _guard = splice_guard();
    let gc = as_gc(op);
    (*gc).prev = FinalizedBit::update((*gc).prev, 1);
}

/// Take `op` off whatever list it is on. Only the node and its two neighbours
/// are touched, so destructors can call this without a [`GcState`].
///
/// Keeps the finalized bit and drops the address and the collecting bit.
///
/// # Safety
/// `op` is an instance of a GC-aware type.
pub unsafe fn untrack(op: *mut ObjectHeader) {
    let _guard = splice_guard();
    contract_check!(
        is_tracked(op),
        op,
        "object not tracked by the garbage collector"
    );
    unlink(as_gc(op));
}

/// [`untrack`] for objects that may or may not be on a list. The check and
/// the unlink happen under one splice guard. Returns whether `op` was tracked.
///
/// # Safety
/// `op` is an instance of a GC-aware type.
pub unsafe fn untrack_if_tracked(op: *mut ObjectHeader) -> bool {
    let _guard = splice_guard();
    if !is_tracked(op) {
        return false;
    }
    unlink(as_gc(op));
    true
}

unsafe fn unlink(gc: *mut GcHead) {
    let prev = prev_of(gc);
    let next = (*gc).next;
    (*prev).next = next;
    set_prev(next, prev);
    (*gc).next = null_mut();
    (*gc).prev &= FinalizedBit::MASK;
}

pub struct Generation {
    head: *mut GcHead,
    pub threshold: usize,
    pub count: usize,
}

impl Generation {
    fn new(threshold: usize) -> Self {
        let head = Box::into_raw(Box::new(GcHead::untracked()));
        unsafe {
            (*head).next = head;
            (*head).prev = head as usize;
        }
        Self {
            head,
            threshold,
            count: 0,
        }
    }

    fn is_empty(&self) -> bool {
        unsafe { (*self.head).next == self.head }
    }
}

/// Generations of tracked objects plus the allocation counters that decide
/// when a collection is due.
pub struct GcState {
    generations: [Generation; GC_GENERATIONS],
}

unsafe impl Send for GcState {}

impl GcState {
    pub fn new() -> Self {
        Self {
            generations: [
                Generation::new(GC_THRESHOLDS[0]),
                Generation::new(GC_THRESHOLDS[1]),
                Generation::new(GC_THRESHOLDS[2]),
            ],
        }
    }

    pub fn generation(&self, gen: usize) -> &Generation {
        &self.generations[gen]
    }

    pub fn generation_mut(&mut self, gen: usize) -> &mut Generation {
        &mut self.generations[gen]
    }

    /// Append `op` to the youngest generation.
    ///
    /// # Safety
    /// `op` is a live instance of a GC-aware type that stays alive, or is
    /// untracked, before this state is dropped.
    pub unsafe fn track(&mut self, op: *mut ObjectHeader) {
        contract_check!(
            (*type_of(op)).has_gc(),
            op,
            "object of a type without GC support cannot be tracked"
        );
        let _guard = splice_guard();
        contract_check!(
            !is_tracked(op),
            op,
            "object already tracked by the garbage collector"
        );
        let gc = as_gc(op);
        let gen0 = self.generations[0].head;
        contract_check!(
            !is_collecting_node(gc) && !is_collecting_node(gen0),
            op,
            "object is in generation which is garbage collected"
        );
        let last = prev_of(gen0);
        (*last).next = gc;
        set_prev(gc, last);
        (*gc).next = gen0;
        set_prev(gen0, gc);
    }

    /// # Safety
    /// See [`untrack`].
    #[inline]
    pub unsafe fn untrack(&mut self, op: *mut ObjectHeader) {
        untrack(op)
    }

    /// # Safety
    /// See [`is_tracked`].
    #[inline]
    pub unsafe fn is_tracked(&self, op: *const ObjectHeader) -> bool {
        is_tracked(op)
    }

    /// # Safety
    /// See [`is_finalized`].
    #[inline]
    pub unsafe fn is_finalized(&self, op: *const ObjectHeader) -> bool {
        is_finalized(op)
    }

    /// # Safety
    /// See [`set_finalized`].
    #[inline]
    pub unsafe fn set_finalized(&mut self, op: *mut ObjectHeader) {
        set_finalized(op)
    }

    pub fn len(&self, gen: usize) -> usize {
        self.iter(gen).count()
    }

    pub fn is_empty(&self, gen: usize) -> bool {
        self.generations[gen].is_empty()
    }

    /// Objects of generation `gen`, oldest first.
    pub fn iter(&self, gen: usize) -> GcIter<'_> {
        let head = self.generations[gen].head;
        GcIter {
            head,
            current: unsafe { (*head).next },
            _state: std::marker::PhantomData,
        }
    }

    pub fn is_collecting(&self, gen: usize) -> bool {
        unsafe { is_collecting_node(self.generations[gen].head) }
    }

    /// Flag generation `gen` and every node on it as under collection. New
    /// objects cannot be tracked onto it until [`GcState::clear_collecting`].
    pub fn mark_collecting(&mut self, gen: usize) {
        self.set_collecting(gen, 1);
    }

    pub fn clear_collecting(&mut self, gen: usize) {
        self.set_collecting(gen, 0);
    }

    fn set_collecting(&mut self, gen: usize, bit: usize) {
        let _guard = splice_guard();
        let head = self.generations[gen].head;
        unsafe {
            (*head).prev = CollectingBit::update((*head).prev, bit);
            let mut node = (*head).next;
            while node != head {
                (*node).prev = CollectingBit::update((*node).prev, bit);
                node = (*node).next;
            }
        }
    }

    /// Move every object of `from` to the tail of `to` in constant time.
    pub fn merge(&mut self, from: usize, to: usize) {
        if from == to || self.generations[from].is_empty() {
            return;
        }
        let _guard = splice_guard();
        let from_head = self.generations[from].head;
        let to_head = self.generations[to].head;
        unsafe {
            let to_tail = prev_of(to_head);
            let first = (*from_head).next;
            let last = prev_of(from_head);
            (*to_tail).next = first;
            set_prev(first, to_tail);
            (*last).next = to_head;
            set_prev(to_head, last);
            (*from_head).next = from_head;
            set_prev(from_head, from_head);
        }
        self.generations[to].count += self.generations[from].count;
        self.generations[from].count = 0;
        log::trace!("merged gc generation {} into {}", from, to);
    }

    pub fn note_allocation(&mut self) {
        self.generations[0].count += 1;
    }

    pub fn note_deallocation(&mut self) {
        let gen0 = &mut self.generations[0];
        gen0.count = gen0.count.saturating_sub(1);
    }

    /// Whether allocations since the last collection exceed the youngest
    /// generation's threshold.
    pub fn needs_collection(&self) -> bool {
        let gen0 = &self.generations[0];
        gen0.threshold != 0 && gen0.count > gen0.threshold
    }
}

impl Default for GcState {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for GcState {
    fn drop(&mut self) {
        // detach survivors so they do not point at freed sentinels
        let _guard = splice_guard();
        for generation in self.generations.iter() {
            unsafe {
                let head = generation.head;
                let mut node = (*head).next;
                while node != head {
                    let next = (*node).next;
                    (*node).next = null_mut();
                    (*node).prev &= FinalizedBit::MASK;
                    node = next;
                }
                drop(Box::from_raw(head));
            }
        }
    }
}

pub struct GcIter<'a> {
    head: *mut GcHead,
    current: *mut GcHead,
    _state: std::marker::PhantomData<&'a GcState>,
}

impl Iterator for GcIter<'_> {
    type Item = *mut ObjectHeader;

    fn next(&mut self) -> Option<Self::Item> {
        if self.current == self.head {
            return None;
        }
        let node = self.current;
        unsafe {
            self.current = (*node).next;
            Some(from_gc(node))
        }
    }
}

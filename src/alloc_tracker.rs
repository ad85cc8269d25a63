//! Allocation accounting and the global object list.
//!
//! Every heap object is a raw allocation headed by [`AllocUnit`]. A unit
//! lives in exactly one of three places at any instant: its allocating
//! context's local list, the tracker's lock-free global list, or an open
//! cycle snapshot while it is in transit between the two. Accounting against
//! the usage cap is batched per context so concurrent allocators rarely
//! touch the shared counter.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::mem::size_of;
use std::ptr::null_mut;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam_utils::CachePadded;
use parking_lot::Mutex;

use crate::descriptor::Descriptor;
use crate::gc::GcState;
use crate::globals::{CONTEXT_PRERESERVE_SIZE, CONTEXT_PRERESERVE_SKIP};

/// Header in front of every heap object. The payload of `size` bytes
/// follows the header in the same raw allocation and starts zeroed.
#[repr(C)]
pub struct AllocUnit {
    /// Next unit in whichever list currently owns this one.
    next: AtomicPtr<AllocUnit>,
    size: usize,
    /// Null until the allocating mutator publishes the layout. The
    /// collector treats a null descriptor as "no reference slots".
    desc: AtomicPtr<Descriptor>,
    mark: AtomicBool,
    /// GC state of the owning generation, stamped at allocation.
    owner: AtomicPtr<GcState>,
}

impl AllocUnit {
    pub fn layout(payload_size: usize) -> Layout {
        Layout::new::<AllocUnit>()
            .extend(Layout::array::<u8>(payload_size).expect("payload size overflow"))
            .expect("allocation size overflow")
            .0
            .pad_to_align()
    }

    pub fn header_size() -> usize {
        size_of::<AllocUnit>()
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn payload(&self) -> *mut u8 {
        unsafe { (self as *const AllocUnit as *mut u8).add(size_of::<AllocUnit>()) }
    }

    pub fn descriptor(&self) -> *const Descriptor {
        self.desc.load(Ordering::Acquire)
    }

    /// Publishes the payload layout. Until this runs the collector will not
    /// trace the object's fields. The unit keeps a reference to the
    /// descriptor until it is freed.
    pub fn publish_descriptor(&self, desc: &Arc<Descriptor>) {
        let raw = Arc::into_raw(desc.clone());
        self.desc.store(raw as *mut Descriptor, Ordering::Release);
    }

    pub(crate) fn mark_bit(&self) -> &AtomicBool {
        &self.mark
    }

    pub(crate) fn set_owner(&self, owner: *const GcState) {
        self.owner.store(owner as *mut GcState, Ordering::Relaxed);
    }

    pub(crate) fn owner(&self) -> *const GcState {
        self.owner.load(Ordering::Relaxed)
    }

    pub(crate) fn next(&self) -> *mut AllocUnit {
        self.next.load(Ordering::Relaxed)
    }

    /// Atomically reads the reference slot at `offset` into the payload.
    ///
    /// # Safety
    /// `offset` must come from a trusted descriptor: pointer aligned and
    /// inside the payload.
    pub unsafe fn read_ref_slot(&self, offset: usize) -> *mut AllocUnit {
        debug_assert!(offset + size_of::<*mut AllocUnit>() <= self.size);
        let slot = self.payload().add(offset) as *const AtomicPtr<AllocUnit>;
        (*slot).load(Ordering::Relaxed)
    }

    /// Atomically swaps the reference slot at `offset`, returning the old
    /// value for the caller's write barrier.
    ///
    /// # Safety
    /// Same contract as [`AllocUnit::read_ref_slot`].
    pub unsafe fn exchange_ref_slot(&self, offset: usize, new: *mut AllocUnit) -> *mut AllocUnit {
        debug_assert!(offset + size_of::<*mut AllocUnit>() <= self.size);
        let slot = self.payload().add(offset) as *const AtomicPtr<AllocUnit>;
        (*slot).swap(new, Ordering::Relaxed)
    }
}

/// Thread-affine scratch state: a short local list of freshly allocated
/// units and a pre-reserved slice of the usage counter. Only the owning
/// mutator touches it outside stop-the-world windows.
pub struct AllocContext {
    head: *mut AllocUnit,
    tail: *mut AllocUnit,
    pre_reserved: usize,
}

impl AllocContext {
    fn new() -> Self {
        Self {
            head: null_mut(),
            tail: null_mut(),
            pre_reserved: 0,
        }
    }

    unsafe fn push(&mut self, unit: *mut AllocUnit) {
        (*unit).next.store(null_mut(), Ordering::Relaxed);
        if self.head.is_null() {
            self.head = unit;
        } else {
            (*self.tail).next.store(unit, Ordering::Relaxed);
        }
        self.tail = unit;
    }
}

/// Detached singly-linked chain of units produced by [`AllocTracker::take_snapshot`]
/// and consumed by the sweep.
pub struct Snapshot {
    head: *mut AllocUnit,
}

impl Snapshot {
    pub fn new() -> Self {
        Self { head: null_mut() }
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_null()
    }

    #[cfg(test)]
    fn count(&self) -> usize {
        let mut n = 0;
        let mut cur = self.head;
        while !cur.is_null() {
            n += 1;
            cur = unsafe { (*cur).next() };
        }
        n
    }
}

impl Default for Snapshot {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone, Copy, Debug)]
pub struct TrackerStatistics {
    pub max_size: usize,
    pub used_bytes: usize,
    pub lifetime_allocated_bytes: usize,
}

pub struct AllocTracker {
    max_size: usize,
    current_usage: CachePadded<AtomicUsize>,
    lifetime_allocated: CachePadded<AtomicUsize>,
    /// Treiber-style list of units no context needs to track anymore.
    /// Pushed concurrently; popped only by the snapshot swap.
    global_head: AtomicPtr<AllocUnit>,
    contexts: Mutex<Vec<*mut AllocContext>>,
}

unsafe impl Send for AllocTracker {}
unsafe impl Sync for AllocTracker {}

impl AllocTracker {
    pub fn new(max_size: usize) -> Self {
        Self {
            max_size,
            current_usage: CachePadded::new(AtomicUsize::new(0)),
            lifetime_allocated: CachePadded::new(AtomicUsize::new(0)),
            global_head: AtomicPtr::new(null_mut()),
            contexts: Mutex::new(Vec::new()),
        }
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub fn current_usage(&self) -> usize {
        self.current_usage.load(Ordering::Relaxed)
    }

    pub fn lifetime_allocated(&self) -> usize {
        self.lifetime_allocated.load(Ordering::Relaxed)
    }

    pub fn new_context(&self) -> *mut AllocContext {
        let ctx = Box::into_raw(Box::new(AllocContext::new()));
        self.contexts.lock().push(ctx);
        ctx
    }

    /// Unregisters and frees a context. Units still on its local list move
    /// to the global list; its unredeemed reservation is returned.
    ///
    /// # Safety
    /// `ctx` must have come from [`AllocTracker::new_context`] on this
    /// tracker and must not be used afterwards.
    pub unsafe fn free_context(&self, ctx: *mut AllocContext) {
        {
            let mut contexts = self.contexts.lock();
            let pos = contexts
                .iter()
                .position(|&c| c == ctx)
                .expect("context is not registered with this tracker");
            contexts.swap_remove(pos);
        }
        let ctx = Box::from_raw(ctx);
        if !ctx.head.is_null() {
            self.push_chain_to_global(ctx.head, ctx.tail);
        }
        if ctx.pre_reserved > 0 {
            self.current_usage.fetch_sub(ctx.pre_reserved, Ordering::Relaxed);
        }
    }

    fn try_account(&self, add: usize) -> bool {
        let mut current = self.current_usage.load(Ordering::Relaxed);
        loop {
            if current + add > self.max_size {
                return false;
            }
            match self.current_usage.compare_exchange_weak(
                current,
                current + add,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    unsafe fn account_small(&self, ctx: *mut AllocContext, total: usize) -> bool {
        let ctx = &mut *ctx;
        if total <= ctx.pre_reserved {
            ctx.pre_reserved -= total;
            return true;
        }
        if self.try_account(CONTEXT_PRERESERVE_SIZE) {
            ctx.pre_reserved += CONTEXT_PRERESERVE_SIZE - total;
            return true;
        }
        // The batch does not fit under max_size; account the exact size the
        // way large allocations do before giving up.
        self.try_account(total)
    }

    /// Allocates a unit with a zeroed `size`-byte payload and appends it to
    /// the context's local list. Returns null when the usage cap or the
    /// process allocator refuses.
    ///
    /// # Safety
    /// `ctx` must belong to this tracker and to the calling thread, and the
    /// call must be bracketed by the caller's shared GC-lock section.
    pub unsafe fn alloc(&self, ctx: *mut AllocContext, size: usize) -> *mut AllocUnit {
        let layout = AllocUnit::layout(size);
        let unit = alloc_zeroed(layout).cast::<AllocUnit>();
        if unit.is_null() {
            return null_mut();
        }
        unit.write(AllocUnit {
            next: AtomicPtr::new(null_mut()),
            size,
            desc: AtomicPtr::new(null_mut()),
            mark: AtomicBool::new(false),
            owner: AtomicPtr::new(null_mut()),
        });

        let total = layout.size();
        let accounted = if size < CONTEXT_PRERESERVE_SKIP {
            self.account_small(ctx, total)
        } else {
            self.try_account(total)
        };
        if !accounted {
            dealloc(unit.cast(), layout);
            return null_mut();
        }

        self.lifetime_allocated.fetch_add(total, Ordering::Relaxed);
        (*ctx).push(unit);
        unit
    }

    /// Lock-free push used by the sweep to keep survivors reachable once
    /// their context no longer tracks them.
    pub fn add_block_to_global_list(&self, unit: *mut AllocUnit) {
        unsafe { self.push_chain_to_global(unit, unit) }
    }

    unsafe fn push_chain_to_global(&self, head: *mut AllocUnit, tail: *mut AllocUnit) {
        let mut old_head = self.global_head.load(Ordering::Relaxed);
        loop {
            (*tail).next.store(old_head, Ordering::Relaxed);
            match self.global_head.compare_exchange_weak(
                old_head,
                head,
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(actual) => old_head = actual,
            }
        }
    }

    /// Splices every context's local list and the swapped-out global list
    /// into one detached chain. Units allocated after this call land only in
    /// context lists and are invisible to the current cycle's sweep.
    ///
    /// The caller serializes this against mutator allocation (the GC holds
    /// exclusive access during the stop-the-world window).
    pub fn take_snapshot(&self, snapshot: &mut Snapshot) {
        assert!(snapshot.is_empty(), "snapshot already open");
        let contexts = self.contexts.lock();
        let mut tail: *mut AllocUnit = null_mut();
        unsafe {
            for &ctx in contexts.iter() {
                let ctx = &mut *ctx;
                if ctx.head.is_null() {
                    continue;
                }
                assert!(
                    (*ctx.tail).next.load(Ordering::Relaxed).is_null(),
                    "context list tail mismatch"
                );
                if snapshot.head.is_null() {
                    snapshot.head = ctx.head;
                } else {
                    (*tail).next.store(ctx.head, Ordering::Relaxed);
                }
                tail = ctx.tail;
                ctx.head = null_mut();
                ctx.tail = null_mut();
            }

            let global = self.global_head.swap(null_mut(), Ordering::Acquire);
            if !global.is_null() {
                if snapshot.head.is_null() {
                    snapshot.head = global;
                } else {
                    (*tail).next.store(global, Ordering::Relaxed);
                }
            }
        }
    }

    /// Consumes a snapshot: survivors (`survives` returned true) go back to
    /// the global list, the rest run their finalizer and are freed. The
    /// freed bytes are returned to the usage counter in one subtraction.
    ///
    /// # Safety
    /// Every unit in the snapshot must still be alive and owned by this
    /// tracker; nothing else may be traversing the chain.
    pub unsafe fn filter_snapshot_and_delete(
        &self,
        snapshot: &mut Snapshot,
        mut survives: impl FnMut(*mut AllocUnit) -> bool,
    ) {
        let mut next = snapshot.head;
        let mut freed = 0usize;
        while !next.is_null() {
            let current = next;
            next = (*current).next.load(Ordering::Relaxed);

            if survives(current) {
                self.add_block_to_global_list(current);
                continue;
            }

            let desc = (*current).descriptor();
            if !desc.is_null() {
                if let Some(finalizer) = (*desc).finalizer() {
                    finalizer((*current).payload());
                }
                // drop the reference taken at publication
                drop(Arc::from_raw(desc));
            }
            let layout = AllocUnit::layout((*current).size);
            freed += layout.size();
            dealloc(current.cast(), layout);
        }
        self.current_usage.fetch_sub(freed, Ordering::Relaxed);
        snapshot.head = null_mut();
    }

    pub fn get_statistics(&self) -> TrackerStatistics {
        TrackerStatistics {
            max_size: self.max_size,
            used_bytes: self.current_usage(),
            lifetime_allocated_bytes: self.lifetime_allocated(),
        }
    }
}

impl Drop for AllocTracker {
    fn drop(&mut self) {
        debug_assert!(
            self.contexts.lock().is_empty(),
            "tracker dropped with live contexts"
        );
        let mut snapshot = Snapshot::new();
        self.take_snapshot(&mut snapshot);
        unsafe {
            self.filter_snapshot_and_delete(&mut snapshot, |_| false);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accounts_exact_when_batch_does_not_fit() {
        let tracker = AllocTracker::new(1024 * 1024);
        let ctx = tracker.new_context();
        unsafe {
            let unit = tracker.alloc(ctx, 64);
            assert!(!unit.is_null());
            assert_eq!(tracker.current_usage(), AllocUnit::layout(64).size());
            tracker.free_context(ctx);
        }
    }

    #[test]
    fn batches_reservation_on_large_heaps() {
        let tracker = AllocTracker::new(64 * 1024 * 1024);
        let ctx = tracker.new_context();
        unsafe {
            assert!(!tracker.alloc(ctx, 64).is_null());
            assert_eq!(tracker.current_usage(), CONTEXT_PRERESERVE_SIZE);
            // the second allocation redeems the reservation
            assert!(!tracker.alloc(ctx, 64).is_null());
            assert_eq!(tracker.current_usage(), CONTEXT_PRERESERVE_SIZE);
            tracker.free_context(ctx);
        }
        // unredeemed reservation is returned with the context
        assert_eq!(tracker.current_usage(), 2 * AllocUnit::layout(64).size());
    }

    #[test]
    fn rejects_past_max_size() {
        let tracker = AllocTracker::new(4096);
        let ctx = tracker.new_context();
        unsafe {
            assert!(tracker.alloc(ctx, 8192).is_null());
            assert_eq!(tracker.current_usage(), 0);
            tracker.free_context(ctx);
        }
    }

    #[test]
    fn snapshot_splices_contexts_and_global_list() {
        let tracker = AllocTracker::new(8 * 1024 * 1024);
        let ctx_a = tracker.new_context();
        let ctx_b = tracker.new_context();
        unsafe {
            for _ in 0..3 {
                assert!(!tracker.alloc(ctx_a, 32).is_null());
            }
            let stray = tracker.alloc(ctx_b, 32);
            assert!(!stray.is_null());

            let mut snapshot = Snapshot::new();
            tracker.take_snapshot(&mut snapshot);
            assert_eq!(snapshot.count(), 4);

            // everything dies; usage drops back to the reservation slop
            let before = tracker.current_usage();
            tracker.filter_snapshot_and_delete(&mut snapshot, |_| false);
            assert!(snapshot.is_empty());
            assert_eq!(
                before - tracker.current_usage(),
                4 * AllocUnit::layout(32).size()
            );

            tracker.free_context(ctx_a);
            tracker.free_context(ctx_b);
        }
    }

    #[test]
    fn survivors_move_to_global_list_and_back_into_next_snapshot() {
        let tracker = AllocTracker::new(8 * 1024 * 1024);
        let ctx = tracker.new_context();
        unsafe {
            let keep = tracker.alloc(ctx, 32);
            let drop_ = tracker.alloc(ctx, 32);
            assert!(!keep.is_null() && !drop_.is_null());

            let mut snapshot = Snapshot::new();
            tracker.take_snapshot(&mut snapshot);
            tracker.filter_snapshot_and_delete(&mut snapshot, |unit| unit == keep);

            let mut second = Snapshot::new();
            tracker.take_snapshot(&mut second);
            assert_eq!(second.count(), 1);
            tracker.filter_snapshot_and_delete(&mut second, |_| false);
            tracker.free_context(ctx);
        }
    }
}

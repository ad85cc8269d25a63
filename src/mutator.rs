//! Mutator threads and the object access API.
//!
//! A mutator is thread-affine state registered with a heap: its root set,
//! its allocation context, its GC-lock token and its local remark buffer.
//! Every accessor brackets the heap touch in a shared GC-lock section, and
//! reference writes run the snapshot-at-the-beginning barrier.

use std::mem::size_of;
use std::ops::{Deref, DerefMut};
use std::ptr::{self, null_mut, NonNull};
use std::sync::Arc;

use log::info;

use crate::alloc_tracker::{AllocContext, AllocUnit};
use crate::descriptor::Descriptor;
use crate::error::GcError;
use crate::gc::{need_remark, GcState};
use crate::gc_lock::GcLockToken;
use crate::globals::HEAP_ALLOC_RETRY_COUNT;
use crate::heap::Heap;
use crate::remark::{LocalRemarkBuffer, RemarkChunk, RemarkQueue};

/// Rooted reference. While rooted in its mutator, the referenced object is
/// part of the live set anchored by the next root snapshot.
pub struct RootRef {
    unit: NonNull<AllocUnit>,
}

impl RootRef {
    fn new(unit: NonNull<AllocUnit>) -> Self {
        Self { unit }
    }

    pub(crate) fn as_unit(&self) -> *mut AllocUnit {
        self.unit.as_ptr()
    }

    /// Payload size of the referenced object.
    pub fn size(&self) -> usize {
        unsafe { (*self.unit.as_ptr()).size() }
    }

    /// True when both handles refer to the same heap object.
    pub fn is_alias(&self, other: &RootRef) -> bool {
        self.unit == other.unit
    }
}

pub struct Mutator {
    heap: Arc<Heap>,
    ctx: *mut AllocContext,
    token: GcLockToken,
    roots: Vec<*mut AllocUnit>,
    local_remarks: LocalRemarkBuffer,
}

impl Mutator {
    pub(crate) fn new(heap: Arc<Heap>, ctx: *mut AllocContext) -> Mutator {
        Mutator {
            heap,
            ctx,
            token: GcLockToken::new(),
            roots: Vec::new(),
            local_remarks: LocalRemarkBuffer::new(),
        }
    }

    pub fn heap(&self) -> &Arc<Heap> {
        &self.heap
    }

    fn gc(&self) -> &Arc<GcState> {
        self.heap.generation().gc()
    }

    /// Enters a shared GC-critical section. Reentrant per thread; pairs
    /// with [`Mutator::unblock_gc`].
    pub fn block_gc(&self) {
        self.gc().gc_lock.block_gc(&self.token);
    }

    pub fn unblock_gc(&self) {
        self.gc().gc_lock.unblock_gc(&self.token);
    }

    /// Allocates an object laid out by `desc` and roots it. The payload
    /// starts zeroed, so every reference slot reads as null. The object
    /// holds a reference to its descriptor until it is swept.
    pub fn alloc_object(&mut self, desc: &Arc<Descriptor>) -> Result<RootRef, GcError> {
        self.alloc_with_size(desc, desc.object_size())
    }

    /// Allocates an object with `ref_slots` trailing reference-array slots
    /// after the fixed part.
    pub fn alloc_object_with_trailing(
        &mut self,
        desc: &Arc<Descriptor>,
        ref_slots: usize,
    ) -> Result<RootRef, GcError> {
        debug_assert!(desc.has_trailing_ref_array());
        let size = desc.object_size() + ref_slots * size_of::<*mut AllocUnit>();
        self.alloc_with_size(desc, size)
    }

    fn alloc_with_size(&mut self, desc: &Arc<Descriptor>, size: usize) -> Result<RootRef, GcError> {
        for attempt in 0..=HEAP_ALLOC_RETRY_COUNT {
            self.block_gc();
            let unit = unsafe { self.heap.generation().alloc(self.ctx, size) };
            if !unit.is_null() {
                unsafe {
                    (*unit).publish_descriptor(desc);
                }
                self.roots.push(unit);
                self.unblock_gc();
                return Ok(RootRef::new(NonNull::new(unit).unwrap()));
            }
            self.unblock_gc();

            if attempt < HEAP_ALLOC_RETRY_COUNT {
                info!(
                    target: "gc",
                    "allocation of {} bytes failed, invoking GC (attempt #{})",
                    size,
                    attempt + 1
                );
                self.gc().start_cycle();
            }
        }
        Err(GcError::OutOfMemory { requested: size })
    }

    /// Adds another root entry for an already-rooted object.
    pub fn dup_ref(&mut self, reference: &RootRef) -> RootRef {
        self.block_gc();
        self.roots.push(reference.as_unit());
        self.unblock_gc();
        RootRef::new(reference.unit)
    }

    /// Releases one root entry. The object stays alive until the sweep
    /// following the moment it became unreachable.
    pub fn release_ref(&mut self, reference: RootRef) {
        self.block_gc();
        let unit = reference.as_unit();
        // Search backward: callers release recently rooted objects first.
        let pos = self
            .roots
            .iter()
            .rposition(|&root| root == unit)
            .expect("reference is not rooted in this mutator");
        self.roots.swap_remove(pos);
        self.unblock_gc();
    }

    /// Atomically reads the reference slot at `offset` and roots the
    /// target. Reads re-shade the containing object so a field forwarded
    /// across writes concurrent with this read stays in the marked set.
    pub fn read_ref(&mut self, object: &RootRef, offset: usize) -> Option<RootRef> {
        self.block_gc();
        let unit = object.as_unit();
        let child = unsafe { (*unit).read_ref_slot(offset) };
        need_remark(self, unit);
        let result = NonNull::new(child).map(|child| {
            self.roots.push(child.as_ptr());
            RootRef::new(child)
        });
        self.unblock_gc();
        result
    }

    /// Atomically overwrites the reference slot at `offset`. The previous
    /// referent is conservatively re-rooted while marking runs, preserving
    /// the heap graph seen at the root snapshot.
    pub fn write_ref(&mut self, object: &RootRef, offset: usize, value: Option<&RootRef>) {
        self.block_gc();
        let unit = object.as_unit();
        let new = value.map_or(null_mut(), |value| value.as_unit());
        let old = unsafe { (*unit).exchange_ref_slot(offset, new) };
        need_remark(self, old);
        self.unblock_gc();
    }

    /// Copies payload bytes out of the object.
    pub fn read_data(&self, object: &RootRef, offset: usize, out: &mut [u8]) {
        self.block_gc();
        unsafe {
            let unit = object.as_unit();
            debug_assert!(offset + out.len() <= (*unit).size());
            ptr::copy_nonoverlapping((*unit).payload().add(offset), out.as_mut_ptr(), out.len());
        }
        self.unblock_gc();
    }

    /// Copies payload bytes into the object.
    pub fn write_data(&self, object: &RootRef, offset: usize, data: &[u8]) {
        self.block_gc();
        unsafe {
            let unit = object.as_unit();
            debug_assert!(offset + data.len() <= (*unit).size());
            ptr::copy_nonoverlapping(data.as_ptr(), (*unit).payload().add(offset), data.len());
        }
        self.unblock_gc();
    }

    pub fn root_count(&self) -> usize {
        self.roots.len()
    }

    pub(crate) fn push_remark(&mut self, unit: *mut AllocUnit, shared: &RemarkQueue) {
        self.local_remarks.push(unit, shared);
    }

    /// GC side, under exclusive access during reconciliation.
    pub(crate) fn take_residual_remarks(&mut self) -> RemarkChunk {
        self.local_remarks.take_residual()
    }

    /// GC side, inside a stop-the-world window.
    pub(crate) fn roots(&self) -> &[*mut AllocUnit] {
        &self.roots
    }

    fn detach(&mut self) {
        // A detaching mutator may hold barrier output the collector has not
        // seen; hand it over before the registry entry disappears.
        let gc = self.gc().clone();
        self.block_gc();
        self.local_remarks.flush(&gc.remark_queue);
        self.unblock_gc();
    }
}

/// Owning handle for a mutator attached to a heap. Dropping it flushes the
/// barrier buffer, detaches the thread and frees its allocation context.
pub struct MutatorRef {
    mutator: NonNull<Mutator>,
}

unsafe impl Send for MutatorRef {}

impl MutatorRef {
    pub(crate) fn from_raw(mutator: *mut Mutator) -> MutatorRef {
        MutatorRef {
            mutator: NonNull::new(mutator).expect("null mutator"),
        }
    }
}

impl Deref for MutatorRef {
    type Target = Mutator;
    fn deref(&self) -> &Mutator {
        unsafe { self.mutator.as_ref() }
    }
}

impl DerefMut for MutatorRef {
    fn deref_mut(&mut self) -> &mut Mutator {
        unsafe { self.mutator.as_mut() }
    }
}

impl Drop for MutatorRef {
    fn drop(&mut self) {
        unsafe {
            let mutator = self.mutator.as_ptr();
            (*mutator).detach();
            let heap = (*mutator).heap.clone();
            heap.detach_thread(mutator);
            let ctx = (*mutator).ctx;
            heap.generation().tracker().free_context(ctx);
            drop(Box::from_raw(mutator));
        }
    }
}

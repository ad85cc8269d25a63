//! # Vela
//!
//! A mostly-concurrent mark-sweep garbage collector for implementing VMs
//! in Rust. Objects are raw payloads laid out by user-supplied
//! [descriptors](descriptor::Descriptor); mutator threads attach to a
//! [`Heap`], allocate rooted objects and mutate reference slots through
//! accessors that carry the write barrier.
//!
//! ## GC cycle
//!
//! A cycle opens with a short stop-the-world window that snapshots every
//! mutator's root set and detaches the allocation list, then marks
//! concurrently while mutators keep running. Reference overwrites during
//! marking push the old referent through a snapshot-at-the-beginning
//! barrier so the graph captured at the snapshot is conservatively traced.
//! After marking, the collector reconciles the barrier output, sweeps the
//! snapshot, and flips the meaning of the mark bit in a second short pause
//! so survivors need no clearing pass.
//!
//! ## When cycles run
//!
//! Hosts can request cycles directly, and a per-heap driver thread also
//! polls allocation statistics, triggering a cycle when usage nears the
//! cap, on a warm-up schedule for fresh heaps, or when the measured
//! allocation rate would exhaust the heap faster than a cycle completes.

pub mod alloc_tracker;
pub mod descriptor;
pub mod driver;
pub mod error;
pub mod gc;
pub mod gc_lock;
pub mod generation;
pub mod globals;
pub mod heap;
pub mod mark_queue;
pub mod moving_window;
pub mod mutator;
pub mod remark;
pub mod statistics;

#[cfg(test)]
mod tests;

pub use crate::descriptor::{Descriptor, FieldDescriptor, Finalizer, ReferenceStrength};
pub use crate::error::GcError;
pub use crate::generation::GenerationParams;
pub use crate::heap::Heap;
pub use crate::mutator::{Mutator, MutatorRef, RootRef};
pub use crate::statistics::GcStats;

//! Coordination lock between mutator threads and the GC thread.
//!
//! Mutators enter in shared mode around every heap access; many can hold
//! the lock at once. The GC thread enters exclusive mode for its two short
//! stop-the-world windows. Exclusive intent bars new blockers from the fast
//! path so the GC cannot be starved by a steady stream of mutators.

use std::cell::Cell;

use parking_lot::{Condvar, Mutex};

struct LockState {
    blockers: usize,
    exclusive: bool,
    exclusive_wanted: bool,
}

pub struct GcLock {
    state: Mutex<LockState>,
    /// Mutators park here while the GC holds or wants exclusive access.
    can_block: Condvar,
    /// The GC parks here until the last blocker leaves.
    drained: Condvar,
}

/// Per-thread reentrancy counter. Nested `block_gc` calls by the same
/// thread only touch the token, not the shared state.
pub struct GcLockToken {
    depth: Cell<u32>,
}

impl GcLockToken {
    pub fn new() -> Self {
        Self { depth: Cell::new(0) }
    }
}

impl Default for GcLockToken {
    fn default() -> Self {
        Self::new()
    }
}

impl GcLock {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(LockState {
                blockers: 0,
                exclusive: false,
                exclusive_wanted: false,
            }),
            can_block: Condvar::new(),
            drained: Condvar::new(),
        }
    }

    /// Declares the calling mutator is about to touch heap references.
    /// Returns without waiting unless the GC holds or wants exclusive
    /// access, in which case the caller parks until the GC exits.
    pub fn block_gc(&self, token: &GcLockToken) {
        let depth = token.depth.get();
        if depth > 0 {
            token.depth.set(depth + 1);
            return;
        }
        let mut state = self.state.lock();
        while state.exclusive || state.exclusive_wanted {
            self.can_block.wait(&mut state);
        }
        state.blockers += 1;
        token.depth.set(1);
    }

    pub fn unblock_gc(&self, token: &GcLockToken) {
        let depth = token.depth.get();
        debug_assert!(depth > 0, "unbalanced unblock_gc");
        if depth > 1 {
            token.depth.set(depth - 1);
            return;
        }
        token.depth.set(0);
        let mut state = self.state.lock();
        state.blockers -= 1;
        if state.blockers == 0 && state.exclusive_wanted {
            self.drained.notify_one();
        }
    }

    /// GC side. Publishes exclusive intent, waits for the blocker count to
    /// drain to zero, then holds the heap exclusively.
    pub fn enter_gc_exclusive(&self) {
        let mut state = self.state.lock();
        debug_assert!(!state.exclusive && !state.exclusive_wanted);
        state.exclusive_wanted = true;
        while state.blockers > 0 {
            self.drained.wait(&mut state);
        }
        state.exclusive_wanted = false;
        state.exclusive = true;
    }

    pub fn exit_gc_exclusive(&self) {
        let mut state = self.state.lock();
        debug_assert!(state.exclusive);
        state.exclusive = false;
        self.can_block.notify_all();
    }
}

impl Default for GcLock {
    fn default() -> Self {
        Self::new()
    }
}

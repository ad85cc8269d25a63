//! Barrier output plumbing between mutators and the collector.
//!
//! Each mutator records overwritten references into a small local buffer
//! and pushes the whole buffer into a shared bounded stream once it fills,
//! so the shared queue is touched once per `LOCAL_REMARK_BUFFER_SIZE`
//! barrier hits. The collector drains the stream chunk by chunk during
//! reconciliation and picks up each mutator's residual buffer under
//! exclusive access.

use std::ptr::null_mut;

use crate::alloc_tracker::AllocUnit;
use crate::globals::{LOCAL_REMARK_BUFFER_SIZE, MUTATOR_MARK_QUEUE_CHUNKS};

/// One flushed batch of a mutator's local remark buffer.
pub struct RemarkChunk {
    items: [*mut AllocUnit; LOCAL_REMARK_BUFFER_SIZE],
    len: usize,
}

unsafe impl Send for RemarkChunk {}

impl RemarkChunk {
    pub fn units(&self) -> &[*mut AllocUnit] {
        &self.items[..self.len]
    }
}

/// Shared MPSC stream of remark chunks.
pub struct RemarkQueue {
    tx: flume::Sender<RemarkChunk>,
    rx: flume::Receiver<RemarkChunk>,
}

impl RemarkQueue {
    pub fn new() -> Self {
        let (tx, rx) = flume::bounded(MUTATOR_MARK_QUEUE_CHUNKS);
        Self { tx, rx }
    }

    /// Mutator side. Blocks while the stream is full.
    pub fn push(&self, chunk: RemarkChunk) {
        self.tx.send(chunk).expect("remark queue disconnected");
    }

    /// Collector side. Returns `None` once the stream is drained.
    pub fn try_drain(&self) -> Option<RemarkChunk> {
        self.rx.try_recv().ok()
    }
}

impl Default for RemarkQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Mutator-local batch buffer for barrier output.
pub struct LocalRemarkBuffer {
    items: [*mut AllocUnit; LOCAL_REMARK_BUFFER_SIZE],
    used: usize,
}

impl LocalRemarkBuffer {
    pub fn new() -> Self {
        Self {
            items: [null_mut(); LOCAL_REMARK_BUFFER_SIZE],
            used: 0,
        }
    }

    /// Records a unit, flushing the whole buffer to the shared stream once
    /// it fills.
    pub fn push(&mut self, unit: *mut AllocUnit, shared: &RemarkQueue) {
        self.items[self.used] = unit;
        self.used += 1;
        if self.used == LOCAL_REMARK_BUFFER_SIZE {
            self.flush(shared);
        }
    }

    /// Sends whatever the buffer holds to the shared stream.
    pub fn flush(&mut self, shared: &RemarkQueue) {
        if self.used == 0 {
            return;
        }
        shared.push(RemarkChunk {
            items: self.items,
            len: self.used,
        });
        self.used = 0;
    }

    /// Collector side. Takes the unflushed residue; the owning mutator must
    /// be out of the barrier path (GC exclusive held).
    pub fn take_residual(&mut self) -> RemarkChunk {
        let chunk = RemarkChunk {
            items: self.items,
            len: self.used,
        };
        self.used = 0;
        chunk
    }
}

impl Default for LocalRemarkBuffer {
    fn default() -> Self {
        Self::new()
    }
}

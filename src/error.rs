use thiserror::Error;

/// Recoverable failures surfaced by the collector. Invariant violations
/// (queue overflow, list inconsistencies) abort with a diagnostic instead.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum GcError {
    #[error("out of memory: requested {requested} bytes")]
    OutOfMemory { requested: usize },

    #[error("timed out waiting for the GC cycle to complete")]
    CycleTimedOut,
}

//! Tuning knobs for the collector. All sizes are bytes unless noted.

/// How often the driver polls heap state.
pub const DRIVER_CHECK_RATE_HZ: u64 = 50;

/// Allocation-rate samples kept by the stat collector, one per driver tick.
pub const ALLOC_RATE_SAMPLES: usize = 50;

/// Cycle duration samples used for the published running average.
pub const CYCLE_TIME_SAMPLE_COUNT: usize = 10;

/// Pre-sweep usage samples feeding the driver's matching rule.
pub const TRIGGER_THRESHOLD_SAMPLES: usize = 10;

/// Entries the main mark queue can hold.
pub const MARK_QUEUE_CAPACITY: usize = 512 * 1024;

/// Entries the deferred mark queue can hold. Each entry is a partial-scan
/// continuation for one object, so this bounds how many objects can be
/// suspended mid-scan at once.
pub const DEFERRED_MARK_QUEUE_CAPACITY: usize = 128 * 1024;

/// Pointers in a mutator's local remark buffer before it flushes.
pub const LOCAL_REMARK_BUFFER_SIZE: usize = 64;

/// Flushed remark chunks the shared stream can hold before flushes block.
pub const MUTATOR_MARK_QUEUE_CHUNKS: usize = 2048;

/// Usage batch a context reserves from the global counter at a time.
pub const CONTEXT_PRERESERVE_SIZE: usize = 2 * 1024 * 1024;

/// Allocations at least this large skip pre-reservation and account exactly.
pub const CONTEXT_PRERESERVE_SKIP: usize = 256 * 1024;

/// Fraction of the heap above which the driver triggers unconditionally.
pub const SOFT_LIMIT_FRACTION: f64 = 0.95;

/// Safety margin applied to the average cycle time by the matching rule.
pub const PANIC_FACTOR: f64 = 1.70;

/// Number of warm-up cycles the driver schedules on a fresh heap.
pub const WARMUP_STEP_COUNT: u32 = 5;

/// Usage fraction between consecutive warm-up triggers.
pub const WARMUP_STEP_FRACTION: f64 = 0.10;

/// Synchronous cycles the allocation path attempts before reporting OOM.
pub const HEAP_ALLOC_RETRY_COUNT: usize = 5;

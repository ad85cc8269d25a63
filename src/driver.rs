//! The GC driver: a periodic policy loop deciding when to start cycles.
//!
//! Each tick runs three rules in order and stops at the first that fires:
//! an unconditional low-memory trigger near the usage cap, a warm-up
//! schedule that seeds the cycle-time samples on a fresh heap, and a
//! matching rule that compares the projected time to exhaustion against
//! the average cycle time.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use log::{debug, info};
use parking_lot::Mutex;

use crate::alloc_tracker::AllocTracker;
use crate::gc::GcState;
use crate::globals::{
    ALLOC_RATE_SAMPLES, DRIVER_CHECK_RATE_HZ, PANIC_FACTOR, SOFT_LIMIT_FRACTION,
    WARMUP_STEP_COUNT, WARMUP_STEP_FRACTION,
};
use crate::moving_window::MovingWindow;
use crate::statistics::human_bytes;

/// Samples the allocation counter once per tick and republishes a
/// bytes-per-second average over a moving window.
struct StatCollector {
    prev_allocated: usize,
    window: MovingWindow<usize>,
}

impl StatCollector {
    fn new(tracker: &AllocTracker) -> Self {
        Self {
            prev_allocated: tracker.lifetime_allocated(),
            window: MovingWindow::new(ALLOC_RATE_SAMPLES),
        }
    }

    fn sample(&mut self, tracker: &AllocTracker) -> f64 {
        let current = tracker.lifetime_allocated();
        let delta = current - self.prev_allocated;
        self.prev_allocated = current;
        self.window.append(delta);
        self.window.average() * DRIVER_CHECK_RATE_HZ as f64
    }
}

/// Warm-up rule state. The first crossings of 10%, 20%, .. 50% of the heap
/// each trigger one cycle so the cycle-time window has samples before the
/// matching rule takes over.
pub(crate) struct WarmupSchedule {
    steps_done: u32,
}

impl WarmupSchedule {
    pub(crate) fn new() -> Self {
        Self { steps_done: 0 }
    }

    pub(crate) fn should_trigger(&mut self, usage: usize, max_size: usize) -> bool {
        if self.steps_done >= WARMUP_STEP_COUNT {
            return false;
        }
        let threshold =
            ((self.steps_done + 1) as f64 * WARMUP_STEP_FRACTION * max_size as f64) as usize;
        if usage >= threshold {
            self.steps_done += 1;
            return true;
        }
        false
    }
}

/// Matching rule: trigger when the projected time to exhaust the usual
/// pre-sweep threshold is shorter than a padded average cycle time, or
/// shorter than one tick (the driver could not react next time).
pub(crate) fn should_trigger_by_rate(
    avg_threshold: f64,
    current_usage: usize,
    alloc_rate: f64,
    average_cycle_time: f64,
    tick_period: f64,
) -> bool {
    let bytes_to_oom = (avg_threshold - current_usage as f64).max(0.0);
    let seconds_to_oom = bytes_to_oom / (alloc_rate + 1.0);
    let adjusted_cycle_time = average_cycle_time * PANIC_FACTOR;
    seconds_to_oom < tick_period || seconds_to_oom < adjusted_cycle_time
}

struct DriverShared {
    paused: AtomicBool,
    quit_requested: AtomicBool,
}

/// Owns the driver thread. Starts paused; the host unpauses once mutators
/// are attached. Shutdown is cooperative and joins the thread.
pub struct Driver {
    shared: Arc<DriverShared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Driver {
    pub(crate) fn new(state: Arc<GcState>, tracker: Arc<AllocTracker>) -> Driver {
        let shared = Arc::new(DriverShared {
            paused: AtomicBool::new(true),
            quit_requested: AtomicBool::new(false),
        });
        let thread_shared = shared.clone();
        let handle = std::thread::Builder::new()
            .name("vela-gc-driver".into())
            .spawn(move || driver_thread(thread_shared, state, tracker))
            .expect("failed to spawn GC driver thread");
        Driver {
            shared,
            thread: Mutex::new(Some(handle)),
        }
    }

    pub fn unpause(&self) {
        self.shared.paused.store(false, Ordering::Relaxed);
    }

    pub fn pause(&self) {
        self.shared.paused.store(true, Ordering::Relaxed);
    }

    pub fn shutdown(&self) {
        self.unpause();
        self.shared.quit_requested.store(true, Ordering::Relaxed);
        let handle = self.thread.lock().take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }
}

impl Drop for Driver {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn driver_thread(shared: Arc<DriverShared>, state: Arc<GcState>, tracker: Arc<AllocTracker>) {
    info!(target: "gc-driver", "driver thread started");

    let period = Duration::from_nanos(1_000_000_000 / DRIVER_CHECK_RATE_HZ);
    let mut deadline = Instant::now() + period;
    let mut stats = StatCollector::new(&tracker);
    let mut warmup = WarmupSchedule::new();

    while !shared.quit_requested.load(Ordering::Relaxed) {
        if !shared.paused.load(Ordering::Relaxed) {
            poll_heap_state(&state, &tracker, &mut stats, &mut warmup);
        }

        let now = Instant::now();
        if deadline > now {
            std::thread::sleep(deadline - now);
        }
        deadline += period;
    }

    info!(target: "gc-driver", "requested to quit, quitting");
}

fn poll_heap_state(
    state: &GcState,
    tracker: &AllocTracker,
    stats: &mut StatCollector,
    warmup: &mut WarmupSchedule,
) {
    let alloc_rate = stats.sample(tracker);
    let usage = tracker.current_usage();
    let max_size = tracker.max_size();

    // Start a cycle before the mutators have to wait on one.
    let soft_limit = (max_size as f64 * SOFT_LIMIT_FRACTION) as usize;
    if usage > soft_limit {
        info!(
            target: "gc-driver",
            "soft limit reached at {} of {}, average allocation rate {}/s, starting cycle",
            human_bytes(usage),
            human_bytes(max_size),
            human_bytes(alloc_rate as usize)
        );
        state.start_cycle();
        return;
    }

    if warmup.should_trigger(usage, max_size) {
        debug!(
            target: "gc-driver",
            "warm-up trigger at {}",
            human_bytes(usage)
        );
        state.start_cycle();
        return;
    }

    let avg_threshold = match state.trigger_threshold_average() {
        Some(avg) => avg.min(max_size as f64),
        None => return,
    };
    let tick_period = 1.0 / DRIVER_CHECK_RATE_HZ as f64;
    if should_trigger_by_rate(
        avg_threshold,
        usage,
        alloc_rate,
        state.average_cycle_time(),
        tick_period,
    ) {
        debug!(
            target: "gc-driver",
            "allocation rate {}/s outpaces cycle time, starting cycle",
            human_bytes(alloc_rate as usize)
        );
        state.start_cycle();
    }
}

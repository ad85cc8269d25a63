//! The cycle engine.
//!
//! One GC cycle walks four phases:
//!
//! 1. A stop-the-world window that publishes the marking epoch, snapshots
//!    every mutator's root set and detaches the object list snapshot.
//! 2. Concurrent marking from the root snapshot, with a deferred queue of
//!    `(parent, field_index)` continuations for when the main ring fills.
//! 3. Reconciliation of the mutators' write-barrier output, so every
//!    reference overwritten during marking is traced as if it were a root
//!    (snapshot-at-the-beginning).
//! 4. A sweep of the snapshot that frees unmarked units, then a second
//!    stop-the-world window that flips the mark-bit polarity. Flipping the
//!    meaning of the bit reclassifies all survivors as unmarked for the
//!    next epoch without touching them.
//!
//! Objects allocated while a cycle runs stay on their context's local list,
//! are invisible to the open snapshot and survive by construction; if they
//! are garbage they fall to the next cycle.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::Instant;

use atomic::Atomic;
use log::{debug, info};
use parking_lot::{Condvar, Mutex};

use crate::alloc_tracker::{AllocTracker, AllocUnit, Snapshot};
use crate::error::GcError;
use crate::gc_lock::GcLock;
use crate::globals::{
    CYCLE_TIME_SAMPLE_COUNT, DEFERRED_MARK_QUEUE_CAPACITY, MARK_QUEUE_CAPACITY,
    TRIGGER_THRESHOLD_SAMPLES,
};
use crate::heap::Heap;
use crate::mark_queue::{overflow_bound_bytes, BoundedQueue, MarkState};
use crate::moving_window::MovingWindow;
use crate::mutator::Mutator;
use crate::remark::{RemarkChunk, RemarkQueue};
use crate::statistics::GcStats;

#[derive(Clone, Copy, PartialEq, Eq)]
enum GcRequest {
    Noop,
    StartCycle,
    Shutdown,
}

struct CycleStatus {
    cycle_id: u64,
    cycle_was_invoked: bool,
}

/// Per-generation collector state shared between mutators, the GC thread
/// and the driver.
pub struct GcState {
    heap: Weak<Heap>,
    pub(crate) gc_lock: GcLock,

    cycle_in_progress: AtomicBool,
    marking_in_progress: AtomicBool,
    /// Polarity the write barrier stamps with while a cycle runs. Published
    /// during the opening stop-the-world window.
    mutator_marked_bit: AtomicBool,
    /// Polarity the collector treats as live this epoch. Flipped in the
    /// closing stop-the-world window.
    gc_marked_bit: AtomicBool,

    cycle_status: Mutex<CycleStatus>,
    cycle_done: Condvar,

    request: Mutex<GcRequest>,
    request_cond: Condvar,

    stats: Mutex<GcStats>,
    pub(crate) remark_queue: RemarkQueue,

    pacing_micros: AtomicU32,
    average_cycle_time: Atomic<f64>,
    bytes_used_before_sweep: AtomicUsize,
    live_set_size: AtomicUsize,
    trigger_samples: Mutex<MovingWindow<usize>>,

    /// Fired by the GC thread right after marking opens; lets hosts observe
    /// the concurrent marking window.
    marking_started_hook: Mutex<Option<Box<dyn Fn() + Send>>>,

    thread: Mutex<Option<JoinHandle<()>>>,
}

impl GcState {
    pub(crate) fn new(heap: Weak<Heap>, tracker: Arc<AllocTracker>) -> Arc<GcState> {
        let bound = overflow_bound_bytes(MARK_QUEUE_CAPACITY, DEFERRED_MARK_QUEUE_CAPACITY);
        assert!(
            bound > tracker.max_size(),
            "mark queues ({} + {} entries) cannot cover a {} byte heap",
            MARK_QUEUE_CAPACITY,
            DEFERRED_MARK_QUEUE_CAPACITY,
            tracker.max_size()
        );

        let state = Arc::new(GcState {
            heap,
            gc_lock: GcLock::new(),
            cycle_in_progress: AtomicBool::new(false),
            marking_in_progress: AtomicBool::new(false),
            mutator_marked_bit: AtomicBool::new(false),
            gc_marked_bit: AtomicBool::new(false),
            cycle_status: Mutex::new(CycleStatus {
                cycle_id: 0,
                cycle_was_invoked: false,
            }),
            cycle_done: Condvar::new(),
            request: Mutex::new(GcRequest::Noop),
            request_cond: Condvar::new(),
            stats: Mutex::new(GcStats::default()),
            remark_queue: RemarkQueue::new(),
            pacing_micros: AtomicU32::new(0),
            average_cycle_time: Atomic::new(0.0),
            bytes_used_before_sweep: AtomicUsize::new(0),
            live_set_size: AtomicUsize::new(0),
            trigger_samples: Mutex::new(MovingWindow::new(TRIGGER_THRESHOLD_SAMPLES)),
            marking_started_hook: Mutex::new(None),
            thread: Mutex::new(None),
        });

        let thread_state = state.clone();
        let handle = std::thread::Builder::new()
            .name("vela-gc".into())
            .spawn(move || gc_thread(thread_state, tracker))
            .expect("failed to spawn GC thread");
        *state.thread.lock() = Some(handle);
        state
    }

    fn send_request(&self, request: GcRequest) {
        let mut slot = self.request.lock();
        *slot = request;
        self.request_cond.notify_one();
    }

    /// Requests a cycle without waiting for it. Concurrent requests between
    /// two completions coalesce into one cycle; every caller gets the same
    /// ticket to pass to [`GcState::wait_cycle`].
    pub fn start_cycle_async(&self) -> u64 {
        let mut status = self.cycle_status.lock();
        let last = status.cycle_id;
        if status.cycle_was_invoked {
            return last;
        }
        status.cycle_was_invoked = true;
        drop(status);

        self.send_request(GcRequest::StartCycle);
        last
    }

    /// Waits until the cycle identified by `cycle_id` has completed, or
    /// until `deadline` passes.
    pub fn wait_cycle(&self, cycle_id: u64, deadline: Option<Instant>) -> Result<(), GcError> {
        let mut status = self.cycle_status.lock();
        while status.cycle_id == cycle_id {
            match deadline {
                Some(deadline) => {
                    if self.cycle_done.wait_until(&mut status, deadline).timed_out() {
                        return Err(GcError::CycleTimedOut);
                    }
                }
                None => self.cycle_done.wait(&mut status),
            }
        }
        Ok(())
    }

    /// Runs one full cycle synchronously.
    pub fn start_cycle(&self) {
        let ticket = self.start_cycle_async();
        let _ = self.wait_cycle(ticket, None);
    }

    pub(crate) fn current_cycle_id(&self) -> u64 {
        self.cycle_status.lock().cycle_id
    }

    /// Stops the GC thread. The driver must already be down so nothing can
    /// request further cycles.
    pub fn perform_shutdown(&self) {
        let handle = self.thread.lock().take();
        if let Some(handle) = handle {
            self.send_request(GcRequest::Shutdown);
            let _ = handle.join();
        }
    }

    /// Stamps a freshly allocated unit: unmarked in the current epoch and
    /// owned by this generation. Called before the unit becomes reachable.
    pub fn on_allocate(&self, unit: *mut AllocUnit) {
        unsafe {
            (*unit)
                .mark_bit()
                .store(!self.mutator_marked_bit.load(Ordering::Relaxed), Ordering::Relaxed);
            (*unit).set_owner(self as *const GcState);
        }
    }

    /// Optional allocation throttle; sleeps when pacing is configured.
    pub fn on_preallocate(&self) {
        let micros = self.pacing_micros.load(Ordering::Relaxed);
        if micros == 0 {
            return;
        }
        std::thread::sleep(std::time::Duration::from_micros(micros as u64));
    }

    pub fn set_pacing(&self, micros: u32) {
        self.pacing_micros.store(micros, Ordering::Relaxed);
    }

    pub fn is_marking(&self) -> bool {
        self.marking_in_progress.load(Ordering::Acquire)
    }

    pub fn cycle_in_progress(&self) -> bool {
        self.cycle_in_progress.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> GcStats {
        *self.stats.lock()
    }

    /// Running average of recent cycle durations, in seconds.
    pub fn average_cycle_time(&self) -> f64 {
        self.average_cycle_time.load(Ordering::Relaxed)
    }

    pub fn live_set_size(&self) -> usize {
        self.live_set_size.load(Ordering::Relaxed)
    }

    pub fn bytes_used_before_sweep(&self) -> usize {
        self.bytes_used_before_sweep.load(Ordering::Relaxed)
    }

    /// Mean of the pre-sweep usage samples of recent cycles, or `None`
    /// before the first completed cycle.
    pub fn trigger_threshold_average(&self) -> Option<f64> {
        let samples = self.trigger_samples.lock();
        if samples.is_empty() {
            None
        } else {
            Some(samples.average())
        }
    }

    /// Installs a hook the GC thread fires right after marking opens.
    pub fn set_marking_started_hook(&self, hook: Option<Box<dyn Fn() + Send>>) {
        *self.marking_started_hook.lock() = hook;
    }
}

/// Write/read barrier slow path. If marking is in progress, conservatively
/// stamps the unit with the live polarity and, when the stamp changed it,
/// records the unit for reconciliation.
pub(crate) fn need_remark(mutator: &mut Mutator, unit: *mut AllocUnit) {
    if unit.is_null() {
        return;
    }
    let state = unsafe {
        let owner = (*unit).owner();
        debug_assert!(!owner.is_null(), "unit has no owning generation");
        &*owner
    };

    if !state.marking_in_progress.load(Ordering::Acquire) {
        return;
    }

    let gc_marked = state.gc_marked_bit.load(Ordering::Relaxed);
    let previous = unsafe { (*unit).mark_bit().swap(gc_marked, Ordering::Relaxed) };
    if previous == gc_marked {
        return;
    }
    mutator.push_remark(unit, &state.remark_queue);
}

fn gc_thread(state: Arc<GcState>, tracker: Arc<AllocTracker>) {
    info!(target: "gc", "GC thread started");

    let mut workspace = CycleWorkspace {
        mark_queue: BoundedQueue::new(MARK_QUEUE_CAPACITY),
        deferred_queue: BoundedQueue::new(DEFERRED_MARK_QUEUE_CAPACITY),
        root_snapshot: Vec::new(),
        cycle_times: MovingWindow::new(CYCLE_TIME_SAMPLE_COUNT),
    };

    loop {
        let request = {
            let mut slot = state.request.lock();
            loop {
                match *slot {
                    GcRequest::Noop => state.request_cond.wait(&mut slot),
                    other => {
                        *slot = GcRequest::Noop;
                        break other;
                    }
                }
            }
        };

        match request {
            GcRequest::Noop => unreachable!(),
            GcRequest::Shutdown => {
                info!(target: "gc", "shutting down GC thread");
                break;
            }
            GcRequest::StartCycle => run_cycle(&state, &tracker, &mut workspace),
        }
    }
}

/// Scratch owned by the GC thread across cycles. The root snapshot buffer
/// and the rings are reused to avoid per-cycle allocation churn.
struct CycleWorkspace {
    mark_queue: BoundedQueue<*mut AllocUnit>,
    deferred_queue: BoundedQueue<MarkState>,
    root_snapshot: Vec<*mut AllocUnit>,
    cycle_times: MovingWindow<f64>,
}

struct CycleState<'a> {
    state: &'a GcState,
    tracker: &'a AllocTracker,
    ws: &'a mut CycleWorkspace,
    stats: GcStats,
    pause_begin: Instant,
    snapshot: Snapshot,
}

fn run_cycle(state: &GcState, tracker: &AllocTracker, ws: &mut CycleWorkspace) {
    // Hold the heap alive for the whole cycle; when it is already being
    // torn down there are no mutators left to scan.
    let heap = state.heap.upgrade();

    let mut cycle = CycleState {
        state,
        tracker,
        ws,
        stats: GcStats::default(),
        pause_begin: Instant::now(),
        snapshot: Snapshot::new(),
    };

    {
        let mut stats = state.stats.lock();
        stats.cycles_started += 1;
        cycle.stats = *stats;
    }
    let live_size_before = cycle.stats.live_object_size;
    let cycle_begin = Instant::now();

    pause_mutators(&mut cycle);
    state
        .mutator_marked_bit
        .store(state.gc_marked_bit.load(Ordering::Relaxed), Ordering::Relaxed);
    state.cycle_in_progress.store(true, Ordering::Release);
    state.marking_in_progress.store(true, Ordering::Release);
    take_root_snapshot(&mut cycle, heap.as_deref());
    tracker.take_snapshot(&mut cycle.snapshot);
    unpause_mutators(&mut cycle);

    {
        let hook = state.marking_started_hook.lock();
        if let Some(hook) = hook.as_ref() {
            hook();
        }
    }

    marking_phase(&mut cycle);
    state.marking_in_progress.store(false, Ordering::Release);
    reconcile_mutator_marks(&mut cycle, heap.as_deref());
    let freed = sweep_phase(&mut cycle);

    pause_mutators(&mut cycle);
    state.gc_marked_bit.fetch_xor(true, Ordering::Relaxed);
    state.cycle_in_progress.store(false, Ordering::Release);
    unpause_mutators(&mut cycle);

    let duration = cycle_begin.elapsed();
    cycle.stats.total_cycle_time += duration;
    cycle.stats.cycles_completed += 1;

    let live_size_now = cycle.stats.live_object_size;
    *state.stats.lock() = cycle.stats;

    {
        let mut status = state.cycle_status.lock();
        status.cycle_id += 1;
        status.cycle_was_invoked = false;
        state.cycle_done.notify_all();
    }

    let usage = tracker.current_usage();
    state
        .bytes_used_before_sweep
        .store(usage + freed, Ordering::Relaxed);
    state
        .live_set_size
        .store(live_size_now - live_size_before, Ordering::Relaxed);
    state.trigger_samples.lock().append(usage + freed);

    ws.cycle_times.append(duration.as_secs_f64());
    state
        .average_cycle_time
        .store(ws.cycle_times.average(), Ordering::Relaxed);

    debug!(
        target: "gc",
        "cycle done in {:.3}ms, freed {} bytes, usage {}",
        duration.as_secs_f64() * 1000.0,
        freed,
        usage
    );
}

fn pause_mutators(cycle: &mut CycleState) {
    cycle.state.gc_lock.enter_gc_exclusive();
    cycle.pause_begin = Instant::now();
}

fn unpause_mutators(cycle: &mut CycleState) {
    let pause = cycle.pause_begin.elapsed();
    cycle.state.gc_lock.exit_gc_exclusive();
    cycle.stats.total_stw_time += pause;
}

/// Copies every attached mutator's root set into the reusable snapshot
/// buffer. Runs inside the opening stop-the-world window, so root sets
/// cannot change underneath.
fn take_root_snapshot(cycle: &mut CycleState, heap: Option<&Heap>) {
    cycle.ws.root_snapshot.clear();
    let heap = match heap {
        Some(heap) => heap,
        None => return,
    };
    let roots = &mut cycle.ws.root_snapshot;
    heap.iterate_mutators(|mutator| unsafe {
        roots.extend_from_slice((*mutator).roots());
    });
}

fn marking_phase(cycle: &mut CycleState) {
    for index in 0..cycle.ws.root_snapshot.len() {
        let root = cycle.ws.root_snapshot[index];
        mark_from(cycle, root);
    }
}

/// Traces one object graph rooted at `block` to exhaustion of both queues.
fn mark_from(cycle: &mut CycleState, block: *mut AllocUnit) {
    if block.is_null() {
        return;
    }
    cycle
        .ws
        .mark_queue
        .push(block)
        .unwrap_or_else(|_| panic!("mark queue full at root enqueue"));
    process_mark_queue(cycle);

    while let Some(resume) = cycle.ws.deferred_queue.pop() {
        scan_object(cycle, resume);
        process_mark_queue(cycle);
    }
}

fn process_mark_queue(cycle: &mut CycleState) {
    while let Some(block) = cycle.ws.mark_queue.pop() {
        scan_object(
            cycle,
            MarkState {
                block,
                field_index: 0,
            },
        );
    }
}

/// Marks one object and enqueues its children, starting at the recorded
/// field index when resuming a suspended scan.
fn scan_object(cycle: &mut CycleState, mark_state: MarkState) {
    let block = mark_state.block;
    let gc_marked = cycle.state.gc_marked_bit.load(Ordering::Relaxed);
    unsafe {
        let previous = (*block).mark_bit().swap(gc_marked, Ordering::Relaxed);
        // Already marked, and not a continuation of a suspended scan.
        if mark_state.field_index == 0 && previous == gc_marked {
            return;
        }

        let desc = (*block).descriptor();
        if desc.is_null() {
            return;
        }
        let desc = &*desc;

        let fields = desc.fields();
        let mut index = mark_state.field_index;
        while index < fields.len() {
            let child = (*block).read_ref_slot(fields[index].offset);
            if !enqueue_child(cycle, block, index, child) {
                return;
            }
            index += 1;
        }

        if !desc.has_trailing_ref_array() {
            return;
        }
        let slot_size = std::mem::size_of::<*mut AllocUnit>();
        let slots = ((*block).size() - desc.object_size()) / slot_size;
        let first_array_index = fields.len();
        for slot in (index - first_array_index)..slots {
            let offset = desc.object_size() + slot * slot_size;
            let child = (*block).read_ref_slot(offset);
            if !enqueue_child(cycle, block, first_array_index + slot, child) {
                return;
            }
        }
    }
}

/// Enqueues a child for marking. When the main queue is full the parent's
/// position is parked on the deferred queue and the scan stops; the caller
/// resumes it later exactly where it left off.
fn enqueue_child(
    cycle: &mut CycleState,
    parent: *mut AllocUnit,
    parent_index: usize,
    child: *mut AllocUnit,
) -> bool {
    if child.is_null() {
        return true;
    }
    if cycle.ws.mark_queue.push(child).is_ok() {
        return true;
    }
    let continuation = MarkState {
        block: parent,
        field_index: parent_index,
    };
    if cycle.ws.deferred_queue.push(continuation).is_err() {
        // Construction asserted the queues cover any live set the tracker
        // can hold, so getting here means a heap invariant broke.
        panic!(
            "deferred mark queue overflow: more than {} suspended scans",
            cycle.ws.deferred_queue.capacity()
        );
    }
    false
}

/// Traces everything the mutators' barriers caught while marking ran.
/// Stream chunks first, then each mutator's residual buffer under a short
/// exclusive window so no barrier push can race the drain.
fn reconcile_mutator_marks(cycle: &mut CycleState, heap: Option<&Heap>) {
    while let Some(chunk) = cycle.state.remark_queue.try_drain() {
        process_remark_chunk(cycle, &chunk);
    }

    let heap = match heap {
        Some(heap) => heap,
        None => return,
    };
    pause_mutators(cycle);
    let mut residuals = Vec::new();
    heap.iterate_mutators(|mutator| unsafe {
        residuals.push((*mutator).take_residual_remarks());
    });
    unpause_mutators(cycle);

    for chunk in &residuals {
        process_remark_chunk(cycle, chunk);
    }

    // A barrier hit that raced the first drain may have flushed a full
    // buffer into the stream right up until the exclusive window closed.
    while let Some(chunk) = cycle.state.remark_queue.try_drain() {
        process_remark_chunk(cycle, &chunk);
    }
}

fn process_remark_chunk(cycle: &mut CycleState, chunk: &RemarkChunk) {
    let gc_marked = cycle.state.gc_marked_bit.load(Ordering::Relaxed);
    for &unit in chunk.units() {
        unsafe {
            // The barrier stamped the unit with the live polarity to
            // deduplicate its pushes; reset it so the scan below actually
            // walks the object's fields.
            (*unit).mark_bit().store(!gc_marked, Ordering::Relaxed);
        }
        mark_from(cycle, unit);
    }
}

/// Frees every unmarked unit in the snapshot and returns the swept payload
/// bytes. Survivors end up on the tracker's global list.
fn sweep_phase(cycle: &mut CycleState) -> usize {
    let gc_marked = cycle.state.gc_marked_bit.load(Ordering::Relaxed);

    let mut count = 0u64;
    let mut total_size = 0usize;
    let mut swept = 0u64;
    let mut swept_size = 0usize;
    let mut live = 0u64;
    let mut live_size = 0usize;

    let tracker = cycle.tracker;
    unsafe {
        tracker.filter_snapshot_and_delete(&mut cycle.snapshot, |block| {
            let size = unsafe { (*block).size() };
            count += 1;
            total_size += size;
            let marked = unsafe { (*block).mark_bit().load(Ordering::Relaxed) };
            if marked == gc_marked {
                live += 1;
                live_size += size;
                return true;
            }
            swept += 1;
            swept_size += size;
            false
        });
    }

    cycle.stats.total_object_count += count;
    cycle.stats.total_object_size += total_size;
    cycle.stats.swept_object_count += swept;
    cycle.stats.swept_object_size += swept_size;
    cycle.stats.live_object_count += live;
    cycle.stats.live_object_size += live_size;

    swept_size
}

use std::mem::size_of;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::time::{Duration, Instant};

use crate::alloc_tracker::AllocUnit;
use crate::descriptor::{Descriptor, FieldDescriptor};
use crate::error::GcError;
use crate::generation::GenerationParams;
use crate::heap::Heap;

const MIB: usize = 1024 * 1024;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn heap_with(max_size: usize) -> Arc<Heap> {
    init_logging();
    Heap::new(GenerationParams { max_size })
}

/// Payload of `size` bytes whose first slot is a reference field.
fn linked_descriptor(size: usize) -> Arc<Descriptor> {
    Arc::new(Descriptor::new(size, vec![FieldDescriptor::strong(0)]))
}

fn leaf_descriptor(size: usize) -> Arc<Descriptor> {
    Arc::new(Descriptor::new(size, vec![]))
}

#[test]
fn unrooted_objects_are_swept() {
    let heap = heap_with(MIB);
    let mut mutator = heap.attach_thread();
    let desc = linked_descriptor(64);

    let a = mutator.alloc_object(&desc).unwrap();
    let b = mutator.alloc_object(&desc).unwrap();
    mutator.write_ref(&a, 0, Some(&b));
    mutator.release_ref(b);
    mutator.release_ref(a);

    let unit_total = AllocUnit::layout(64).size();
    assert_eq!(heap.generation().tracker().current_usage(), 2 * unit_total);

    heap.generation().gc().start_cycle();

    let stats = heap.stats();
    assert_eq!(stats.swept_object_count, 2);
    assert_eq!(stats.swept_object_size, 2 * 64);
    assert_eq!(stats.live_object_count, 0);
    assert_eq!(heap.generation().tracker().current_usage(), 0);
}

#[test]
fn rooted_object_survives_repeated_cycles() {
    let heap = heap_with(MIB);
    let mut mutator = heap.attach_thread();
    let desc = leaf_descriptor(64);

    let obj = mutator.alloc_object(&desc).unwrap();
    mutator.write_data(&obj, 0, &[0xAB; 16]);

    for _ in 0..4 {
        heap.generation().gc().start_cycle();
    }

    // counted live once per snapshot it appeared in, never swept
    let stats = heap.stats();
    assert_eq!(stats.live_object_count, 4);
    assert_eq!(stats.swept_object_count, 0);

    let mut buf = [0u8; 16];
    mutator.read_data(&obj, 0, &mut buf);
    assert_eq!(buf, [0xAB; 16]);
    mutator.release_ref(obj);
}

#[test]
fn write_barrier_saves_overwritten_child() {
    let heap = heap_with(MIB);
    let mut mutator = heap.attach_thread();
    let desc = linked_descriptor(64);

    let r = mutator.alloc_object(&desc).unwrap();
    let c = mutator.alloc_object(&desc).unwrap();
    let d = mutator.alloc_object(&desc).unwrap();
    mutator.write_ref(&r, 0, Some(&c));
    mutator.release_ref(c);

    let gc = heap.generation().gc().clone();
    let (entered_tx, entered_rx) = mpsc::channel();
    let (resume_tx, resume_rx) = mpsc::channel::<()>();
    gc.set_marking_started_hook(Some(Box::new(move || {
        entered_tx.send(()).unwrap();
        resume_rx.recv().unwrap();
    })));

    let ticket = gc.start_cycle_async();
    entered_rx.recv().unwrap();
    assert!(gc.is_marking());

    // Overwrite the only reference to the snapshot-reachable child while
    // marking is in progress; the barrier must keep it alive.
    mutator.write_ref(&r, 0, Some(&d));

    resume_tx.send(()).unwrap();
    gc.wait_cycle(ticket, None).unwrap();
    gc.set_marking_started_hook(None);

    let stats = heap.stats();
    assert_eq!(stats.live_object_count, 3);
    assert_eq!(stats.swept_object_count, 0);

    mutator.release_ref(d);
    mutator.release_ref(r);
}

#[test]
fn allocation_failure_retries_with_gc() {
    let heap = heap_with(MIB);
    let mut mutator = heap.attach_thread();

    let small = leaf_descriptor(64 * 1024);
    for _ in 0..15 {
        let obj = mutator.alloc_object(&small).unwrap();
        mutator.release_ref(obj);
    }
    assert!(heap.generation().tracker().current_usage() > 15 * 64 * 1024);

    // Does not fit until a cycle reclaims the dead objects.
    let big = leaf_descriptor(256 * 1024);
    let obj = mutator
        .alloc_object(&big)
        .expect("retry loop reclaims memory");

    let stats = heap.stats();
    assert!(stats.cycles_completed >= 1);
    assert_eq!(stats.swept_object_count, 15);
    mutator.release_ref(obj);
}

#[test]
fn exhausted_heap_reports_oom() {
    let heap = heap_with(MIB);
    let mut mutator = heap.attach_thread();
    let desc = leaf_descriptor(512 * 1024);

    let held = mutator.alloc_object(&desc).unwrap();
    let result = mutator.alloc_object(&desc);
    assert!(matches!(result, Err(GcError::OutOfMemory { .. })));
    mutator.release_ref(held);
}

#[test]
fn concurrent_cycle_requests_coalesce() {
    let heap = heap_with(MIB);
    let _mutator = heap.attach_thread();
    let gc = heap.generation().gc().clone();

    let (entered_tx, entered_rx) = mpsc::channel();
    let (resume_tx, resume_rx) = mpsc::channel::<()>();
    gc.set_marking_started_hook(Some(Box::new(move || {
        entered_tx.send(()).unwrap();
        resume_rx.recv().unwrap();
    })));

    let first = gc.start_cycle_async();
    entered_rx.recv().unwrap();

    let thread_gc = gc.clone();
    let second = std::thread::spawn(move || thread_gc.start_cycle_async())
        .join()
        .unwrap();
    assert_eq!(first, second);

    resume_tx.send(()).unwrap();
    gc.wait_cycle(first, None).unwrap();
    gc.set_marking_started_hook(None);
    assert_eq!(heap.stats().cycles_completed, 1);

    // the next request is a fresh cycle with a fresh ticket
    let third = gc.start_cycle_async();
    assert_ne!(third, first);
    gc.wait_cycle(third, None).unwrap();
    assert_eq!(heap.stats().cycles_completed, 2);
}

#[test]
fn wait_cycle_times_out_without_a_cycle() {
    let heap = heap_with(MIB);
    let gc = heap.generation().gc();

    let current = gc.current_cycle_id();
    let deadline = Instant::now() + Duration::from_millis(50);
    assert_eq!(
        gc.wait_cycle(current, Some(deadline)),
        Err(GcError::CycleTimedOut)
    );
}

#[test]
fn read_ref_roots_the_target() {
    let heap = heap_with(MIB);
    let mut mutator = heap.attach_thread();
    let desc = linked_descriptor(64);

    let parent = mutator.alloc_object(&desc).unwrap();
    let child = mutator.alloc_object(&desc).unwrap();
    mutator.write_ref(&parent, 0, Some(&child));
    mutator.release_ref(child);

    let reread = mutator.read_ref(&parent, 0).expect("slot holds the child");
    mutator.release_ref(parent);

    heap.generation().gc().start_cycle();

    let stats = heap.stats();
    assert_eq!(stats.live_object_count, 1);
    assert_eq!(stats.swept_object_count, 1);

    let mut buf = [0u8; 8];
    mutator.read_data(&reread, 0, &mut buf);
    mutator.release_ref(reread);
}

#[test]
fn read_barrier_reshades_the_container_while_marking() {
    let heap = heap_with(MIB);
    let mut mutator = heap.attach_thread();
    let desc = linked_descriptor(64);

    let r = mutator.alloc_object(&desc).unwrap();
    let c = mutator.alloc_object(&desc).unwrap();
    mutator.write_ref(&r, 0, Some(&c));
    mutator.release_ref(c);

    let gc = heap.generation().gc().clone();
    let (entered_tx, entered_rx) = mpsc::channel();
    let (resume_tx, resume_rx) = mpsc::channel::<()>();
    gc.set_marking_started_hook(Some(Box::new(move || {
        entered_tx.send(()).unwrap();
        resume_rx.recv().unwrap();
    })));

    let ticket = gc.start_cycle_async();
    entered_rx.recv().unwrap();
    assert!(gc.is_marking());

    // The first cycle of a fresh heap marks with the `false` polarity and
    // stamps allocations `true`, so the read-side re-shade is observable
    // on the mark bits directly.
    let reread = mutator.read_ref(&r, 0).expect("slot holds the child");
    unsafe {
        // the container was stamped with the live polarity by the read
        assert!(!(*r.as_unit()).mark_bit().load(Ordering::Relaxed));
        // the target is left untouched for the container's re-trace
        assert!((*reread.as_unit()).mark_bit().load(Ordering::Relaxed));
    }
    mutator.release_ref(reread);

    resume_tx.send(()).unwrap();
    gc.wait_cycle(ticket, None).unwrap();
    gc.set_marking_started_hook(None);

    // The marker skips the pre-stamped container, so the child was only
    // reachable through the re-trace the read barrier queued. The child's
    // read-side root was taken after the root snapshot and then released,
    // so it cannot be what kept either object alive.
    let stats = heap.stats();
    assert_eq!(stats.live_object_count, 2);
    assert_eq!(stats.swept_object_count, 0);

    mutator.release_ref(r);
}

#[test]
fn dup_ref_keeps_object_rooted() {
    let heap = heap_with(MIB);
    let mut mutator = heap.attach_thread();
    let desc = leaf_descriptor(64);

    let obj = mutator.alloc_object(&desc).unwrap();
    let extra = mutator.dup_ref(&obj);
    mutator.release_ref(obj);

    heap.generation().gc().start_cycle();
    assert_eq!(heap.stats().live_object_count, 1);

    mutator.release_ref(extra);
    heap.generation().gc().start_cycle();
    heap.generation().gc().start_cycle();
    assert_eq!(heap.stats().swept_object_count, 1);
}

#[test]
fn trailing_reference_array_is_traced() {
    let heap = heap_with(MIB);
    let mut mutator = heap.attach_thread();
    let array_desc = Arc::new(Descriptor::new(16, vec![]).with_trailing_ref_array());
    let leaf = leaf_descriptor(32);

    let array = mutator.alloc_object_with_trailing(&array_desc, 4).unwrap();
    for slot in 0..4 {
        let element = mutator.alloc_object(&leaf).unwrap();
        let offset = 16 + slot * size_of::<*mut AllocUnit>();
        mutator.write_ref(&array, offset, Some(&element));
        mutator.release_ref(element);
    }

    heap.generation().gc().start_cycle();

    let stats = heap.stats();
    assert_eq!(stats.live_object_count, 5);
    assert_eq!(stats.swept_object_count, 0);
    mutator.release_ref(array);
}

static FINALIZED: AtomicUsize = AtomicUsize::new(0);

fn counting_finalizer(_payload: *mut u8) {
    FINALIZED.fetch_add(1, Ordering::SeqCst);
}

#[test]
fn finalizers_run_when_objects_are_swept() {
    let heap = heap_with(MIB);
    let mut mutator = heap.attach_thread();
    let desc = Arc::new(Descriptor::new(64, vec![]).with_finalizer(counting_finalizer));

    let obj = mutator.alloc_object(&desc).unwrap();
    mutator.release_ref(obj);
    heap.generation().gc().start_cycle();

    assert_eq!(FINALIZED.load(Ordering::SeqCst), 1);
}

#[test]
fn concurrent_mutators_survive_cycles() {
    let heap = heap_with(8 * MIB);
    let desc = linked_descriptor(64);

    let mut workers = Vec::new();
    for _ in 0..4 {
        let heap = heap.clone();
        let desc = desc.clone();
        workers.push(std::thread::spawn(move || {
            let mut mutator = heap.attach_thread();
            for _ in 0..1000 {
                let a = mutator.alloc_object(&desc).unwrap();
                let b = mutator.alloc_object(&desc).unwrap();
                mutator.write_ref(&a, 0, Some(&b));
                mutator.release_ref(b);
                mutator.release_ref(a);
            }
        }));
    }

    for _ in 0..5 {
        heap.generation().gc().start_cycle();
    }
    for worker in workers {
        worker.join().unwrap();
    }

    // Two cycles drain the floating garbage left by the last one: units
    // allocated after a cycle's snapshot carry the next epoch's live
    // polarity and fall only at the cycle after that.
    heap.generation().gc().start_cycle();
    heap.generation().gc().start_cycle();
    assert_eq!(heap.generation().tracker().current_usage(), 0);
}

#[test]
fn driver_warms_up_a_growing_heap() {
    let heap = heap_with(4 * MIB);
    let mut mutator = heap.attach_thread();
    heap.unpause_driver();

    let desc = leaf_descriptor(4096);
    let mut held = Vec::new();
    for _ in 0..160 {
        held.push(mutator.alloc_object(&desc).unwrap());
    }

    // past 10% of the heap, the warm-up rule fires on an upcoming tick
    let deadline = Instant::now() + Duration::from_secs(5);
    while heap.stats().cycles_completed == 0 && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(10));
    }
    assert!(heap.stats().cycles_completed >= 1);

    for obj in held {
        mutator.release_ref(obj);
    }
}

use std::sync::Arc;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use vela::{Descriptor, FieldDescriptor, GenerationParams, Heap};

pub fn bench_alloc_and_collect(c: &mut Criterion) {
    let mut group = c.benchmark_group("linked chains");
    group.sample_size(20);

    for chain_len in [1024usize, 4096, 16384] {
        group.bench_function(BenchmarkId::new("alloc_sweep", chain_len), |b| {
            b.iter_batched_ref(
                || {
                    Heap::new(GenerationParams {
                        max_size: 64 * 1024 * 1024,
                    })
                },
                |heap| {
                    let mut mutator = heap.attach_thread();
                    let desc = Arc::new(Descriptor::new(64, vec![FieldDescriptor::strong(0)]));

                    let mut prev = mutator.alloc_object(&desc).unwrap();
                    for _ in 0..chain_len {
                        let next = mutator.alloc_object(&desc).unwrap();
                        mutator.write_ref(&next, 0, Some(&prev));
                        mutator.release_ref(prev);
                        prev = next;
                    }
                    mutator.release_ref(prev);
                    heap.generation().gc().start_cycle();
                },
                criterion::BatchSize::LargeInput,
            );
        });
    }
    group.finish();
}

criterion_group!(benches, bench_alloc_and_collect);
criterion_main!(benches);

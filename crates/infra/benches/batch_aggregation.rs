use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};

use std::sync::Arc;

use pixelflow_core::{AggregateRoot, AssetRef, ManualClock, SequentialIds, UserId};
use pixelflow_infra::{BatchAggregator, InMemoryJobStore, JobStore};
use pixelflow_jobs::{BatchItem, BatchJob, ChildOutcome, Job, NewBatch, PartialFailurePolicy, create_batch};

fn seeded(size: usize) -> (Arc<InMemoryJobStore>, BatchJob, Vec<Job>) {
    let store = InMemoryJobStore::arc();
    let (batch, children) = create_batch(
        NewBatch {
            user_id: UserId::new(),
            items: (0..size)
                .map(|i| BatchItem {
                    prompt: None,
                    temp_asset_ref: AssetRef::new(format!("tmp/{i}.jpg")),
                })
                .collect(),
            policy: PartialFailurePolicy::default(),
        },
        &ManualClock::epoch(),
        &SequentialIds::new(),
    )
    .unwrap();
    store.insert_batch(batch.clone(), children.clone()).unwrap();
    (store, batch, children)
}

fn bench_sequential_increments(c: &mut Criterion) {
    let mut group = c.benchmark_group("batch_increment_sequential");

    for size in [10usize, 100].iter() {
        group.throughput(Throughput::Elements(*size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            b.iter_batched(
                || seeded(size),
                |(store, batch, children)| {
                    let aggregator = BatchAggregator::new(store, Arc::new(ManualClock::epoch()), 3);
                    for child in &children {
                        black_box(
                            aggregator
                                .increment_batch_progress(*batch.id(), *child.id(), ChildOutcome::Succeeded)
                                .unwrap(),
                        );
                    }
                },
                criterion::BatchSize::SmallInput,
            );
        });
    }

    group.finish();
}

fn bench_contended_increments(c: &mut Criterion) {
    let mut group = c.benchmark_group("batch_increment_contended");
    group.sample_size(20);

    let size = 64usize;
    group.throughput(Throughput::Elements(size as u64));
    group.bench_function("threads_64", |b| {
        b.iter_batched(
            || seeded(size),
            |(store, batch, children)| {
                let aggregator = BatchAggregator::new(store, Arc::new(ManualClock::epoch()), size as u32);
                std::thread::scope(|scope| {
                    for child in &children {
                        let aggregator = &aggregator;
                        let batch_id = *batch.id();
                        scope.spawn(move || {
                            aggregator
                                .increment_batch_progress(batch_id, *child.id(), ChildOutcome::Succeeded)
                                .unwrap()
                        });
                    }
                });
            },
            criterion::BatchSize::SmallInput,
        );
    });

    group.finish();
}

criterion_group!(benches, bench_sequential_increments, bench_contended_increments);
criterion_main!(benches);

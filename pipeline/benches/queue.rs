//! Priority queue benchmarks
//!
//! Measures enqueue/pop cost, including the drop path when a queue is full.

use chrono::Utc;
use criterion::{BatchSize, Criterion, Throughput, criterion_group, criterion_main};
use tulva_pipeline::QueueCapacities;
use tulva_pipeline::queue::PriorityQueues;
use tulva_pipeline::{DataPoint, DataType, Priority};

fn make_point(i: usize, priority: Priority) -> DataPoint {
    DataPoint::new("bench", DataType::News, priority, Utc::now()).with_field("seq", i as i64)
}

fn make_points(count: usize) -> Vec<DataPoint> {
    (0..count)
        .map(|i| make_point(i, Priority::ALL[i % Priority::ALL.len()]))
        .collect()
}

fn bench_enqueue(c: &mut Criterion) {
    let mut group = c.benchmark_group("queue_enqueue");

    for count in [10, 100, 1_000] {
        group.throughput(Throughput::Elements(count as u64));
        group.bench_function(format!("mixed_{count}"), |b| {
            b.iter_batched(
                || (PriorityQueues::new(QueueCapacities::uniform(100_000)), make_points(count)),
                |(queues, points)| {
                    for point in points {
                        queues.enqueue(point);
                    }
                    queues
                },
                BatchSize::SmallInput,
            )
        });
    }

    group.finish();
}

fn bench_enqueue_full(c: &mut Criterion) {
    let mut group = c.benchmark_group("queue_enqueue_full");
    group.throughput(Throughput::Elements(1_000));

    group.bench_function("drop_1000", |b| {
        let queues = PriorityQueues::new(QueueCapacities::uniform(1));
        queues.enqueue(make_point(0, Priority::Low));

        b.iter_batched(
            || (0..1_000).map(|i| make_point(i, Priority::Low)).collect::<Vec<_>>(),
            |points| {
                for point in points {
                    queues.enqueue(point);
                }
            },
            BatchSize::SmallInput,
        )
    });

    group.finish();
}

fn bench_push_pop_cycle(c: &mut Criterion) {
    let mut group = c.benchmark_group("queue_cycle");
    group.throughput(Throughput::Elements(1_000));

    group.bench_function("push_100_pop_100_x10", |b| {
        let queues = PriorityQueues::new(QueueCapacities::default());
        let queue = queues.queue(Priority::High);

        b.iter(|| {
            for _ in 0..10 {
                for i in 0..100 {
                    queue.push(make_point(i, Priority::High));
                }
                while queue.try_pop().is_some() {}
            }
        })
    });

    group.finish();
}

criterion_group!(benches, bench_enqueue, bench_enqueue_full, bench_push_pop_cycle);
criterion_main!(benches);

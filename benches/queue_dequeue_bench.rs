use codegraph_substrate::queue::{PartitionStrategy, QueueManager, TaskPayload};
use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};
use serde_json::Value as Json;

fn fill_queue(partitions: usize, tasks: usize) -> QueueManager {
    let qm = QueueManager::new(partitions, PartitionStrategy::Priority, tasks * 2, tasks * 2);
    for i in 0..tasks {
        let priority = (i % 11) as u8;
        qm.enqueue(TaskPayload::new("parse", priority, Json::Null), None).unwrap();
    }
    qm
}

fn dequeue_by_priority_benchmark(c: &mut Criterion) {
    c.bench_function("dequeue_by_priority_100_of_10k", |b| {
        b.iter_batched(|| fill_queue(8, 10_000), |qm| black_box(qm.dequeue_by_priority(100)), BatchSize::LargeInput);
    });
}

fn enqueue_benchmark(c: &mut Criterion) {
    c.bench_function("enqueue_single_task", |b| {
        let qm = QueueManager::new(8, PartitionStrategy::Hash, 1_000_000, 900_000);
        b.iter(|| qm.enqueue(TaskPayload::new("parse", 5, Json::Null), None).unwrap());
    });
}

criterion_group!(benches, dequeue_by_priority_benchmark, enqueue_benchmark);
criterion_main!(benches);

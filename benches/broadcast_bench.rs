use criterion::{black_box, criterion_group, criterion_main, Criterion};
use nserf::broadcast::BroadcastQueue;

fn fill(queue: &BroadcastQueue, n: usize) {
    for i in 0..n {
        queue.queue_broadcast(vec![0u8; 128], Some(format!("node-{i}")), 4);
    }
}

fn bench_broadcast(c: &mut Criterion) {
    c.bench_function("queue_broadcast/1000_distinct_keys", |b| {
        b.iter(|| {
            let queue = BroadcastQueue::new();
            fill(&queue, 1000);
            black_box(&queue);
        })
    });

    c.bench_function("get_broadcasts/select_from_1000", |b| {
        let queue = BroadcastQueue::new();
        fill(&queue, 1000);
        b.iter(|| black_box(queue.get_broadcasts(overhead(), 512)))
    });

    c.bench_function("invalidate/repeated_same_key", |b| {
        let queue = BroadcastQueue::new();
        b.iter(|| {
            queue.queue_broadcast(vec![0u8; 128], Some("flapping-node".into()), 4);
            queue.invalidate("flapping-node");
        })
    });
}

fn overhead() -> usize {
    16
}

criterion_group!(benches, bench_broadcast);
criterion_main!(benches);

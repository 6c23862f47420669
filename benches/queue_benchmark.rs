use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use std::num::NonZeroUsize;
use std::sync::Arc;

use snap_sync::Queue;

/// Benchmark: uncontended offer/take on each strategy (fast path)
/// 基准测试：各策略下无竞争的 offer/take（快速路径）
fn bench_queue_offer_take_fast_path(c: &mut Criterion) {
    let mut group = c.benchmark_group("queue_offer_take_fast_path");
    let cap = NonZeroUsize::new(64).unwrap();

    let queues: Vec<(&str, Queue<u64>)> = vec![
        ("unbounded", Queue::unbounded()),
        ("bounded", Queue::bounded(cap)),
        ("sliding", Queue::sliding(cap)),
        ("dropping", Queue::dropping(cap)),
    ];

    for (name, queue) in queues {
        group.bench_with_input(BenchmarkId::from_parameter(name), &queue, |b, queue| {
            b.iter(|| {
                assert!(queue.try_offer(1).is_ok());
                assert_eq!(queue.try_take(), Some(1));
            });
        });
    }

    group.finish();
}

/// Benchmark: batch offer then drain
/// 基准测试：批量 offer 后排空
fn bench_queue_batch_offer(c: &mut Criterion) {
    let mut group = c.benchmark_group("queue_batch_offer");

    for batch in [16usize, 256] {
        group.bench_with_input(BenchmarkId::from_parameter(batch), &batch, |b, &batch| {
            let queue: Queue<usize> = Queue::unbounded();
            b.iter(|| {
                assert!(queue.try_offer_all(0..batch).is_ok());
                assert_eq!(queue.take_all().len(), batch);
            });
        });
    }

    group.finish();
}

/// Benchmark: bounded pipeline comparison (snap-sync Queue vs tokio mpsc)
/// 基准测试：有界流水线对比（snap-sync Queue vs tokio mpsc）
fn bench_queue_pipeline_comparison(c: &mut Criterion) {
    let mut group = c.benchmark_group("queue_pipeline_comparison");
    const N: u64 = 1_000;
    const CAP: usize = 16;

    group.bench_function("snap_sync_bounded", |b| {
        let runtime = tokio::runtime::Runtime::new().unwrap();

        b.to_async(&runtime).iter(|| async {
            let queue = Arc::new(Queue::bounded(NonZeroUsize::new(CAP).unwrap()));
            let producer = {
                let queue = queue.clone();
                tokio::spawn(async move {
                    for i in 0..N {
                        queue.offer(i).await;
                    }
                })
            };

            let mut sum = 0;
            for _ in 0..N {
                sum += queue.take().await;
            }
            producer.await.unwrap();
            assert_eq!(sum, N * (N - 1) / 2);
        });
    });

    group.bench_function("tokio_mpsc_bounded", |b| {
        let runtime = tokio::runtime::Runtime::new().unwrap();

        b.to_async(&runtime).iter(|| async {
            let (tx, mut rx) = tokio::sync::mpsc::channel::<u64>(CAP);
            let producer = tokio::spawn(async move {
                for i in 0..N {
                    tx.send(i).await.unwrap();
                }
            });

            let mut sum = 0;
            for _ in 0..N {
                sum += rx.recv().await.unwrap();
            }
            producer.await.unwrap();
            assert_eq!(sum, N * (N - 1) / 2);
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_queue_offer_take_fast_path,
    bench_queue_batch_offer,
    bench_queue_pipeline_comparison
);
criterion_main!(benches);

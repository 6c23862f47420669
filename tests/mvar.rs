//! MVar integration tests: conservation, ordering and cancellation under
//! real concurrency.
//!
//! MVar 集成测试：真实并发下的守恒性、顺序性与取消。

#![cfg(not(feature = "loom"))]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::task::Poll;
use std::time::Duration;

use snap_sync::MVar;

/// Multiset of taken values equals the multiset of put values: nothing is
/// lost, nothing is duplicated.
///
/// 取出值的多重集合等于放入值的多重集合：无丢失，无重复。
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_puts_and_takes_conserve_values() {
    const PUTTERS: usize = 8;
    const PER_PUTTER: usize = 100;

    let mvar = Arc::new(MVar::new());

    let mut putters = Vec::new();
    for p in 0..PUTTERS {
        let mvar = mvar.clone();
        putters.push(tokio::spawn(async move {
            for i in 0..PER_PUTTER {
                mvar.put(p * PER_PUTTER + i).await;
            }
        }));
    }

    let mut takers = Vec::new();
    for _ in 0..PUTTERS {
        let mvar = mvar.clone();
        takers.push(tokio::spawn(async move {
            let mut got = Vec::with_capacity(PER_PUTTER);
            for _ in 0..PER_PUTTER {
                got.push(mvar.take().await);
            }
            got
        }));
    }

    for p in putters {
        p.await.unwrap();
    }

    let mut counts: BTreeMap<usize, usize> = BTreeMap::new();
    for t in takers {
        for v in t.await.unwrap() {
            *counts.entry(v).or_insert(0) += 1;
        }
    }

    assert_eq!(counts.len(), PUTTERS * PER_PUTTER);
    assert!(counts.values().all(|&c| c == 1));
}

/// A single consumer observes one producer's puts in put order.
///
/// 单一消费者按 put 顺序观察单一生产者的 put。
#[tokio::test]
async fn takes_observe_puts_in_order() {
    let mvar = Arc::new(MVar::new());

    let producer = {
        let mvar = mvar.clone();
        tokio::spawn(async move {
            for i in 0..200 {
                mvar.put(i).await;
            }
        })
    };

    for expect in 0..200 {
        assert_eq!(mvar.take().await, expect);
    }
    producer.await.unwrap();
}

/// With N concurrently-registered takers, exactly one is resolved per put.
///
/// N 个并发注册的 taker 中，每次 put 恰好解析一个。
#[tokio::test]
async fn exactly_one_taker_resolved_per_put() {
    let mvar: Arc<MVar<u32>> = Arc::new(MVar::new());

    let mut takers: Vec<_> = (0..4).map(|_| tokio_test::task::spawn(mvar.take())).collect();
    for taker in takers.iter_mut() {
        assert!(taker.poll().is_pending());
    }

    for expect in [1u32, 2, 3] {
        assert!(mvar.try_put(expect).is_ok());

        let mut resolved_at = None;
        for (i, taker) in takers.iter_mut().enumerate() {
            if let Poll::Ready(v) = taker.poll() {
                assert_eq!(v, expect);
                assert!(resolved_at.is_none(), "two takers resolved by one put");
                resolved_at = Some(i);
            }
        }
        // Exactly one taker resolved; retire it.
        takers.remove(resolved_at.expect("no taker resolved"));
    }
    assert_eq!(takers.len(), 1);
}

/// `try_put` on a full cell always fails and leaves the value unchanged.
///
/// 对已满单元的 `try_put` 总是失败且不改变驻留值。
#[tokio::test]
async fn try_put_on_full_never_mutates() {
    let mvar = MVar::with_value(1);
    for i in 2..50 {
        assert_eq!(mvar.try_put(i), Err(i));
    }
    assert_eq!(mvar.try_take(), Some(1));
}

/// A take registered before any put is resolved by the first subsequent
/// put.
///
/// 在任何 put 之前注册的 take 由之后第一个 put 解析。
#[tokio::test]
async fn early_take_resolved_by_first_put() {
    let mvar = Arc::new(MVar::new());

    let taker = {
        let mvar = mvar.clone();
        tokio::spawn(async move { mvar.take().await })
    };
    tokio::task::yield_now().await;

    mvar.put("first").await;
    let got = tokio::time::timeout(Duration::from_secs(1), taker)
        .await
        .expect("take should resolve")
        .unwrap();
    assert_eq!(got, "first");
}

/// Cancelling registrations at staggered points never disturbs the
/// remaining waiters.
///
/// 在交错的时间点取消注册绝不影响其余等待者。
#[tokio::test]
async fn staggered_cancellation_leaves_others_intact() {
    for cancel_at in 0..4usize {
        let mvar: Arc<MVar<usize>> = Arc::new(MVar::new());

        let mut takers: Vec<_> = (0..4)
            .map(|_| Some(tokio_test::task::spawn(mvar.take())))
            .collect();
        for taker in takers.iter_mut().flatten() {
            assert!(taker.poll().is_pending());
        }

        // Cancel one mid-flight registration.
        takers[cancel_at] = None;

        for v in 0..3 {
            assert!(mvar.try_put(v).is_ok());
        }

        let mut got: Vec<usize> = takers
            .iter_mut()
            .flatten()
            .filter_map(|t| match t.poll() {
                Poll::Ready(v) => Some(v),
                Poll::Pending => None,
            })
            .collect();
        got.sort_unstable();
        assert_eq!(got, vec![0, 1, 2]);
    }
}

/// Reads are broadcast: every pending reader sees every subsequent put,
/// and reading never consumes.
///
/// read 是广播：每个等待中的读取者都能看到之后的 put，且读取从不消费。
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn read_broadcast_sees_put() {
    let mvar: Arc<MVar<u64>> = Arc::new(MVar::new());

    let readers: Vec<_> = (0..8)
        .map(|_| {
            let mvar = mvar.clone();
            tokio::spawn(async move { mvar.read().await })
        })
        .collect();
    tokio::task::yield_now().await;

    mvar.put(42).await;

    for reader in readers {
        let got = tokio::time::timeout(Duration::from_secs(1), reader)
            .await
            .expect("read should resolve")
            .unwrap();
        assert_eq!(got, 42);
    }
    assert_eq!(mvar.try_take(), Some(42));
}

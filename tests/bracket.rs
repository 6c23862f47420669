//! Bracket and ForwardCancellable integration tests: exactly-once release
//! across completion, failure and cancellation, and composed failures.
//!
//! bracket 与 ForwardCancellable 集成测试：完成、失败与取消下的恰好一次
//! release，以及失败合成。

#![cfg(not(feature = "loom"))]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use snap_sync::bracket::{bracket_case, BracketError, ExitCase};
use snap_sync::{ForwardCancellable, MVar};

/// acquire returns R, use fails with E1, release fails with E2 on the
/// Error(E1) exit: the caller observes one combined failure referencing
/// both, and release still ran exactly once.
///
/// acquire 返回 R，use 以 E1 失败，release 在 Error(E1) 退出时以 E2 失败：
/// 调用者观察到引用二者的单个合成失败，release 仍恰好执行一次。
#[tokio::test]
async fn combined_failure_carries_both_errors() {
    let release_runs = Arc::new(AtomicUsize::new(0));

    let counter = release_runs.clone();
    let result: Result<(), _> = bracket_case(
        async { Ok::<_, String>("R") },
        |_: &mut &str| async { Err::<(), _>("E1".to_string()) },
        move |_resource, exit: &ExitCase<String>| {
            counter.fetch_add(1, Ordering::SeqCst);
            assert_eq!(*exit, ExitCase::Error("E1".to_string()));
            Err("E2".to_string())
        },
    )
    .await;

    assert_eq!(
        result.unwrap_err(),
        BracketError::Both {
            use_error: "E1".to_string(),
            release_error: "E2".to_string(),
        }
    );
    assert_eq!(release_runs.load(Ordering::SeqCst), 1);
}

/// Aborting the task running a bracket releases the resource with the
/// Cancelled exit, exactly once.
///
/// 中止运行 bracket 的任务会以 Cancelled 退出释放资源，恰好一次。
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn task_abort_releases_cancelled() {
    let release_runs = Arc::new(AtomicUsize::new(0));
    let entered = Arc::new(MVar::new());

    let counter = release_runs.clone();
    let gate = entered.clone();
    let task = tokio::spawn(async move {
        bracket_case(
            async { Ok::<_, String>(1u32) },
            move |_: &mut u32| {
                let gate = gate.clone();
                async move {
                    gate.put(()).await;
                    std::future::pending::<Result<(), String>>().await
                }
            },
            move |_resource, exit: &ExitCase<String>| {
                assert_eq!(*exit, ExitCase::Cancelled);
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            },
        )
        .await
    });

    // Wait until `use` is definitely in flight, then cancel.
    entered.take().await;
    task.abort();
    let _ = task.await;

    // The abort drops the future synchronously with the release in its
    // drop path; give the runtime one beat regardless.
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(release_runs.load(Ordering::SeqCst), 1);
}

/// A resource threaded through nested brackets is released inside-out.
///
/// 穿过嵌套 bracket 的资源按由内向外的顺序释放。
#[tokio::test]
async fn nested_brackets_release_inside_out() {
    let order = Arc::new(std::sync::Mutex::new(Vec::new()));

    let outer_log = order.clone();
    let inner_log = order.clone();
    let result = bracket_case(
        async { Ok::<_, String>("outer") },
        move |_: &mut &str| {
            let inner_log = inner_log.clone();
            async move {
                bracket_case(
                    async { Ok::<_, String>("inner") },
                    |_: &mut &str| async { Ok::<_, String>(()) },
                    move |r, _exit: &ExitCase<String>| {
                        inner_log.lock().unwrap().push(r);
                        Ok(())
                    },
                )
                .await
                .map_err(|e| e.to_string())
            }
        },
        move |r, _exit: &ExitCase<String>| {
            outer_log.lock().unwrap().push(r);
            Ok(())
        },
    )
    .await;

    assert!(result.is_ok());
    assert_eq!(*order.lock().unwrap(), vec!["inner", "outer"]);
}

/// Queued cancel requests across tasks all resolve once the action is
/// supplied, and the action runs exactly once.
///
/// 跨任务排队的取消请求在动作提供后全部解析，动作恰好执行一次。
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn forward_cancellable_queued_across_tasks() {
    let forward = Arc::new(ForwardCancellable::new());
    let fired = Arc::new(AtomicUsize::new(0));

    let cancellers: Vec<_> = (0..8)
        .map(|_| {
            let forward = forward.clone();
            tokio::spawn(async move { forward.cancel().await })
        })
        .collect();
    tokio::task::yield_now().await;

    let counter = fired.clone();
    forward.complete(Box::new(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    }));

    for c in cancellers {
        tokio::time::timeout(Duration::from_secs(1), c)
            .await
            .expect("cancel should resolve")
            .unwrap();
    }
    assert_eq!(fired.load(Ordering::SeqCst), 1);
}

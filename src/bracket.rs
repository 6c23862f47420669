//! Resource-safety combinator with exit-case-aware release.
//!
//! [`bracket_case`] pairs an `acquire` future with a `release` action that
//! is guaranteed to run exactly once, tagged with how the `use` step ended:
//! [`ExitCase::Completed`], [`ExitCase::Error`] or [`ExitCase::Cancelled`].
//! The instant acquire yields a resource, the release frame is installed as
//! a [`ForwardCancellable`] action, so dropping the returned future mid-use
//! still releases with `Cancelled`. A single atomic guard flag resolves the
//! race between normal completion and drop-cancellation to exactly one
//! execution.
//!
//! If `release` itself fails while handling an `Error(e1)` exit, the new
//! failure is composed with `e1` into one [`BracketError::Both`] rather
//! than discarding either.
//!
//! Rust adaptation of "acquire is non-cancellable": a future dropped
//! mid-acquire has not produced a resource yet and cleans up after itself;
//! the guarantee installed here is that from the instant a resource exists,
//! release has a cleanup target.
//!
//! 具有退出情形感知释放的资源安全组合子。
//!
//! [`bracket_case`] 将 `acquire` future 与保证恰好执行一次的 `release`
//! 动作配对 —— 并标注 `use` 阶段的结束方式：[`ExitCase::Completed`]、
//! [`ExitCase::Error`] 或 [`ExitCase::Cancelled`]。
//! acquire 产出资源的那一刻，释放帧即作为 [`ForwardCancellable`] 动作安装，
//! 因此在 use 中途 drop 返回的 future 仍会以 `Cancelled` 释放。
//! 单个原子保护标志将正常完成与 drop 取消之间的竞争裁决为恰好一次执行。
//!
//! 若 `release` 在处理 `Error(e1)` 退出时自身失败，新失败会与 `e1`
//! 合成一个 [`BracketError::Both`]，二者都不会被丢弃。
//!
//! "acquire 不可取消" 的 Rust 适配：在 acquire 中途被 drop 的 future
//! 尚未产出资源，自会清理自身；这里安装的保证是：资源一旦存在，
//! release 就有了清理目标。
//!
//! # Examples
//!
//! ```
//! use snap_sync::bracket::{bracket_case, ExitCase};
//! use std::sync::{Arc, Mutex};
//!
//! # tokio_test::block_on(async {
//! let log: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
//!
//! let release_log = log.clone();
//! let result = bracket_case(
//!     async { Ok::<_, String>(10) },
//!     |n: &mut i32| {
//!         let n = *n;
//!         async move { Ok::<_, String>(n * 2) }
//!     },
//!     move |n, exit: &ExitCase<String>| {
//!         release_log.lock().unwrap().push(format!("released {n}: {exit:?}"));
//!         Ok::<(), String>(())
//!     },
//! )
//! .await;
//!
//! assert_eq!(result.unwrap(), 20);
//! assert_eq!(*log.lock().unwrap(), vec!["released 10: Completed"]);
//! # });
//! ```

use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use crate::forward::ForwardCancellable;
use crate::shim::atomic::{AtomicBool, Ordering};
use crate::shim::cell::UnsafeCell;

pub use self::error::BracketError;

/// How the `use` step of a bracket ended.
///
/// Cancellation is a distinct control-flow exit, never an error value.
///
/// bracket 的 `use` 阶段如何结束。
///
/// 取消是独立的控制流退出，绝不是错误值。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitCase<E> {
    /// `use` returned a value.
    ///
    /// `use` 返回了值。
    Completed,
    /// `use` failed.
    ///
    /// `use` 失败。
    Error(E),
    /// The bracket future was dropped before `use` finished.
    ///
    /// bracket future 在 `use` 完成前被 drop。
    Cancelled,
}

pub mod error {
    //! Bracket error types.

    use std::fmt;

    /// Failure of a bracketed computation, keeping every involved error.
    ///
    /// bracket 计算的失败，保留所有相关错误。
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum BracketError<E> {
        /// `acquire` failed; `use` and `release` never ran.
        ///
        /// `acquire` 失败；`use` 与 `release` 未执行。
        Acquire(E),
        /// `use` failed; `release` succeeded.
        ///
        /// `use` 失败；`release` 成功。
        Use(E),
        /// `use` succeeded; `release` failed.
        ///
        /// `use` 成功；`release` 失败。
        Release(E),
        /// `use` and `release` both failed; neither error is dropped.
        ///
        /// `use` 与 `release` 都失败；两个错误都不丢弃。
        Both {
            use_error: E,
            release_error: E,
        },
    }

    impl<E: fmt::Display> fmt::Display for BracketError<E> {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            match self {
                BracketError::Acquire(e) => write!(f, "acquire failed: {e}"),
                BracketError::Use(e) => write!(f, "use failed: {e}"),
                BracketError::Release(e) => write!(f, "release failed: {e}"),
                BracketError::Both {
                    use_error,
                    release_error,
                } => write!(
                    f,
                    "use failed: {use_error}; release also failed: {release_error}"
                ),
            }
        }
    }

    impl<E: fmt::Debug + fmt::Display> std::error::Error for BracketError<E> {}
}

/// The release frame: one atomic guard flag electing the unique firer, plus
/// the payload it consumes.
///
/// 释放帧：一个裁决唯一触发者的原子保护标志，加上其消费的负载。
struct Frame<A, E, R>
where
    R: FnOnce(A, &ExitCase<E>) -> Result<(), E>,
{
    fired: AtomicBool,
    payload: UnsafeCell<Option<(A, R)>>,
    _exit: PhantomData<fn(&ExitCase<E>)>,
}

// SAFETY: the payload cell is touched only by the unique winner of the
// `fired` flag, and by the owning task's resource borrow, which ends before
// any firer can run (the use future drops before the guard does).
unsafe impl<A: Send, E, R> Send for Frame<A, E, R> where
    R: FnOnce(A, &ExitCase<E>) -> Result<(), E> + Send
{
}
unsafe impl<A: Send, E, R> Sync for Frame<A, E, R> where
    R: FnOnce(A, &ExitCase<E>) -> Result<(), E> + Send
{
}

impl<A, E, R> Frame<A, E, R>
where
    R: FnOnce(A, &ExitCase<E>) -> Result<(), E>,
{
    fn new(resource: A, release: R) -> Self {
        Self {
            fired: AtomicBool::new(false),
            payload: UnsafeCell::new(Some((resource, release))),
            _exit: PhantomData,
        }
    }

    /// Pointer to the resource while the payload is installed; null after
    /// the frame fired.
    fn resource_ptr(&self) -> *mut A {
        self.payload.with_mut(|p| {
            // SAFETY: called only between installation and the first fire,
            // from the owning task.
            match unsafe { &mut *p } {
                Some((resource, _)) => resource as *mut A,
                None => std::ptr::null_mut(),
            }
        })
    }

    /// Run the release exactly once; `None` if another exit already did.
    ///
    /// 恰好执行一次 release；若另一退出路径已执行则返回 `None`。
    fn fire(&self, exit: &ExitCase<E>) -> Option<Result<(), E>> {
        if self.fired.swap(true, Ordering::AcqRel) {
            return None;
        }
        // SAFETY: the guard flag elected us the unique firer.
        let payload = self.payload.with_mut(|p| unsafe { (*p).take() });
        payload.map(|(resource, release)| release(resource, exit))
    }
}

/// Arms the cancellation path: dropped mid-flight, it requests the
/// ForwardCancellable-backed release; forgotten on the completion path.
struct DropGuard<'a> {
    forward: &'a ForwardCancellable,
}

impl Drop for DropGuard<'_> {
    fn drop(&mut self) {
        self.forward.trigger();
    }
}

/// `acquire`/`use`/`release` with an exit-case-aware release.
///
/// See the [module docs](self) for the full contract.
///
/// 具有退出情形感知 release 的 `acquire`/`use`/`release`。
///
/// 完整契约见[模块文档](self)。
pub async fn bracket_case<A, B, E, Acq, Use, UseFut, Rel>(
    acquire: Acq,
    use_fn: Use,
    release: Rel,
) -> Result<B, BracketError<E>>
where
    Acq: Future<Output = Result<A, E>>,
    Use: FnOnce(&mut A) -> UseFut,
    UseFut: Future<Output = Result<B, E>>,
    Rel: FnOnce(A, &ExitCase<E>) -> Result<(), E> + Send + 'static,
    A: Send + 'static,
    E: 'static,
{
    let resource = match acquire.await {
        Ok(resource) => resource,
        Err(e) => return Err(BracketError::Acquire(e)),
    };

    let forward = ForwardCancellable::new();
    let frame = Arc::new(Frame::new(resource, release));

    // The resource exists: install the release hook before anything can
    // suspend again.
    {
        let frame = frame.clone();
        forward.complete(Box::new(move || {
            // A release failure on the cancellation path has no caller left
            // to observe it.
            let _ = frame.fire(&ExitCase::Cancelled);
        }));
    }

    let guard = DropGuard { forward: &forward };

    let resource_ptr = frame.resource_ptr();
    if resource_ptr.is_null() {
        unreachable!("release frame fired before use");
    }
    // SAFETY: the payload stays installed until a fire, and no fire can run
    // while this borrow is alive: the firers are the completion path below
    // and `guard`, which drops only after the use future (created later,
    // dropped earlier) has released the borrow.
    let used = use_fn(unsafe { &mut *resource_ptr }).await;

    // Completion path: disarm the cancellation guard without firing it.
    std::mem::forget(guard);

    match used {
        Ok(value) => match frame.fire(&ExitCase::Completed) {
            None | Some(Ok(())) => Ok(value),
            Some(Err(release_error)) => Err(BracketError::Release(release_error)),
        },
        Err(use_error) => {
            let exit = ExitCase::Error(use_error);
            let released = frame.fire(&exit);
            let use_error = match exit {
                ExitCase::Error(e) => e,
                _ => unreachable!("exit case constructed above"),
            };
            match released {
                None | Some(Ok(())) => Err(BracketError::Use(use_error)),
                Some(Err(release_error)) => Err(BracketError::Both {
                    use_error,
                    release_error,
                }),
            }
        }
    }
}

/// Exit-case-oblivious convenience wrapper over [`bracket_case`].
///
/// [`bracket_case`] 的不感知退出情形的便捷包装。
pub async fn bracket<A, B, E, Acq, Use, UseFut, Rel>(
    acquire: Acq,
    use_fn: Use,
    release: Rel,
) -> Result<B, BracketError<E>>
where
    Acq: Future<Output = Result<A, E>>,
    Use: FnOnce(&mut A) -> UseFut,
    UseFut: Future<Output = Result<B, E>>,
    Rel: FnOnce(A) -> Result<(), E> + Send + 'static,
    A: Send + 'static,
    E: 'static,
{
    bracket_case(acquire, use_fn, move |resource, _exit: &ExitCase<E>| {
        release(resource)
    })
    .await
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::*;
    use std::sync::Mutex;

    type Log = Arc<Mutex<Vec<String>>>;

    fn recording_release(log: &Log) -> impl FnOnce(u32, &ExitCase<String>) -> Result<(), String> {
        let log = log.clone();
        move |resource, exit| {
            log.lock().unwrap().push(format!("{resource}:{exit:?}"));
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_completed_exit() {
        let log: Log = Arc::new(Mutex::new(Vec::new()));

        let result = bracket_case(
            async { Ok::<_, String>(1u32) },
            |r: &mut u32| {
                let r = *r;
                async move { Ok::<_, String>(r + 1) }
            },
            recording_release(&log),
        )
        .await;

        assert_eq!(result.unwrap(), 2);
        assert_eq!(*log.lock().unwrap(), vec!["1:Completed"]);
    }

    #[tokio::test]
    async fn test_error_exit_composes_failures() {
        let result = bracket_case(
            async { Ok::<_, String>(1u32) },
            |_: &mut u32| async { Err::<u32, _>("use boom".to_string()) },
            |_resource, _exit: &ExitCase<String>| Err("release boom".to_string()),
        )
        .await;

        assert_eq!(
            result.unwrap_err(),
            BracketError::Both {
                use_error: "use boom".to_string(),
                release_error: "release boom".to_string(),
            }
        );
    }

    #[tokio::test]
    async fn test_error_exit_release_ok() {
        let log: Log = Arc::new(Mutex::new(Vec::new()));

        let result = bracket_case(
            async { Ok::<_, String>(7u32) },
            |_: &mut u32| async { Err::<u32, _>("use boom".to_string()) },
            recording_release(&log),
        )
        .await;

        assert_eq!(result.unwrap_err(), BracketError::Use("use boom".to_string()));
        assert_eq!(*log.lock().unwrap(), vec!["7:Error(\"use boom\")"]);
    }

    #[tokio::test]
    async fn test_release_failure_on_success() {
        let result = bracket_case(
            async { Ok::<_, String>(1u32) },
            |r: &mut u32| {
                let r = *r;
                async move { Ok::<_, String>(r) }
            },
            |_resource, _exit: &ExitCase<String>| Err("release boom".to_string()),
        )
        .await;

        assert_eq!(
            result.unwrap_err(),
            BracketError::Release("release boom".to_string())
        );
    }

    #[tokio::test]
    async fn test_acquire_failure_skips_use_and_release() {
        let log: Log = Arc::new(Mutex::new(Vec::new()));

        let result = bracket_case(
            async { Err::<u32, _>("acquire boom".to_string()) },
            |_: &mut u32| async { Ok::<u32, String>(0) },
            recording_release(&log),
        )
        .await;

        assert_eq!(
            result.unwrap_err(),
            BracketError::Acquire("acquire boom".to_string())
        );
        assert!(log.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_drop_mid_use_releases_cancelled() {
        let log: Log = Arc::new(Mutex::new(Vec::new()));

        let bracket_fut = bracket_case(
            async { Ok::<_, String>(3u32) },
            |_: &mut u32| std::future::pending::<Result<u32, String>>(),
            recording_release(&log),
        );

        let mut task = tokio_test::task::spawn(bracket_fut);
        assert!(task.poll().is_pending());
        drop(task);

        assert_eq!(*log.lock().unwrap(), vec!["3:Cancelled"]);
    }

    #[tokio::test]
    async fn test_release_runs_exactly_once_under_drop_after_completion() {
        let log: Log = Arc::new(Mutex::new(Vec::new()));

        let result = bracket_case(
            async { Ok::<_, String>(9u32) },
            |r: &mut u32| {
                let r = *r;
                async move { Ok::<_, String>(r) }
            },
            recording_release(&log),
        )
        .await;

        assert_eq!(result.unwrap(), 9);
        assert_eq!(log.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_bracket_ignores_exit_case() {
        let log: Log = Arc::new(Mutex::new(Vec::new()));

        let release_log = log.clone();
        let result = bracket(
            async { Ok::<_, String>(5u32) },
            |_: &mut u32| async { Err::<u32, _>("boom".to_string()) },
            move |resource| {
                release_log.lock().unwrap().push(format!("closed {resource}"));
                Ok(())
            },
        )
        .await;

        assert_eq!(result.unwrap_err(), BracketError::Use("boom".to_string()));
        assert_eq!(*log.lock().unwrap(), vec!["closed 5"]);
    }
}

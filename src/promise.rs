//! Single-assignment, multi-waiter completion cell.
//!
//! A [`Promise`] is written at most once and read by any number of waiters.
//! Completion is one CAS transition from `Unset` to `Set`; every registered
//! getter is handed a clone of the value strictly after the CAS. Getters
//! that arrive later resolve immediately. This is the cell that bridges a
//! one-shot callback result into as many suspended observers as care about
//! it; fiber join handles wrap exactly this contract.
//!
//! 单次赋值、多等待者的完成单元。
//!
//! [`Promise`] 至多被写入一次，可被任意数量的等待者读取。
//! 完成是一次从 `Unset` 到 `Set` 的 CAS 转换；每个已注册的 getter
//! 在 CAS 之后严格获得值的克隆。之后到达的 getter 立即解析。
//! 这个单元把一次性回调结果桥接给任意多个挂起的观察者 ——
//! fiber 的 join 句柄包装的正是这一契约。
//!
//! # Examples
//!
//! ```
//! use snap_sync::Promise;
//! use std::sync::Arc;
//!
//! # tokio_test::block_on(async {
//! let promise = Arc::new(Promise::new());
//!
//! let waiter = {
//!     let promise = promise.clone();
//!     tokio::spawn(async move { promise.get().await })
//! };
//!
//! promise.complete(42);
//! assert_eq!(waiter.await.unwrap(), 42);
//! # });
//! ```

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use im::OrdMap;

use crate::snapshot::{SnapshotCell, Update};
use crate::token::Token;
use crate::waiter::Waiter;

enum PromiseState<A> {
    /// Not yet completed; waiters keyed by token, FIFO by construction.
    ///
    /// 尚未完成；等待者以 token 为键，天然 FIFO。
    Unset { waiters: OrdMap<Token, Arc<Waiter<A>>> },
    /// Completed. Terminal.
    ///
    /// 已完成。终态。
    Set { value: A },
}

/// Single-assignment completion cell with broadcast delivery.
///
/// 具有广播投递能力的单次赋值完成单元。
pub struct Promise<A> {
    cell: SnapshotCell<PromiseState<A>>,
}

impl<A> std::fmt::Debug for Promise<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Promise")
            .field("is_completed", &self.is_completed())
            .finish()
    }
}

impl<A> Default for Promise<A>
where
    A: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<A> Promise<A> {
    /// Whether the promise has been completed. Pure snapshot read.
    ///
    /// promise 是否已完成。纯快照读取。
    #[inline]
    pub fn is_completed(&self) -> bool {
        self.cell.read(|s| matches!(s, PromiseState::Set { .. }))
    }
}

impl<A> Promise<A>
where
    A: Clone,
{
    /// Create an unset promise.
    ///
    /// 创建一个未完成的 promise。
    #[inline]
    pub fn new() -> Self {
        Self {
            cell: SnapshotCell::new(PromiseState::Unset {
                waiters: OrdMap::new(),
            }),
        }
    }

    /// The value, if already completed. Never suspends.
    ///
    /// 若已完成则返回值。从不挂起。
    #[inline]
    pub fn try_get(&self) -> Option<A> {
        self.cell.read(|s| match s {
            PromiseState::Set { value } => Some(value.clone()),
            PromiseState::Unset { .. } => None,
        })
    }

    /// Complete the promise, waking every registered getter with a clone.
    ///
    /// # Panics
    ///
    /// Panics if the promise was already completed. A double completion is a
    /// bug in the surrounding runtime, not recoverable data; use
    /// [`try_complete`](Self::try_complete) for racy completion.
    ///
    /// 完成 promise，以克隆唤醒每个已注册的 getter。
    ///
    /// # Panics
    ///
    /// 若 promise 已完成则 panic。重复完成是外围运行时的 bug，
    /// 不是可恢复的数据；竞争式完成请用 [`try_complete`](Self::try_complete)。
    pub fn complete(&self, value: A) {
        if self.try_complete(value).is_err() {
            panic!("promise already completed");
        }
    }

    /// Complete unless already completed; `Err` returns the value to the
    /// race loser.
    ///
    /// 若尚未完成则完成；竞争失败方通过 `Err` 拿回值。
    pub fn try_complete(&self, value: A) -> Result<(), A> {
        let woken = self.cell.update(|state| match state {
            PromiseState::Set { .. } => Update::Keep(None),
            PromiseState::Unset { waiters } => Update::Swap(
                PromiseState::Set {
                    value: value.clone(),
                },
                Some(waiters.clone()),
            ),
        });

        match woken {
            None => Err(value),
            Some(waiters) => {
                // Strictly after the CAS: broadcast to every waiter.
                for (_, waiter) in waiters.iter() {
                    let _ = waiter.complete(value.clone());
                }
                Ok(())
            }
        }
    }

    /// Wait for completion. Registers under a fresh token when unset;
    /// dropping the returned future removes exactly that registration.
    ///
    /// 等待完成。未完成时以新 token 注册；
    /// drop 返回的 future 会精确移除该注册。
    #[inline]
    pub fn get(&self) -> Get<'_, A> {
        Get {
            promise: self,
            waiter: None,
        }
    }

    fn register_get(&self, token: Token, waiter: &Arc<Waiter<A>>) -> Option<A> {
        self.cell.update(|state| match state {
            PromiseState::Set { value } => Update::Keep(Some(value.clone())),
            PromiseState::Unset { waiters } => Update::Swap(
                PromiseState::Unset {
                    waiters: waiters.update(token, waiter.clone()),
                },
                None,
            ),
        })
    }

    fn remove_get(&self, token: Token) {
        self.cell.update(|state| match state {
            PromiseState::Set { .. } => Update::Keep(()),
            PromiseState::Unset { waiters } => {
                if waiters.contains_key(&token) {
                    Update::Swap(
                        PromiseState::Unset {
                            waiters: waiters.without(&token),
                        },
                        (),
                    )
                } else {
                    Update::Keep(())
                }
            }
        });
    }
}

/// Future returned by [`Promise::get`].
///
/// [`Promise::get`] 返回的 future。
pub struct Get<'a, A>
where
    A: Clone,
{
    promise: &'a Promise<A>,
    waiter: Option<(Token, Arc<Waiter<A>>)>,
}

impl<A> Future for Get<'_, A>
where
    A: Clone,
{
    type Output = A;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<A> {
        let this = self.get_mut();

        if let Some((_, waiter)) = &this.waiter {
            let polled = waiter.poll_consume(cx);
            if polled.is_ready() {
                // Serviced; nothing left to deregister on drop.
                this.waiter = None;
            }
            return polled;
        }

        // First poll: register-or-resolve in a single transition.
        let token = Token::next();
        let waiter = Waiter::new();
        if let Some(value) = this.promise.register_get(token, &waiter) {
            return Poll::Ready(value);
        }

        this.waiter = Some((token, waiter.clone()));
        let polled = waiter.poll_consume(cx);
        if polled.is_ready() {
            this.waiter = None;
        }
        polled
    }
}

impl<A> Drop for Get<'_, A>
where
    A: Clone,
{
    fn drop(&mut self) {
        if let Some((token, _)) = self.waiter.take() {
            // No-op if the completion already serviced this token.
            self.promise.remove_get(token);
        }
    }
}

impl<A> std::fmt::Debug for Get<'_, A>
where
    A: Clone,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Get")
            .field("registered", &self.waiter.is_some())
            .finish()
    }
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::*;

    #[test]
    fn test_try_get_before_and_after() {
        let promise = Promise::new();
        assert_eq!(promise.try_get(), None);
        assert!(!promise.is_completed());

        promise.complete(5);
        assert_eq!(promise.try_get(), Some(5));
        assert!(promise.is_completed());
    }

    #[test]
    fn test_try_complete_race_loser_gets_value_back() {
        let promise = Promise::new();
        assert!(promise.try_complete(1).is_ok());
        assert_eq!(promise.try_complete(2), Err(2));
        assert_eq!(promise.try_get(), Some(1));
    }

    #[test]
    #[should_panic(expected = "promise already completed")]
    fn test_double_complete_panics() {
        let promise = Promise::new();
        promise.complete(1);
        promise.complete(2);
    }

    #[tokio::test]
    async fn test_get_after_complete_is_immediate() {
        let promise = Promise::new();
        promise.complete("done");
        assert_eq!(promise.get().await, "done");
    }

    #[tokio::test]
    async fn test_broadcast_to_multiple_getters() {
        let promise = Arc::new(Promise::new());

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let promise = promise.clone();
                tokio::spawn(async move { promise.get().await })
            })
            .collect();

        // Let the getters register.
        tokio::task::yield_now().await;
        promise.complete(11u32);

        for h in handles {
            assert_eq!(h.await.unwrap(), 11);
        }
    }

    #[tokio::test]
    async fn test_dropped_getter_does_not_disturb_others() {
        let promise = Arc::new(Promise::new());

        let mut dropped = tokio_test::task::spawn(promise.get());
        assert!(dropped.poll().is_pending());

        let kept = {
            let promise = promise.clone();
            tokio::spawn(async move { promise.get().await })
        };
        tokio::task::yield_now().await;

        drop(dropped);
        promise.complete(3);
        assert_eq!(kept.await.unwrap(), 3);
    }
}

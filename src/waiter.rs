//! Waiter registrations: the listener half of every suspended operation.
//!
//! A [`Waiter`] is one registration: a one-shot result [`Slot`] plus an
//! [`AtomicWaker`]. Servicing a registration means filling the slot and
//! waking. The slot's state machine makes that fire exactly once no matter
//! how many mutators race for it. The registered future polls its own
//! waiter, never the shared state, so a slow consumer cannot block a
//! mutator.
//!
//! [`ReadEntry`] is the broadcast variant used by `MVar::read` and
//! `Queue::peek`: it captures a monomorphized clone hook at the call site
//! where `A: Clone` is provable, so the containing types carry no `Clone`
//! bounds.
//!
//! 等待者注册：每个挂起操作的监听器一侧。
//!
//! [`Waiter`] 即一次注册：一个一次性结果 [`Slot`] 加一个 [`AtomicWaker`]。
//! 服务一个注册意味着填充槽并唤醒 —— 槽的状态机保证无论多少修改者竞争，
//! 它都恰好触发一次。注册方的 future 轮询自己的 waiter，而非共享状态，
//! 因此慢消费者不会阻塞修改者。
//!
//! [`ReadEntry`] 是 `MVar::read` 与 `Queue::peek` 使用的广播变体：
//! 它在能证明 `A: Clone` 的调用点捕获单态化的克隆钩子，
//! 使外层类型无需携带 `Clone` 约束。

use std::sync::Arc;
use std::task::{Context, Poll};

use crate::atomic_waker::AtomicWaker;
use crate::slot::Slot;

/// One suspended registration: result slot + waker.
///
/// 一次挂起的注册：结果槽 + waker。
pub(crate) struct Waiter<T> {
    slot: Slot<T>,
    waker: AtomicWaker,
}

impl<T> Waiter<T> {
    #[inline]
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            slot: Slot::empty(),
            waker: AtomicWaker::new(),
        })
    }

    /// Service this registration: deposit the result and wake the task.
    ///
    /// Returns `Err(value)` if the registration was already serviced; the
    /// caller keeps the value (exactly-once delivery).
    ///
    /// 服务该注册：存入结果并唤醒任务。
    ///
    /// 若该注册已被服务则返回 `Err(value)`，值归还调用者（恰好一次投递）。
    #[inline]
    pub(crate) fn complete(&self, value: T) -> Result<(), T> {
        let filled = self.slot.fill(value);
        if filled.is_ok() {
            self.waker.wake();
        }
        filled
    }

    /// Consume the deposited result, if any.
    ///
    /// 取出已存入的结果（如果有）。
    #[inline]
    pub(crate) fn try_consume(&self) -> Option<T> {
        self.slot.take()
    }

    /// Poll for the result with the register-then-recheck pattern, so a
    /// completion racing with registration can never be missed.
    ///
    /// 使用"先注册再复查"模式轮询结果，
    /// 与注册竞争的完成不可能被错过。
    pub(crate) fn poll_consume(&self, cx: &mut Context<'_>) -> Poll<T> {
        if let Some(value) = self.slot.take() {
            return Poll::Ready(value);
        }

        self.waker.register(cx.waker());

        match self.slot.take() {
            Some(value) => Poll::Ready(value),
            None => Poll::Pending,
        }
    }
}

impl<T> std::fmt::Debug for Waiter<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Waiter").finish_non_exhaustive()
    }
}

/// Broadcast registration: a waiter plus the clone hook captured where
/// `A: Clone` was in scope.
///
/// 广播注册：一个 waiter 加在 `A: Clone` 可见处捕获的克隆钩子。
pub(crate) struct ReadEntry<A> {
    waiter: Arc<Waiter<A>>,
    clone_fn: fn(&A) -> A,
}

// Derived Clone would demand A: Clone on the entry itself; the whole point
// of the stored hook is that it doesn't.
impl<A> Clone for ReadEntry<A> {
    fn clone(&self) -> Self {
        Self {
            waiter: self.waiter.clone(),
            clone_fn: self.clone_fn,
        }
    }
}

impl<A> ReadEntry<A> {
    #[inline]
    pub(crate) fn new() -> Self
    where
        A: Clone,
    {
        Self {
            waiter: Waiter::new(),
            clone_fn: |v| v.clone(),
        }
    }

    #[inline]
    pub(crate) fn waiter(&self) -> &Arc<Waiter<A>> {
        &self.waiter
    }

    /// Deliver a clone of `value` to this reader.
    ///
    /// 将 `value` 的克隆投递给该读取者。
    #[inline]
    pub(crate) fn deliver(&self, value: &A) {
        let _ = self.waiter.complete((self.clone_fn)(value));
    }

    /// Clone `value` through the captured hook, for callers that need a
    /// master copy without an `A: Clone` bound in scope.
    ///
    /// 通过捕获的钩子克隆 `value`，供作用域内没有 `A: Clone` 约束
    /// 却需要主副本的调用者使用。
    #[inline]
    pub(crate) fn clone_value(&self, value: &A) -> A {
        (self.clone_fn)(value)
    }
}

impl<A> std::fmt::Debug for ReadEntry<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadEntry").finish_non_exhaustive()
    }
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::*;

    #[test]
    fn test_complete_once() {
        let waiter = Waiter::new();
        assert!(waiter.complete(1).is_ok());
        assert_eq!(waiter.complete(2), Err(2));
        assert_eq!(waiter.try_consume(), Some(1));
        assert_eq!(waiter.try_consume(), None);
    }

    #[test]
    fn test_poll_consume() {
        use futures::task::noop_waker;

        let waiter: Arc<Waiter<u32>> = Waiter::new();
        let waker = noop_waker();
        let mut cx = Context::from_waker(&waker);

        assert!(waiter.poll_consume(&mut cx).is_pending());
        waiter.complete(9).unwrap();
        assert_eq!(waiter.poll_consume(&mut cx), Poll::Ready(9));
    }

    #[test]
    fn test_read_entry_delivers_clone() {
        let entry: ReadEntry<String> = ReadEntry::new();
        let value = "hello".to_string();

        let copy = entry.clone_value(&value);
        entry.deliver(&copy);
        assert_eq!(entry.waiter().try_consume(), Some("hello".to_string()));
        // Original untouched
        assert_eq!(value, "hello");
    }
}

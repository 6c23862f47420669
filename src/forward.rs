//! Placeholder for a not-yet-known cancellation action.
//!
//! A [`ForwardCancellable`] decouples *requesting* cancellation from
//! *knowing how* to cancel. Cancel requests arriving before the action is
//! supplied are queued; [`complete`](ForwardCancellable::complete) then
//! fires the action exactly once on behalf of every queued request, and the
//! state permanently becomes a no-op. With no queued request, `complete`
//! merely records the action and the first later cancel fires it.
//!
//! Queued requests ride an internal [`Promise<()>`]: `cancel()` resolves
//! once the action has actually run, no matter which side ran it.
//!
//! 尚未可知的取消动作的占位符。
//!
//! [`ForwardCancellable`] 将*请求*取消与*知道如何*取消解耦。
//! 动作尚未提供时到达的取消请求被排队；
//! [`complete`](ForwardCancellable::complete) 随后代表所有排队请求
//! 恰好触发一次动作，状态永久变为空操作。
//! 没有排队请求时，`complete` 仅记录动作，之后第一个 cancel 触发它。
//!
//! 排队请求依托内部 [`Promise<()>`]：无论动作由哪一侧执行，
//! `cancel()` 都在动作真正运行后解析。
//!
//! # Examples
//!
//! ```
//! use snap_sync::ForwardCancellable;
//! use std::sync::Arc;
//! use std::sync::atomic::{AtomicUsize, Ordering};
//!
//! # tokio_test::block_on(async {
//! let fc = Arc::new(ForwardCancellable::new());
//! let fired = Arc::new(AtomicUsize::new(0));
//!
//! let pending = {
//!     let fc = fc.clone();
//!     tokio::spawn(async move { fc.cancel().await })
//! };
//! tokio::task::yield_now().await;
//!
//! let counter = fired.clone();
//! fc.complete(Box::new(move || {
//!     counter.fetch_add(1, Ordering::SeqCst);
//! }));
//!
//! pending.await.unwrap();
//! assert_eq!(fired.load(Ordering::SeqCst), 1);
//! # });
//! ```

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use crate::promise::{Get, Promise};
use crate::slot::Slot;
use crate::snapshot::{SnapshotCell, Update};

/// A deferred cancellation action.
///
/// 延迟的取消动作。
pub type CancelAction = Box<dyn FnOnce() + Send>;

enum FwdState {
    /// No action yet; `requested` records whether any cancel is queued
    /// (the waiters themselves ride the internal promise).
    ///
    /// 尚无动作；`requested` 记录是否已有排队的取消请求
    /// （等待者本身依托内部 promise）。
    Empty { requested: bool },
    /// Action supplied, not yet fired.
    ///
    /// 动作已提供，尚未触发。
    Active { action: Arc<Slot<CancelAction>> },
    /// Action fired. Terminal no-op.
    ///
    /// 动作已触发。终态空操作。
    Done,
}

enum CompleteStep {
    Stored,
    Fire(Arc<Slot<CancelAction>>),
    AlreadyCompleted,
}

enum TriggerStep {
    Queued,
    Fire(Arc<Slot<CancelAction>>),
    AlreadyDone,
}

/// Deferred cancellation-action holder.
///
/// 延迟取消动作的持有者。
pub struct ForwardCancellable {
    cell: SnapshotCell<FwdState>,
    done: Promise<()>,
}

impl std::fmt::Debug for ForwardCancellable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ForwardCancellable")
            .field("is_done", &self.done.is_completed())
            .finish()
    }
}

impl Default for ForwardCancellable {
    fn default() -> Self {
        Self::new()
    }
}

impl ForwardCancellable {
    /// Create a holder with no action assigned.
    ///
    /// 创建一个尚未指定动作的持有者。
    #[inline]
    pub fn new() -> Self {
        Self {
            cell: SnapshotCell::new(FwdState::Empty { requested: false }),
            done: Promise::new(),
        }
    }

    /// Whether the action has already fired.
    ///
    /// 动作是否已触发。
    #[inline]
    pub fn is_done(&self) -> bool {
        self.done.is_completed()
    }

    /// Supply the cancellation action.
    ///
    /// Fires it immediately, exactly once, if any cancel request is
    /// already queued; otherwise records it for the first later cancel.
    ///
    /// # Panics
    ///
    /// Panics if called twice: supplying two actions to one holder is a bug
    /// in the surrounding runtime.
    ///
    /// 提供取消动作。
    ///
    /// 若已有排队的取消请求则立即 —— 且恰好一次 —— 触发；
    /// 否则记录下来，交由之后第一个 cancel 触发。
    ///
    /// # Panics
    ///
    /// 重复调用会 panic：向同一持有者提供两个动作是外围运行时的 bug。
    pub fn complete(&self, action: CancelAction) {
        let slot = Arc::new(Slot::full(action));
        let step = self.cell.update(|state| match state {
            FwdState::Empty { requested: false } => Update::Swap(
                FwdState::Active {
                    action: slot.clone(),
                },
                CompleteStep::Stored,
            ),
            FwdState::Empty { requested: true } => {
                Update::Swap(FwdState::Done, CompleteStep::Fire(slot.clone()))
            }
            FwdState::Active { .. } | FwdState::Done => Update::Keep(CompleteStep::AlreadyCompleted),
        });

        match step {
            CompleteStep::Stored => {}
            CompleteStep::Fire(slot) => self.fire(&slot),
            CompleteStep::AlreadyCompleted => {
                panic!("forward cancellable completed twice")
            }
        }
    }

    /// Non-suspending cancel request: fire now if the action is known,
    /// queue the request if not, no-op if already fired. Used by drop paths
    /// that cannot await.
    ///
    /// 非挂起的取消请求：动作已知则立即触发，未知则排队，
    /// 已触发则为空操作。供无法 await 的 drop 路径使用。
    pub fn trigger(&self) {
        let step = self.cell.update(|state| match state {
            FwdState::Empty { requested: true } => Update::Keep(TriggerStep::Queued),
            FwdState::Empty { requested: false } => {
                Update::Swap(FwdState::Empty { requested: true }, TriggerStep::Queued)
            }
            FwdState::Active { action } => {
                Update::Swap(FwdState::Done, TriggerStep::Fire(action.clone()))
            }
            FwdState::Done => Update::Keep(TriggerStep::AlreadyDone),
        });

        if let TriggerStep::Fire(slot) = step {
            self.fire(&slot);
        }
    }

    /// Request cancellation and wait until the action has run.
    ///
    /// Requests made before [`complete`](Self::complete) accumulate; the
    /// action still fires exactly once. Idempotent once fired.
    ///
    /// 请求取消并等待动作执行完毕。
    ///
    /// 在 [`complete`](Self::complete) 之前发出的请求会累积；
    /// 动作仍然恰好触发一次。触发后幂等。
    #[inline]
    pub fn cancel(&self) -> Cancel<'_> {
        Cancel {
            forward: self,
            awaiting: None,
        }
    }

    /// Exactly-once execution: the single transition into `Done` elected us
    /// the firer.
    fn fire(&self, slot: &Arc<Slot<CancelAction>>) {
        if let Some(action) = slot.take() {
            action();
        }
        self.done.complete(());
    }
}

/// Future returned by [`ForwardCancellable::cancel`].
///
/// [`ForwardCancellable::cancel`] 返回的 future。
pub struct Cancel<'a> {
    forward: &'a ForwardCancellable,
    awaiting: Option<Get<'a, ()>>,
}

impl Future for Cancel<'_> {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let this = self.get_mut();

        if this.awaiting.is_none() {
            this.forward.trigger();
            this.awaiting = Some(this.forward.done.get());
        }
        match &mut this.awaiting {
            Some(get) => Pin::new(get).poll(cx),
            None => Poll::Pending,
        }
    }
}

impl std::fmt::Debug for Cancel<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cancel")
            .field("requested", &self.awaiting.is_some())
            .finish()
    }
}

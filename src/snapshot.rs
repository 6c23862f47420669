//! The state-snapshot / CAS-loop pattern shared by every primitive.
//!
//! One [`SnapshotCell`] per instance holds the entire state behind a single
//! epoch-managed atomic pointer. Every mutation is: load a snapshot, compute
//! a successor plus a notification descriptor, compare-and-swap, retry on
//! contention. The descriptor is returned to the caller so notifications run
//! strictly *after* the CAS, so a slow listener can never block another
//! mutator, and no mutator ever observes a torn state. Superseded snapshots
//! are retired through epoch reclamation, which is what makes it sound to
//! read a snapshot another thread is concurrently replacing.
//!
//! 所有原语共享的状态快照 / CAS 循环模式。
//!
//! 每个实例一个 [`SnapshotCell`]，整个状态置于单个由 epoch 管理的原子指针后。
//! 每次修改都是：加载快照，计算后继状态与通知描述，compare-and-swap，
//! 竞争失败则重试。描述被返回给调用者，因此通知严格发生在 CAS *之后* ——
//! 慢监听器不会阻塞其他修改者，任何修改者也不会观察到撕裂状态。
//! 被替换的快照通过 epoch 回收，这正是允许在另一线程并发替换时
//! 仍能安全读取快照的原因。

use std::sync::atomic::Ordering;

use crossbeam_epoch::{self as epoch, Atomic, Owned};

/// Outcome of one transition attempt.
///
/// 单次转换尝试的结果。
pub(crate) enum Update<S, T> {
    /// Install the successor state, then return the descriptor.
    ///
    /// 安装后继状态，然后返回描述。
    Swap(S, T),
    /// No transition needed (pure read or policy rejection); return as-is.
    ///
    /// 无需转换（纯读取或策略拒绝）；直接返回。
    Keep(T),
}

/// Single atomically-swappable state reference.
///
/// 单个可原子替换的状态引用。
pub(crate) struct SnapshotCell<S> {
    state: Atomic<S>,
}

impl<S> SnapshotCell<S> {
    #[inline]
    pub(crate) fn new(initial: S) -> Self {
        Self {
            state: Atomic::new(initial),
        }
    }

    /// Pure snapshot read; never retries, never suspends.
    ///
    /// 纯快照读取；从不重试，从不挂起。
    pub(crate) fn read<T>(&self, f: impl FnOnce(&S) -> T) -> T {
        let guard = epoch::pin();
        let shared = self.state.load(Ordering::Acquire, &guard);
        // SAFETY: the cell always holds a state, and the pinned guard keeps
        // this snapshot alive even if a concurrent CAS retires it.
        let snapshot = unsafe { shared.deref() };
        f(snapshot)
    }

    /// Run one CAS transition.
    ///
    /// `f` must be pure with respect to retries: it may run several times,
    /// and a discarded successor must lose nothing (values that move into
    /// the successor are pre-wrapped in `Arc<Slot<_>>` by the caller).
    /// Notifications described by the returned value are the caller's job,
    /// strictly after this returns.
    ///
    /// 执行一次 CAS 转换。
    ///
    /// `f` 必须对重试保持纯性：它可能执行多次，被丢弃的后继状态不能丢失
    /// 任何东西（移入后继的值由调用者预先包入 `Arc<Slot<_>>`）。
    /// 返回值所描述的通知由调用者在本函数返回后严格执行。
    pub(crate) fn update<T>(&self, mut f: impl FnMut(&S) -> Update<S, T>) -> T {
        let guard = epoch::pin();
        loop {
            let shared = self.state.load(Ordering::Acquire, &guard);
            // SAFETY: as in `read`.
            let snapshot = unsafe { shared.deref() };

            match f(snapshot) {
                Update::Keep(out) => return out,
                Update::Swap(next, out) => {
                    match self.state.compare_exchange(
                        shared,
                        Owned::new(next),
                        Ordering::AcqRel,
                        Ordering::Acquire,
                        &guard,
                    ) {
                        Ok(_) => {
                            // SAFETY: the old snapshot is now unlinked; no
                            // new reader can reach it, so retire it once all
                            // current guards are gone.
                            unsafe { guard.defer_destroy(shared) };
                            return out;
                        }
                        Err(_) => {
                            // Lost the race: the candidate successor is
                            // dropped with the error, retry from a fresh load.
                            continue;
                        }
                    }
                }
            }
        }
    }
}

impl<S> Drop for SnapshotCell<S> {
    fn drop(&mut self) {
        // SAFETY: `&mut self` rules out concurrent access, so the current
        // snapshot can be reclaimed immediately.
        unsafe {
            let shared = self.state.load(Ordering::Relaxed, epoch::unprotected());
            drop(shared.into_owned());
        }
    }
}

impl<S> std::fmt::Debug for SnapshotCell<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnapshotCell").finish_non_exhaustive()
    }
}

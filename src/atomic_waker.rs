//! Atomic waker storage using a state machine for safe concurrent access.
//!
//! Based on Tokio's AtomicWaker but simplified for the needs of this crate:
//! every suspended registration owns exactly one waker cell, the registering
//! side is a single task, and the waking side is whichever mutator won the
//! CAS that serviced the registration. Uses `UnsafeCell<Option<Waker>>` plus
//! an atomic state machine to avoid Box allocation while keeping concurrent
//! access safe. Routed through the loom shim so `--features loom` models it.
//!
//! 使用状态机进行安全并发访问的原子 waker 存储。
//!
//! 基于 Tokio 的 AtomicWaker，并针对本 crate 的需求简化：
//! 每个挂起的注册恰好拥有一个 waker 单元，注册方是单一任务，
//! 唤醒方是赢得该注册服务权 CAS 的那个修改者。
//! 使用 `UnsafeCell<Option<Waker>>` 加原子状态机，避免 Box 分配，
//! 同时保持并发访问安全。通过 loom 适配层接入，`--features loom` 可建模。

use std::task::Waker;

use crate::shim::atomic::{AtomicUsize, Ordering};
use crate::shim::cell::UnsafeCell;

// Waker registration states
const WAITING: usize = 0;
const REGISTERING: usize = 0b01;
const WAKING: usize = 0b10;

/// Atomic waker storage with state machine synchronization
///
/// 带有状态机同步的原子 waker 存储
pub(crate) struct AtomicWaker {
    state: AtomicUsize,
    waker: UnsafeCell<Option<Waker>>,
}

// SAFETY: access to the waker cell is serialized by the REGISTERING/WAKING
// state machine; whichever side holds the transient state has exclusive
// access to the cell.
unsafe impl Sync for AtomicWaker {}
unsafe impl Send for AtomicWaker {}

impl AtomicWaker {
    /// Create a new, empty atomic waker.
    ///
    /// 创建一个新的空原子 waker。
    #[inline]
    #[cfg(not(feature = "loom"))]
    pub(crate) const fn new() -> Self {
        Self {
            state: AtomicUsize::new(WAITING),
            waker: UnsafeCell::new(None),
        }
    }

    // loom's atomics are not const-constructible.
    #[inline]
    #[cfg(feature = "loom")]
    pub(crate) fn new() -> Self {
        Self {
            state: AtomicUsize::new(WAITING),
            waker: UnsafeCell::new(None),
        }
    }

    /// Register a waker to be notified.
    ///
    /// Stores the waker, replacing any previous one. If a concurrent wake
    /// lands during registration, the newly registered waker is woken
    /// immediately, so a wakeup can never be lost between a poll's
    /// "register then re-check" steps.
    ///
    /// 注册一个待通知的 waker。
    ///
    /// 存储 waker 并替换之前的。如果注册期间发生并发唤醒，
    /// 新注册的 waker 会被立即唤醒，因此在 poll 的
    /// "先注册再复查" 步骤之间不会丢失唤醒。
    pub(crate) fn register(&self, waker: &Waker) {
        match self
            .state
            .compare_exchange(WAITING, REGISTERING, Ordering::Acquire, Ordering::Acquire)
        {
            Ok(_) => {
                // SAFETY: the REGISTERING state grants exclusive cell access.
                let old_waker = self.waker.with_mut(|cell| unsafe { (*cell).replace(waker.clone()) });

                match self.state.compare_exchange(
                    REGISTERING,
                    WAITING,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => {
                        drop(old_waker);
                    }
                    Err(_) => {
                        // A wake raced in while we held REGISTERING; the
                        // state is REGISTERING | WAKING. Consume the stored
                        // waker and fire it ourselves.
                        // SAFETY: the waker still holds the cell exclusively
                        // until the state is restored below.
                        let waker = self.waker.with_mut(|cell| unsafe { (*cell).take() });
                        self.state.store(WAITING, Ordering::Release);

                        drop(old_waker);
                        if let Some(waker) = waker {
                            waker.wake();
                        }
                    }
                }
            }
            Err(WAKING) => {
                // A wake is in flight; don't store, fire directly.
                waker.wake_by_ref();
            }
            Err(_) => {
                // Concurrent register. Each registration belongs to a single
                // task, so this only happens on a stale poll; drop it.
            }
        }
    }

    /// Take the stored waker out for waking.
    ///
    /// Returns the waker if one was registered. Atomically removes it, so
    /// two concurrent wakers hand the waker to exactly one of them.
    ///
    /// 取出存储的 waker 用于唤醒。
    ///
    /// 若已注册则返回该 waker，并原子地移除，
    /// 两个并发唤醒者中恰好一个拿到 waker。
    pub(crate) fn take(&self) -> Option<Waker> {
        match self.state.fetch_or(WAKING, Ordering::AcqRel) {
            WAITING => {
                // SAFETY: the WAKING bit grants exclusive cell access.
                let waker = self.waker.with_mut(|cell| unsafe { (*cell).take() });

                self.state.store(WAITING, Ordering::Release);

                waker
            }
            _ => {
                // A register or another wake is in progress; that side
                // observes the WAKING bit and fires the waker itself.
                None
            }
        }
    }

    /// Wake the registered waker, if any.
    ///
    /// 唤醒已注册的 waker（如果有）。
    #[inline]
    pub(crate) fn wake(&self) {
        if let Some(waker) = self.take() {
            waker.wake();
        }
    }
}

impl Drop for AtomicWaker {
    fn drop(&mut self) {
        // SAFETY: exclusive access during drop.
        self.waker.with_mut(|cell| unsafe {
            let _ = (*cell).take();
        });
    }
}

impl std::fmt::Debug for AtomicWaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AtomicWaker").finish()
    }
}

//! One-shot value slot guarded by an atomic state machine.
//!
//! Snapshot states hold their payloads behind `Arc<Slot<T>>` so a state can
//! be wholesale-replaced without cloning values: the unique CAS winner that
//! removes an entry from a snapshot *takes* the value out, while observers
//! holding older snapshots may still *read* it under a transient guard
//! state. Fill is one-shot too, which is what makes a listener fire exactly
//! once no matter how many mutators race to service it.
//!
//! Same discipline as [`AtomicWaker`](crate::atomic_waker): a transient
//! state value acts as an exclusive ticket for the `UnsafeCell`.
//!
//! 由原子状态机保护的一次性值槽。
//!
//! 快照状态通过 `Arc<Slot<T>>` 持有负载，因此状态可以整体替换而无需克隆值：
//! 赢得 CAS、将条目从快照中移除的唯一胜者负责*取出*值，
//! 而持有旧快照的观察者仍可在瞬态保护状态下*读取*它。
//! 填充同样是一次性的，这保证了无论多少修改者竞争服务某个监听器，
//! 它都恰好触发一次。
//!
//! 与 [`AtomicWaker`](crate::atomic_waker) 采用相同的纪律：
//! 瞬态状态值充当 `UnsafeCell` 的独占票据。

use crate::shim::atomic::{AtomicU8, Ordering};
use crate::shim::cell::UnsafeCell;
use crate::shim::hint::spin_loop;

// Slot states
const EMPTY: u8 = 0; // no value yet
const WRITING: u8 = 1; // fill in progress (exclusive)
const FULL: u8 = 2; // value present
const READING: u8 = 3; // concurrent read in progress (exclusive, transient)
const TAKEN: u8 = 4; // value moved out, terminal

/// One-shot value cell: fill once, take once, read concurrently.
///
/// 一次性值单元：填充一次，取出一次，可并发读取。
pub(crate) struct Slot<T> {
    state: AtomicU8,
    value: UnsafeCell<Option<T>>,
}

// SAFETY: the cell is only touched while holding one of the exclusive
// transient states (WRITING/READING) or after winning the FULL -> TAKEN
// transition, so aliased access never happens.
unsafe impl<T: Send> Send for Slot<T> {}
unsafe impl<T: Send> Sync for Slot<T> {}

impl<T> Slot<T> {
    /// Create an empty slot, to be filled exactly once.
    ///
    /// 创建一个空槽，之后恰好填充一次。
    #[inline]
    pub(crate) fn empty() -> Self {
        Self {
            state: AtomicU8::new(EMPTY),
            value: UnsafeCell::new(None),
        }
    }

    /// Create a slot already holding `value`.
    ///
    /// 创建一个已持有 `value` 的槽。
    #[inline]
    pub(crate) fn full(value: T) -> Self {
        Self {
            state: AtomicU8::new(FULL),
            value: UnsafeCell::new(Some(value)),
        }
    }

    /// Fill the slot. Returns `Err(value)` if it was already filled or taken.
    ///
    /// The one-shot guarantee of listeners lives here: a second fill loses
    /// and gets its value back instead of clobbering the first.
    ///
    /// 填充槽。如果已被填充或取出则返回 `Err(value)`。
    ///
    /// 监听器的一次性保证就在这里：第二次填充会失败并拿回自己的值，
    /// 而不是覆盖第一次。
    pub(crate) fn fill(&self, value: T) -> Result<(), T> {
        match self
            .state
            .compare_exchange(EMPTY, WRITING, Ordering::Acquire, Ordering::Acquire)
        {
            Ok(_) => {
                // SAFETY: WRITING grants exclusive cell access.
                self.value.with_mut(|cell| unsafe { *cell = Some(value) });
                self.state.store(FULL, Ordering::Release);
                Ok(())
            }
            Err(_) => Err(value),
        }
    }

    /// Move the value out. Caller must be the unique logical owner (the CAS
    /// winner that removed this slot's entry from a snapshot).
    ///
    /// Returns `None` if the slot was never filled or was already taken.
    /// Spins past an in-flight `fill` or `read_with`; both are bounded
    /// (a store or a clone).
    ///
    /// 将值移出。调用者必须是唯一的逻辑所有者
    /// （即赢得 CAS、将此槽条目从快照中移除的一方）。
    ///
    /// 若槽从未填充或已被取出则返回 `None`。
    /// 会自旋越过进行中的 `fill` 或 `read_with`；二者都有界
    /// （一次存储或一次克隆）。
    pub(crate) fn take(&self) -> Option<T> {
        loop {
            match self
                .state
                .compare_exchange(FULL, TAKEN, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => {
                    // SAFETY: winning FULL -> TAKEN grants exclusive access;
                    // no other party touches the cell after TAKEN.
                    return self.value.with_mut(|cell| unsafe { (*cell).take() });
                }
                Err(EMPTY) | Err(TAKEN) => return None,
                Err(_) => spin_loop(), // WRITING or READING in flight
            }
        }
    }

    /// Read the value in place without consuming it.
    ///
    /// `f` typically clones. Returns `None` if there is no value (never
    /// filled, or already taken by its owner).
    ///
    /// 原地读取值而不消费它。
    ///
    /// `f` 通常执行克隆。若没有值（从未填充或已被所有者取出）则返回 `None`。
    pub(crate) fn read_with<R>(&self, f: impl Fn(&T) -> R) -> Option<R> {
        loop {
            match self
                .state
                .compare_exchange(FULL, READING, Ordering::Acquire, Ordering::Acquire)
            {
                Ok(_) => {
                    // SAFETY: READING grants exclusive cell access until the
                    // state is restored below. The value is present: only
                    // this reader can move the state away from READING.
                    let out = self.value.with(|cell| unsafe {
                        (*cell).as_ref().map(|v| f(v))
                    });
                    self.state.store(FULL, Ordering::Release);
                    return out;
                }
                Err(EMPTY) | Err(TAKEN) => return None,
                Err(_) => spin_loop(), // WRITING or a concurrent READING
            }
        }
    }

}

impl<T> Drop for Slot<T> {
    fn drop(&mut self) {
        // SAFETY: exclusive access during drop; dropping the Option drops a
        // still-present value.
        self.value.with_mut(|cell| unsafe {
            let _ = (*cell).take();
        });
    }
}

impl<T> std::fmt::Debug for Slot<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Slot")
            .field("state", &self.state.load(Ordering::Acquire))
            .finish()
    }
}

//! Multi-element buffered queue with interchangeable backpressure policies.
//!
//! A [`Queue`] is either in `Deficit` (no buffered elements; pending peeks
//! and takes wait) or `Surplus` (buffered elements; under [`Bounded`]
//! backpressure, pending offers wait once the buffer is full). Every
//! operation, batch offers included, is a single CAS transition on a
//! [`SnapshotCell`], so a batch is partitioned into (satisfy takers / fit in
//! buffer / register as pending) atomically, never partially visible.
//!
//! Fairness: when the buffer and pending offers both exist, a take drains
//! the buffer head and promotes the oldest pending offer's next element into
//! the buffer tail within the same CAS, preserving FIFO order across both
//! sources. Peeks are broadcast like `MVar::read` and unordered relative to
//! each other.
//!
//! Dropping any suspended future is the cancel action for exactly that
//! registration. A serviced-but-unobserved `take` reinstates its element at
//! the buffer head, so `take().await` is cancel-safe in `select!` loops.
//!
//! [`Bounded`]: BackpressureStrategy::Bounded
//!
//! 具有可互换背压策略的多元素缓冲队列。
//!
//! [`Queue`] 要么处于 `Deficit`（无缓冲元素；等待中的 peek 与 take 挂起），
//! 要么处于 `Surplus`（有缓冲元素；在 [`Bounded`] 背压下，缓冲区满后
//! 等待中的 offer 挂起）。每个操作 —— 包括批量 offer —— 都是
//! [`SnapshotCell`] 上的单次 CAS 转换，因此批量被原子地划分为
//! （满足 taker / 放入缓冲 / 注册等待），绝不会部分可见。
//!
//! 公平性：缓冲区与等待 offer 同时存在时，take 在同一次 CAS 中取走缓冲区
//! 头部并将最老等待 offer 的下一个元素提升到缓冲区尾部，
//! 保持两个来源整体的 FIFO 顺序。peek 像 `MVar::read` 一样广播，
//! 彼此之间无顺序保证。
//!
//! drop 任何挂起的 future 即是对该注册的取消动作。已被服务但未被观察的
//! `take` 会把元素放回缓冲区头部，因此 `take().await` 在 `select!`
//! 循环中是取消安全的。
//!
//! # Examples
//!
//! ```
//! use snap_sync::Queue;
//! use std::num::NonZeroUsize;
//!
//! # tokio_test::block_on(async {
//! let queue = Queue::bounded(NonZeroUsize::new(2).unwrap());
//!
//! queue.offer(1).await;
//! queue.offer(2).await;
//! assert_eq!(queue.try_offer(3), Err(3)); // full
//!
//! assert_eq!(queue.take().await, 1);
//! assert_eq!(queue.take().await, 2);
//! # });
//! ```

use std::future::Future;
use std::num::NonZeroUsize;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use im::{OrdMap, Vector};

use crate::slot::Slot;
use crate::snapshot::{SnapshotCell, Update};
use crate::token::Token;
use crate::waiter::{ReadEntry, Waiter};

/// Producer policy once a bounded buffer is full.
///
/// 有界缓冲区满后的生产者策略。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackpressureStrategy {
    /// Offers never block; the buffer grows without bound.
    ///
    /// offer 从不阻塞；缓冲区无界增长。
    Unbounded,
    /// Offers suspend once the buffer holds `capacity` elements.
    ///
    /// 缓冲区达到 `capacity` 后 offer 挂起。
    Bounded(NonZeroUsize),
    /// Offers never block; the oldest buffered element is evicted to admit
    /// a new one.
    ///
    /// offer 从不阻塞；淘汰最老的缓冲元素以接纳新元素。
    Sliding(NonZeroUsize),
    /// Offers never block; excess elements are discarded (their offers
    /// still resolve: accepted by policy, never left pending).
    ///
    /// offer 从不阻塞；超额元素被丢弃（其 offer 仍会解析 ——
    /// 按策略接纳，绝不滞留）。
    Dropping(NonZeroUsize),
}

/// A pending batch offer: the not-yet-admitted remainder plus its
/// completion listener. A single `offer` is a one-element batch.
///
/// 等待中的批量 offer：尚未接纳的剩余部分及其完成监听器。
/// 单个 `offer` 即单元素批量。
struct OfferEntry<A> {
    values: Vector<Arc<Slot<A>>>,
    done: Arc<Waiter<()>>,
}

impl<A> Clone for OfferEntry<A> {
    fn clone(&self) -> Self {
        Self {
            values: self.values.clone(),
            done: self.done.clone(),
        }
    }
}

// Invariants: buffer non-empty only in Surplus; offers pending only under
// Bounded with the buffer at capacity; peeks/takes populate only in Deficit.
enum QueueState<A> {
    Deficit {
        peeks: OrdMap<Token, ReadEntry<A>>,
        takes: OrdMap<Token, Arc<Waiter<A>>>,
    },
    Surplus {
        buffer: Vector<Arc<Slot<A>>>,
        offers: OrdMap<Token, OfferEntry<A>>,
    },
}

impl<A> QueueState<A> {
    fn deficit() -> Self {
        QueueState::Deficit {
            peeks: OrdMap::new(),
            takes: OrdMap::new(),
        }
    }
}

/// Post-CAS notifications owed by a successful offer transition.
///
/// offer 转换成功后应执行的 CAS 后通知。
struct OfferNotify<A> {
    /// Takers serviced directly, each paired with the slot it consumes.
    handed: Vec<(Arc<Waiter<A>>, Arc<Slot<A>>)>,
    /// Pending peeks to broadcast, with the master copy of the first
    /// offered element (cloned while the batch was still owned).
    peeks: Option<(OrdMap<Token, ReadEntry<A>>, A)>,
}

impl<A> OfferNotify<A> {
    fn none() -> Self {
        Self {
            handed: Vec::new(),
            peeks: None,
        }
    }
}

enum OfferOutcome<A> {
    /// Whole batch admitted (or resolved by policy).
    Done(OfferNotify<A>),
    /// Admitted up to capacity; the remainder registered as pending.
    Registered(OfferNotify<A>),
    /// Try-mode rejection: nothing changed, nothing visible.
    Rejected,
}

enum TakeOutcome<A> {
    Took {
        value: Arc<Slot<A>>,
        /// Listener of a pending offer whose last element was promoted.
        finished_offer: Option<Arc<Waiter<()>>>,
    },
    Unavailable,
    Registered,
}

enum PeekStep<A> {
    Front(Arc<Slot<A>>),
    Registered,
}

/// Buffered queue with pluggable backpressure.
///
/// 具有可插拔背压的缓冲队列。
pub struct Queue<A> {
    strategy: BackpressureStrategy,
    cell: SnapshotCell<QueueState<A>>,
}

impl<A> std::fmt::Debug for Queue<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Queue")
            .field("strategy", &self.strategy)
            .field("size", &self.size())
            .finish()
    }
}

impl<A> Queue<A> {
    /// Create a queue with the given backpressure strategy.
    ///
    /// 以给定背压策略创建队列。
    #[inline]
    pub fn with_strategy(strategy: BackpressureStrategy) -> Self {
        Self {
            strategy,
            cell: SnapshotCell::new(QueueState::deficit()),
        }
    }

    /// Offers never suspend; the buffer grows without bound.
    ///
    /// offer 从不挂起；缓冲区无界增长。
    #[inline]
    pub fn unbounded() -> Self {
        Self::with_strategy(BackpressureStrategy::Unbounded)
    }

    /// Offers suspend once `capacity` elements are buffered.
    ///
    /// 缓冲达到 `capacity` 后 offer 挂起。
    #[inline]
    pub fn bounded(capacity: NonZeroUsize) -> Self {
        Self::with_strategy(BackpressureStrategy::Bounded(capacity))
    }

    /// Oldest buffered elements are evicted to admit new ones.
    ///
    /// 淘汰最老的缓冲元素以接纳新元素。
    #[inline]
    pub fn sliding(capacity: NonZeroUsize) -> Self {
        Self::with_strategy(BackpressureStrategy::Sliding(capacity))
    }

    /// Excess elements are discarded once at capacity.
    ///
    /// 达到容量后丢弃超额元素。
    #[inline]
    pub fn dropping(capacity: NonZeroUsize) -> Self {
        Self::with_strategy(BackpressureStrategy::Dropping(capacity))
    }

    /// The queue's backpressure strategy.
    ///
    /// 队列的背压策略。
    #[inline]
    pub fn strategy(&self) -> BackpressureStrategy {
        self.strategy
    }

    /// Snapshot count: buffered plus pending-offer elements, or the negated
    /// number of blocked takers when in deficit. Diagnostic, not a hard
    /// contract.
    ///
    /// 快照计数：缓冲元素加等待 offer 的元素；处于 deficit 时为
    /// 被阻塞 taker 数的相反数。仅用于诊断，不构成硬性契约。
    pub fn size(&self) -> isize {
        self.cell.read(|state| match state {
            QueueState::Deficit { takes, .. } => -(takes.len() as isize),
            QueueState::Surplus { buffer, offers } => {
                let pending: usize = offers.iter().map(|(_, e)| e.values.len()).sum();
                (buffer.len() + pending) as isize
            }
        })
    }

    /// Number of elements currently queued (buffered + pending offers).
    ///
    /// 当前排队的元素数（缓冲 + 等待 offer）。
    #[inline]
    pub fn len(&self) -> usize {
        self.size().max(0) as usize
    }

    /// Whether no element is currently queued.
    ///
    /// 当前是否没有排队元素。
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.size() <= 0
    }

    // ========================================================================
    // Offer side
    // ========================================================================

    /// Non-blocking offer; `Err(value)` exactly when `Bounded` would
    /// otherwise suspend.
    ///
    /// 非阻塞 offer；恰在 `Bounded` 将会挂起时返回 `Err(value)`。
    pub fn try_offer(&self, value: A) -> Result<(), A> {
        let batch = vec![Arc::new(Slot::full(value))];
        match self.offer_transition(&batch, None) {
            OfferOutcome::Done(notify) => {
                self.notify_offer(notify);
                Ok(())
            }
            OfferOutcome::Rejected => match Self::recover(batch).pop() {
                Some(v) => Err(v),
                // Unreachable: a rejected batch was never shared.
                None => Ok(()),
            },
            OfferOutcome::Registered(_) => unreachable!("try offer cannot register"),
        }
    }

    /// Non-blocking, all-or-nothing batch offer; on `Err` the whole batch
    /// is returned and nothing is visible.
    ///
    /// 非阻塞、全有或全无的批量 offer；`Err` 时整个批量被归还，
    /// 且没有任何可见效果。
    pub fn try_offer_all(&self, batch: impl IntoIterator<Item = A>) -> Result<(), Vec<A>> {
        let batch: Vec<_> = batch
            .into_iter()
            .map(|v| Arc::new(Slot::full(v)))
            .collect();
        match self.offer_transition(&batch, None) {
            OfferOutcome::Done(notify) => {
                self.notify_offer(notify);
                Ok(())
            }
            OfferOutcome::Rejected => Err(Self::recover(batch)),
            OfferOutcome::Registered(_) => unreachable!("try offer cannot register"),
        }
    }

    /// Offer one element; suspends only under `Bounded` at capacity.
    ///
    /// offer 一个元素；仅在 `Bounded` 达到容量时挂起。
    #[inline]
    pub fn offer(&self, value: A) -> Offer<'_, A> {
        Offer {
            queue: self,
            batch: Some(vec![Arc::new(Slot::full(value))]),
            waiter: None,
        }
    }

    /// Offer a batch, partitioned atomically into (satisfy takers / fit in
    /// buffer / register as pending) in one transition. Resolves once every
    /// element is admitted or resolved by policy.
    ///
    /// offer 一个批量，在单次转换中原子划分为
    /// （满足 taker / 放入缓冲 / 注册等待）。
    /// 当每个元素都被接纳或按策略解析后完成。
    #[inline]
    pub fn offer_all(&self, batch: impl IntoIterator<Item = A>) -> Offer<'_, A> {
        Offer {
            queue: self,
            batch: Some(
                batch
                    .into_iter()
                    .map(|v| Arc::new(Slot::full(v)))
                    .collect(),
            ),
            waiter: None,
        }
    }

    // ========================================================================
    // Take side
    // ========================================================================

    /// Remove and return the oldest element, or `None` when none is
    /// buffered.
    ///
    /// 移除并返回最老的元素；无缓冲元素时返回 `None`。
    pub fn try_take(&self) -> Option<A> {
        loop {
            match self.take_transition(None) {
                TakeOutcome::Took {
                    value,
                    finished_offer,
                } => match self.notify_take(value, finished_offer) {
                    Some(v) => return Some(v),
                    // Raced a stale owner; the state advanced, reload.
                    None => continue,
                },
                _ => return None,
            }
        }
    }

    /// Take, suspending while no element is available.
    ///
    /// Cancel-safe: dropping the future after it was serviced but before the
    /// value was observed reinstates the element at the buffer head.
    ///
    /// take，在没有可用元素期间挂起。
    ///
    /// 取消安全：future 被服务后、值被观察前被 drop 时，
    /// 元素会被放回缓冲区头部。
    #[inline]
    pub fn take(&self) -> Take<'_, A> {
        Take {
            queue: self,
            waiter: None,
        }
    }

    /// Atomically drain the buffer plus all pending offers in one
    /// transition, waking every drained offer's listener. Returns the
    /// elements in FIFO order; empty when in deficit. Never suspends.
    ///
    /// 在单次转换中原子排空缓冲区与所有等待 offer，
    /// 唤醒每个被排空 offer 的监听器。按 FIFO 顺序返回元素；
    /// deficit 时返回空。从不挂起。
    pub fn take_all(&self) -> Vec<A> {
        let (buffer, offers) = self.cell.update(|state| match state {
            QueueState::Deficit { .. } => Update::Keep((Vector::new(), OrdMap::new())),
            QueueState::Surplus { buffer, offers } => Update::Swap(
                QueueState::deficit(),
                (buffer.clone(), offers.clone()),
            ),
        });

        let mut drained = Vec::with_capacity(buffer.len());
        for slot in buffer.iter() {
            if let Some(v) = slot.take() {
                drained.push(v);
            }
        }
        for (_, entry) in offers.iter() {
            for slot in entry.values.iter() {
                if let Some(v) = slot.take() {
                    drained.push(v);
                }
            }
            let _ = entry.done.complete(());
        }
        drained
    }

    // ========================================================================
    // Peek side (non-consuming, broadcast)
    // ========================================================================

    /// Observe the oldest element without removing it; `None` when none is
    /// buffered. Never suspends.
    ///
    /// 观察最老的元素但不移除；无缓冲元素时返回 `None`。从不挂起。
    pub fn try_peek(&self) -> Option<A>
    where
        A: Clone,
    {
        loop {
            let front = self.cell.read(|state| match state {
                QueueState::Deficit { .. } => None,
                QueueState::Surplus { buffer, .. } => buffer.front().cloned(),
            });
            match front {
                None => return None,
                Some(slot) => match slot.read_with(|v| v.clone()) {
                    Some(v) => return Some(v),
                    // Drained between the snapshot and the read; reload.
                    None => continue,
                },
            }
        }
    }

    /// Observe the oldest element, suspending while none is available.
    /// Broadcast: concurrent peeks are unordered relative to each other.
    ///
    /// 观察最老的元素，无可用元素期间挂起。
    /// 广播语义：并发 peek 彼此之间无顺序保证。
    #[inline]
    pub fn peek(&self) -> Peek<'_, A>
    where
        A: Clone,
    {
        Peek {
            queue: self,
            waiter: None,
        }
    }

    /// Observe every queued element (buffered plus pending offers,
    /// mirroring [`take_all`](Self::take_all)'s view), suspending while none
    /// is available.
    ///
    /// 观察所有排队元素（缓冲加等待 offer，与
    /// [`take_all`](Self::take_all) 的视角一致），无可用元素期间挂起。
    #[inline]
    pub fn peek_all(&self) -> PeekAll<'_, A>
    where
        A: Clone,
    {
        PeekAll {
            queue: self,
            waiter: None,
        }
    }

    // ========================================================================
    // Transitions (pure with respect to retries)
    // ========================================================================

    fn offer_transition(
        &self,
        batch: &[Arc<Slot<A>>],
        register: Option<(Token, &Arc<Waiter<()>>)>,
    ) -> OfferOutcome<A> {
        self.cell.update(|state| {
            if batch.is_empty() {
                return Update::Keep(OfferOutcome::Done(OfferNotify::none()));
            }
            match state {
                QueueState::Deficit { peeks, takes } => {
                    // Broadcast copy cloned from the still-owned first slot,
                    // per attempt, so delivery never races its new owner.
                    let broadcast = peeks.get_min().and_then(|(_, entry)| {
                        batch[0].read_with(|v| entry.clone_value(v))
                    });
                    let peek_notify = broadcast.map(|copy| (peeks.clone(), copy));

                    let k = takes.len().min(batch.len());
                    let handed: Vec<_> = takes
                        .iter()
                        .take(k)
                        .zip(batch.iter())
                        .map(|((_, waiter), slot)| (waiter.clone(), slot.clone()))
                        .collect();
                    let rem = &batch[k..];

                    if rem.is_empty() {
                        let mut remaining = takes.clone();
                        for (tok, _) in takes.iter().take(k) {
                            remaining = remaining.without(tok);
                        }
                        return Update::Swap(
                            QueueState::Deficit {
                                peeks: OrdMap::new(),
                                takes: remaining,
                            },
                            OfferOutcome::Done(OfferNotify {
                                handed,
                                peeks: peek_notify,
                            }),
                        );
                    }

                    // All takers satisfied; the remainder becomes the buffer
                    // per strategy.
                    let (buffer, leftover) = self.partition_into_empty_buffer(rem);
                    if leftover.is_empty() {
                        Update::Swap(
                            QueueState::Surplus {
                                buffer,
                                offers: OrdMap::new(),
                            },
                            OfferOutcome::Done(OfferNotify {
                                handed,
                                peeks: peek_notify,
                            }),
                        )
                    } else {
                        match register {
                            None => Update::Keep(OfferOutcome::Rejected),
                            Some((token, done)) => Update::Swap(
                                QueueState::Surplus {
                                    buffer,
                                    offers: OrdMap::new().update(
                                        token,
                                        OfferEntry {
                                            values: leftover,
                                            done: done.clone(),
                                        },
                                    ),
                                },
                                OfferOutcome::Registered(OfferNotify {
                                    handed,
                                    peeks: peek_notify,
                                }),
                            ),
                        }
                    }
                }
                QueueState::Surplus { buffer, offers } => {
                    let (next_buffer, leftover) =
                        self.partition_into_buffer(buffer, !offers.is_empty(), batch);
                    if leftover.is_empty() {
                        Update::Swap(
                            QueueState::Surplus {
                                buffer: next_buffer,
                                offers: offers.clone(),
                            },
                            OfferOutcome::Done(OfferNotify::none()),
                        )
                    } else {
                        match register {
                            None => Update::Keep(OfferOutcome::Rejected),
                            Some((token, done)) => Update::Swap(
                                QueueState::Surplus {
                                    buffer: next_buffer,
                                    offers: offers.update(
                                        token,
                                        OfferEntry {
                                            values: leftover,
                                            done: done.clone(),
                                        },
                                    ),
                                },
                                OfferOutcome::Registered(OfferNotify::none()),
                            ),
                        }
                    }
                }
            }
        })
    }

    /// Partition a remainder into a fresh buffer when no elements were
    /// buffered before. Returns (buffer, leftover-to-register).
    fn partition_into_empty_buffer(
        &self,
        rem: &[Arc<Slot<A>>],
    ) -> (Vector<Arc<Slot<A>>>, Vector<Arc<Slot<A>>>) {
        match self.strategy {
            BackpressureStrategy::Unbounded => {
                (rem.iter().cloned().collect(), Vector::new())
            }
            BackpressureStrategy::Bounded(cap) => {
                let fit = cap.get().min(rem.len());
                (
                    rem[..fit].iter().cloned().collect(),
                    rem[fit..].iter().cloned().collect(),
                )
            }
            BackpressureStrategy::Sliding(cap) => {
                // The most recent `cap` elements survive; evicted values
                // are simply dropped with their slots.
                let skip = rem.len().saturating_sub(cap.get());
                (rem[skip..].iter().cloned().collect(), Vector::new())
            }
            BackpressureStrategy::Dropping(cap) => {
                let fit = cap.get().min(rem.len());
                (rem[..fit].iter().cloned().collect(), Vector::new())
            }
        }
    }

    /// Partition a batch into an existing buffer. `offers_pending` forces
    /// new elements behind already-registered offers under `Bounded`.
    fn partition_into_buffer(
        &self,
        buffer: &Vector<Arc<Slot<A>>>,
        offers_pending: bool,
        batch: &[Arc<Slot<A>>],
    ) -> (Vector<Arc<Slot<A>>>, Vector<Arc<Slot<A>>>) {
        match self.strategy {
            BackpressureStrategy::Unbounded => {
                let mut next = buffer.clone();
                next.extend(batch.iter().cloned());
                (next, Vector::new())
            }
            BackpressureStrategy::Bounded(cap) => {
                let room = if offers_pending {
                    // FIFO: nothing may overtake a pending offer.
                    0
                } else {
                    cap.get().saturating_sub(buffer.len())
                };
                let fit = room.min(batch.len());
                let mut next = buffer.clone();
                next.extend(batch[..fit].iter().cloned());
                (next, batch[fit..].iter().cloned().collect())
            }
            BackpressureStrategy::Sliding(cap) => {
                let mut next = buffer.clone();
                next.extend(batch.iter().cloned());
                let excess = next.len().saturating_sub(cap.get());
                for _ in 0..excess {
                    next.pop_front();
                }
                (next, Vector::new())
            }
            BackpressureStrategy::Dropping(cap) => {
                let fit = cap.get().saturating_sub(buffer.len()).min(batch.len());
                let mut next = buffer.clone();
                next.extend(batch[..fit].iter().cloned());
                (next, Vector::new())
            }
        }
    }

    fn notify_offer(&self, notify: OfferNotify<A>) {
        if let Some((peeks, copy)) = notify.peeks {
            for (_, entry) in peeks.iter() {
                entry.deliver(&copy);
            }
        }
        for (waiter, slot) in notify.handed {
            // Handed slots never entered shared state; we still own them.
            if let Some(value) = slot.take() {
                let _ = waiter.complete(value);
            }
        }
    }

    fn take_transition(&self, register: Option<(Token, &Arc<Waiter<A>>)>) -> TakeOutcome<A> {
        self.cell.update(|state| match state {
            QueueState::Surplus { buffer, offers } => {
                let head = match buffer.front() {
                    Some(head) => head.clone(),
                    // Surplus implies a non-empty buffer.
                    None => unreachable!("surplus queue with empty buffer"),
                };
                let mut next_buffer = buffer.clone();
                next_buffer.pop_front();

                // Promote the oldest pending offer's next element into the
                // buffer tail within the same CAS.
                let mut next_offers = offers.clone();
                let mut finished_offer = None;
                if let Some((offer_token, entry)) = offers.get_min() {
                    let mut values = entry.values.clone();
                    if let Some(promoted) = values.pop_front() {
                        next_buffer.push_back(promoted);
                    }
                    if values.is_empty() {
                        next_offers = next_offers.without(offer_token);
                        finished_offer = Some(entry.done.clone());
                    } else {
                        next_offers = next_offers.update(
                            *offer_token,
                            OfferEntry {
                                values,
                                done: entry.done.clone(),
                            },
                        );
                    }
                }

                let next = if next_buffer.is_empty() && next_offers.is_empty() {
                    QueueState::deficit()
                } else {
                    QueueState::Surplus {
                        buffer: next_buffer,
                        offers: next_offers,
                    }
                };
                Update::Swap(
                    next,
                    TakeOutcome::Took {
                        value: head,
                        finished_offer,
                    },
                )
            }
            QueueState::Deficit { peeks, takes } => match register {
                None => Update::Keep(TakeOutcome::Unavailable),
                Some((token, waiter)) => Update::Swap(
                    QueueState::Deficit {
                        peeks: peeks.clone(),
                        takes: takes.update(token, waiter.clone()),
                    },
                    TakeOutcome::Registered,
                ),
            },
        })
    }

    fn notify_take(
        &self,
        value: Arc<Slot<A>>,
        finished_offer: Option<Arc<Waiter<()>>>,
    ) -> Option<A> {
        // We won the CAS that unlinked this slot: unique logical owner.
        let taken = value.take();
        if let Some(done) = finished_offer {
            let _ = done.complete(());
        }
        taken
    }

    /// Put a serviced-but-unobserved take's element back at the head.
    ///
    /// 将已服务但未被观察的 take 的元素放回头部。
    fn reinstate(&self, value: A) {
        let slot = Arc::new(Slot::full(value));
        let notify = self.cell.update(|state| match state {
            QueueState::Deficit { peeks, takes } => {
                let broadcast = peeks
                    .get_min()
                    .and_then(|(_, entry)| slot.read_with(|v| entry.clone_value(v)));
                let peek_notify = broadcast.map(|copy| (peeks.clone(), copy));
                match takes.get_min() {
                    Some((taker_token, taker)) => Update::Swap(
                        QueueState::Deficit {
                            peeks: OrdMap::new(),
                            takes: takes.without(taker_token),
                        },
                        OfferNotify {
                            handed: vec![(taker.clone(), slot.clone())],
                            peeks: peek_notify,
                        },
                    ),
                    None => Update::Swap(
                        QueueState::Surplus {
                            buffer: Vector::unit(slot.clone()),
                            offers: OrdMap::new(),
                        },
                        OfferNotify {
                            handed: Vec::new(),
                            peeks: peek_notify,
                        },
                    ),
                }
            }
            QueueState::Surplus { buffer, offers } => {
                // Head position restored; a bounded buffer may transiently
                // hold capacity + 1, and offers keep gating on len >= cap.
                let mut next = buffer.clone();
                next.push_front(slot.clone());
                Update::Swap(
                    QueueState::Surplus {
                        buffer: next,
                        offers: offers.clone(),
                    },
                    OfferNotify::none(),
                )
            }
        });
        self.notify_offer(notify);
    }

    fn recover(batch: Vec<Arc<Slot<A>>>) -> Vec<A> {
        batch.into_iter().filter_map(|slot| slot.take()).collect()
    }

    // ========================================================================
    // Cancellation: remove exactly one registration, no-op if serviced
    // ========================================================================

    fn cancel_offer(&self, token: Token) {
        self.cell.update(|state| match state {
            QueueState::Surplus { buffer, offers } if offers.contains_key(&token) => {
                Update::Swap(
                    QueueState::Surplus {
                        buffer: buffer.clone(),
                        offers: offers.without(&token),
                    },
                    (),
                )
            }
            _ => Update::Keep(()),
        });
    }

    fn cancel_take(&self, token: Token) {
        self.cell.update(|state| match state {
            QueueState::Deficit { peeks, takes } if takes.contains_key(&token) => Update::Swap(
                QueueState::Deficit {
                    peeks: peeks.clone(),
                    takes: takes.without(&token),
                },
                (),
            ),
            _ => Update::Keep(()),
        });
    }

    fn cancel_peek(&self, token: Token) {
        self.cell.update(|state| match state {
            QueueState::Deficit { peeks, takes } if peeks.contains_key(&token) => Update::Swap(
                QueueState::Deficit {
                    peeks: peeks.without(&token),
                    takes: takes.clone(),
                },
                (),
            ),
            _ => Update::Keep(()),
        });
    }

    /// Snapshot view of every queued element; `None` in deficit.
    fn try_view(&self) -> Option<Vec<A>>
    where
        A: Clone,
    {
        let view = self.cell.read(|state| match state {
            QueueState::Deficit { .. } => None,
            QueueState::Surplus { buffer, offers } => {
                Some((buffer.clone(), offers.clone()))
            }
        });
        let (buffer, offers) = view?;

        let mut out = Vec::with_capacity(buffer.len());
        for slot in buffer.iter() {
            if let Some(v) = slot.read_with(|v| v.clone()) {
                out.push(v);
            }
        }
        for (_, entry) in offers.iter() {
            for slot in entry.values.iter() {
                if let Some(v) = slot.read_with(|v| v.clone()) {
                    out.push(v);
                }
            }
        }
        if out.is_empty() {
            // Everything raced away; the caller reloads.
            None
        } else {
            Some(out)
        }
    }
}

// ============================================================================
// Futures
// ============================================================================

/// Future returned by [`Queue::offer`] and [`Queue::offer_all`].
///
/// [`Queue::offer`] 与 [`Queue::offer_all`] 返回的 future。
pub struct Offer<'a, A> {
    queue: &'a Queue<A>,
    batch: Option<Vec<Arc<Slot<A>>>>,
    waiter: Option<(Token, Arc<Waiter<()>>)>,
}

impl<A> Future for Offer<'_, A> {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let this = self.get_mut();

        if let Some((_, done)) = &this.waiter {
            let polled = done.poll_consume(cx);
            if polled.is_ready() {
                this.waiter = None;
            }
            return polled;
        }

        let Some(batch) = this.batch.take() else {
            return Poll::Ready(());
        };

        let token = Token::next();
        let done = Waiter::new();
        match this.queue.offer_transition(&batch, Some((token, &done))) {
            OfferOutcome::Done(notify) => {
                this.queue.notify_offer(notify);
                Poll::Ready(())
            }
            OfferOutcome::Registered(notify) => {
                this.queue.notify_offer(notify);
                this.waiter = Some((token, done.clone()));
                let polled = done.poll_consume(cx);
                if polled.is_ready() {
                    this.waiter = None;
                }
                polled
            }
            OfferOutcome::Rejected => unreachable!("registering offer cannot be rejected"),
        }
    }
}

impl<A> Drop for Offer<'_, A> {
    fn drop(&mut self) {
        if let Some((token, _)) = self.waiter.take() {
            // Abandons the not-yet-admitted remainder; admitted elements
            // stay queued.
            self.queue.cancel_offer(token);
        }
    }
}

impl<A> std::fmt::Debug for Offer<'_, A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Offer")
            .field("registered", &self.waiter.is_some())
            .finish()
    }
}

/// Future returned by [`Queue::take`].
///
/// [`Queue::take`] 返回的 future。
pub struct Take<'a, A> {
    queue: &'a Queue<A>,
    waiter: Option<(Token, Arc<Waiter<A>>)>,
}

impl<A> Future for Take<'_, A> {
    type Output = A;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<A> {
        let this = self.get_mut();

        if let Some((_, waiter)) = &this.waiter {
            let polled = waiter.poll_consume(cx);
            if polled.is_ready() {
                this.waiter = None;
            }
            return polled;
        }

        let token = Token::next();
        let waiter = Waiter::new();
        loop {
            match this.queue.take_transition(Some((token, &waiter))) {
                TakeOutcome::Took {
                    value,
                    finished_offer,
                } => match this.queue.notify_take(value, finished_offer) {
                    Some(v) => return Poll::Ready(v),
                    None => continue,
                },
                TakeOutcome::Registered => {
                    this.waiter = Some((token, waiter.clone()));
                    let polled = waiter.poll_consume(cx);
                    if polled.is_ready() {
                        this.waiter = None;
                    }
                    return polled;
                }
                TakeOutcome::Unavailable => unreachable!("registering take cannot be unavailable"),
            }
        }
    }
}

impl<A> Drop for Take<'_, A> {
    fn drop(&mut self) {
        if let Some((token, waiter)) = self.waiter.take() {
            self.queue.cancel_take(token);
            // Serviced after cancellation lost the race: reinstate.
            if let Some(value) = waiter.try_consume() {
                self.queue.reinstate(value);
            }
        }
    }
}

impl<A> std::fmt::Debug for Take<'_, A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Take")
            .field("registered", &self.waiter.is_some())
            .finish()
    }
}

/// Future returned by [`Queue::peek`].
///
/// [`Queue::peek`] 返回的 future。
pub struct Peek<'a, A>
where
    A: Clone,
{
    queue: &'a Queue<A>,
    waiter: Option<(Token, Arc<Waiter<A>>)>,
}

impl<A> Future for Peek<'_, A>
where
    A: Clone,
{
    type Output = A;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<A> {
        let this = self.get_mut();

        if let Some((_, waiter)) = &this.waiter {
            let polled = waiter.poll_consume(cx);
            if polled.is_ready() {
                this.waiter = None;
            }
            return polled;
        }

        let token = Token::next();
        let entry: ReadEntry<A> = ReadEntry::new();
        loop {
            let step = this.queue.cell.update(|state| match state {
                QueueState::Surplus { buffer, .. } => match buffer.front() {
                    Some(front) => Update::Keep(PeekStep::Front(front.clone())),
                    None => unreachable!("surplus queue with empty buffer"),
                },
                QueueState::Deficit { peeks, takes } => Update::Swap(
                    QueueState::Deficit {
                        peeks: peeks.update(token, entry.clone()),
                        takes: takes.clone(),
                    },
                    PeekStep::Registered,
                ),
            });

            match step {
                PeekStep::Front(slot) => match slot.read_with(|v| v.clone()) {
                    Some(v) => return Poll::Ready(v),
                    None => continue,
                },
                PeekStep::Registered => {
                    this.waiter = Some((token, entry.waiter().clone()));
                    let polled = entry.waiter().poll_consume(cx);
                    if polled.is_ready() {
                        this.waiter = None;
                    }
                    return polled;
                }
            }
        }
    }
}

impl<A> Drop for Peek<'_, A>
where
    A: Clone,
{
    fn drop(&mut self) {
        if let Some((token, _)) = self.waiter.take() {
            self.queue.cancel_peek(token);
        }
    }
}

impl<A> std::fmt::Debug for Peek<'_, A>
where
    A: Clone,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peek")
            .field("registered", &self.waiter.is_some())
            .finish()
    }
}

/// Future returned by [`Queue::peek_all`].
///
/// [`Queue::peek_all`] 返回的 future。
pub struct PeekAll<'a, A>
where
    A: Clone,
{
    queue: &'a Queue<A>,
    waiter: Option<(Token, Arc<Waiter<A>>)>,
}

impl<A> Future for PeekAll<'_, A>
where
    A: Clone,
{
    type Output = Vec<A>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Vec<A>> {
        let this = self.get_mut();

        if let Some((_, waiter)) = &this.waiter {
            return match waiter.poll_consume(cx) {
                Poll::Ready(head) => {
                    this.waiter = None;
                    // Prefer the full current view; if it raced away, the
                    // delivered head is still a faithful observation.
                    match this.queue.try_view() {
                        Some(view) => Poll::Ready(view),
                        None => Poll::Ready(vec![head]),
                    }
                }
                Poll::Pending => Poll::Pending,
            };
        }

        let token = Token::next();
        let entry: ReadEntry<A> = ReadEntry::new();
        loop {
            if let Some(view) = this.queue.try_view() {
                return Poll::Ready(view);
            }

            let registered = this.queue.cell.update(|state| match state {
                QueueState::Surplus { .. } => Update::Keep(false),
                QueueState::Deficit { peeks, takes } => Update::Swap(
                    QueueState::Deficit {
                        peeks: peeks.update(token, entry.clone()),
                        takes: takes.clone(),
                    },
                    true,
                ),
            });

            if registered {
                this.waiter = Some((token, entry.waiter().clone()));
                let polled = entry.waiter().poll_consume(cx);
                if polled.is_ready() {
                    this.waiter = None;
                }
                return polled.map(|head| vec![head]);
            }
            // Surplus appeared between the view and the registration
            // attempt; reload.
        }
    }
}

impl<A> Drop for PeekAll<'_, A>
where
    A: Clone,
{
    fn drop(&mut self) {
        if let Some((token, _)) = self.waiter.take() {
            self.queue.cancel_peek(token);
        }
    }
}

impl<A> std::fmt::Debug for PeekAll<'_, A>
where
    A: Clone,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeekAll")
            .field("registered", &self.waiter.is_some())
            .finish()
    }
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::*;

    fn cap(n: usize) -> NonZeroUsize {
        NonZeroUsize::new(n).unwrap()
    }

    #[test]
    fn test_unbounded_try_offer_take() {
        let queue = Queue::unbounded();
        assert!(queue.is_empty());

        for i in 0..10 {
            assert!(queue.try_offer(i).is_ok());
        }
        assert_eq!(queue.size(), 10);

        for i in 0..10 {
            assert_eq!(queue.try_take(), Some(i));
        }
        assert_eq!(queue.try_take(), None);
    }

    #[test]
    fn test_bounded_try_offer_rejects_at_capacity() {
        let queue = Queue::bounded(cap(2));
        assert!(queue.try_offer(1).is_ok());
        assert!(queue.try_offer(2).is_ok());
        assert_eq!(queue.try_offer(3), Err(3));

        assert_eq!(queue.try_take(), Some(1));
        assert!(queue.try_offer(3).is_ok());
    }

    #[test]
    fn test_sliding_keeps_most_recent() {
        let queue = Queue::sliding(cap(3));
        for i in 0..6 {
            assert!(queue.try_offer(i).is_ok());
        }
        assert_eq!(queue.take_all(), vec![3, 4, 5]);
    }

    #[test]
    fn test_dropping_keeps_first() {
        let queue = Queue::dropping(cap(3));
        for i in 0..6 {
            assert!(queue.try_offer(i).is_ok());
        }
        assert_eq!(queue.take_all(), vec![0, 1, 2]);
    }

    #[test]
    fn test_size_negative_with_blocked_takers() {
        let queue: Queue<u32> = Queue::unbounded();
        let mut t1 = tokio_test::task::spawn(queue.take());
        let mut t2 = tokio_test::task::spawn(queue.take());
        assert!(t1.poll().is_pending());
        assert!(t2.poll().is_pending());
        assert_eq!(queue.size(), -2);
        drop(t1);
        assert_eq!(queue.size(), -1);
        drop(t2);
    }

    #[tokio::test]
    async fn test_blocked_offer_proceeds_after_take() {
        let queue = Queue::bounded(cap(1));
        assert!(queue.try_offer(1).is_ok());

        let mut blocked = tokio_test::task::spawn(queue.offer(2));
        assert!(blocked.poll().is_pending());

        assert_eq!(queue.try_take(), Some(1));
        assert_eq!(blocked.poll(), Poll::Ready(()));
        assert_eq!(queue.try_take(), Some(2));
    }

    #[tokio::test]
    async fn test_fifo_across_buffer_and_pending_offers() {
        let queue = Queue::bounded(cap(2));
        assert!(queue.try_offer_all(vec![1, 2]).is_ok());

        let mut o3 = tokio_test::task::spawn(queue.offer(3));
        let mut o4 = tokio_test::task::spawn(queue.offer(4));
        assert!(o3.poll().is_pending());
        assert!(o4.poll().is_pending());

        for expect in 1..=4 {
            assert_eq!(queue.try_take(), Some(expect));
        }
        assert_eq!(queue.try_take(), None);
        assert_eq!(o3.poll(), Poll::Ready(()));
        assert_eq!(o4.poll(), Poll::Ready(()));
    }

    #[tokio::test]
    async fn test_take_all_drains_pending_offers() {
        let queue = Queue::bounded(cap(2));
        assert!(queue.try_offer_all(vec![1, 2]).is_ok());

        let mut blocked = tokio_test::task::spawn(queue.offer_all(vec![3, 4]));
        assert!(blocked.poll().is_pending());

        assert_eq!(queue.take_all(), vec![1, 2, 3, 4]);
        assert_eq!(blocked.poll(), Poll::Ready(()));
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_peek_does_not_consume() {
        let queue = Queue::unbounded();
        assert!(queue.try_offer("a").is_ok());

        assert_eq!(queue.peek().await, "a");
        assert_eq!(queue.try_peek(), Some("a"));
        assert_eq!(queue.try_take(), Some("a"));
        assert_eq!(queue.try_peek(), None);
    }

    #[tokio::test]
    async fn test_peek_broadcast_on_offer() {
        let queue = Queue::unbounded();

        let mut p1 = tokio_test::task::spawn(queue.peek());
        let mut p2 = tokio_test::task::spawn(queue.peek());
        assert!(p1.poll().is_pending());
        assert!(p2.poll().is_pending());

        assert!(queue.try_offer(7).is_ok());
        assert_eq!(p1.poll(), Poll::Ready(7));
        assert_eq!(p2.poll(), Poll::Ready(7));
        assert_eq!(queue.try_take(), Some(7));
    }

    #[tokio::test]
    async fn test_peek_all_sees_pending_offers() {
        let queue = Queue::bounded(cap(2));
        assert!(queue.try_offer_all(vec![1, 2]).is_ok());
        let mut blocked = tokio_test::task::spawn(queue.offer(3));
        assert!(blocked.poll().is_pending());

        assert_eq!(queue.peek_all().await, vec![1, 2, 3]);
        // Nothing consumed.
        assert_eq!(queue.size(), 3);
    }

    #[tokio::test]
    async fn test_cancelled_take_leaves_others_intact() {
        let queue = Queue::unbounded();

        let mut cancelled = tokio_test::task::spawn(queue.take());
        let mut kept = tokio_test::task::spawn(queue.take());
        assert!(cancelled.poll().is_pending());
        assert!(kept.poll().is_pending());

        drop(cancelled);
        assert!(queue.try_offer(5).is_ok());
        assert_eq!(kept.poll(), Poll::Ready(5));
    }

    #[tokio::test]
    async fn test_serviced_but_dropped_take_reinstates_at_head() {
        let queue = Queue::unbounded();

        let mut pending = tokio_test::task::spawn(queue.take());
        assert!(pending.poll().is_pending());

        assert!(queue.try_offer_all(vec![1, 2]).is_ok());
        // `pending` was handed 1 directly; 2 went to the buffer.
        drop(pending);

        assert_eq!(queue.try_take(), Some(1));
        assert_eq!(queue.try_take(), Some(2));
    }
}

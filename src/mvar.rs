//! Single-slot suspending cell enforcing at-most-one resident value.
//!
//! An [`MVar`] is either `Empty` (holding pending reads and takes) or `Full`
//! (holding the resident value and pending puts). Every operation is one CAS
//! transition on a [`SnapshotCell`]; all listener notifications run strictly
//! after the CAS. Puts are serviced FIFO relative to registered takers;
//! every successful put resolves exactly one pending take (unicast) and
//! notifies all pending reads (broadcast).
//!
//! Suspending operations return named futures; dropping such a future is the
//! cancel action for exactly that registration and never disturbs any other
//! waiter. A `take` that was serviced but dropped before observing its value
//! reinstates the value into the cell, so `take().await` is cancel-safe in
//! `select!` loops.
//!
//! 强制至多一个驻留值的单槽挂起单元。
//!
//! [`MVar`] 要么为 `Empty`（持有等待中的 read 与 take），要么为 `Full`
//! （持有驻留值与等待中的 put）。每个操作都是 [`SnapshotCell`] 上的一次
//! CAS 转换；所有监听器通知严格发生在 CAS 之后。put 相对已注册的 taker
//! 按 FIFO 服务；每次成功的 put 恰好解析一个等待的 take（单播），
//! 并通知所有等待的 read（广播）。
//!
//! 挂起操作返回命名 future；drop 该 future 即是对该注册的取消动作，
//! 绝不影响其他等待者。已被服务但在观察到值之前被 drop 的 `take`
//! 会把值重新放回单元，因此 `take().await` 在 `select!` 循环中是取消安全的。
//!
//! # Examples
//!
//! ```
//! use snap_sync::MVar;
//! use std::sync::Arc;
//!
//! # tokio_test::block_on(async {
//! let mvar = Arc::new(MVar::new());
//!
//! let taker = {
//!     let mvar = mvar.clone();
//!     tokio::spawn(async move { mvar.take().await })
//! };
//!
//! mvar.put(7).await;
//! assert_eq!(taker.await.unwrap(), 7);
//! # });
//! ```

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use im::OrdMap;

use crate::slot::Slot;
use crate::snapshot::{SnapshotCell, Update};
use crate::token::Token;
use crate::waiter::{ReadEntry, Waiter};

/// A put waiting for the cell to empty: the value it carries plus its
/// completion listener.
///
/// 等待单元变空的 put：其携带的值与完成监听器。
struct PutEntry<A> {
    value: Arc<Slot<A>>,
    done: Arc<Waiter<()>>,
}

impl<A> Clone for PutEntry<A> {
    fn clone(&self) -> Self {
        Self {
            value: self.value.clone(),
            done: self.done.clone(),
        }
    }
}

// Invariants: exactly one variant is observable at a time; reads/takes
// populate only while Empty; puts queue only while Full.
enum MVarState<A> {
    Empty {
        reads: OrdMap<Token, ReadEntry<A>>,
        takes: OrdMap<Token, Arc<Waiter<A>>>,
    },
    Full {
        value: Arc<Slot<A>>,
        puts: OrdMap<Token, PutEntry<A>>,
    },
}

impl<A> MVarState<A> {
    fn empty() -> Self {
        MVarState::Empty {
            reads: OrdMap::new(),
            takes: OrdMap::new(),
        }
    }
}

/// What a successful put transition has to notify, strictly post-CAS.
///
/// put 转换成功后需要（严格在 CAS 之后）执行的通知。
enum PutOutcome<A> {
    /// Delivered straight to the oldest pending take; cell stays Empty.
    Handed {
        taker: Arc<Waiter<A>>,
        reads: OrdMap<Token, ReadEntry<A>>,
        broadcast: Option<A>,
    },
    /// Became the resident value.
    Installed {
        reads: OrdMap<Token, ReadEntry<A>>,
        broadcast: Option<A>,
    },
    /// Cell was Full; nothing changed.
    Rejected,
    /// Cell was Full; registered as a pending put.
    Registered,
}

enum TakeOutcome<A> {
    /// Got the resident value; `promoted` is the adopted put's listener.
    Took {
        value: Arc<Slot<A>>,
        promoted: Option<Arc<Waiter<()>>>,
    },
    /// Cell was Empty; nothing changed.
    Unavailable,
    /// Cell was Empty; registered as a pending take.
    Registered,
}

enum ReadStep<A> {
    Resident(Arc<Slot<A>>),
    Registered,
}

/// Single-slot synchronization cell.
///
/// 单槽同步单元。
pub struct MVar<A> {
    cell: SnapshotCell<MVarState<A>>,
}

impl<A> std::fmt::Debug for MVar<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MVar")
            .field("is_empty", &self.is_empty())
            .finish()
    }
}

impl<A> Default for MVar<A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A> MVar<A> {
    /// Create an empty cell.
    ///
    /// 创建一个空单元。
    #[inline]
    pub fn new() -> Self {
        Self {
            cell: SnapshotCell::new(MVarState::empty()),
        }
    }

    /// Create a cell already holding `value`.
    ///
    /// 创建一个已持有 `value` 的单元。
    #[inline]
    pub fn with_value(value: A) -> Self {
        Self {
            cell: SnapshotCell::new(MVarState::Full {
                value: Arc::new(Slot::full(value)),
                puts: OrdMap::new(),
            }),
        }
    }

    /// Pure snapshot read; never suspends.
    ///
    /// 纯快照读取；从不挂起。
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.cell.read(|s| matches!(s, MVarState::Empty { .. }))
    }

    /// Pure snapshot read; never suspends.
    ///
    /// 纯快照读取；从不挂起。
    #[inline]
    pub fn is_not_empty(&self) -> bool {
        !self.is_empty()
    }

    /// Install `value` unless the cell is Full.
    ///
    /// On success the value goes straight to the oldest pending take if one
    /// exists, else becomes resident; all pending reads receive a clone
    /// either way. `Err(value)` returns ownership when the cell is Full.
    ///
    /// 若单元非 Full 则放入 `value`。
    ///
    /// 成功时，值直接交给最老的等待 take（若有），否则成为驻留值；
    /// 两种情况下所有等待的 read 都会收到克隆。
    /// 单元为 Full 时通过 `Err(value)` 归还所有权。
    pub fn try_put(&self, value: A) -> Result<(), A> {
        let slot = Arc::new(Slot::full(value));
        let outcome = self.put_transition(&slot, None);
        if self.notify_put(&slot, outcome) {
            Ok(())
        } else {
            // Rejected: reclaim the value out of our own slot.
            match slot.take() {
                Some(v) => Err(v),
                // A rejected put's slot was never shared.
                None => Ok(()),
            }
        }
    }

    /// Put, suspending while the cell is Full.
    ///
    /// Registers under a fresh token when it cannot complete synchronously;
    /// dropping the returned future removes exactly that registration.
    ///
    /// put，在单元为 Full 期间挂起。
    ///
    /// 无法同步完成时以新 token 注册；
    /// drop 返回的 future 会精确移除该注册。
    #[inline]
    pub fn put(&self, value: A) -> Put<'_, A> {
        Put {
            mvar: self,
            value: Some(Arc::new(Slot::full(value))),
            waiter: None,
        }
    }

    /// Take the resident value, or `None` when Empty.
    ///
    /// With queued puts, the oldest put's value is adopted as the new
    /// resident value in the same CAS (its listener fires after), preserving
    /// FIFO put order.
    ///
    /// 取出驻留值，Empty 时返回 `None`。
    ///
    /// 存在排队 put 时，最老 put 的值在同一次 CAS 中被采纳为新驻留值
    /// （其监听器随后触发），保持 put 的 FIFO 顺序。
    pub fn try_take(&self) -> Option<A> {
        match self.take_transition(None) {
            TakeOutcome::Took { value, promoted } => self.notify_take(value, promoted),
            _ => None,
        }
    }

    /// Take, suspending while the cell is Empty.
    ///
    /// Cancel-safe: dropping the future after it was serviced but before the
    /// value was observed reinstates the value into the cell.
    ///
    /// take，在单元为 Empty 期间挂起。
    ///
    /// 取消安全：future 被服务后、值被观察前被 drop 时，
    /// 值会被放回单元。
    #[inline]
    pub fn take(&self) -> Take<'_, A> {
        Take {
            mvar: self,
            waiter: None,
        }
    }

    /// Read the resident value without consuming it, suspending while Empty.
    ///
    /// Pending reads are broadcast on every subsequent successful put and
    /// are unordered relative to each other.
    ///
    /// 读取驻留值但不消费，Empty 期间挂起。
    ///
    /// 等待中的 read 在之后每次成功 put 时被广播，彼此之间无顺序保证。
    #[inline]
    pub fn read(&self) -> Read<'_, A>
    where
        A: Clone,
    {
        Read {
            mvar: self,
            waiter: None,
        }
    }

    // ========================================================================
    // Transitions (pure with respect to retries) and post-CAS notification
    // ========================================================================

    fn put_transition(
        &self,
        slot: &Arc<Slot<A>>,
        register: Option<(Token, &Arc<Waiter<()>>)>,
    ) -> PutOutcome<A> {
        self.cell.update(|state| match state {
            MVarState::Empty { reads, takes } => {
                // Broadcast copy is cloned from our still-owned slot, per
                // attempt, so post-CAS delivery never races the value's
                // eventual owner.
                let broadcast = reads
                    .get_min()
                    .and_then(|(_, entry)| slot.read_with(|v| entry.clone_value(v)));
                match takes.get_min() {
                    Some((taker_token, taker)) => Update::Swap(
                        MVarState::Empty {
                            reads: OrdMap::new(),
                            takes: takes.without(taker_token),
                        },
                        PutOutcome::Handed {
                            taker: taker.clone(),
                            reads: reads.clone(),
                            broadcast,
                        },
                    ),
                    None => Update::Swap(
                        MVarState::Full {
                            value: slot.clone(),
                            puts: OrdMap::new(),
                        },
                        PutOutcome::Installed {
                            reads: reads.clone(),
                            broadcast,
                        },
                    ),
                }
            }
            MVarState::Full { value, puts } => match register {
                None => Update::Keep(PutOutcome::Rejected),
                Some((token, done)) => Update::Swap(
                    MVarState::Full {
                        value: value.clone(),
                        puts: puts.update(
                            token,
                            PutEntry {
                                value: slot.clone(),
                                done: done.clone(),
                            },
                        ),
                    },
                    PutOutcome::Registered,
                ),
            },
        })
    }

    /// Returns whether the put completed (handed over or installed).
    fn notify_put(&self, slot: &Arc<Slot<A>>, outcome: PutOutcome<A>) -> bool {
        match outcome {
            PutOutcome::Handed {
                taker,
                reads,
                broadcast,
            } => {
                if let Some(copy) = broadcast {
                    for (_, entry) in reads.iter() {
                        entry.deliver(&copy);
                    }
                }
                // The slot never became shared on this path; we still own it.
                if let Some(value) = slot.take() {
                    let _ = taker.complete(value);
                }
                true
            }
            PutOutcome::Installed { reads, broadcast } => {
                if let Some(copy) = broadcast {
                    for (_, entry) in reads.iter() {
                        entry.deliver(&copy);
                    }
                }
                true
            }
            PutOutcome::Rejected => false,
            PutOutcome::Registered => false,
        }
    }

    fn take_transition(&self, register: Option<(Token, &Arc<Waiter<A>>)>) -> TakeOutcome<A> {
        self.cell.update(|state| match state {
            MVarState::Full { value, puts } => match puts.get_min() {
                Some((put_token, put)) => Update::Swap(
                    MVarState::Full {
                        value: put.value.clone(),
                        puts: puts.without(put_token),
                    },
                    TakeOutcome::Took {
                        value: value.clone(),
                        promoted: Some(put.done.clone()),
                    },
                ),
                None => Update::Swap(
                    MVarState::empty(),
                    TakeOutcome::Took {
                        value: value.clone(),
                        promoted: None,
                    },
                ),
            },
            MVarState::Empty { reads, takes } => match register {
                None => Update::Keep(TakeOutcome::Unavailable),
                Some((token, waiter)) => Update::Swap(
                    MVarState::Empty {
                        reads: reads.clone(),
                        takes: takes.update(token, waiter.clone()),
                    },
                    TakeOutcome::Registered,
                ),
            },
        })
    }

    fn notify_take(&self, value: Arc<Slot<A>>, promoted: Option<Arc<Waiter<()>>>) -> Option<A> {
        // We won the CAS that unlinked this slot, so we are its unique
        // logical owner.
        let taken = value.take();
        if let Some(done) = promoted {
            let _ = done.complete(());
        }
        taken
    }

    /// Put-equivalent transition used when a serviced take is dropped
    /// before observing its value. Never fails: when the cell is Full the
    /// value queues as a detached pending put that services normally.
    ///
    /// 已服务的 take 在观察到值之前被 drop 时使用的等效 put 转换。
    /// 永不失败：单元为 Full 时，值作为游离的等待 put 排队并正常被服务。
    fn reinstate(&self, value: A) {
        let slot = Arc::new(Slot::full(value));
        let token = Token::next();
        let detached = Waiter::new();
        let outcome = self.put_transition(&slot, Some((token, &detached)));
        self.notify_put(&slot, outcome);
    }

    // ========================================================================
    // Cancellation: remove exactly one registration, no-op if serviced
    // ========================================================================

    fn cancel_put(&self, token: Token) {
        self.cell.update(|state| match state {
            MVarState::Full { value, puts } if puts.contains_key(&token) => Update::Swap(
                MVarState::Full {
                    value: value.clone(),
                    puts: puts.without(&token),
                },
                (),
            ),
            _ => Update::Keep(()),
        });
    }

    fn cancel_take(&self, token: Token) {
        self.cell.update(|state| match state {
            MVarState::Empty { reads, takes } if takes.contains_key(&token) => Update::Swap(
                MVarState::Empty {
                    reads: reads.clone(),
                    takes: takes.without(&token),
                },
                (),
            ),
            _ => Update::Keep(()),
        });
    }

    fn cancel_read(&self, token: Token) {
        self.cell.update(|state| match state {
            MVarState::Empty { reads, takes } if reads.contains_key(&token) => Update::Swap(
                MVarState::Empty {
                    reads: reads.without(&token),
                    takes: takes.clone(),
                },
                (),
            ),
            _ => Update::Keep(()),
        });
    }
}

// ============================================================================
// Futures
// ============================================================================

/// Future returned by [`MVar::put`].
///
/// [`MVar::put`] 返回的 future。
pub struct Put<'a, A> {
    mvar: &'a MVar<A>,
    value: Option<Arc<Slot<A>>>,
    waiter: Option<(Token, Arc<Waiter<()>>)>,
}

impl<A> Future for Put<'_, A> {
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

        let Some(slot) = this.value.take() else {
            // Already completed; a resolved future polled again stays ready.
            return Poll::Ready(());
        };

        let token = Token::next();
        let done = Waiter::new();
        let outcome = this.mvar.put_transition(&slot, Some((token, &done)));
        if this.mvar.notify_put(&slot, outcome) {
            return Poll::Ready(());
        }

        this.waiter = Some((token, done.clone()));
        let polled = done.poll_consume(cx);
        if polled.is_ready() {
            this.waiter = None;
        }
        polled
    }
}

impl<A> Drop for Put<'_, A> {
    fn drop(&mut self) {
        if let Some((token, _)) = self.waiter.take() {
            // No-op if a take already adopted our value.
            self.mvar.cancel_put(token);
        }
    }
}

impl<A> std::fmt::Debug for Put<'_, A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Put")
            .field("registered", &self.waiter.is_some())
            .finish()
    }
}

/// Future returned by [`MVar::take`].
///
/// [`MVar::take`] 返回的 future。
pub struct Take<'a, A> {
    mvar: &'a MVar<A>,
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
            match this.mvar.take_transition(Some((token, &waiter))) {
                TakeOutcome::Took { value, promoted } => {
                    match this.mvar.notify_take(value, promoted) {
                        Some(v) => return Poll::Ready(v),
                        // Resident slot drained by a stale owner: the state
                        // has necessarily advanced, try again.
                        None => continue,
                    }
                }
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
            self.mvar.cancel_take(token);
            // Serviced after cancellation lost the race: put the value back.
            if let Some(value) = waiter.try_consume() {
                self.mvar.reinstate(value);
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

/// Future returned by [`MVar::read`].
///
/// [`MVar::read`] 返回的 future。
pub struct Read<'a, A>
where
    A: Clone,
{
    mvar: &'a MVar<A>,
    waiter: Option<(Token, Arc<Waiter<A>>)>,
}

impl<A> Future for Read<'_, A>
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
            let step = this.mvar.cell.update(|state| match state {
                MVarState::Full { value, .. } => Update::Keep(ReadStep::Resident(value.clone())),
                MVarState::Empty { reads, takes } => Update::Swap(
                    MVarState::Empty {
                        reads: reads.update(token, entry.clone()),
                        takes: takes.clone(),
                    },
                    ReadStep::Registered,
                ),
            });

            match step {
                ReadStep::Resident(slot) => match slot.read_with(|v| v.clone()) {
                    Some(v) => return Poll::Ready(v),
                    // Lost the race against the resident value's taker; the
                    // state has advanced, reload.
                    None => continue,
                },
                ReadStep::Registered => {
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

impl<A> Drop for Read<'_, A>
where
    A: Clone,
{
    fn drop(&mut self) {
        if let Some((token, _)) = self.waiter.take() {
            self.mvar.cancel_read(token);
        }
    }
}

impl<A> std::fmt::Debug for Read<'_, A>
where
    A: Clone,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Read")
            .field("registered", &self.waiter.is_some())
            .finish()
    }
}

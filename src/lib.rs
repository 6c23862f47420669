//! # snap-sync
//!
//! Cancellable, lock-free async synchronization primitives for Rust.
//!
//! 可取消、无锁的 Rust 异步同步原语库。
//!
//! ## Overview / 概述
//!
//! `snap-sync` provides the concurrency cells underlying an asynchronous
//! effect runtime: a single-slot synchronization cell ([`MVar`]), a buffered
//! queue with four interchangeable backpressure policies ([`Queue`]), a
//! placeholder for a not-yet-known cancellation action
//! ([`ForwardCancellable`]), a resource-safety combinator
//! ([`bracket_case`](bracket::bracket_case)) and a single-assignment
//! multi-waiter completion cell ([`Promise`]).
//!
//! `snap-sync` 提供异步效果运行时底层的并发单元：单槽同步单元
//! （[`MVar`]）、具有四种可互换背压策略的缓冲队列（[`Queue`]）、
//! 尚未可知取消动作的占位符（[`ForwardCancellable`]）、资源安全组合子
//! （[`bracket_case`](bracket::bracket_case)）以及单次赋值多等待者完成单元
//! （[`Promise`]）。
//!
//! ## Key Features / 主要特性
//!
//! - **One atomic cell per instance**: all state lives behind a single
//!   epoch-managed pointer, mutated only by compare-and-swap retry loops
//!   over immutable snapshots; no lock, mutex or monitor anywhere
//! - **Notifications strictly after the CAS**: a slow listener can never
//!   block another mutator, and no mutator observes a torn state
//! - **Token-keyed cancellation**: every suspended registration is keyed by
//!   a unique token; dropping its future removes exactly that registration
//!   and never disturbs any other waiter
//! - **FIFO fairness**: puts and offers are serviced in registration order
//!   relative to takers; reads and peeks are broadcast
//! - **Cancel-safe takes**: an element handed to a take whose future is
//!   dropped before observing it is reinstated, so nothing is lost in
//!   `select!` loops
//!
//! - **每实例一个原子单元**：所有状态都位于单个由 epoch 管理的指针之后，
//!   仅通过对不可变快照的 compare-and-swap 重试循环修改 ——
//!   任何地方都没有锁、互斥量或监视器
//! - **通知严格发生在 CAS 之后**：慢监听器不会阻塞其他修改者，
//!   任何修改者也不会观察到撕裂状态
//! - **以 token 为键的取消**：每个挂起的注册都以唯一 token 为键；
//!   drop 其 future 即精确移除该注册，绝不影响其他等待者
//! - **FIFO 公平性**：put 与 offer 相对 taker 按注册顺序被服务；
//!   read 与 peek 为广播
//! - **取消安全的 take**：已交付给 take、但其 future 在观察到值之前被
//!   drop 的元素会被放回，`select!` 循环中不会丢失任何东西
//!
//! ## Modules / 模块
//!
//! ### [`mvar`]
//!
//! Single-slot cell enforcing at-most-one resident value. `put`/`take`
//! suspend until the opposite condition holds; `read` observes without
//! consuming and is broadcast on every put.
//!
//! 强制至多一个驻留值的单槽单元。`put`/`take` 挂起直到对向条件成立；
//! `read` 观察而不消费，并在每次 put 时被广播。
//!
//! ### [`queue`]
//!
//! N-slot buffered cell. [`BackpressureStrategy`] picks what happens at
//! capacity: `Bounded` suspends offers, `Sliding` evicts the oldest,
//! `Dropping` discards the newest, `Unbounded` never fills. Batch offers
//! partition atomically; takes promote pending offers in the same CAS.
//!
//! N 槽缓冲单元。[`BackpressureStrategy`] 决定达到容量后的行为：
//! `Bounded` 挂起 offer，`Sliding` 淘汰最老元素，`Dropping` 丢弃最新元素，
//! `Unbounded` 永不填满。批量 offer 原子划分；take 在同一次 CAS 中
//! 提升等待中的 offer。
//!
//! ### [`promise`]
//!
//! Single-assignment completion cell bridging one callback result to any
//! number of suspended observers.
//!
//! 单次赋值完成单元，把一个回调结果桥接给任意数量的挂起观察者。
//!
//! ### [`forward`]
//!
//! [`ForwardCancellable`] decouples requesting cancellation from knowing
//! how to cancel; queued requests fire the eventually-supplied action
//! exactly once.
//!
//! [`ForwardCancellable`] 将请求取消与知道如何取消解耦；
//! 排队的请求让最终提供的动作恰好触发一次。
//!
//! ### [`bracket`]
//!
//! `acquire`/`use`/`release` with exit-case-aware, exactly-once release,
//! including on drop-cancellation; release failures compose with use
//! failures instead of shadowing them.
//!
//! 具有退出情形感知、恰好一次 release 的 `acquire`/`use`/`release`，
//! 包括 drop 取消时；release 失败与 use 失败合成，而不是相互遮蔽。
//!
//! ## Examples / 示例
//!
//! ### Handing values through an MVar
//!
//! ```
//! use snap_sync::MVar;
//! use std::sync::Arc;
//!
//! # tokio_test::block_on(async {
//! let cell = Arc::new(MVar::new());
//!
//! let consumer = {
//!     let cell = cell.clone();
//!     tokio::spawn(async move { cell.take().await })
//! };
//!
//! cell.put("hello").await;
//! assert_eq!(consumer.await.unwrap(), "hello");
//! # });
//! ```
//!
//! ### Backpressure policies
//!
//! ```
//! use snap_sync::Queue;
//! use std::num::NonZeroUsize;
//!
//! # tokio_test::block_on(async {
//! let sliding = Queue::sliding(NonZeroUsize::new(2).unwrap());
//! for i in 0..5 {
//!     sliding.offer(i).await; // never suspends
//! }
//! assert_eq!(sliding.take_all(), vec![3, 4]);
//! # });
//! ```
//!
//! ### Guaranteed release
//!
//! ```
//! use snap_sync::bracket::{bracket_case, ExitCase};
//!
//! # tokio_test::block_on(async {
//! let result = bracket_case(
//!     async { Ok::<_, String>("resource") },
//!     |r: &mut &str| {
//!         let r = *r;
//!         async move { Ok::<_, String>(r.len()) }
//!     },
//!     |_r, _exit: &ExitCase<String>| Ok(()),
//! )
//! .await;
//! assert_eq!(result.unwrap(), 8);
//! # });
//! ```
//!
//! ## Safety / 安全性
//!
//! The snapshot loop itself is safe Rust over `crossbeam-epoch`; `unsafe`
//! appears only in the two micro state machines (the one-shot value slot
//! and the atomic waker) where a transient state value acts as an exclusive
//! ticket for an `UnsafeCell`, and in the bracket release frame, where a
//! single atomic flag elects the unique firer. Safety is guaranteed
//! through:
//!
//! 快照循环本身是基于 `crossbeam-epoch` 的安全 Rust；`unsafe` 仅出现在
//! 两个微型状态机（一次性值槽与原子 waker）中 —— 瞬态状态值充当
//! `UnsafeCell` 的独占票据 —— 以及 bracket 释放帧中，
//! 由单个原子标志裁决唯一触发者。安全性通过以下方式保证：
//!
//! - Atomic state machines serializing every cell access
//! - The CAS winner being the unique logical owner of whatever it unlinks
//! - Epoch-based reclamation keeping loaded snapshots alive
//! - Model testing of the state machines with `loom` (`--features loom`)
//!
//! - 原子状态机串行化每次单元访问
//! - CAS 胜者是其所解除链接内容的唯一逻辑所有者
//! - 基于 epoch 的回收保证已加载快照存活
//! - 使用 `loom` 对状态机进行模型测试（`--features loom`）

pub mod bracket;
pub mod forward;
pub mod mvar;
pub mod promise;
pub mod queue;

mod atomic_waker;
mod shim;
mod slot;
mod snapshot;
mod token;
mod waiter;

pub use bracket::{bracket, bracket_case, BracketError, ExitCase};
pub use forward::{CancelAction, ForwardCancellable};
pub use mvar::MVar;
pub use promise::Promise;
pub use queue::{BackpressureStrategy, Queue};

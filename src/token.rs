//! Unique waiter identity.
//!
//! Every suspended registration (a pending put, take, read, offer, peek or
//! promise getter) is keyed by a [`Token`] so that cancelling one waiter can
//! remove exactly that entry from a waiter map, regardless of how many times
//! the map has been wholesale-replaced in the meantime.
//!
//! Tokens are drawn from a process-wide monotonic counter, so ordering tokens
//! orders registrations: an ordered map keyed by `Token` is FIFO for free.
//!
//! 唯一的等待者标识。
//!
//! 每个挂起的注册（等待中的 put、take、read、offer、peek 或 promise getter）
//! 都以 [`Token`] 为键，使得取消某个等待者时可以精确移除对应条目，
//! 无论等待者映射在此期间被整体替换了多少次。
//!
//! Token 来自进程级单调递增计数器，因此 Token 的顺序即注册顺序：
//! 以 `Token` 为键的有序映射天然就是 FIFO。

use std::sync::atomic::{AtomicU64, Ordering};

// Identity allocation is not part of any modeled interleaving, so the counter
// stays on std atomics even under the loom feature.
static NEXT: AtomicU64 = AtomicU64::new(1);

/// Identity-only key for one waiter registration.
///
/// 等待者注册的纯标识键。
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) struct Token(u64);

impl Token {
    /// Allocate a fresh token, strictly greater than every earlier one.
    ///
    /// 分配一个新 token，严格大于之前的所有 token。
    #[inline]
    pub(crate) fn next() -> Self {
        Token(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokens_are_unique_and_ordered() {
        let a = Token::next();
        let b = Token::next();
        let c = Token::next();
        assert!(a < b && b < c);
        assert_ne!(a, b);
    }

    #[test]
    fn tokens_are_unique_across_threads() {
        use std::collections::HashSet;
        use std::thread;

        let handles: Vec<_> = (0..4)
            .map(|_| thread::spawn(|| (0..1000).map(|_| Token::next()).collect::<Vec<_>>()))
            .collect();

        let mut seen = HashSet::new();
        for h in handles {
            for t in h.join().unwrap() {
                assert!(seen.insert(t));
            }
        }
    }
}

//! Per-worker exchange pools.
//!
//! Each I/O worker owns one `ExchangePools`, holding one fixed-capacity
//! stack per exchange kind. Decode pops from the stack instead of
//! allocating; finished exchanges are reset and pushed back.
//!
//! Pools are never shared between workers. `ExchangePools` is `!Send`, so a
//! pool cannot leave the thread that created it, and its fast path takes no
//! locks.

use crate::exchange::{Exchange, ExchangeKind};
use std::collections::HashMap;
use std::marker::PhantomData;
use std::rc::Rc;
use tracing::trace;

/// Fixed-capacity LIFO stack.
///
/// `push` beyond capacity drops the value instead of growing, which caps
/// the memory retained per worker.
#[derive(Debug)]
pub struct FixedStack<T> {
    items: Vec<T>,
    capacity: usize,
}

impl<T> FixedStack<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            items: Vec::with_capacity(capacity),
            capacity,
        }
    }

    /// Pop the most recently pushed value.
    pub fn pop(&mut self) -> Option<T> {
        self.items.pop()
    }

    /// Push a value. Returns `false` if the stack was full and the value
    /// was dropped.
    pub fn push(&mut self, item: T) -> bool {
        if self.items.len() >= self.capacity {
            return false;
        }
        self.items.push(item);
        true
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Counters for one worker's pools.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Acquires served from a stack.
    pub hits: u64,
    /// Acquires that found the stack empty.
    pub misses: u64,
    /// Releases dropped because the stack was full.
    pub dropped: u64,
}

/// One worker's exchange stacks, keyed by exchange kind.
pub struct ExchangePools {
    stacks: HashMap<ExchangeKind, FixedStack<Exchange>>,
    capacity: usize,
    stats: PoolStats,
    // pins the pools to the creating thread
    _not_send: PhantomData<Rc<()>>,
}

impl ExchangePools {
    /// Pools holding up to `capacity` idle exchanges per kind. A capacity
    /// of zero disables pooling.
    pub fn new(capacity: usize) -> Self {
        Self {
            stacks: HashMap::new(),
            capacity,
            stats: PoolStats::default(),
            _not_send: PhantomData,
        }
    }

    /// Pop an idle exchange of `kind`, or `None` if the stack is empty.
    ///
    /// The stack for `kind` is created on first use.
    pub fn acquire(&mut self, kind: ExchangeKind) -> Option<Exchange> {
        let capacity = self.capacity;
        let stack = self
            .stacks
            .entry(kind)
            .or_insert_with(|| FixedStack::new(capacity));
        match stack.pop() {
            Some(mut exchange) => {
                self.stats.hits += 1;
                exchange.set_pooled(true);
                Some(exchange)
            }
            None => {
                self.stats.misses += 1;
                None
            }
        }
    }

    /// Pop an idle exchange or construct a fresh one.
    pub fn obtain(&mut self, kind: ExchangeKind) -> Exchange {
        self.acquire(kind).unwrap_or_else(|| Exchange::new(kind))
    }

    /// Reset `exchange` and push it onto its kind's stack.
    ///
    /// Returns `false` when the stack is full and the exchange was dropped.
    pub fn release(&mut self, mut exchange: Exchange) -> bool {
        exchange.reset();
        exchange.set_pooled(false);
        let capacity = self.capacity;
        let kind = exchange.kind();
        let stack = self
            .stacks
            .entry(kind)
            .or_insert_with(|| FixedStack::new(capacity));
        let kept = stack.push(exchange);
        if !kept {
            self.stats.dropped += 1;
            trace!(?kind, "exchange pool full, dropping");
        }
        kept
    }

    /// Idle exchanges currently held for `kind`.
    pub fn idle(&self, kind: ExchangeKind) -> usize {
        self.stacks.get(&kind).map_or(0, FixedStack::len)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> PoolStats {
        self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::{FrameKind, Message};

    #[test]
    fn test_fixed_stack_drops_over_capacity() {
        let mut stack = FixedStack::new(2);
        assert!(stack.push(1));
        assert!(stack.push(2));
        assert!(!stack.push(3));
        assert_eq!(stack.len(), 2);
        assert_eq!(stack.pop(), Some(2));
        assert_eq!(stack.pop(), Some(1));
        assert_eq!(stack.pop(), None);
    }

    #[test]
    fn test_capacity_plus_one_release_then_acquire() {
        let capacity = 4;
        let mut pools = ExchangePools::new(capacity);

        for _ in 0..=capacity {
            pools.release(Exchange::new(ExchangeKind::Frame));
        }
        assert_eq!(pools.idle(ExchangeKind::Frame), capacity);

        let results: Vec<_> = (0..=capacity)
            .map(|_| pools.acquire(ExchangeKind::Frame))
            .collect();
        assert!(results[..capacity].iter().all(Option::is_some));
        assert!(results[capacity].is_none());

        let stats = pools.stats();
        assert_eq!(stats.hits, capacity as u64);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.dropped, 1);
    }

    #[test]
    fn test_stacks_are_per_kind() {
        let mut pools = ExchangePools::new(8);
        pools.release(Exchange::new(ExchangeKind::Text));

        assert!(pools.acquire(ExchangeKind::Frame).is_none());
        let ex = pools.acquire(ExchangeKind::Text).unwrap();
        assert_eq!(ex.kind(), ExchangeKind::Text);
    }

    #[test]
    fn test_release_resets_and_marks_pooled() {
        let mut pools = ExchangePools::new(1);
        pools.release(Exchange::Frame(Message::text("leftover")));

        let ex = pools.obtain(ExchangeKind::Frame);
        assert!(ex.is_pooled());
        assert_eq!(ex.frame_kind(), None);
        assert_eq!(ex.as_message().unwrap().payload().write_size(), 0);

        let fresh = pools.obtain(ExchangeKind::Frame);
        assert!(!fresh.is_pooled());
    }

    #[test]
    fn test_zero_capacity_disables_pooling() {
        let mut pools = ExchangePools::new(0);
        assert!(!pools.release(Exchange::Frame(Message::new(FrameKind::Ping))));
        assert!(pools.acquire(ExchangeKind::Frame).is_none());
    }
}

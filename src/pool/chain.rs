//! Component A: the priority idle chain.
//!
//! Ordered by `idle_since` ascending. Deliberately *not* internally synchronized — every caller
//! reaches this type through [`super::inner::SharedPool`]'s own `std::sync::Mutex`, which is the
//! single serializer of chain mutations (see the concurrency model in the crate-level docs).
//! Because insertions only ever happen in `now()` order while that lock is held, a plain
//! append-only `Vec` already gives `pop_most_recent` its LIFO behavior for free, and
//! `remove_idle_longer_than` can stop at the first non-expired entry instead of scanning the
//! whole chain.

use std::time::{Duration, Instant};

use super::conn::Idle;
use crate::connection::Connection;

pub(crate) struct Chain<C: Connection> {
    /// Oldest-idle at the front, youngest-idle at the back.
    entries: Vec<Idle<C>>,
}

impl<C: Connection> Chain<C> {
    pub fn new() -> Self {
        Chain {
            entries: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Insert a newly-idle connection. Always the youngest entry by construction.
    pub fn add(&mut self, idle: Idle<C>) {
        self.entries.push(idle);
    }

    /// Pop the most-recently-idled entry (LIFO), maximizing warm TCP/driver-side reuse.
    pub fn pop_most_recent(&mut self) -> Option<Idle<C>> {
        self.entries.pop()
    }

    /// Remove every entry idle longer than `threshold`, stopping as soon as we reach an entry
    /// that's still within the window (idle order is monotonic with insertion order since every
    /// mutation happens under the same lock).
    pub fn remove_idle_longer_than(&mut self, threshold: Duration) -> Vec<Idle<C>> {
        let now = Instant::now();
        let mut cut = 0;
        while cut < self.entries.len() && now.duration_since(self.entries[cut].idle_since) >= threshold
        {
            cut += 1;
        }
        self.entries.drain(..cut).collect()
    }

    /// Drain every entry, regardless of age. Used by `shutdown`.
    pub fn drain_all(&mut self) -> Vec<Idle<C>> {
        self.entries.drain(..).collect()
    }

    /// Remove and return the single oldest-idle entry, if any. Used by the maintenance
    /// scheduler's keepalive probe, which only ever touches the entry least likely to still be
    /// warm.
    pub fn pop_oldest(&mut self) -> Option<Idle<C>> {
        if self.entries.is_empty() {
            None
        } else {
            Some(self.entries.remove(0))
        }
    }

    /// Put an entry back at the oldest position without re-stamping `idle_since`. Used to restore
    /// entries that were provisionally popped (by `remove_idle_longer_than` beyond the shrink
    /// floor, or by `pop_oldest` after a successful keepalive probe) and must keep their original
    /// idle time rather than being treated as freshly released.
    pub fn readd_front(&mut self, idle: Idle<C>) {
        self.entries.insert(0, idle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::conn::Live;
    use futures_core::future::BoxFuture;
    use std::thread::sleep;

    struct FakeConn;
    impl Connection for FakeConn {
        fn ping(&mut self) -> BoxFuture<'_, Result<(), crate::Error>> {
            Box::pin(async { Ok(()) })
        }
        fn close(self) -> BoxFuture<'static, Result<(), crate::Error>> {
            Box::pin(async { Ok(()) })
        }
    }

    fn idle() -> Idle<FakeConn> {
        Live::new(FakeConn).into_idle()
    }

    #[test]
    fn pop_most_recent_is_lifo() {
        let mut chain = Chain::new();
        chain.add(idle());
        sleep(Duration::from_millis(2));
        let second = idle();
        let second_since = second.idle_since;
        chain.add(second);

        let popped = chain.pop_most_recent().unwrap();
        assert_eq!(popped.idle_since, second_since);
        assert_eq!(chain.len(), 1);
    }

    #[test]
    fn remove_idle_longer_than_respects_floor_order() {
        let mut chain = Chain::new();
        chain.add(idle());
        sleep(Duration::from_millis(20));
        chain.add(idle());

        let evicted = chain.remove_idle_longer_than(Duration::from_millis(10));
        assert_eq!(evicted.len(), 1, "only the older entry should be evicted");
        assert_eq!(chain.len(), 1);
    }

    #[test]
    fn readd_front_preserves_idle_since() {
        let mut chain = Chain::new();
        let first = idle();
        let first_since = first.idle_since;
        chain.add(first);
        sleep(Duration::from_millis(2));
        chain.add(idle());

        let oldest = chain.pop_oldest().unwrap();
        assert_eq!(oldest.idle_since, first_since);
        chain.readd_front(oldest);

        assert_eq!(chain.len(), 2);
        assert_eq!(chain.pop_oldest().unwrap().idle_since, first_since);
    }
}

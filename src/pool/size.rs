//! Lock-free bookkeeping for `pool_size` and `peak_pool_size`.
//!
//! Split out from [`super::inner`] because the increment/decrement dance needs to be exception
//! (in our case, early-return/`?`) safe: every path that increments the live count must guarantee
//! a matching decrement even if it bails out partway through opening a connection. An RAII guard
//! makes that automatic instead of relying on every call site remembering to clean up.

use std::sync::atomic::{AtomicU32, Ordering};

/// Tracks the live connection count against a configured ceiling, plus the all-time high-water
/// mark.
pub(crate) struct PoolSize {
    size: AtomicU32,
    peak: AtomicU32,
    max_size: u32,
}

/// Reserves one slot of capacity, to be committed (a connection was actually opened) or
/// cancelled (the attempt failed) by the holder.
pub(crate) struct IncreaseGuard<'a> {
    size: &'a PoolSize,
    committed: bool,
}

impl PoolSize {
    pub fn new(max_size: u32) -> Self {
        PoolSize {
            size: AtomicU32::new(0),
            peak: AtomicU32::new(0),
            max_size,
        }
    }

    pub fn current(&self) -> u32 {
        self.size.load(Ordering::Acquire)
    }

    pub fn peak(&self) -> u32 {
        self.peak.load(Ordering::Acquire)
    }

    /// Atomically claims one unit of capacity if under `max_size`, returning a guard that must be
    /// either [`IncreaseGuard::commit`]ted or dropped (which releases the reservation).
    pub fn try_reserve(&self) -> Option<IncreaseGuard<'_>> {
        let mut size = self.current();

        while size < self.max_size {
            match self.size.compare_exchange_weak(
                size,
                size + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    self.bump_peak(size + 1);
                    return Some(IncreaseGuard {
                        size: self,
                        committed: false,
                    });
                }
                Err(observed) => size = observed,
            }
        }

        None
    }

    fn bump_peak(&self, candidate: u32) {
        let mut peak = self.peak.load(Ordering::Acquire);
        while candidate > peak {
            match self
                .peak
                .compare_exchange_weak(peak, candidate, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => break,
                Err(observed) => peak = observed,
            }
        }
    }

    /// Decrement the live count directly, e.g. when a proxy is evicted out of the idle chain
    /// rather than dropped straight out of a reservation.
    pub fn release_one(&self) {
        self.size.fetch_sub(1, Ordering::AcqRel);
    }
}

impl<'a> IncreaseGuard<'a> {
    /// The reservation turned into a real, counted connection — keep it reserved.
    pub fn commit(mut self) {
        self.committed = true;
    }
}

impl Drop for IncreaseGuard<'_> {
    fn drop(&mut self) {
        if !self.committed {
            self.size.release_one();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserve_respects_ceiling() {
        let size = PoolSize::new(2);
        let g1 = size.try_reserve().unwrap();
        let g2 = size.try_reserve().unwrap();
        assert!(size.try_reserve().is_none());
        g1.commit();
        g2.commit();
        assert_eq!(size.current(), 2);
        assert_eq!(size.peak(), 2);
    }

    #[test]
    fn dropped_guard_releases_reservation() {
        let size = PoolSize::new(1);
        {
            let _g = size.try_reserve().unwrap();
            assert_eq!(size.current(), 1);
        }
        assert_eq!(size.current(), 0);
        assert_eq!(size.peak(), 1, "peak survives the release");
    }
}

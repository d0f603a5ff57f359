//! Component D: the process-wide maintenance scheduler.
//!
//! A single background task, started lazily the first time any pool registers, sweeps every
//! still-live pool at a fixed tick. Each pool decides for itself whether it's actually due (per
//! its own `maintenance_interval`), so pools with different cadences can share one scheduler task
//! instead of the process accumulating one timer per pool.
//!
//! The registry holds only `Weak` references: a dropped [`crate::pool::Pool`] simply stops being
//! upgradable and is pruned on the next tick, with no explicit unregister step needed.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, Weak};
use std::time::Duration;

use futures_core::future::BoxFuture;
use once_cell::sync::Lazy;

/// Tick at which the scheduler re-evaluates every registered pool. Individual pools are only
/// actually swept once their own `maintenance_interval` has elapsed.
const SCHEDULER_TICK: Duration = Duration::from_secs(1);

/// What the scheduler needs from a pool to sweep it, independent of the pool's connection type.
pub(crate) trait Maintainable: Send + Sync {
    fn name(&self) -> &str;

    /// Run one maintenance pass: idle eviction down to the configured floor, plus an optional
    /// keepalive probe. Implementations are responsible for deciding whether they're actually due
    /// (per their own configured cadence) and returning promptly if not.
    fn sweep(&self) -> BoxFuture<'_, ()>;
}

static REGISTRY: Lazy<Mutex<Vec<Weak<dyn Maintainable>>>> = Lazy::new(|| Mutex::new(Vec::new()));
static SCHEDULER_RUNNING: AtomicBool = AtomicBool::new(false);

/// Register a pool with the process-wide scheduler, starting the background task if this is the
/// first registration (or the previous run already exited for lack of live pools).
pub(crate) fn register(pool: Weak<dyn Maintainable>) {
    REGISTRY.lock().unwrap().push(pool);

    if !SCHEDULER_RUNNING.swap(true, Ordering::AcqRel) {
        tokio::spawn(run());
    }
}

async fn run() {
    loop {
        tokio::time::sleep(SCHEDULER_TICK).await;

        let pools: Vec<_> = {
            let mut registry = REGISTRY.lock().unwrap();
            registry.retain(|weak| weak.strong_count() > 0);

            if registry.is_empty() {
                // Nothing left to maintain. Stop cleanly; `register` restarts us if a new pool
                // shows up later.
                SCHEDULER_RUNNING.store(false, Ordering::Release);
                return;
            }

            registry.iter().filter_map(Weak::upgrade).collect()
        };

        for pool in pools {
            pool.sweep().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    struct CountingPool {
        sweeps: AtomicUsize,
    }

    impl Maintainable for CountingPool {
        fn name(&self) -> &str {
            "counting"
        }

        fn sweep(&self) -> BoxFuture<'_, ()> {
            self.sweeps.fetch_add(1, Ordering::SeqCst);
            Box::pin(async {})
        }
    }

    #[tokio::test(start_paused = true)]
    async fn registered_pool_gets_swept() {
        let pool = Arc::new(CountingPool {
            sweeps: AtomicUsize::new(0),
        });
        let weak: Weak<dyn Maintainable> = Arc::downgrade(&pool) as Weak<dyn Maintainable>;
        register(weak);

        tokio::time::advance(SCHEDULER_TICK * 3).await;
        // yield so the scheduler task actually runs after each advance
        for _ in 0..3 {
            tokio::task::yield_now().await;
        }

        assert!(pool.sweeps.load(Ordering::SeqCst) >= 1);
    }
}

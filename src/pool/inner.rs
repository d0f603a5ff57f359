//! Component C: the pool manager.
//!
//! Owns the idle chain, the live-connection count, and the closed flag described in the
//! crate-level data model. [`super::Pool`] is a thin `Arc<SharedPool<F>>` facade; everything that
//! actually enforces the pool's contracts (acquire, release, growth, shrink, shutdown) lives here
//! so it can be shared between the public [`super::Pool`] handle and the background maintenance
//! task without duplicating state.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use futures_core::future::BoxFuture;
use tokio::sync::Notify;

use super::chain::Chain;
use super::conn::{Floating, Live, PooledConnection};
use super::size::PoolSize;
use super::statement::XaContext;
use super::XaBinding;
use crate::config::PoolConfig;
use crate::connection::{ConnectFactory, Connection};
use crate::error::{Error, ValidationFailed};
use crate::maintenance::{self, Maintainable};
use crate::transaction::ExecutionContext;

pub(crate) struct SharedPool<F: ConnectFactory> {
    factory: F,
    config: PoolConfig,
    chain: Mutex<Chain<F::Connection>>,
    size: PoolSize,
    closed: AtomicBool,
    notify: Notify,
    xa: Option<XaBinding<F>>,
    last_swept: Mutex<Instant>,
}

impl<F: ConnectFactory> SharedPool<F> {
    pub(crate) async fn new_arc(
        factory: F,
        config: PoolConfig,
        xa: Option<XaBinding<F>>,
    ) -> Result<Arc<Self>, Error> {
        config.validate()?;
        crate::config::claim_pool_name(&config.name)?;

        let pool = Arc::new(SharedPool {
            factory,
            chain: Mutex::new(Chain::new()),
            size: PoolSize::new(config.max_pool_size),
            closed: AtomicBool::new(false),
            notify: Notify::new(),
            xa,
            last_swept: Mutex::new(Instant::now()),
            config,
        });

        let core = pool.config.core_pool_size;
        if core > 0 {
            pool.fill_pool(core).await?;
        }

        let weak: std::sync::Weak<dyn Maintainable> = Arc::downgrade(&pool);
        maintenance::register(weak);

        Ok(pool)
    }

    pub(crate) fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub(crate) fn size(&self) -> u32 {
        self.size.current()
    }

    pub(crate) fn peak_size(&self) -> u32 {
        self.size.peak()
    }

    pub(crate) fn idle_count(&self) -> usize {
        self.chain.lock().unwrap().len()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn xa_context_for(
        &self,
        live: &Live<F::Connection>,
        ctx: ExecutionContext,
    ) -> Option<XaContext> {
        let xa = self.xa.as_ref()?;
        Some(XaContext {
            coordinator: Arc::clone(&xa.coordinator),
            ctx,
            resource: live.xa_resource(xa.make_resource.as_ref()),
        })
    }

    /// The acquire critical path: pop an idle proxy, growing the pool or blocking on exhaustion
    /// per the configured policy, then validate it if `test_before_use` is set.
    pub(crate) async fn acquire(self: &Arc<Self>) -> Result<PooledConnection<F>, Error> {
        let deadline = self.config.acquire_timeout().map(|d| Instant::now() + d);

        loop {
            if self.closed.load(Ordering::Acquire) {
                return Err(Error::PoolClosed);
            }

            let popped = {
                let mut chain = self.chain.lock().unwrap();
                chain.pop_most_recent()
            };

            let live = match popped {
                Some(idle) => idle.live,
                None => {
                    let current = self.size.current();
                    if current < self.config.max_pool_size {
                        let n = self
                            .config
                            .acquire_increment
                            .min(self.config.max_pool_size - current)
                            .max(1);
                        self.fill_pool(n).await?;
                        continue;
                    } else if self.config.useless_connection_exception {
                        return Err(Error::Exhausted);
                    } else {
                        tracing::debug!(pool = %self.config.name, "pool exhausted, waiting for a release");
                        self.wait_for_signal(deadline).await?;
                        continue;
                    }
                }
            };

            if self.config.test_before_use {
                match self.validate(live).await {
                    Ok(live) => return Ok(PooledConnection::new(live, Arc::clone(self))),
                    Err(ValidationFailed) => {
                        // Validation failures don't count against `acquire_retry_times`; they
                        // consume pool capacity and the loop below naturally reopens it (the
                        // replacement the design calls for) on its next iteration.
                        self.size.release_one();
                        continue;
                    }
                }
            }

            return Ok(PooledConnection::new(live, Arc::clone(self)));
        }
    }

    /// Non-blocking variant: returns `None` immediately instead of growing or waiting.
    pub(crate) fn try_acquire(self: &Arc<Self>) -> Option<PooledConnection<F>> {
        if self.closed.load(Ordering::Acquire) {
            return None;
        }
        let mut chain = self.chain.lock().unwrap();
        let idle = chain.pop_most_recent()?;
        drop(chain);
        Some(PooledConnection::new(idle.live, Arc::clone(self)))
    }

    async fn wait_for_signal(&self, deadline: Option<Instant>) -> Result<(), Error> {
        match deadline {
            Some(d) => {
                let remaining = d.checked_duration_since(Instant::now()).ok_or(Error::Timeout)?;
                tokio::time::timeout(remaining, self.notify.notified())
                    .await
                    .map_err(|_| Error::Timeout)?;
            }
            None => self.notify.notified().await,
        }
        Ok(())
    }

    /// Open one physical connection, reserving capacity for it first. The reservation and the
    /// opened handle travel together in a [`Floating`] so any early return (connect failure)
    /// releases the reservation automatically via `Floating`'s guard.
    async fn open_one(&self) -> Result<Floating<'_, F::Connection>, Error> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::PoolClosed);
        }
        let guard = self.size.try_reserve().ok_or(Error::Exhausted)?;
        let raw = self.try_get_connection(self.config.acquire_retry_times).await?;
        Ok(Floating::new(raw, guard))
    }

    async fn try_get_connection(&self, retry_times: u32) -> Result<F::Connection, Error> {
        let mut attempts = 0;
        loop {
            match self.factory.connect().await {
                Ok(conn) => return Ok(conn),
                Err(e) => {
                    attempts += 1;
                    if attempts > retry_times {
                        tracing::warn!(
                            pool = %self.config.name,
                            attempts,
                            error = %e,
                            "giving up establishing a connection"
                        );
                        return Err(Error::ConnectFailed(e.to_string()));
                    }
                    tracing::debug!(
                        pool = %self.config.name,
                        attempt = attempts,
                        error = %e,
                        "connection attempt failed, retrying"
                    );
                }
            }
        }
    }

    /// Grow the pool by up to `n` connections, chaining every one that opens successfully.
    /// Stops early (without error) if capacity runs out from under it — that just means another
    /// caller already grew the pool concurrently.
    async fn fill_pool(&self, n: u32) -> Result<(), Error> {
        let mut opened = Vec::with_capacity(n as usize);

        for _ in 0..n {
            match self.open_one().await {
                Ok(floating) => opened.push(Live::new(floating.keep())),
                Err(Error::Exhausted) => break,
                Err(e) => {
                    for live in opened {
                        self.size.release_one();
                        let _ = live.raw.close().await;
                    }
                    return Err(e);
                }
            }
        }

        if opened.is_empty() {
            return Ok(());
        }

        if self.closed.load(Ordering::Acquire) {
            for live in opened {
                self.size.release_one();
                let _ = live.raw.close().await;
            }
            return Err(Error::PoolClosed);
        }

        let grown = opened.len();
        {
            let mut chain = self.chain.lock().unwrap();
            for live in opened {
                chain.add(live.into_idle());
            }
        }
        for _ in 0..grown {
            self.notify.notify_one();
        }

        Ok(())
    }

    async fn validate(
        &self,
        mut live: Live<F::Connection>,
    ) -> Result<Live<F::Connection>, ValidationFailed> {
        match live.raw.ping().await {
            Ok(()) => Ok(live),
            Err(e) => {
                tracing::debug!(
                    pool = %self.config.name,
                    error = %e,
                    "connection failed liveness validation"
                );
                let _ = live.raw.close().await;
                Err(ValidationFailed)
            }
        }
    }

    /// Return a checked-out connection to the chain, or close it outright if the pool has since
    /// been shut down. Called synchronously from [`super::conn::PooledConnection`]'s `Drop`, so
    /// the shutdown-path close has to happen on a spawned task rather than inline.
    pub(crate) fn release(&self, live: Live<F::Connection>) {
        if self.closed.load(Ordering::Acquire) {
            self.size.release_one();
            self.notify.notify_one();
            let raw = live.raw;
            tokio::spawn(async move {
                if let Err(e) = raw.close().await {
                    tracing::warn!(
                        error = %e,
                        "error closing connection released after pool shutdown"
                    );
                }
            });
            return;
        }

        let mut chain = self.chain.lock().unwrap();
        chain.add(live.into_idle());
        drop(chain);
        self.notify.notify_one();
    }

    /// Detach and close a connection outright rather than returning it to the chain, per
    /// [`super::conn::PooledConnection::close`].
    pub(crate) async fn discard(&self, raw: F::Connection) {
        self.size.release_one();
        self.notify.notify_one();
        if let Err(e) = raw.close().await {
            tracing::warn!(
                pool = %self.config.name,
                error = %e,
                "error closing explicitly discarded connection"
            );
        }
    }

    pub(crate) async fn shutdown(&self) {
        self.closed.store(true, Ordering::Release);

        let idle_entries = {
            let mut chain = self.chain.lock().unwrap();
            chain.drain_all()
        };

        for idle in idle_entries {
            self.size.release_one();
            if let Err(e) = idle.live.raw.close().await {
                tracing::warn!(
                    pool = %self.config.name,
                    error = %e,
                    "error closing connection during shutdown"
                );
            }
        }

        self.notify.notify_waiters();
        tracing::debug!(pool = %self.config.name, "pool shut down");
    }

    fn due_for_sweep(&self) -> bool {
        let mut last = self.last_swept.lock().unwrap();
        if last.elapsed() >= self.config.maintenance_interval_duration() {
            *last = Instant::now();
            true
        } else {
            false
        }
    }

    /// Evict chain entries idle longer than `limit_idle_time`, never past the `core_pool_size`
    /// floor.
    async fn shrink(&self) {
        let core = self.config.core_pool_size;
        let current = self.size.current();
        if current <= core {
            return;
        }
        let floor_remove = current - core;

        let mut candidates = {
            let mut chain = self.chain.lock().unwrap();
            let mut candidates = chain.remove_idle_longer_than(self.config.limit_idle_time_duration());
            if candidates.len() as u32 > floor_remove {
                let excess = candidates.split_off(floor_remove as usize);
                for idle in excess.into_iter().rev() {
                    chain.readd_front(idle);
                }
            }
            candidates
        };

        if candidates.is_empty() {
            return;
        }

        tracing::debug!(
            pool = %self.config.name,
            count = candidates.len(),
            "evicting excess-idle connections"
        );

        for idle in candidates.drain(..) {
            self.size.release_one();
            if let Err(e) = idle.live.raw.close().await {
                tracing::warn!(
                    pool = %self.config.name,
                    error = %e,
                    "error closing evicted idle connection"
                );
            }
        }
    }

    /// Optional keepalive: ping the single oldest idle entry, destroying it on failure rather
    /// than waiting for a caller to discover it's dead via `test_before_use` or a driver error.
    async fn keepalive_probe(&self) {
        let oldest = {
            let mut chain = self.chain.lock().unwrap();
            chain.pop_oldest()
        };

        let mut idle = match oldest {
            Some(idle) => idle,
            None => return,
        };

        match idle.live.raw.ping().await {
            Ok(()) => {
                let mut chain = self.chain.lock().unwrap();
                chain.readd_front(idle);
            }
            Err(e) => {
                tracing::warn!(
                    pool = %self.config.name,
                    error = %e,
                    "keepalive probe failed, destroying connection"
                );
                self.size.release_one();
                let _ = idle.live.raw.close().await;
            }
        }
    }
}

impl<F: ConnectFactory> Maintainable for SharedPool<F> {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn sweep(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            if self.closed.load(Ordering::Acquire) {
                return;
            }
            if !self.due_for_sweep() {
                return;
            }
            self.shrink().await;
            self.keepalive_probe().await;
        })
    }
}

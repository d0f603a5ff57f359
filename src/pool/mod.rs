//! A bounded, async pool of database connections ([`Pool`]) plus its collaborators.
//!
//! [`Pool`] is a thin `Arc` handle around [`inner::SharedPool`], which holds all the actual
//! mutable state (component C in the crate-level docs). The rest of this module's children are
//! the other leaf components it's built from:
//!
//! - [`chain`] — component A, the idle priority chain.
//! - [`conn`] — component B, the connection proxy / [`PooledConnection`] state machine.
//! - [`size`] — the lock-free `pool_size`/`peak_pool_size` bookkeeping `inner` builds on.
//! - [`statement`] — component E, the statement invocation layer.

mod chain;
mod conn;
mod inner;
mod size;
mod statement;

use std::fmt;
use std::sync::Arc;

pub use conn::PooledConnection;
pub use statement::StatementHandle;

use inner::SharedPool;

use crate::config::PoolConfig;
use crate::connection::ConnectFactory;
use crate::error::Error;
use crate::transaction::{ExecutionContext, TransactionCoordinator, XaResource};

/// Binds an XA-enabled pool to the coordinator it enlists into and the function that derives an
/// [`XaResource`] from one of the pool's physical connections.
pub(crate) struct XaBinding<F: ConnectFactory> {
    pub(crate) coordinator: Arc<TransactionCoordinator>,
    pub(crate) make_resource: Arc<dyn Fn(&F::Connection) -> Arc<dyn XaResource> + Send + Sync>,
}

impl<F: ConnectFactory> Clone for XaBinding<F> {
    fn clone(&self) -> Self {
        XaBinding {
            coordinator: Arc::clone(&self.coordinator),
            make_resource: Arc::clone(&self.make_resource),
        }
    }
}

/// Builds a [`Pool`], optionally wiring it into a [`TransactionCoordinator`] as an XA
/// participant.
///
/// Mirrors the configuration loader's `PoolConfig` one-to-one; this type only adds the pieces
/// that can't come from a deserialized config (the connection factory and, for XA pools, the
/// function that turns a physical connection into an [`XaResource`]).
pub struct PoolOptions<F: ConnectFactory> {
    config: PoolConfig,
    xa: Option<XaBinding<F>>,
}

impl<F: ConnectFactory> PoolOptions<F> {
    pub fn new(config: PoolConfig) -> Self {
        PoolOptions { config, xa: None }
    }

    /// Enable XA participation: connections acquired from this pool enlist into `coordinator`
    /// (via `make_resource`) before running an `execute`/`execute_batch`/`execute_update`
    /// statement.
    pub fn xa<M>(mut self, coordinator: Arc<TransactionCoordinator>, make_resource: M) -> Self
    where
        M: Fn(&F::Connection) -> Arc<dyn XaResource> + Send + Sync + 'static,
    {
        self.xa = Some(XaBinding {
            coordinator,
            make_resource: Arc::new(make_resource),
        });
        self
    }

    /// Build the pool, pre-populating `core_pool_size` connections from `factory`.
    pub async fn connect(self, factory: F) -> Result<Pool<F>, Error> {
        let inner = SharedPool::new_arc(factory, self.config, self.xa).await?;
        Ok(Pool(inner))
    }
}

/// A bounded pool of `F::Connection`s.
///
/// Cloning a `Pool` is cheap (it's an `Arc` around the shared state) and every clone refers to
/// the same underlying reservoir.
pub struct Pool<F: ConnectFactory>(Arc<SharedPool<F>>);

impl<F: ConnectFactory> Pool<F> {
    /// Shorthand for `PoolOptions::new(config).connect(factory)`.
    pub async fn connect(factory: F, config: PoolConfig) -> Result<Self, Error> {
        PoolOptions::new(config).connect(factory).await
    }

    /// Check out a connection, growing the pool or waiting for a release as configured.
    pub async fn acquire(&self) -> Result<PooledConnection<F>, Error> {
        self.0.acquire().await
    }

    /// Check out a connection only if one is already idle; never grows or waits.
    pub fn try_acquire(&self) -> Option<PooledConnection<F>> {
        self.0.try_acquire()
    }

    /// Close the pool: further `acquire` calls fail with [`Error::PoolClosed`], every currently
    /// idle connection is closed now, and every in-use connection is closed as it's released.
    pub async fn close(&self) {
        self.0.shutdown().await
    }

    /// This pool's configured name.
    pub fn name(&self) -> &str {
        &self.0.config().name
    }

    /// Current live connection count (idle + in-use).
    pub fn size(&self) -> u32 {
        self.0.size()
    }

    /// All-time high-water mark of [`Pool::size`].
    pub fn peak_size(&self) -> u32 {
        self.0.peak_size()
    }

    /// Number of connections currently idle in the chain.
    pub fn idle_count(&self) -> usize {
        self.0.idle_count()
    }

    /// Whether [`Pool::close`] has been called.
    pub fn is_closed(&self) -> bool {
        self.0.is_closed()
    }

    /// Wrap a statement produced against a checked-out connection's driver type, tracking it in
    /// that checkout's dependent-statement set and, for XA pools, enlisting into `ctx` before any
    /// `execute*` call. See [`PooledConnection::track_statement`].
    pub fn track_statement<S>(
        &self,
        conn: &PooledConnection<F>,
        statement: S,
        ctx: Option<ExecutionContext>,
    ) -> StatementHandle<S> {
        conn.track_statement(statement, ctx)
    }
}

impl<F: ConnectFactory> Clone for Pool<F> {
    fn clone(&self) -> Self {
        Pool(Arc::clone(&self.0))
    }
}

impl<F: ConnectFactory> fmt::Debug for Pool<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("name", &self.name())
            .field("size", &self.size())
            .field("idle_count", &self.idle_count())
            .field("peak_size", &self.peak_size())
            .field("is_closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_core::future::BoxFuture;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc as StdArc;

    #[derive(Debug)]
    struct FakeConn {
        healthy: bool,
    }

    impl crate::connection::Connection for FakeConn {
        fn ping(&mut self) -> BoxFuture<'_, Result<(), Error>> {
            let healthy = self.healthy;
            Box::pin(async move {
                if healthy {
                    Ok(())
                } else {
                    Err(Error::Connection("unhealthy".into()))
                }
            })
        }

        fn close(self) -> BoxFuture<'static, Result<(), Error>> {
            Box::pin(async { Ok(()) })
        }
    }

    struct FakeFactory {
        opened: StdArc<AtomicU32>,
        unhealthy_first: bool,
    }

    impl crate::connection::ConnectFactory for FakeFactory {
        type Connection = FakeConn;

        fn connect(&self) -> BoxFuture<'_, Result<Self::Connection, Error>> {
            let n = self.opened.fetch_add(1, Ordering::SeqCst);
            let unhealthy_first = self.unhealthy_first;
            Box::pin(async move {
                Ok(FakeConn {
                    healthy: !(unhealthy_first && n == 0),
                })
            })
        }
    }

    fn unique_name(prefix: &str) -> String {
        use std::sync::atomic::{AtomicU64, Ordering};
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        format!("{prefix}-{}", COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    #[tokio::test]
    async fn warm_pool_acquire_then_grows_then_releases() {
        let factory = FakeFactory {
            opened: StdArc::new(AtomicU32::new(0)),
            unhealthy_first: false,
        };
        let config = PoolConfig::new(unique_name("warm"), 4)
            .core_pool_size(2)
            .acquire_increment(1)
            .useless_connection_exception(true);
        let pool = Pool::connect(factory, config).await.unwrap();

        assert_eq!(pool.size(), 2);
        assert_eq!(pool.idle_count(), 2);

        let a = pool.acquire().await.unwrap();
        let b = pool.acquire().await.unwrap();
        assert_eq!(pool.idle_count(), 0);

        let c = pool.acquire().await.unwrap();
        assert_eq!(pool.size(), 3);
        assert_eq!(pool.idle_count(), 0);

        drop(a);
        drop(b);
        drop(c);
        // Drop releases synchronously but asynchronously notifies; give the runtime a tick.
        tokio::task::yield_now().await;

        assert_eq!(pool.idle_count(), 3);
        assert_eq!(pool.peak_size(), 3);
    }

    #[tokio::test]
    async fn exhaustion_fails_fast_when_configured() {
        let factory = FakeFactory {
            opened: StdArc::new(AtomicU32::new(0)),
            unhealthy_first: false,
        };
        let config = PoolConfig::new(unique_name("fail-fast"), 1).useless_connection_exception(true);
        let pool = Pool::connect(factory, config).await.unwrap();

        let _held = pool.acquire().await.unwrap();
        let err = pool.acquire().await.unwrap_err();
        assert!(matches!(err, Error::Exhausted));
    }

    #[tokio::test]
    async fn exhaustion_blocks_and_wakes_on_release() {
        let factory = FakeFactory {
            opened: StdArc::new(AtomicU32::new(0)),
            unhealthy_first: false,
        };
        let config =
            PoolConfig::new(unique_name("block-wake"), 1).useless_connection_exception(false);
        let pool = Pool::connect(factory, config).await.unwrap();

        let held = pool.acquire().await.unwrap();
        let pool2 = pool.clone();
        let waiter = tokio::spawn(async move { pool2.acquire().await });

        // Give the waiter task a chance to reach the blocking wait before we release.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        drop(held);

        let resumed = waiter.await.unwrap().unwrap();
        assert_eq!(pool.size(), 1);
        assert_eq!(pool.idle_count(), 0);
        drop(resumed);
    }

    #[tokio::test]
    async fn validation_recycles_invalid_proxy() {
        let factory = FakeFactory {
            opened: StdArc::new(AtomicU32::new(0)),
            unhealthy_first: true,
        };
        let config = PoolConfig::new(unique_name("validate"), 2)
            .core_pool_size(1)
            .test_before_use(true);
        let pool = Pool::connect(factory, config).await.unwrap();

        let conn = pool.acquire().await.unwrap();
        assert_eq!(pool.size(), 1, "the unhealthy proxy was replaced, not grown past core");
        drop(conn);
    }

    #[tokio::test]
    async fn shutdown_closes_idle_and_rejects_new_acquires() {
        let factory = FakeFactory {
            opened: StdArc::new(AtomicU32::new(0)),
            unhealthy_first: false,
        };
        let config = PoolConfig::new(unique_name("shutdown"), 2).core_pool_size(2);
        let pool = Pool::connect(factory, config).await.unwrap();

        pool.close().await;
        assert!(pool.is_closed());
        assert_eq!(pool.idle_count(), 0);

        let err = pool.acquire().await.unwrap_err();
        assert!(matches!(err, Error::PoolClosed));
    }
}

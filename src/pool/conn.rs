//! Component B: the connection proxy state machine, rendered as ownership transitions instead of
//! an explicit enum.
//!
//! [`Live<C>`] is a checked-out (or about-to-be-chained) physical connection plus its dependent
//! statement registry. [`Idle<C>`] is the same thing stamped with when it went idle — the chain
//! only ever holds `Idle<C>` values. [`PooledConnection<C>`] is the public handle callers get back
//! from [`super::Pool::acquire`]; its `Drop` is what makes "release" the only way back to the
//! pool, which is the proxy's most important contract: closing/dropping a checked-out connection
//! returns it rather than destroying it.

use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use futures_core::future::BoxFuture;

use super::inner::SharedPool;
use super::size::IncreaseGuard;
use super::statement::{StatementHandle, StatementRegistry, XaContext};
use crate::connection::ConnectFactory;
use crate::error::Error;
use crate::transaction::{ExecutionContext, XaResource};

pub(crate) struct Live<C> {
    pub(crate) raw: C,
    pub(crate) statements: Arc<StatementRegistry>,
    /// Cached per-connection XA resource, lazily built by the pool's `make_resource` and reused
    /// for every enlistment this physical connection ever takes part in — so two statement
    /// handles against the same connection enlist as the same resource, not two distinct ones.
    xa_resource: Mutex<Option<Arc<dyn XaResource>>>,
}

pub(crate) struct Idle<C> {
    pub(crate) live: Live<C>,
    pub(crate) idle_since: Instant,
}

/// A connection reserved against the pool's size ceiling, not yet attached to anything.
///
/// Mirrors the reservation/commit dance in [`super::size`]: holding a `Floating<C>` means the
/// pool's live count already reflects this connection, so every exit path (handing it to a
/// caller, chaining it as idle, or discarding it on error) is accounted for exactly once.
pub(crate) struct Floating<'p, C> {
    pub(crate) inner: C,
    guard: IncreaseGuard<'p>,
}

impl<C> Live<C> {
    pub fn new(raw: C) -> Self {
        Live {
            raw,
            statements: Arc::new(StatementRegistry::new()),
            xa_resource: Mutex::new(None),
        }
    }

    /// Get (building on first use) the single `XaResource` this physical connection enlists as.
    pub fn xa_resource(
        &self,
        make: &(dyn Fn(&C) -> Arc<dyn XaResource> + Send + Sync),
    ) -> Arc<dyn XaResource> {
        let mut cached = self.xa_resource.lock().unwrap();
        if let Some(resource) = cached.as_ref() {
            return Arc::clone(resource);
        }
        let resource = make(&self.raw);
        *cached = Some(Arc::clone(&resource));
        resource
    }

    pub fn into_idle(self) -> Idle<C> {
        Idle {
            live: self,
            idle_since: Instant::now(),
        }
    }

    /// Start a fresh statement registry for a new checkout. The old registry (if any dependent
    /// statements leaked past the previous release) is simply dropped; anything still holding a
    /// `StatementHandle` against it already observed `is_closed() == true` via `drain()`.
    pub fn begin_checkout(&mut self) {
        self.statements = Arc::new(StatementRegistry::new());
    }

    /// Drain dependent statements on release, per the proxy's IN_USE → IDLE contract.
    pub fn end_checkout(&self) {
        let outstanding = self.statements.drain();
        if outstanding > 0 {
            tracing::debug!(
                outstanding,
                "closed dependent statements still open at release"
            );
        }
    }
}

impl<C> Deref for Idle<C> {
    type Target = Live<C>;

    fn deref(&self) -> &Self::Target {
        &self.live
    }
}

impl<C> DerefMut for Idle<C> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.live
    }
}

impl<'p, C> Floating<'p, C> {
    pub fn new(inner: C, guard: IncreaseGuard<'p>) -> Self {
        Floating { inner, guard }
    }

    /// Give up the size reservation without closing anything — used when a connection is handed
    /// off to a long-lived owner ([`PooledConnection`] or the chain) that tracks its own count.
    pub fn keep(self) -> C {
        self.guard.commit();
        self.inner
    }
}

const DEREF_ERR: &str = "(bug) connection already released to pool";

/// A connection checked out from [`super::Pool`].
///
/// Returned to the pool on drop, or explicitly via [`PooledConnection::close`] / the embedding
/// crate's preferred "return to pool" spelling.
pub struct PooledConnection<F: ConnectFactory> {
    live: Option<Live<F::Connection>>,
    pool: Arc<SharedPool<F>>,
}

impl<F: ConnectFactory> PooledConnection<F> {
    pub(crate) fn new(mut live: Live<F::Connection>, pool: Arc<SharedPool<F>>) -> Self {
        live.begin_checkout();
        PooledConnection {
            live: Some(live),
            pool,
        }
    }

    /// Open a new statement against this connection's opaque driver type, producing a
    /// [`StatementHandle`] tracked in this checkout's dependent-statement set.
    ///
    /// `statement` is typically the result of a driver-specific `prepare`/`create_statement`
    /// call the caller already performed against [`PooledConnection::deref_mut`]; this method
    /// only wraps it with the invocation-layer bookkeeping (closed tracking, XA enlistment).
    ///
    /// `ctx` identifies which logical unit of work this statement executes under. Pass `None`
    /// for statements that don't participate in a distributed transaction, or when the owning
    /// pool isn't XA-enabled at all (in which case it's ignored regardless).
    pub fn track_statement<S>(&self, statement: S, ctx: Option<ExecutionContext>) -> StatementHandle<S> {
        let live = self.live.as_ref().expect(DEREF_ERR);
        let xa = ctx.and_then(|ctx| self.pool.xa_context_for(live, ctx));
        StatementHandle::new(statement, &live.statements, xa)
    }

    /// Number of dependent statements currently tracked as open against this checkout.
    pub fn open_statement_count(&self) -> usize {
        self.live
            .as_ref()
            .map(|l| l.statements.len())
            .unwrap_or(0)
    }

    /// Detach the connection from the pool and close it outright, rather than returning it.
    ///
    /// Used when the caller knows the connection is no longer fit for reuse (e.g. it observed a
    /// fatal driver error) and wants to avoid it being handed to the next acquirer.
    pub fn close(mut self) -> BoxFuture<'static, Result<(), Error>> {
        let live = self.live.take().expect(DEREF_ERR);
        let pool = Arc::clone(&self.pool);
        Box::pin(async move {
            live.end_checkout();
            pool.discard(live.raw).await;
            Ok(())
        })
    }
}

impl<F: ConnectFactory> Deref for PooledConnection<F> {
    type Target = F::Connection;

    fn deref(&self) -> &Self::Target {
        &self.live.as_ref().expect(DEREF_ERR).raw
    }
}

impl<F: ConnectFactory> DerefMut for PooledConnection<F> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.live.as_mut().expect(DEREF_ERR).raw
    }
}

impl<F: ConnectFactory> Drop for PooledConnection<F> {
    fn drop(&mut self) {
        if let Some(live) = self.live.take() {
            live.end_checkout();
            self.pool.release(live);
        }
    }
}

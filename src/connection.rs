//! The capability set the pool needs from a physical connection, and how to create one.
//!
//! These traits are the seam between this crate (which only knows about pooling) and a concrete
//! database driver (which knows how to actually open a socket and speak a wire protocol). A
//! driver integration implements [`Connection`] for its connection type and [`ConnectFactory`]
//! for whatever holds the connection parameters (a DSN, a config struct, ...).

use futures_core::future::BoxFuture;

use crate::error::Error;

/// A single physical connection to a database.
///
/// This is intentionally narrow: the pool only ever needs to know how to check liveness and how
/// to close the handle. Everything else (preparing statements, running queries) happens through
/// whatever richer API the driver exposes on `Self` directly — the pool hands out `&mut Self` via
/// [`crate::pool::PooledConnection`]'s `Deref`/`DerefMut`.
pub trait Connection: Send + 'static {
    /// Probe the connection for liveness, e.g. by running a trivial query.
    ///
    /// Used by the pool's `test_before_use` validation path and by the maintenance scheduler's
    /// optional keepalive sweep. Drivers with no cheap native ping can implement this with the
    /// configured `test_query_sql`.
    fn ping(&mut self) -> BoxFuture<'_, Result<(), Error>>;

    /// Close the physical handle. Called by the pool manager on eviction and shutdown; never
    /// called as a side effect of the caller dropping a [`crate::pool::PooledConnection`] (that
    /// returns the connection to the pool instead of destroying it).
    fn close(self) -> BoxFuture<'static, Result<(), Error>>;
}

/// Produces physical connections for a [`Pool`][crate::pool::Pool] to manage.
///
/// Implementations are expected to be cheaply cloneable (an `Arc` around a DSN/config is typical)
/// since the pool manager calls `connect()` repeatedly over its lifetime.
pub trait ConnectFactory: Send + Sync + 'static {
    /// The physical connection type this factory produces.
    type Connection: Connection;

    /// Open one new physical connection.
    ///
    /// A single failed attempt should return promptly with an error; retry policy
    /// (`acquire_retry_times`) is the pool manager's responsibility, not the factory's.
    fn connect(&self) -> BoxFuture<'_, Result<Self::Connection, Error>>;
}

//! Error and Result types.

use std::fmt;

/// A specialized `Result` type for this crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Everything that can go wrong acquiring, using, or managing a pooled connection.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The connection factory refused to connect after exhausting `acquire_retry_times`.
    #[error("failed to establish a connection after retrying: {0}")]
    ConnectFailed(String),

    /// The pool is at `max_pool_size` and `useless_connection_exception` is set.
    #[error("connection pool exhausted")]
    Exhausted,

    /// A bounded wait for a connection expired.
    #[error("timed out waiting for a connection")]
    Timeout,

    /// The wait for a connection was cancelled (the waiting task was dropped).
    #[error("interrupted while waiting for a connection")]
    Interrupted,

    /// An operation was attempted against a proxy that has already been released or destroyed.
    #[error("operation attempted on a closed connection proxy")]
    ProxyClosed,

    /// An operation was attempted against a pool that has been shut down.
    #[error("attempted to use a connection pool that has been closed")]
    PoolClosed,

    /// Enlistment/delistment failed, or the transaction coordinator was asked for an illegal
    /// state transition.
    #[error("transaction error: {0}")]
    TransactionError(String),

    /// A recognized configuration option failed validation.
    #[error("invalid pool configuration: {0}")]
    Config(String),

    /// The underlying connection factory or driver returned an error outside of the acquire
    /// path (e.g. while executing a statement).
    #[error("connection error: {0}")]
    Connection(#[source] Box<dyn std::error::Error + Send + Sync + 'static>),
}

/// Internal signal raised by a liveness probe; never surfaced to callers of [`crate::Pool`].
///
/// A failed probe always results in the proxy being destroyed and a replacement scheduled, so
/// this never needs to escape the pool manager — it exists purely so `try_get_connection`'s retry
/// loop and the validation path can share a `Result` plumbing without conflating "could not
/// connect" with "connected, but failed its health check".
#[derive(Debug)]
pub(crate) struct ValidationFailed;

impl fmt::Display for ValidationFailed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("connection failed liveness validation")
    }
}

impl std::error::Error for ValidationFailed {}

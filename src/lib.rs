//! A bounded, async connection pool with distributed-transaction enlistment.
//!
//! [`Pool`] amortizes the cost of establishing physical connections by keeping a reservoir of
//! them around, handing out [`PooledConnection`] proxies on [`Pool::acquire`] and recycling the
//! underlying handle when the proxy is dropped or explicitly released. A companion
//! [`TransactionCoordinator`] lets statements executed through a pooled connection enlist into an
//! ambient distributed transaction before they run.
//!
//! The pool is generic over a [`ConnectFactory`] so it carries no knowledge of any particular
//! wire protocol; plugging in a driver means implementing [`ConnectFactory`] (and, for XA pools,
//! [`transaction::XaResource`]) for that driver's connection type.

#![forbid(unsafe_code)]

pub mod config;
pub mod connection;
pub mod error;
mod maintenance;
pub mod pool;
pub mod transaction;

pub use config::PoolConfig;
pub use connection::{ConnectFactory, Connection};
pub use error::{Error, Result};
pub use pool::{Pool, PoolOptions, PooledConnection, StatementHandle};
pub use transaction::{DelistFlag, ExecutionContext, SuspendedTransaction, TransactionCoordinator, XaResource};

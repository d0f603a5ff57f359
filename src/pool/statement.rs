//! Component E: the statement invocation layer.
//!
//! A [`StatementHandle`] wraps whatever opaque statement type a driver integration produces
//! (`prepare`/`create_statement` on a connection). It enforces the one contract that matters at
//! this layer — a statement tied to a released proxy can no longer run — and, for connections
//! drawn from an XA-enabled pool, enlists the connection's [`XaResource`] into the ambient
//! transaction before every execution call.
//!
//! Identity-style operations (`Display`, `PartialEq`, `Hash`, "get the owning connection") are
//! implemented directly on the handle rather than routed through the same interception path as
//! `execute`/`execute_batch`/`execute_update`. In the source system this distinction mattered
//! because a dynamic proxy intercepts *every* method call by name and has to special-case these to
//! avoid infinite recursion into the proxy machinery; in Rust there is no such reflection, so the
//! distinction survives only as "which inherent method did you call", which is simpler and cannot
//! accidentally regress.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::Error;
use crate::transaction::{ExecutionContext, TransactionCoordinator, XaResource};

/// Per-checkout registry of statements opened against one [`PooledConnection`][super::PooledConnection].
///
/// A fresh registry is installed on every IDLE → IN_USE transition (so it always starts empty, per
/// the proxy's state-machine invariant) and [`StatementRegistry::drain`] is called on release,
/// marking every statement still outstanding as closed.
#[derive(Default)]
pub(crate) struct StatementRegistry {
    open: Mutex<Vec<(u64, Arc<AtomicBool>)>>,
    next_id: AtomicU64,
}

impl StatementRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(self: &Arc<Self>) -> (u64, Arc<AtomicBool>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let closed = Arc::new(AtomicBool::new(false));
        self.open.lock().unwrap().push((id, closed.clone()));
        (id, closed)
    }

    pub fn deregister(&self, id: u64) {
        self.open.lock().unwrap().retain(|(open_id, _)| *open_id != id);
    }

    /// Mark every still-open statement closed. Returns how many were outstanding, for logging.
    pub fn drain(&self) -> usize {
        let mut open = self.open.lock().unwrap();
        let n = open.len();
        for (_, closed) in open.drain(..) {
            closed.store(true, Ordering::Release);
        }
        n
    }

    pub fn len(&self) -> usize {
        self.open.lock().unwrap().len()
    }
}

/// Enlistment context a [`StatementHandle`] needs to intercept execution calls.
///
/// `None` for pools that aren't participating in distributed transactions — in that case
/// `execute*` delegate directly, matching the "non-transactional pools delegate directly" rule.
#[derive(Clone)]
pub(crate) struct XaContext {
    pub coordinator: Arc<TransactionCoordinator>,
    pub ctx: ExecutionContext,
    pub resource: Arc<dyn XaResource>,
}

/// A statement checked out against a pooled connection.
///
/// `S` is whatever opaque statement type the connection's driver produces; this layer does not
/// need to know anything about it beyond "it's the thing the caller's closure operates on".
pub struct StatementHandle<S> {
    id: u64,
    closed: Arc<AtomicBool>,
    registry: Arc<StatementRegistry>,
    xa: Option<XaContext>,
    statement: S,
}

impl<S> StatementHandle<S> {
    pub(crate) fn new(statement: S, registry: &Arc<StatementRegistry>, xa: Option<XaContext>) -> Self {
        let (id, closed) = registry.register();
        Self {
            id,
            closed,
            registry: registry.clone(),
            xa,
            statement,
        }
    }

    /// True once the owning proxy has been released (or force-closed) with this statement still
    /// outstanding.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Direct, non-intercepted access to the owning connection's identity concerns. Matches the
    /// `to_string`/`equals`/`hash_code`/`get_connection` carve-out in the design.
    pub fn statement_id(&self) -> u64 {
        self.id
    }

    /// Run a read-only statement operation. Delegates directly; enlistment is only required
    /// around the write-capable `execute*` methods per the invocation contract.
    pub async fn query<'a, F, Fut, R>(&'a mut self, op: F) -> Result<R, Error>
    where
        F: FnOnce(&'a mut S) -> Fut,
        Fut: Future<Output = Result<R, Error>> + 'a,
    {
        self.guarded(op).await
    }

    pub async fn execute<'a, F, Fut, R>(&'a mut self, op: F) -> Result<R, Error>
    where
        F: FnOnce(&'a mut S) -> Fut,
        Fut: Future<Output = Result<R, Error>> + 'a,
    {
        if self.is_closed() {
            return Err(Error::ProxyClosed);
        }
        self.enlist().await?;
        self.guarded(op).await
    }

    pub async fn execute_update<'a, F, Fut, R>(&'a mut self, op: F) -> Result<R, Error>
    where
        F: FnOnce(&'a mut S) -> Fut,
        Fut: Future<Output = Result<R, Error>> + 'a,
    {
        self.execute(op).await
    }

    pub async fn execute_batch<'a, F, Fut, R>(&'a mut self, op: F) -> Result<R, Error>
    where
        F: FnOnce(&'a mut S) -> Fut,
        Fut: Future<Output = Result<R, Error>> + 'a,
    {
        self.execute(op).await
    }

    async fn enlist(&self) -> Result<(), Error> {
        if let Some(xa) = &self.xa {
            xa.coordinator
                .enlist(xa.ctx, xa.resource.clone())
                .await
                .map_err(|e| Error::TransactionError(e.to_string()))?;
        }
        Ok(())
    }

    async fn guarded<'a, F, Fut, R>(&'a mut self, op: F) -> Result<R, Error>
    where
        F: FnOnce(&'a mut S) -> Fut,
        Fut: Future<Output = Result<R, Error>> + 'a,
    {
        if self.is_closed() {
            return Err(Error::ProxyClosed);
        }
        op(&mut self.statement).await
    }
}

impl<S> Drop for StatementHandle<S> {
    fn drop(&mut self) {
        self.registry.deregister(self.id);
    }
}

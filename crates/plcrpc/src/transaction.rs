//! # Request Transaction Manager
//!
//! Admission control for outstanding requests on one connection. A device only
//! tolerates a negotiated number of simultaneously outstanding exchanges; the
//! manager keeps the number of in-flight requests at or below that ceiling and
//! queues the rest in submission order.
//!
//! ## Invariants
//!
//! - `active <= limit` at all times.
//! - Queued work is admitted first-in, first-out.
//! - Every admitted transaction is released exactly once. Admission hands out a
//!   [`TransactionGuard`] and the release happens when it drops, so success,
//!   protocol errors, timeouts, panics and abandoned futures all free the slot.
//! - Work items are never invoked while the manager lock is held, so a work item
//!   may freely start and submit further transactions.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::sync::oneshot;

use crate::error::Error;
use crate::error::Result;

/// Manager-wide sequence number of a transaction.
pub type TransactionId = u64;

type Work = Box<dyn FnOnce(TransactionGuard) + Send + 'static>;

struct Queued {
    id: TransactionId,
    work: Work,
}

struct State {
    limit: usize,
    active: usize,
    queue: VecDeque<Queued>,
    next_id: TransactionId,
    admitted: u64,
    released: u64,
    shutdown: bool,
}

impl State {
    /// Pops as many queued items as the limit allows, counting them as active.
    fn admit_queued(&mut self) -> Vec<Queued> {
        let mut admitted = Vec::new();
        while self.active < self.limit {
            let Some(item) = self.queue.pop_front() else { break };
            self.active += 1;
            self.admitted += 1;
            admitted.push(item);
        }
        admitted
    }
}

struct Inner {
    state: Mutex<State>,
    idle: Notify,
}

/// Snapshot of the manager's counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransactionStats {
    pub limit: usize,
    pub active: usize,
    pub queued: usize,
    /// Transactions that were handed a slot.
    pub admitted: u64,
    /// Transactions whose slot was given back.
    pub released: u64,
}

/// Bounds the number of concurrently outstanding requests on one connection.
///
/// Cheap to clone; clones share the same counters and queue.
#[derive(Clone)]
pub struct TransactionManager {
    inner: Arc<Inner>,
}

impl TransactionManager {
    /// Creates a manager admitting at most `limit` concurrent transactions.
    ///
    /// A limit of 0 is treated as 1.
    pub fn new(limit: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    limit: limit.max(1),
                    active: 0,
                    queue: VecDeque::new(),
                    next_id: 1,
                    admitted: 0,
                    released: 0,
                    shutdown: false,
                }),
                idle: Notify::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Starts a new transaction. Never blocks; admission happens on submit.
    pub fn start(&self) -> Transaction {
        let mut state = self.lock();
        let id = state.next_id;
        state.next_id += 1;
        Transaction { id, manager: self.clone() }
    }

    /// Starts a transaction and waits until it is admitted.
    ///
    /// The returned guard holds the slot until it is dropped. If the caller gives
    /// up while still queued, the slot is handed back as soon as it is granted.
    pub async fn acquire(&self) -> Result<TransactionGuard> {
        let (tx, rx) = oneshot::channel();
        self.start().submit(move |guard| {
            // A dropped receiver returns the guard here, which releases it.
            let _ = tx.send(guard);
        });
        rx.await.map_err(|_| Error::Shutdown)
    }

    /// Changes the concurrency ceiling, admitting queued work if it was raised.
    pub fn set_concurrency_limit(&self, limit: usize) {
        let admitted = {
            let mut state = self.lock();
            state.limit = limit.max(1);
            tracing::debug!(limit = state.limit, queued = state.queue.len(), "concurrency limit set");
            state.admit_queued()
        };
        self.run(admitted);
    }

    /// Returns the current ceiling.
    pub fn concurrency_limit(&self) -> usize {
        self.lock().limit
    }

    pub fn stats(&self) -> TransactionStats {
        let state = self.lock();
        TransactionStats {
            limit: state.limit,
            active: state.active,
            queued: state.queue.len(),
            admitted: state.admitted,
            released: state.released,
        }
    }

    /// Shuts the manager down.
    ///
    /// Queued work is dropped without being invoked and later submissions are
    /// discarded. Transactions that already hold a slot run to completion.
    pub fn close(&self) {
        let dropped = {
            let mut state = self.lock();
            state.shutdown = true;
            std::mem::take(&mut state.queue)
        };
        tracing::debug!(dropped = dropped.len(), "transaction manager closed");
        drop(dropped);
        if self.lock().active == 0 {
            self.inner.idle.notify_waiters();
        }
    }

    /// Shuts down, then waits for active transactions to finish.
    ///
    /// Returns `Error::Timeout` if transactions are still active after `timeout`.
    pub async fn close_graceful(&self, timeout: Duration) -> Result<()> {
        self.close();
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let idle = self.inner.idle.notified();
            if self.lock().active == 0 {
                return Ok(());
            }
            if tokio::time::timeout_at(deadline, idle).await.is_err() {
                let active = self.lock().active;
                tracing::warn!(active, "transactions still active after graceful close");
                return Err(Error::Timeout { invoke_id: None, after: timeout });
            }
        }
    }

    fn submit(&self, id: TransactionId, work: Work) {
        let mut state = self.lock();
        if state.shutdown {
            drop(state);
            tracing::debug!(transaction = id, "manager shut down, dropping work");
            return;
        }
        if state.active < state.limit && state.queue.is_empty() {
            state.active += 1;
            state.admitted += 1;
            drop(state);
            tracing::trace!(transaction = id, "admitted immediately");
            work(TransactionGuard::new(id, self.clone()));
        } else {
            state.queue.push_back(Queued { id, work });
            tracing::trace!(transaction = id, queued = state.queue.len(), "queued");
        }
    }

    fn release(&self, id: TransactionId) {
        let admitted = {
            let mut state = self.lock();
            state.active -= 1;
            state.released += 1;
            if state.active == 0 {
                self.inner.idle.notify_waiters();
            }
            state.admit_queued()
        };
        tracing::trace!(transaction = id, "released");
        self.run(admitted);
    }

    fn run(&self, admitted: Vec<Queued>) {
        for Queued { id, work } in admitted {
            tracing::trace!(transaction = id, "admitted from queue");
            work(TransactionGuard::new(id, self.clone()));
        }
    }
}

impl fmt::Display for TransactionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let stats = self.stats();
        write!(
            f,
            "TransactionManager(active: {}/{}, queued: {}, admitted: {}, released: {})",
            stats.active, stats.limit, stats.queued, stats.admitted, stats.released
        )
    }
}

impl fmt::Debug for TransactionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// A started, not yet submitted transaction.
pub struct Transaction {
    id: TransactionId,
    manager: TransactionManager,
}

impl Transaction {
    pub fn id(&self) -> TransactionId {
        self.id
    }

    /// Submits the work item.
    ///
    /// If a slot is free the work runs synchronously on the calling thread,
    /// otherwise it is queued and runs on whichever thread releases a slot.
    /// The work receives the guard that holds its slot.
    pub fn submit(self, work: impl FnOnce(TransactionGuard) + Send + 'static) {
        self.manager.submit(self.id, Box::new(work));
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction").field("id", &self.id).finish()
    }
}

/// Holds one admitted slot. Dropping it ends the transaction.
#[must_use = "dropping the guard immediately ends the transaction"]
pub struct TransactionGuard {
    id: TransactionId,
    manager: TransactionManager,
}

impl TransactionGuard {
    fn new(id: TransactionId, manager: TransactionManager) -> Self {
        Self { id, manager }
    }

    pub fn id(&self) -> TransactionId {
        self.id
    }

    /// Ends the transaction after a successful exchange.
    pub fn end(self) {}

    /// Ends the transaction after a failed exchange.
    pub fn fail(self, reason: &Error) {
        tracing::debug!(transaction = self.id, %reason, "transaction failed");
    }
}

impl Drop for TransactionGuard {
    fn drop(&mut self) {
        self.manager.release(self.id);
    }
}

impl fmt::Debug for TransactionGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionGuard").field("id", &self.id).finish()
    }
}

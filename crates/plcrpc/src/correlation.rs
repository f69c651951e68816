//! # Correlation Table
//!
//! Routes inbound messages to the expectation waiting for them.
//!
//! A driver embeds an invocation id in every request and the device echoes it in
//! the response. The table maps ids to pending expectations; the conversation
//! pump hands every inbound message to [`CorrelationTable::dispatch`], which finds
//! the expectation, lets it test the message and removes it once it fires.
//!
//! Some responses carry no id at all (the COTP connection confirm, for
//! instance). Expectations for those register as [`Key::Uncorrelated`] and are
//! offered every inbound message in registration order.
//!
//! ## Invariants
//!
//! - At most one expectation per id is outstanding.
//! - An expectation fires at most once: dispatch, expiry and `fail_all` race on
//!   the same entry and whichever removes it first wins.
//! - Every entry carries a unique token. Expiring an old registration never
//!   removes a newer entry that happens to reuse the same id.
//! - Once failed, the table rejects new registrations with the same error.

use std::fmt;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry as Slot;

use crate::error::Error;
use crate::error::Result;

/// Per-connection request tag echoed back in the response.
pub type InvokeId = u32;

/// The reserved id that is never handed out.
pub const SENTINEL_INVOKE_ID: InvokeId = 0;

/// Inbound messages expose the invocation id they answer, if any.
pub trait Correlated {
    fn invoke_id(&self) -> Option<InvokeId>;
}

/// What an expectation is registered under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Key {
    /// Matches inbound messages carrying this id.
    Id(InvokeId),
    /// Offered every inbound message, in registration order.
    Uncorrelated,
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Id(id) => write!(f, "#{}", id),
            Self::Uncorrelated => write!(f, "uncorrelated"),
        }
    }
}

/// Generates invocation ids: monotonically increasing, wrapping back to 1 when
/// the protocol's ceiling is reached, never yielding the sentinel 0.
#[derive(Debug)]
pub struct InvokeIdGenerator {
    next: AtomicU32,
    ceiling: InvokeId,
}

impl InvokeIdGenerator {
    /// `first` is the first id handed out; `ceiling` is never handed out.
    pub fn new(first: InvokeId, ceiling: InvokeId) -> Self {
        let ceiling = ceiling.max(2);
        let first = if first == SENTINEL_INVOKE_ID || first >= ceiling { 1 } else { first };
        Self { next: AtomicU32::new(first), ceiling }
    }

    /// Returns the next id.
    pub fn next_id(&self) -> InvokeId {
        let ceiling = self.ceiling;
        self.next
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
                let following = current.wrapping_add(1);
                Some(if following >= ceiling || following == SENTINEL_INVOKE_ID { 1 } else { following })
            })
            .unwrap_or(1)
    }

    /// Number of distinct ids this generator cycles through.
    pub fn span(&self) -> u64 {
        u64::from(self.ceiling) - 1
    }
}

/// A pending expectation with its reply slot, type-erased over the reply type.
pub(crate) trait Responder<M>: Send + Sync {
    /// Tests a message against the expectation. Returns `true` once it fired.
    fn offer(&mut self, msg: &M) -> bool;

    /// Fails the expectation with an error.
    fn fail(&mut self, error: Error);
}

struct Entry<M> {
    token: u64,
    responder: Box<dyn Responder<M>>,
}

/// Maps invocation ids to the expectations awaiting them.
pub struct CorrelationTable<M> {
    keyed: DashMap<InvokeId, Entry<M>>,
    uncorrelated: Mutex<Vec<Entry<M>>>,
    next_token: AtomicU64,
    failed: Mutex<Option<Error>>,
}

impl<M: Correlated> CorrelationTable<M> {
    pub fn new() -> Self {
        Self {
            keyed: DashMap::new(),
            uncorrelated: Mutex::new(Vec::new()),
            next_token: AtomicU64::new(1),
            failed: Mutex::new(None),
        }
    }

    fn failure(&self) -> Option<Error> {
        self.failed.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Picks the next id from `ids` that has no outstanding expectation.
    ///
    /// Returns `Error::InvokeIdsExhausted` if every id in the range is in use.
    pub fn allocate(&self, ids: &InvokeIdGenerator) -> Result<InvokeId> {
        for _ in 0..ids.span() {
            let id = ids.next_id();
            if !self.keyed.contains_key(&id) {
                return Ok(id);
            }
            tracing::debug!(invoke_id = id, "invocation id still outstanding, skipping");
        }
        Err(Error::InvokeIdsExhausted)
    }

    /// Stores an expectation.
    ///
    /// The returned token identifies this registration for [`expire`](Self::expire).
    pub(crate) fn register(&self, key: Key, responder: Box<dyn Responder<M>>) -> Result<u64> {
        if let Some(error) = self.failure() {
            return Err(error);
        }

        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let entry = Entry { token, responder };
        match key {
            Key::Id(id) => match self.keyed.entry(id) {
                Slot::Occupied(_) => return Err(Error::DuplicateInvokeId(id)),
                Slot::Vacant(slot) => {
                    slot.insert(entry);
                }
            },
            Key::Uncorrelated => {
                self.uncorrelated.lock().unwrap_or_else(|e| e.into_inner()).push(entry);
            }
        }

        // A concurrent fail_all may have drained the table before our insert.
        if let Some(error) = self.failure() {
            self.expire(key, token);
            return Err(error);
        }

        tracing::trace!(%key, token, "expectation registered");
        Ok(token)
    }

    /// Removes a registration that timed out or was abandoned.
    ///
    /// Returns `false` if it already fired.
    pub fn expire(&self, key: Key, token: u64) -> bool {
        match key {
            Key::Id(id) => self.keyed.remove_if(&id, |_, entry| entry.token == token).is_some(),
            Key::Uncorrelated => {
                let mut list = self.uncorrelated.lock().unwrap_or_else(|e| e.into_inner());
                let before = list.len();
                list.retain(|entry| entry.token != token);
                list.len() != before
            }
        }
    }

    /// Offers an inbound message to the matching expectation.
    ///
    /// Returns the message back if no expectation accepted it.
    pub fn dispatch(&self, msg: M) -> Option<M> {
        if let Some(id) = msg.invoke_id() {
            // Offer and removal happen under one shard lock, so expiry sees
            // either the live entry or nothing.
            if self.keyed.remove_if_mut(&id, |_, entry| entry.responder.offer(&msg)).is_some() {
                tracing::trace!(invoke_id = id, "response correlated");
                return None;
            }
        }

        let mut list = self.uncorrelated.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(index) = list.iter_mut().position(|entry| entry.responder.offer(&msg)) {
            list.remove(index);
            tracing::trace!("uncorrelated response matched");
            return None;
        }

        Some(msg)
    }

    /// Fails every pending expectation and every later registration.
    pub fn fail_all(&self, error: Error) {
        *self.failed.lock().unwrap_or_else(|e| e.into_inner()) = Some(error.clone());

        let keys: Vec<InvokeId> = self.keyed.iter().map(|e| *e.key()).collect();
        let mut failed = 0usize;
        for key in keys {
            if let Some((_, mut entry)) = self.keyed.remove(&key) {
                entry.responder.fail(error.clone());
                failed += 1;
            }
        }

        let drained = std::mem::take(&mut *self.uncorrelated.lock().unwrap_or_else(|e| e.into_inner()));
        for mut entry in drained {
            entry.responder.fail(error.clone());
            failed += 1;
        }

        tracing::debug!(failed, %error, "failed all pending expectations");
    }

    /// Number of outstanding expectations.
    pub fn len(&self) -> usize {
        self.keyed.len() + self.uncorrelated.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, id: InvokeId) -> bool {
        self.keyed.contains_key(&id)
    }
}

impl<M: Correlated> Default for CorrelationTable<M> {
    fn default() -> Self {
        Self::new()
    }
}

/// Removes its expectation from the table when dropped, unless it already fired.
pub(crate) struct Registration<M: Correlated> {
    table: Arc<CorrelationTable<M>>,
    key: Key,
    token: u64,
}

impl<M: Correlated> Registration<M> {
    pub(crate) fn new(table: Arc<CorrelationTable<M>>, key: Key, token: u64) -> Self {
        Self { table, key, token }
    }

    /// Removes the expectation now. Returns `false` if it already fired.
    pub(crate) fn expire(&self) -> bool {
        self.table.expire(self.key, self.token)
    }
}

impl<M: Correlated> Drop for Registration<M> {
    fn drop(&mut self) {
        if self.table.expire(self.key, self.token) {
            tracing::trace!(key = %self.key, "expectation removed before firing");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use tokio::sync::oneshot;

    #[derive(Debug, Clone, PartialEq)]
    struct Msg {
        id: Option<InvokeId>,
        body: &'static str,
    }

    impl Correlated for Msg {
        fn invoke_id(&self) -> Option<InvokeId> {
            self.id
        }
    }

    /// Fires when the body matches.
    struct BodyIs {
        body: &'static str,
        tx: Option<oneshot::Sender<std::result::Result<Msg, Error>>>,
    }

    impl Responder<Msg> for BodyIs {
        fn offer(&mut self, msg: &Msg) -> bool {
            if msg.body != self.body {
                return false;
            }
            if let Some(tx) = self.tx.take() {
                let _ = tx.send(Ok(msg.clone()));
            }
            true
        }

        fn fail(&mut self, error: Error) {
            if let Some(tx) = self.tx.take() {
                let _ = tx.send(Err(error));
            }
        }
    }

    fn body_is(body: &'static str) -> (Box<dyn Responder<Msg>>, oneshot::Receiver<std::result::Result<Msg, Error>>) {
        let (tx, rx) = oneshot::channel();
        (Box::new(BodyIs { body, tx: Some(tx) }), rx)
    }

    #[test]
    fn test_generator_skips_sentinel_and_wraps() {
        let ids = InvokeIdGenerator::new(3, 5);
        let seen: Vec<_> = (0..6).map(|_| ids.next_id()).collect();
        assert_eq!(seen, vec![3, 4, 1, 2, 3, 4]);
    }

    #[test]
    fn test_generator_clamps_first() {
        assert_eq!(InvokeIdGenerator::new(0, 10).next_id(), 1);
        assert_eq!(InvokeIdGenerator::new(10, 10).next_id(), 1);
    }

    #[test]
    fn test_generator_full_u32_range() {
        let ids = InvokeIdGenerator::new(u32::MAX - 2, u32::MAX);
        assert_eq!(ids.next_id(), u32::MAX - 2);
        assert_eq!(ids.next_id(), u32::MAX - 1);
        assert_eq!(ids.next_id(), 1);
    }

    #[test]
    fn test_allocate_skips_outstanding_ids() {
        let table = CorrelationTable::<Msg>::new();
        let ids = InvokeIdGenerator::new(1, 4);

        let (r, _rx) = body_is("a");
        table.register(Key::Id(1), r).unwrap();

        assert_eq!(table.allocate(&ids).unwrap(), 2);
        assert_eq!(table.allocate(&ids).unwrap(), 3);
        // 1 is still outstanding, so the wrap lands on 2.
        assert_eq!(table.allocate(&ids).unwrap(), 2);
    }

    #[test]
    fn test_allocate_exhausted() {
        let table = CorrelationTable::<Msg>::new();
        let ids = InvokeIdGenerator::new(1, 3);
        let mut keep = Vec::new();
        for id in 1..3 {
            let (r, rx) = body_is("a");
            table.register(Key::Id(id), r).unwrap();
            keep.push(rx);
        }

        assert!(matches!(table.allocate(&ids), Err(Error::InvokeIdsExhausted)));
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let table = CorrelationTable::<Msg>::new();
        let (a, _ra) = body_is("a");
        let (b, _rb) = body_is("b");

        table.register(Key::Id(7), a).unwrap();
        assert!(matches!(table.register(Key::Id(7), b), Err(Error::DuplicateInvokeId(7))));
    }

    #[test]
    fn test_dispatch_resolves_once() {
        let table = CorrelationTable::<Msg>::new();
        let (r, mut rx) = body_is("pong");
        table.register(Key::Id(5), r).unwrap();

        let msg = Msg { id: Some(5), body: "pong" };
        assert!(table.dispatch(msg.clone()).is_none());
        assert_eq!(rx.try_recv().unwrap().unwrap(), msg);

        // A duplicate response has nobody waiting for it.
        assert_eq!(table.dispatch(msg.clone()), Some(msg));
        assert!(table.is_empty());
    }

    #[test]
    fn test_fired_entry_cannot_be_expired() {
        let table = CorrelationTable::<Msg>::new();
        let (r, mut rx) = body_is("pong");
        let token = table.register(Key::Id(6), r).unwrap();

        assert!(table.dispatch(Msg { id: Some(6), body: "pong" }).is_none());

        // The deadline passing now finds nothing to expire, and the reply waits.
        assert!(!table.contains(6));
        assert!(!table.expire(Key::Id(6), token));
        assert!(rx.try_recv().unwrap().is_ok());
    }

    #[test]
    fn test_non_matching_message_keeps_expectation() {
        let table = CorrelationTable::<Msg>::new();
        let (r, mut rx) = body_is("pong");
        table.register(Key::Id(5), r).unwrap();

        let other = Msg { id: Some(5), body: "noise" };
        assert_eq!(table.dispatch(other.clone()), Some(other));
        assert!(table.contains(5));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_uncorrelated_offered_in_order() {
        let table = CorrelationTable::<Msg>::new();
        let (first, mut rx1) = body_is("confirm");
        let (second, mut rx2) = body_is("confirm");
        table.register(Key::Uncorrelated, first).unwrap();
        table.register(Key::Uncorrelated, second).unwrap();

        assert!(table.dispatch(Msg { id: None, body: "confirm" }).is_none());

        assert!(rx1.try_recv().unwrap().is_ok());
        assert!(rx2.try_recv().is_err());
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_stale_expiry_does_not_remove_reused_id() {
        let table = CorrelationTable::<Msg>::new();
        let (old, _rx_old) = body_is("a");
        let old_token = table.register(Key::Id(9), old).unwrap();
        assert!(table.expire(Key::Id(9), old_token));

        let (new, _rx_new) = body_is("a");
        table.register(Key::Id(9), new).unwrap();

        // The old registration's expiry comes late.
        assert!(!table.expire(Key::Id(9), old_token));
        assert!(table.contains(9));
    }

    #[test]
    fn test_fail_all_reaches_every_waiter_and_closes() {
        let table = CorrelationTable::<Msg>::new();
        let (a, mut ra) = body_is("a");
        let (b, mut rb) = body_is("b");
        table.register(Key::Id(1), a).unwrap();
        table.register(Key::Uncorrelated, b).unwrap();

        let lost = Error::Transport(crate::error::TransportError::ConnectionLost("reset".into()));
        table.fail_all(lost);

        assert!(ra.try_recv().unwrap().unwrap_err().is_transport());
        assert!(rb.try_recv().unwrap().unwrap_err().is_transport());
        assert!(table.is_empty());

        let (c, _rc) = body_is("c");
        assert!(table.register(Key::Id(2), c).unwrap_err().is_transport());
    }

    #[test]
    fn test_registration_guard_expires_on_drop() {
        let table = Arc::new(CorrelationTable::<Msg>::new());
        let (r, _rx) = body_is("a");
        let token = table.register(Key::Id(3), r).unwrap();

        drop(Registration::new(table.clone(), Key::Id(3), token));
        assert!(!table.contains(3));
    }
}

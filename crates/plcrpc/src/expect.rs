//! # Expectation Pipeline
//!
//! Describes the response a request is waiting for and delivers it.
//!
//! ```ignore
//! let confirm = conversation
//!     .request(packet)
//!     .expect_response(Key::Id(tpdu_ref), timeout)
//!     .only(|p: Tpkt| p.into_data())
//!     .check(|(tpdu, _)| *tpdu == tpdu_ref)
//!     .unwrap(|(_, message)| message)
//!     .on_timeout(|e| tracing::warn!(%e, "no answer"))
//!     .send()
//!     .await?;
//! ```
//!
//! ## Architecture
//!
//! - **Stages**: `check`, `unwrap` and `only` compose into one
//!   `Fn(M) -> Option<T>`. `None` at any stage means "this message is not for
//!   me"; the expectation stays registered and waits for the next one.
//! - **Registration before send**: `send` stores the expectation in the
//!   correlation table before the request reaches the channel, so a reply that
//!   overtakes the sender is still matched.
//! - **One outcome**: exactly one of success, error (`on_error`) or timeout
//!   (`on_timeout`) happens. Dropping the future removes the expectation.

use std::time::Duration;

use tokio::sync::oneshot;

use crate::conversation::Conversation;
use crate::conversation::Message;
use crate::correlation::Key;
use crate::correlation::Registration;
use crate::correlation::Responder;
use crate::error::Error;
use crate::error::Result;

type Chain<M, T> = Box<dyn Fn(M) -> Option<T> + Send + Sync + 'static>;
type Handler = Box<dyn FnOnce(&Error) + Send + 'static>;

/// A request that has not been sent yet.
pub struct Request<'c, M: Message> {
    conversation: &'c Conversation<M>,
    msg: M,
}

impl<'c, M: Message> Request<'c, M> {
    pub(crate) fn new(conversation: &'c Conversation<M>, msg: M) -> Self {
        Self { conversation, msg }
    }

    /// Declares the response this request waits for and its deadline.
    pub fn expect_response(self, key: Key, timeout: Duration) -> Expectation<'c, M, M> {
        Expectation {
            conversation: self.conversation,
            msg: self.msg,
            key,
            timeout,
            chain: Box::new(Some),
            on_timeout: None,
            on_error: None,
        }
    }

}

/// A request together with the pipeline its response must pass.
pub struct Expectation<'c, M: Message, T> {
    conversation: &'c Conversation<M>,
    msg: M,
    key: Key,
    timeout: Duration,
    chain: Chain<M, T>,
    on_timeout: Option<Handler>,
    on_error: Option<Handler>,
}

impl<'c, M: Message, T: Send + 'static> Expectation<'c, M, T> {
    /// Keeps only values for which the predicate holds.
    pub fn check(self, predicate: impl Fn(&T) -> bool + Send + Sync + 'static) -> Self {
        let chain = self.chain;
        Expectation {
            chain: Box::new(move |m| chain(m).filter(|t| predicate(t))),
            conversation: self.conversation,
            msg: self.msg,
            key: self.key,
            timeout: self.timeout,
            on_timeout: self.on_timeout,
            on_error: self.on_error,
        }
    }

    /// Extracts a nested payload.
    pub fn unwrap<U>(self, f: impl Fn(T) -> U + Send + Sync + 'static) -> Expectation<'c, M, U> {
        self.only(move |t| Some(f(t)))
    }

    /// Narrows to one variant: a combined check and unwrap.
    pub fn only<U>(self, f: impl Fn(T) -> Option<U> + Send + Sync + 'static) -> Expectation<'c, M, U> {
        let chain = self.chain;
        Expectation {
            chain: Box::new(move |m| chain(m).and_then(&f)),
            conversation: self.conversation,
            msg: self.msg,
            key: self.key,
            timeout: self.timeout,
            on_timeout: self.on_timeout,
            on_error: self.on_error,
        }
    }

    /// Runs when the deadline passes without a matching response.
    pub fn on_timeout(mut self, handler: impl FnOnce(&Error) + Send + 'static) -> Self {
        self.on_timeout = Some(Box::new(handler));
        self
    }

    /// Runs when the channel fails before a matching response arrives.
    pub fn on_error(mut self, handler: impl FnOnce(&Error) + Send + 'static) -> Self {
        self.on_error = Some(Box::new(handler));
        self
    }

    /// Sends the request and waits for the unwrapped response.
    pub async fn send(self) -> Result<T> {
        let Expectation { conversation, msg, key, timeout, chain, on_timeout, on_error } = self;

        let (tx, mut rx) = oneshot::channel();
        let table = conversation.table();
        let token = match table.register(key, Box::new(PendingReply { chain, tx: Some(tx) })) {
            Ok(token) => token,
            Err(error) => return Err(fire(on_error, error)),
        };
        let registration = Registration::new(table.clone(), key, token);

        if let Err(error) = conversation.send_raw(msg).await {
            return Err(fire(on_error, error));
        }

        match tokio::time::timeout(timeout, &mut rx).await {
            Ok(Ok(Ok(value))) => Ok(value),
            Ok(Ok(Err(error))) => Err(fire(on_error, error)),
            Ok(Err(_)) => Err(fire(on_error, Error::ChannelClosed)),
            Err(_) => {
                registration.expire();
                // A response delivered between the deadline and the removal wins.
                if let Ok(outcome) = rx.try_recv() {
                    return outcome.map_err(|error| fire(on_error, error));
                }
                let invoke_id = match key {
                    Key::Id(id) => Some(id),
                    Key::Uncorrelated => None,
                };
                tracing::debug!(%key, ?timeout, peer = conversation.name(), "request timed out");
                Err(fire(on_timeout, Error::Timeout { invoke_id, after: timeout }))
            }
        }
    }

    /// Sends the request and maps the response through `handler`.
    pub async fn handle<R>(self, handler: impl FnOnce(T) -> R) -> Result<R> {
        self.send().await.map(handler)
    }
}

fn fire(handler: Option<Handler>, error: Error) -> Error {
    if let Some(handler) = handler {
        handler(&error);
    }
    error
}

/// The type-erased entry the correlation table stores.
struct PendingReply<M, T> {
    chain: Chain<M, T>,
    tx: Option<oneshot::Sender<Result<T>>>,
}

impl<M: Clone, T: Send> Responder<M> for PendingReply<M, T> {
    fn offer(&mut self, msg: &M) -> bool {
        if self.tx.is_none() {
            return true;
        }
        let Some(value) = (self.chain)(msg.clone()) else {
            return false;
        };
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(Ok(value));
        }
        true
    }

    fn fail(&mut self, error: Error) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(Err(error));
        }
    }
}

//! # Handshake State Machine
//!
//! Connection setup as an explicit step enum driven by one async task.
//!
//! A driver implements [`Handshake`] for its protocol: `first_step` names where
//! to begin, and `step` performs one request/response exchange through the
//! conversation and says what comes next. [`run`] drives the machine and owns
//! the connection state: it publishes `Connected` when the machine finishes
//! and `Failed` (closing the conversation) on the first error.

use std::fmt;
use std::sync::Arc;

use crate::conversation::ConnectionState;
use crate::conversation::Conversation;
use crate::conversation::Message;
use crate::error::Error;
use crate::error::Result;

/// What a handshake step decided.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition<S, O> {
    /// Continue with another step.
    Next(S),
    /// The connection is established.
    Done(O),
}

/// A protocol's connection setup sequence.
#[async_trait::async_trait]
pub trait Handshake<M: Message>: Send + Sync {
    /// Step enum; its `Debug` form names the step in errors and logs.
    type Step: fmt::Debug + Send + Sync;
    /// What the handshake learned (negotiated sizes, controller type, ...).
    type Outcome: Send;

    fn first_step(&self) -> Self::Step;

    /// Performs one step.
    async fn step(
        &self,
        step: &Self::Step,
        conversation: &Conversation<M>,
    ) -> Result<Transition<Self::Step, Self::Outcome>>;
}

/// Drives `handshake` to completion on `conversation`.
///
/// Returns the outcome once the last step finishes. The first failing step
/// aborts the chain: no further step runs, the conversation is closed, and the
/// step's error is returned wrapped in [`Error::Handshake`].
pub async fn run<M, H>(handshake: &H, conversation: &Conversation<M>) -> Result<H::Outcome>
where
    M: Message,
    H: Handshake<M>,
{
    let mut step = handshake.first_step();
    loop {
        tracing::debug!(peer = conversation.name(), step = ?step, "handshake step");
        match handshake.step(&step, conversation).await {
            Ok(Transition::Next(next)) => step = next,
            Ok(Transition::Done(outcome)) => {
                conversation.set_state(ConnectionState::Connected);
                tracing::info!(peer = conversation.name(), "connected");
                return Ok(outcome);
            }
            Err(source) => {
                let error = Error::Handshake { step: format!("{:?}", step), source: Arc::new(source) };
                tracing::warn!(peer = conversation.name(), %error, "handshake aborted");
                conversation.set_state(ConnectionState::Failed(error.clone()));
                if let Err(e) = conversation.close().await {
                    tracing::debug!(peer = conversation.name(), error = %e, "close after failed handshake");
                }
                return Err(error);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::channel::MemoryChannel;
    use crate::conversation::ConversationConfig;
    use crate::correlation::Correlated;
    use crate::correlation::InvokeId;

    #[derive(Debug, Clone)]
    struct Nothing;

    impl Correlated for Nothing {
        fn invoke_id(&self) -> Option<InvokeId> {
            None
        }
    }

    /// Counts down without touching the wire.
    struct Countdown;

    #[async_trait::async_trait]
    impl Handshake<Nothing> for Countdown {
        type Step = u8;
        type Outcome = &'static str;

        fn first_step(&self) -> u8 {
            3
        }

        async fn step(&self, step: &u8, _: &Conversation<Nothing>) -> Result<Transition<u8, &'static str>> {
            Ok(match step {
                0 => Transition::Done("ready"),
                n => Transition::Next(n - 1),
            })
        }
    }

    #[tokio::test]
    async fn test_run_publishes_connected() {
        let (near, _far) = MemoryChannel::pair();
        let conversation = Conversation::new("plc", Arc::new(near), ConversationConfig::default());
        assert!(matches!(conversation.state(), ConnectionState::Connecting));

        let outcome = run(&Countdown, &conversation).await.unwrap();

        assert_eq!(outcome, "ready");
        assert!(conversation.state().is_connected());
    }
}

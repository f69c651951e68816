//! # Channel Abstraction
//!
//! A minimal, async interface for moving decoded protocol messages between a
//! driver and a device.
//!
//! ## Philosophy
//!
//! - **Message-Oriented**: Framing and bit-level codecs live below this layer.
//!   A channel moves whole, already-decoded messages of one protocol type.
//! - **Split Directions**: `send` and `recv` are independent. Correlating a
//!   reply to its request is the job of the correlation table, not the channel.

use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::sync::mpsc;

use crate::error::TransportError;

pub type Result<T> = std::result::Result<T, TransportError>;

/// A bidirectional stream of protocol messages.
///
/// This trait is designed to be object-safe (`Arc<dyn Channel<M>>`).
#[async_trait::async_trait]
pub trait Channel<M>: Send + Sync + 'static {
    /// Hands one message to the transport.
    ///
    /// Returns once the message is queued for transmission, not when a reply arrives.
    async fn send(&self, msg: M) -> Result<()>;

    /// Waits for the next inbound message.
    ///
    /// # invariants
    /// - Returns `Ok(None)` once the remote side closed the stream.
    /// - Returns `Err` if the link failed.
    /// - Only one task calls `recv` at a time (the conversation pump).
    async fn recv(&self) -> Result<Option<M>>;

    /// Closes the outbound direction. The remote side observes end-of-stream.
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// An in-memory duplex channel built on tokio mpsc channels.
///
/// Messages sent on one end appear on the other end's `recv()` and vice versa.
/// Tests use the far end to play the device.
pub struct MemoryChannel<M> {
    tx: std::sync::Mutex<Option<mpsc::UnboundedSender<M>>>,
    rx: Arc<Mutex<mpsc::UnboundedReceiver<M>>>,
}

impl<M> MemoryChannel<M> {
    /// Creates a channel from separate tx and rx halves.
    pub fn new(tx: mpsc::UnboundedSender<M>, rx: mpsc::UnboundedReceiver<M>) -> Self {
        Self {
            tx: std::sync::Mutex::new(Some(tx)),
            rx: Arc::new(Mutex::new(rx)),
        }
    }

    /// Creates a pair of channels connected to each other.
    ///
    /// Messages sent on `a` are received by `b` and vice versa.
    pub fn pair() -> (Self, Self) {
        let (tx_a, rx_a) = mpsc::unbounded_channel();
        let (tx_b, rx_b) = mpsc::unbounded_channel();

        (Self::new(tx_a, rx_b), Self::new(tx_b, rx_a))
    }
}

#[async_trait::async_trait]
impl<M: Send + 'static> Channel<M> for MemoryChannel<M> {
    async fn send(&self, msg: M) -> Result<()> {
        let tx = self.tx.lock().unwrap_or_else(|e| e.into_inner()).clone();
        let Some(tx) = tx else {
            return Err(TransportError::Closed);
        };
        tx.send(msg).map_err(|_| TransportError::ConnectionLost("Channel closed".into()))
    }

    async fn recv(&self) -> Result<Option<M>> {
        let mut rx = self.rx.lock().await;
        Ok(rx.recv().await)
    }

    async fn close(&self) -> Result<()> {
        self.tx.lock().unwrap_or_else(|e| e.into_inner()).take();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pair_delivers_both_ways() {
        let (a, b) = MemoryChannel::<u32>::pair();

        a.send(7).await.unwrap();
        b.send(9).await.unwrap();

        assert_eq!(b.recv().await.unwrap(), Some(7));
        assert_eq!(a.recv().await.unwrap(), Some(9));
    }

    #[tokio::test]
    async fn test_close_ends_remote_stream() {
        let (a, b) = MemoryChannel::<u32>::pair();

        a.close().await.unwrap();

        assert_eq!(b.recv().await.unwrap(), None);
        assert_eq!(a.send(1).await, Err(TransportError::Closed));
    }
}

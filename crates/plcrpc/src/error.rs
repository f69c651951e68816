//! # Error Definitions
//!
//! The central ledger of every failure the correlation engine can surface.
//!
//! Errors are `Clone` because a single failure is routinely fanned out to many
//! waiters: a transport reset fails every pending expectation, and a failed
//! symbol lookup fails every caller sharing that resolution.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::correlation::InvokeId;

/// Errors that occur at the channel/transport layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The peer is unreachable or the connection was dropped.
    ConnectionLost(String),
    /// The channel was closed locally.
    Closed,
    /// Generic I/O error or internal transport failure.
    Io(String),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConnectionLost(msg) => write!(f, "Connection lost: {}", msg),
            Self::Closed => write!(f, "Channel closed"),
            Self::Io(msg) => write!(f, "I/O error: {}", msg),
        }
    }
}

impl std::error::Error for TransportError {}

/// Failures surfaced to callers of the engine.
#[derive(Debug, Clone)]
pub enum Error {
    /// No matching response arrived within the deadline.
    Timeout { invoke_id: Option<InvokeId>, after: Duration },
    /// The device answered with a non-OK status code.
    Protocol { code: u32, message: String },
    /// The connection failed; every pending exchange on it fails with this.
    Transport(TransportError),
    /// A symbolic address could not be turned into a direct one.
    Resolution { key: String, reason: String },
    /// A connection handshake step failed; the connection never became usable.
    Handshake { step: String, source: Arc<Error> },
    /// The transaction manager was shut down before the work was admitted.
    Shutdown,
    /// An expectation is already registered for this invocation id.
    DuplicateInvokeId(InvokeId),
    /// Every invocation id in the protocol's range is still outstanding.
    InvokeIdsExhausted,
    /// The reply slot was dropped without delivering an outcome.
    ChannelClosed,
}

impl Error {
    /// Shorthand for a device status-code failure.
    pub fn protocol(code: u32, message: impl Into<String>) -> Self {
        Self::Protocol { code, message: message.into() }
    }

    /// Shorthand for a failed symbolic resolution.
    pub fn resolution(key: impl fmt::Debug, reason: impl Into<String>) -> Self {
        Self::Resolution { key: format!("{:?}", key), reason: reason.into() }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout { invoke_id: Some(id), after } => {
                write!(f, "Request {} timed out after {:?}", id, after)
            }
            Self::Timeout { invoke_id: None, after } => write!(f, "Request timed out after {:?}", after),
            Self::Protocol { code, message } => write!(f, "Protocol error 0x{:x}: {}", code, message),
            Self::Transport(e) => write!(f, "Transport error: {}", e),
            Self::Resolution { key, reason } => write!(f, "Could not resolve {}: {}", key, reason),
            Self::Handshake { step, source } => write!(f, "Handshake failed at step {}: {}", step, source),
            Self::Shutdown => write!(f, "Transaction manager is shut down"),
            Self::DuplicateInvokeId(id) => write!(f, "Invocation id {} is already outstanding", id),
            Self::InvokeIdsExhausted => write!(f, "No free invocation id"),
            Self::ChannelClosed => write!(f, "Response channel closed"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Transport(e) => Some(e),
            Self::Handshake { source, .. } => Some(source.as_ref()),
            _ => None,
        }
    }
}

impl From<TransportError> for Error {
    fn from(e: TransportError) -> Self {
        Self::Transport(e)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

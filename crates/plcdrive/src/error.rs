use std::fmt;

/// Failures surfaced by the drivers.
#[derive(Debug, Clone)]
pub enum Error {
    /// The exchange itself failed: timeout, transport, handshake, resolution.
    Rpc(plcrpc::Error),
    /// The request cannot be sent as given.
    InvalidRequest(String),
    /// The device answered with something that does not fit the request.
    Malformed(String),
    /// No live subscription has this id.
    UnknownSubscription(u64),
}

impl Error {
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::Malformed(message.into())
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Rpc(e) if e.is_timeout())
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rpc(e) => write!(f, "{}", e),
            Self::InvalidRequest(msg) => write!(f, "Invalid request: {}", msg),
            Self::Malformed(msg) => write!(f, "Malformed response: {}", msg),
            Self::UnknownSubscription(id) => write!(f, "Unknown subscription {}", id),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Rpc(e) => Some(e),
            _ => None,
        }
    }
}

impl From<plcrpc::Error> for Error {
    fn from(e: plcrpc::Error) -> Self {
        Self::Rpc(e)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

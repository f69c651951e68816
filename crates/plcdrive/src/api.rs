//! # Driver API
//!
//! The protocol-neutral surface every driver exposes. Requests name their
//! items so responses can be matched back by name; values travel as raw bytes
//! in the device's own encoding.

use std::fmt;

use tokio::sync::watch;

use plcrpc::ConnectionState;

use crate::error::Error;
use crate::error::Result;
use crate::subscription::Subscription;
use crate::subscription::SubscriptionHandle;

/// Outcome of one item of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResponseCode {
    Ok,
    NotFound,
    AccessDenied,
    InvalidAddress,
    InvalidDataType,
    InternalError,
    /// The device reported an error this driver has no closer mapping for.
    RemoteError,
}

impl ResponseCode {
    pub fn is_ok(self) -> bool {
        self == Self::Ok
    }
}

impl fmt::Display for ResponseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Ok => "ok",
            Self::NotFound => "not found",
            Self::AccessDenied => "access denied",
            Self::InvalidAddress => "invalid address",
            Self::InvalidDataType => "invalid data type",
            Self::InternalError => "internal error",
            Self::RemoteError => "remote error",
        };
        f.write_str(name)
    }
}

/// Named fields to read.
#[derive(Debug, Clone)]
pub struct ReadRequest<F> {
    pub items: Vec<(String, F)>,
}

impl<F> ReadRequest<F> {
    pub fn new() -> Self {
        Self { items: Vec::new() }
    }

    pub fn add(mut self, name: impl Into<String>, field: F) -> Self {
        self.items.push((name.into(), field));
        self
    }

    pub(crate) fn check(&self) -> Result<()> {
        non_empty(self.items.len())
    }
}

impl<F> Default for ReadRequest<F> {
    fn default() -> Self {
        Self::new()
    }
}

/// Named fields with the bytes to store in them.
#[derive(Debug, Clone)]
pub struct WriteRequest<F> {
    pub items: Vec<(String, F, Vec<u8>)>,
}

impl<F> WriteRequest<F> {
    pub fn new() -> Self {
        Self { items: Vec::new() }
    }

    pub fn add(mut self, name: impl Into<String>, field: F, value: impl Into<Vec<u8>>) -> Self {
        self.items.push((name.into(), field, value.into()));
        self
    }

    pub(crate) fn check(&self) -> Result<()> {
        non_empty(self.items.len())
    }
}

impl<F> Default for WriteRequest<F> {
    fn default() -> Self {
        Self::new()
    }
}

/// Named things to watch. What a trigger is depends on the protocol.
#[derive(Debug, Clone)]
pub struct SubscribeRequest<T> {
    pub items: Vec<(String, T)>,
}

impl<T> SubscribeRequest<T> {
    pub fn new() -> Self {
        Self { items: Vec::new() }
    }

    pub fn add(mut self, name: impl Into<String>, trigger: T) -> Self {
        self.items.push((name.into(), trigger));
        self
    }

    pub(crate) fn check(&self) -> Result<()> {
        non_empty(self.items.len())
    }
}

impl<T> Default for SubscribeRequest<T> {
    fn default() -> Self {
        Self::new()
    }
}

fn non_empty(len: usize) -> Result<()> {
    if len == 0 {
        return Err(Error::InvalidRequest("request has no items".into()));
    }
    Ok(())
}

/// One read item's outcome. `value` is set only when `code` is `Ok`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadItem {
    pub name: String,
    pub code: ResponseCode,
    pub value: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadResponse {
    pub items: Vec<ReadItem>,
}

impl ReadResponse {
    pub fn get(&self, name: &str) -> Option<&ReadItem> {
        self.items.iter().find(|item| item.name == name)
    }

    pub fn value(&self, name: &str) -> Option<&[u8]> {
        self.get(name)?.value.as_deref()
    }
}

/// Per-item codes of a write or unsubscribe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusResponse {
    pub items: Vec<(String, ResponseCode)>,
}

impl StatusResponse {
    pub fn code(&self, name: &str) -> Option<ResponseCode> {
        self.items.iter().find(|(n, _)| n == name).map(|(_, code)| *code)
    }

    pub fn all_ok(&self) -> bool {
        self.items.iter().all(|(_, code)| code.is_ok())
    }
}

pub type WriteResponse = StatusResponse;
pub type UnsubscribeResponse = StatusResponse;

/// A connected controller.
#[async_trait::async_trait]
pub trait Driver: Send + Sync {
    /// How this protocol addresses a value.
    type Field: Send + Sync;
    /// What a subscription item watches.
    type Trigger: Send + Sync;

    async fn read(&self, request: ReadRequest<Self::Field>) -> Result<ReadResponse>;

    async fn write(&self, request: WriteRequest<Self::Field>) -> Result<WriteResponse>;

    async fn subscribe(&self, request: SubscribeRequest<Self::Trigger>) -> Result<Subscription>;

    async fn unsubscribe(&self, handle: &SubscriptionHandle) -> Result<UnsubscribeResponse>;

    /// Watches the connection lifecycle.
    fn state(&self) -> watch::Receiver<ConnectionState>;

    async fn close(&self) -> Result<()>;
}

//! # Conversation with Async Pump
//!
//! A `Conversation` is one live connection to a device. It owns the channel,
//! the correlation table, the transaction manager and the invocation-id
//! generator, and spawns a background pump that reads every inbound message
//! and routes it to the expectation waiting for it.
//!
//! Messages nobody is waiting for (alarms, notifications, late duplicates) go
//! to the unsolicited handler if one is installed and are dropped otherwise.

use std::fmt;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::RwLock;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::channel::Channel;
use crate::correlation::Correlated;
use crate::correlation::CorrelationTable;
use crate::correlation::InvokeId;
use crate::correlation::InvokeIdGenerator;
use crate::error::Error;
use crate::error::Result;
use crate::error::TransportError;
use crate::expect::Request;
use crate::transaction::TransactionManager;

/// Everything a protocol message type needs to travel through a conversation.
pub trait Message: Correlated + Clone + Send + Sync + 'static {}

impl<T: Correlated + Clone + Send + Sync + 'static> Message for T {}

type Unsolicited<M> = Arc<RwLock<Option<Box<dyn Fn(M) + Send + Sync>>>>;

/// Lifecycle of a connection.
#[derive(Debug, Clone)]
pub enum ConnectionState {
    /// The handshake has not completed yet.
    Connecting,
    /// The handshake completed; requests may be issued.
    Connected,
    /// The connection was closed, locally or by the device.
    Disconnected,
    /// The handshake or the link failed.
    Failed(Error),
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }

    /// `true` once the state can no longer change.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Disconnected | Self::Failed(_))
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
            Self::Disconnected => write!(f, "disconnected"),
            Self::Failed(e) => write!(f, "failed: {}", e),
        }
    }
}

/// Knobs shared by every conversation regardless of protocol.
#[derive(Debug, Clone)]
pub struct ConversationConfig {
    /// Deadline for a single request/response exchange.
    pub request_timeout: Duration,
    /// Transactions admitted at once before the handshake negotiates a limit.
    pub initial_concurrency: usize,
    /// First invocation id handed out.
    pub first_invoke_id: InvokeId,
    /// Invocation ids wrap back to 1 when they reach this value.
    pub invoke_id_ceiling: InvokeId,
}

impl Default for ConversationConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(10),
            initial_concurrency: 1,
            first_invoke_id: 1,
            invoke_id_ceiling: u32::MAX,
        }
    }
}

impl ConversationConfig {
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_initial_concurrency(mut self, limit: usize) -> Self {
        self.initial_concurrency = limit;
        self
    }

    pub fn with_invoke_ids(mut self, first: InvokeId, ceiling: InvokeId) -> Self {
        self.first_invoke_id = first;
        self.invoke_id_ceiling = ceiling;
        self
    }
}

/// One connection to one device.
///
/// Wrap it in an `Arc` to share it between tasks; every method takes `&self`.
pub struct Conversation<M: Message> {
    name: String,
    config: ConversationConfig,
    channel: Arc<dyn Channel<M>>,
    table: Arc<CorrelationTable<M>>,
    transactions: TransactionManager,
    ids: InvokeIdGenerator,
    state: Arc<watch::Sender<ConnectionState>>,
    unsolicited: Unsolicited<M>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl<M: Message> Conversation<M> {
    /// Creates a conversation and spawns the background pump task.
    ///
    /// The conversation starts in [`ConnectionState::Connecting`]; a handshake
    /// moves it on.
    pub fn new(name: impl Into<String>, channel: Arc<dyn Channel<M>>, config: ConversationConfig) -> Self {
        let name = name.into();
        let table = Arc::new(CorrelationTable::new());
        let (state, _) = watch::channel(ConnectionState::Connecting);
        let state = Arc::new(state);
        let unsolicited: Unsolicited<M> = Arc::new(RwLock::new(None));

        let pump = tokio::spawn(Self::pump(
            name.clone(),
            channel.clone(),
            table.clone(),
            state.clone(),
            unsolicited.clone(),
        ));

        Self {
            transactions: TransactionManager::new(config.initial_concurrency),
            ids: InvokeIdGenerator::new(config.first_invoke_id, config.invoke_id_ceiling),
            name,
            config,
            channel,
            table,
            state,
            unsolicited,
            pump: Mutex::new(Some(pump)),
        }
    }

    async fn pump(
        name: String,
        channel: Arc<dyn Channel<M>>,
        table: Arc<CorrelationTable<M>>,
        state: Arc<watch::Sender<ConnectionState>>,
        unsolicited: Unsolicited<M>,
    ) {
        let error = loop {
            match channel.recv().await {
                Ok(Some(msg)) => {
                    let Some(msg) = table.dispatch(msg) else {
                        continue;
                    };
                    let handler = unsolicited.read().unwrap_or_else(|e| e.into_inner());
                    match handler.as_ref() {
                        Some(handler) => handler(msg),
                        None => tracing::trace!(peer = %name, "dropping unsolicited message"),
                    }
                }
                Ok(None) => {
                    tracing::debug!(peer = %name, "device closed the stream");
                    break TransportError::ConnectionLost("Stream closed".into());
                }
                Err(e) => {
                    tracing::warn!(peer = %name, error = %e, "transport error in pump");
                    break e;
                }
            }
        };

        let graceful = matches!(error, TransportError::ConnectionLost(_) | TransportError::Closed);
        table.fail_all(Error::Transport(error.clone()));
        state.send_if_modified(|current| {
            if current.is_terminal() {
                return false;
            }
            *current = if graceful { ConnectionState::Disconnected } else { ConnectionState::Failed(error.into()) };
            true
        });
    }

    /// Returns the peer name used for logging and diagnostics.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &ConversationConfig {
        &self.config
    }

    pub fn transactions(&self) -> &TransactionManager {
        &self.transactions
    }

    pub(crate) fn table(&self) -> &Arc<CorrelationTable<M>> {
        &self.table
    }

    /// Number of expectations still waiting for a response.
    pub fn pending(&self) -> usize {
        self.table.len()
    }

    /// Allocates an invocation id with no outstanding expectation.
    pub fn next_invoke_id(&self) -> Result<InvokeId> {
        self.table.allocate(&self.ids)
    }

    /// Starts building a request. Nothing is sent until the expectation is.
    pub fn request(&self, msg: M) -> Request<'_, M> {
        Request::new(self, msg)
    }

    pub(crate) async fn send_raw(&self, msg: M) -> Result<()> {
        self.channel.send(msg).await.map_err(Error::from)
    }

    /// Installs the handler for inbound messages no expectation claimed.
    ///
    /// The handler runs on the pump task and must not block.
    pub fn on_unsolicited(&self, handler: impl Fn(M) + Send + Sync + 'static) {
        *self.unsolicited.write().unwrap_or_else(|e| e.into_inner()) = Some(Box::new(handler));
    }

    pub fn state(&self) -> ConnectionState {
        self.state.borrow().clone()
    }

    /// Watches lifecycle changes.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Moves to a new state unless the connection already ended.
    pub(crate) fn set_state(&self, next: ConnectionState) {
        self.state.send_if_modified(|current| {
            if current.is_terminal() {
                return false;
            }
            tracing::debug!(peer = %self.name, from = %current, to = %next, "connection state");
            *current = next;
            true
        });
    }

    /// Fails pending work, closes the channel and stops the pump.
    pub async fn close(&self) -> Result<()> {
        self.transactions.close();
        let closed = self.channel.close().await;
        self.table.fail_all(Error::Transport(TransportError::Closed));
        self.set_state(ConnectionState::Disconnected);
        if let Some(pump) = self.pump.lock().unwrap_or_else(|e| e.into_inner()).take() {
            pump.abort();
        }
        tracing::info!(peer = %self.name, "conversation closed");
        closed.map_err(Error::from)
    }
}

impl<M: Message> Drop for Conversation<M> {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.lock().unwrap_or_else(|e| e.into_inner()).take() {
            pump.abort();
        }
    }
}

impl<M: Message> fmt::Debug for Conversation<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Conversation")
            .field("name", &self.name)
            .field("state", &*self.state.borrow())
            .field("pending", &self.table.len())
            .field("transactions", &self.transactions)
            .finish()
    }
}

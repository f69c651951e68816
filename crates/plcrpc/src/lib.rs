//! Transaction-bounded request/response correlation for controller protocols.

pub mod channel;
pub mod conversation;
pub mod correlation;
pub mod error;
pub mod expect;
pub mod handshake;
pub mod resolve;
pub mod transaction;

pub use channel::Channel;
pub use channel::MemoryChannel;
pub use conversation::ConnectionState;
pub use conversation::Conversation;
pub use conversation::ConversationConfig;
pub use conversation::Message;
pub use correlation::Correlated;
pub use correlation::InvokeId;
pub use correlation::Key;
pub use error::Error;
pub use error::Result;
pub use error::TransportError;
pub use handshake::Handshake;
pub use handshake::Transition;
pub use resolve::Resolve;
pub use resolve::ResolutionCache;
pub use transaction::TransactionGuard;
pub use transaction::TransactionManager;

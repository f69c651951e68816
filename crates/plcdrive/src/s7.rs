//! # S7 Driver
//!
//! Siemens S7 over ISO-on-TCP (TPKT + COTP).
//!
//! ## Architecture
//!
//! - **Handshake**: COTP connect, then S7 setup communication, then (only if
//!   the controller type is unknown) an SZL read of the module identification.
//!   The PLC's `max_amq_callee` becomes the conversation's concurrency limit.
//! - **Correlation**: requests are matched by the S7 PDU reference. Setup
//!   messages carry reference 0 and are matched by arrival instead.
//! - **Events**: mode transitions and pushed alarms arrive unsolicited and are
//!   routed by event type.

pub mod driver;
pub mod field;
pub mod handshake;
pub mod message;

pub use driver::S7Driver;
pub use field::DataType;
pub use field::S7Field;
pub use handshake::Negotiated;
pub use message::EventType;
pub use message::MemoryArea;
pub use message::Tpkt;

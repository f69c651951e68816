//! # ADS Driver
//!
//! Beckhoff ADS over AMS/TCP.
//!
//! ## Architecture
//!
//! - **Correlation**: by AMS invoke id. Device notifications carry id 0 and
//!   are routed by notification handle instead.
//! - **Symbols**: symbolic fields are turned into `SYM_VALBYHND` addresses by
//!   a [`ResolutionCache`](plcrpc::ResolutionCache); concurrent requests naming
//!   the same symbol share one lookup.
//! - **Sum-up requests**: several fields read or written together travel as
//!   one `ReadWrite` on a sum-up index group. Per-item return codes come
//!   first, then the data.

pub mod driver;
pub mod field;
pub mod message;
mod resolver;
mod session;

pub use driver::AdsDriver;
pub use field::DataType;
pub use field::DirectField;
pub use field::Field;
pub use field::Notification;
pub use field::NotificationMode;
pub use field::SymbolicField;
pub use message::AdsData;
pub use message::AmsPacket;

//! Drivers for S7 and ADS controllers on top of `plcrpc` conversations.
//!
//! Each driver takes a [`plcrpc::Channel`] of decoded protocol messages, runs
//! the protocol's connection handshake and then implements [`Driver`].

pub mod ads;
pub mod api;
pub mod config;
pub mod error;
pub mod s7;
pub mod subscription;

pub use ads::AdsDriver;
pub use api::Driver;
pub use api::ReadRequest;
pub use api::ReadResponse;
pub use api::ResponseCode;
pub use api::StatusResponse;
pub use api::SubscribeRequest;
pub use api::WriteRequest;
pub use config::AdsConfig;
pub use config::AmsAddress;
pub use config::AmsNetId;
pub use config::ControllerType;
pub use config::S7Config;
pub use error::Error;
pub use error::Result;
pub use s7::S7Driver;
pub use subscription::Subscription;
pub use subscription::SubscriptionEvent;
pub use subscription::SubscriptionHandle;

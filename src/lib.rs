//! BBDO broker.
//!
//! Receives monitoring events from pollers, multiplexes them through a
//! sequenced in-memory engine and feeds them to any number of outputs over
//! the BBDO wire protocol, with composable transport layers (TCP, file,
//! memory, TLS, compression, failover).

pub mod bbdo;
pub mod broker;
pub mod cache;
pub mod catalogue;
pub mod config;
pub mod events;
pub mod multiplexing;
pub mod processing;
pub mod stream;
pub mod utils;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use broker::{Broker, BrokerError, EndpointStatus};
pub use config::Config;

//! chatrelay - Real-time text-messaging relay
//!
//! This library provides a TCP relay that routes chat messages between
//! authenticated users, queues them for users who are offline and redelivers
//! anything the receiver has not acknowledged.

pub mod relay;

pub use relay::{MessageBroker, RelayClient, RelayConfig, RelayServer, SessionRegistry};

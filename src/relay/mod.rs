// Relay module for real-time text messaging
//
// Clients connect over TCP, authenticate against a user directory and
// exchange newline-delimited JSON records. Messages for users who are
// offline (or whose session cannot take them yet) wait in the broker until
// the receiver's next session drains them, and stay tracked until the
// receiver acknowledges them.

pub mod error;
pub mod message;
pub mod wire;
pub mod registry;
pub mod broker;
pub mod directory;
pub mod config;
pub mod session;
pub mod server;
pub mod client;
pub mod cli;
pub mod commands;

pub use error::{RelayError, RelayResult};
pub use message::{ClientRecord, Credentials, DeliveryOutcome, Identity, Message, MessageStatus, Outbound, ServerRecord};
pub use registry::{SessionHandle, SessionRegistry};
pub use broker::{MessageBroker, Routed};
pub use directory::{MemoryDirectory, SqliteDirectory, UserDirectory, UserRecord};
pub use config::RelayConfig;
pub use session::{ConnectionSession, RelayContext, SessionLimits, SessionState};
pub use server::RelayServer;
pub use client::RelayClient;
pub use cli::{LoginArgs, RelayCli, RelayCommand, ServeArgs};
pub use commands::execute_command;

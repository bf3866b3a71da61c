// Runtime configuration for the relay server

use std::path::PathBuf;
use std::time::Duration;

/// Longest record either side accepts unless configured otherwise
pub const DEFAULT_MAX_LINE_BYTES: usize = 64 * 1024;

/// Settings for one relay server instance
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Address to listen on
    pub host: String,
    pub port: u16,

    /// Maximum number of concurrent sessions
    pub max_sessions: usize,

    /// How long an excess connection waits for a free session slot
    pub admission_timeout: Duration,

    /// How long a new connection has to send its handshake
    pub handshake_timeout: Duration,

    /// Capacity of each session's outbound mailbox
    pub mailbox_capacity: usize,

    /// Longest accepted record, in bytes
    pub max_line_bytes: usize,

    /// How long shutdown waits for sessions to finish
    pub shutdown_grace: Duration,

    /// User database; `None` runs with an in-memory directory
    pub db_path: Option<PathBuf>,
}

impl RelayConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Default location of state files
    pub fn state_dir() -> PathBuf {
        let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
        PathBuf::from(home).join(".chatrelay")
    }

    /// Default user database
    pub fn default_db_path() -> PathBuf {
        Self::state_dir().join("users.db")
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 5000,
            max_sessions: 50,
            admission_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(30),
            mailbox_capacity: 256,
            max_line_bytes: DEFAULT_MAX_LINE_BYTES,
            shutdown_grace: Duration::from_secs(5),
            db_path: Some(Self::default_db_path()),
        }
    }
}

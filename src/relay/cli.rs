// CLI commands for the relay

use crate::relay::config::RelayConfig;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

/// Relay CLI
#[derive(Debug, Parser)]
#[command(name = "chatrelay")]
#[command(about = "Real-time text-messaging relay with store-and-forward delivery")]
pub struct RelayCli {
    #[command(subcommand)]
    pub command: RelayCommand,
}

/// Relay subcommands
#[derive(Debug, Subcommand)]
pub enum RelayCommand {
    /// Run the relay server
    Serve(ServeArgs),

    /// Add a user to the directory
    AddUser {
        /// User email (the routing identity)
        #[arg(short, long)]
        email: String,

        /// User password
        #[arg(short, long)]
        password: String,

        /// User database (default: ~/.chatrelay/users.db)
        #[arg(long)]
        db: Option<PathBuf>,
    },

    /// Remove a user from the directory
    RemoveUser {
        /// User email
        #[arg(short, long)]
        email: String,

        /// User database (default: ~/.chatrelay/users.db)
        #[arg(long)]
        db: Option<PathBuf>,
    },

    /// List users in the directory
    ListUsers {
        /// Show detailed information
        #[arg(short, long)]
        verbose: bool,

        /// User database (default: ~/.chatrelay/users.db)
        #[arg(long)]
        db: Option<PathBuf>,
    },

    /// Send one message and wait for its confirmation
    Send {
        /// Message content
        message: String,

        /// Recipient email
        #[arg(short, long)]
        to: String,

        #[command(flatten)]
        login: LoginArgs,
    },

    /// Print incoming messages, acknowledging each one
    Listen {
        /// Exit after this many seconds without a message
        #[arg(long)]
        idle_timeout: Option<u64>,

        #[command(flatten)]
        login: LoginArgs,
    },
}

/// Options for `serve`
#[derive(Debug, Args)]
pub struct ServeArgs {
    /// Address to listen on
    #[arg(long, default_value = "127.0.0.1")]
    pub host: String,

    /// Port to listen on
    #[arg(short, long, default_value = "5000")]
    pub port: u16,

    /// Maximum concurrent sessions
    #[arg(long, default_value = "50")]
    pub max_sessions: usize,

    /// Seconds an excess connection waits for a free slot
    #[arg(long, default_value = "10")]
    pub admission_timeout: u64,

    /// Seconds a client has to send its handshake
    #[arg(long, default_value = "30")]
    pub handshake_timeout: u64,

    /// Outbound mailbox capacity per session
    #[arg(long, default_value = "256")]
    pub mailbox_capacity: usize,

    /// User database (default: ~/.chatrelay/users.db)
    #[arg(long, conflicts_with = "ephemeral")]
    pub db: Option<PathBuf>,

    /// Keep users in memory instead of a database
    #[arg(long)]
    pub ephemeral: bool,

    /// Seed user for --ephemeral, as EMAIL:PASSWORD (repeatable)
    #[arg(long = "user", value_name = "EMAIL:PASSWORD", requires = "ephemeral")]
    pub users: Vec<String>,
}

impl ServeArgs {
    pub fn to_config(&self) -> RelayConfig {
        let db_path = if self.ephemeral {
            None
        } else {
            Some(self.db.clone().unwrap_or_else(RelayConfig::default_db_path))
        };

        RelayConfig {
            host: self.host.clone(),
            port: self.port,
            max_sessions: self.max_sessions,
            admission_timeout: Duration::from_secs(self.admission_timeout),
            handshake_timeout: Duration::from_secs(self.handshake_timeout),
            mailbox_capacity: self.mailbox_capacity,
            db_path,
            ..RelayConfig::default()
        }
    }
}

/// Connection and credentials for client commands
#[derive(Debug, Args)]
pub struct LoginArgs {
    /// Relay address
    #[arg(short, long, default_value = "127.0.0.1:5000")]
    pub server: String,

    /// Your email
    #[arg(short, long)]
    pub email: String,

    /// Your password
    #[arg(short, long)]
    pub password: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serve_defaults() {
        let cli = RelayCli::parse_from(["chatrelay", "serve"]);
        let RelayCommand::Serve(args) = cli.command else {
            panic!("expected serve");
        };

        let config = args.to_config();
        assert_eq!(config.bind_addr(), "127.0.0.1:5000");
        assert_eq!(config.max_sessions, 50);
        assert_eq!(config.handshake_timeout, Duration::from_secs(30));
        assert!(config.db_path.is_some());
    }

    #[test]
    fn test_ephemeral_serve_with_users() {
        let cli = RelayCli::parse_from([
            "chatrelay",
            "serve",
            "--port",
            "6000",
            "--ephemeral",
            "--user",
            "x@example.com:pw",
            "--user",
            "y@example.com:pw",
        ]);
        let RelayCommand::Serve(args) = cli.command else {
            panic!("expected serve");
        };

        assert_eq!(args.users.len(), 2);
        let config = args.to_config();
        assert_eq!(config.port, 6000);
        assert!(config.db_path.is_none());
    }

    #[test]
    fn test_send_parses_login() {
        let cli = RelayCli::parse_from([
            "chatrelay",
            "send",
            "hello",
            "--to",
            "y@example.com",
            "--email",
            "x@example.com",
            "--password",
            "pw",
        ]);
        match cli.command {
            RelayCommand::Send { message, to, login } => {
                assert_eq!(message, "hello");
                assert_eq!(to, "y@example.com");
                assert_eq!(login.server, "127.0.0.1:5000");
            }
            other => panic!("unexpected command {:?}", other),
        }
    }
}

// Command handlers for the relay CLI

use crate::relay::*;
use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::net::TcpStream;

/// Execute a relay command
pub async fn execute_command(command: RelayCommand) -> Result<()> {
    match command {
        RelayCommand::Serve(args) => handle_serve(args).await,
        RelayCommand::AddUser { email, password, db } => handle_add_user(email, password, db),
        RelayCommand::RemoveUser { email, db } => handle_remove_user(email, db),
        RelayCommand::ListUsers { verbose, db } => handle_list_users(verbose, db),
        RelayCommand::Send { message, to, login } => handle_send(message, to, login).await,
        RelayCommand::Listen {
            idle_timeout,
            login,
        } => handle_listen(idle_timeout, login).await,
    }
}

fn open_directory(db: Option<PathBuf>) -> Result<SqliteDirectory> {
    let path = db.unwrap_or_else(RelayConfig::default_db_path);
    SqliteDirectory::new(&path)
        .with_context(|| format!("Failed to open user database {}", path.display()))
}

/// Split an EMAIL:PASSWORD pair
fn parse_user(pair: &str) -> Result<(&str, &str)> {
    pair.split_once(':')
        .filter(|(email, _)| !email.is_empty())
        .with_context(|| format!("Invalid user '{}', expected EMAIL:PASSWORD", pair))
}

fn unix_secs(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

async fn handle_serve(args: ServeArgs) -> Result<()> {
    let config = args.to_config();

    let directory: Arc<dyn UserDirectory> = match &config.db_path {
        Some(path) => {
            let directory = SqliteDirectory::new(path)?;
            let reset = directory.reset_presence()?;
            if reset > 0 {
                tracing::info!("Cleared stale presence for {} user(s)", reset);
            }
            println!("📒 User database: {}", path.display());
            Arc::new(directory)
        }
        None => {
            let directory = MemoryDirectory::new();
            for user in &args.users {
                let (email, password) = parse_user(user)?;
                directory.add_user(email, password)?;
            }
            println!("📒 In-memory user directory ({} user(s))", args.users.len());
            Arc::new(directory)
        }
    };

    let server = RelayServer::new(config, directory);
    let shutdown = server.shutdown_token();

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Received Ctrl+C, shutting down");
            shutdown.cancel();
        }
    });

    println!("🚀 Relay starting on {}", server.config().bind_addr());
    println!("  (Press Ctrl+C to stop)");

    server.run().await?;

    println!("✓ Relay stopped");
    Ok(())
}

fn handle_add_user(email: String, password: String, db: Option<PathBuf>) -> Result<()> {
    let directory = open_directory(db)?;
    directory.add_user(&email, &password)?;
    println!("✓ Added user {}", email);
    Ok(())
}

fn handle_remove_user(email: String, db: Option<PathBuf>) -> Result<()> {
    let directory = open_directory(db)?;
    if directory.remove_user(&email)? {
        println!("✓ Removed user {}", email);
    } else {
        println!("No user named {}", email);
    }
    Ok(())
}

fn handle_list_users(verbose: bool, db: Option<PathBuf>) -> Result<()> {
    let directory = open_directory(db)?;
    let users = directory.list_users()?;

    if users.is_empty() {
        println!("No users found");
        return Ok(());
    }

    println!("Users ({}):", users.len());
    for user in users {
        let presence = if user.online { "online" } else { "offline" };
        println!("  {} [{}]", user.email, presence);
        if verbose {
            println!("    Created: {}", unix_secs(user.created_at));
            match user.last_seen {
                Some(seen) => println!("    Last seen: {}", unix_secs(seen)),
                None => println!("    Last seen: never"),
            }
        }
    }

    Ok(())
}

async fn connect_and_login(login: &LoginArgs) -> Result<RelayClient<TcpStream>> {
    let mut client = RelayClient::connect(&login.server).await?;
    if !client.login(&login.email, &login.password).await? {
        anyhow::bail!("Authentication failed for {}", login.email);
    }
    Ok(client)
}

/// Log out and wait briefly for the server to confirm
async fn finish(mut client: RelayClient<TcpStream>) -> Result<()> {
    client.logout().await?;

    let confirmed = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            match client.next_record().await? {
                Some(ServerRecord::LogoutConfirm) | None => return Ok::<_, anyhow::Error>(()),
                Some(_) => {}
            }
        }
    })
    .await;

    if !matches!(confirmed, Ok(Ok(()))) {
        tracing::debug!("No logout confirmation from the server");
    }
    Ok(())
}

async fn handle_send(message: String, to: String, login: LoginArgs) -> Result<()> {
    let mut client = connect_and_login(&login).await?;

    println!("📤 Sending message to: {}", to);
    client.send_chat(&to, &message).await?;

    loop {
        match client.next_record().await? {
            Some(ServerRecord::Confirmation { id, status }) => {
                println!("✓ Message {} {}", id, status);
                break;
            }
            Some(ServerRecord::Error { content }) => {
                anyhow::bail!("Server rejected the message: {}", content);
            }
            // Our own backlog; left unacknowledged for `listen`
            Some(_) => {}
            None => anyhow::bail!("Connection closed before the message was confirmed"),
        }
    }

    finish(client).await
}

async fn handle_listen(idle_timeout: Option<u64>, login: LoginArgs) -> Result<()> {
    let mut client = connect_and_login(&login).await?;

    println!("👂 Listening as {}", login.email);
    println!("  (Press Ctrl+C to stop)");

    loop {
        let next = async {
            match idle_timeout {
                Some(secs) => tokio::time::timeout(Duration::from_secs(secs), client.next_record())
                    .await
                    .ok(),
                None => Some(client.next_record().await),
            }
        };

        let record = tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                println!("\n✓ Stopped listening");
                break;
            }
            record = next => record,
        };

        match record {
            None => {
                println!("✓ No new messages");
                break;
            }
            Some(Ok(None)) => {
                println!("Server closed the connection");
                return Ok(());
            }
            Some(Ok(Some(ServerRecord::Chat {
                id,
                sender_email,
                content,
                ..
            }))) => {
                println!("💬 {}: {}", sender_email, content.unwrap_or_default());
                client.acknowledge(&id).await?;
            }
            Some(Ok(Some(ServerRecord::Error { content }))) => {
                eprintln!("⚠ {}", content);
            }
            Some(Ok(Some(_))) => {}
            Some(Err(e)) => return Err(e),
        }
    }

    finish(client).await
}

// TCP relay server: accept loop, session admission and graceful shutdown

use crate::relay::config::RelayConfig;
use crate::relay::directory::UserDirectory;
use crate::relay::session::{ConnectionSession, RelayContext, SessionLimits};
use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

/// A relay server instance
pub struct RelayServer {
    config: RelayConfig,
    ctx: RelayContext,
    slots: Arc<Semaphore>,
    shutdown: CancellationToken,
}

impl RelayServer {
    pub fn new(config: RelayConfig, directory: Arc<dyn UserDirectory>) -> Self {
        let max_sessions = config.max_sessions.clamp(1, Semaphore::MAX_PERMITS);
        let ctx = RelayContext::new(directory, SessionLimits::from(&config));

        Self {
            config,
            ctx,
            slots: Arc::new(Semaphore::new(max_sessions)),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// Broker, registry and directory shared by this server's sessions
    pub fn context(&self) -> &RelayContext {
        &self.ctx
    }

    /// Token that stops the server when cancelled
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Number of sessions currently holding a slot
    pub fn active_sessions(&self) -> usize {
        self.max_sessions() - self.slots.available_permits()
    }

    fn max_sessions(&self) -> usize {
        self.config.max_sessions.clamp(1, Semaphore::MAX_PERMITS)
    }

    pub async fn bind(&self) -> Result<TcpListener> {
        let addr = self.config.bind_addr();
        TcpListener::bind(&addr)
            .await
            .with_context(|| format!("Failed to bind {}", addr))
    }

    /// Bind the configured address and serve until shut down
    pub async fn run(self) -> Result<()> {
        let listener = self.bind().await?;
        self.serve(listener).await
    }

    /// Serve connections from `listener` until the shutdown token fires,
    /// then wait (up to the configured grace period) for sessions to close
    pub async fn serve(self, listener: TcpListener) -> Result<()> {
        let local_addr = listener
            .local_addr()
            .context("Failed to read listener address")?;
        tracing::info!(
            "Relay listening on {} (max {} sessions)",
            local_addr,
            self.max_sessions()
        );

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    tracing::info!("Listener shutting down");
                    break;
                }
                result = listener.accept() => {
                    match result {
                        Ok((stream, peer)) => self.admit(stream, peer),
                        Err(e) => {
                            tracing::error!("Accept error: {}", e);
                        }
                    }
                }
            }
        }

        drop(listener);
        self.drain().await;
        Ok(())
    }

    /// Hand a connection to its own task. It waits for a free session slot
    /// for up to `admission_timeout` and is dropped if none frees up.
    fn admit(&self, stream: TcpStream, peer: SocketAddr) {
        let ctx = self.ctx.clone();
        let slots = Arc::clone(&self.slots);
        let shutdown = self.shutdown.clone();
        let admission_timeout = self.config.admission_timeout;

        tokio::spawn(async move {
            let permit = tokio::select! {
                _ = shutdown.cancelled() => return,
                acquired = tokio::time::timeout(admission_timeout, slots.acquire_owned()) => {
                    match acquired {
                        Ok(Ok(permit)) => permit,
                        Ok(Err(_)) => return,
                        Err(_) => {
                            tracing::warn!("Rejecting {}: no free session slot", peer);
                            return;
                        }
                    }
                }
            };

            if let Err(e) = stream.set_nodelay(true) {
                tracing::debug!("Failed to set TCP_NODELAY for {}: {}", peer, e);
            }

            let session = ConnectionSession::new(ctx, &shutdown);
            tracing::debug!("Accepted {} as session {}", peer, session.id());
            session.run(stream).await;

            drop(permit);
        });
    }

    async fn drain(&self) {
        let max_sessions = self.max_sessions();
        let active = self.active_sessions();
        if active > 0 {
            tracing::info!("Waiting for {} session(s) to close", active);
        }

        let all_slots = u32::try_from(max_sessions).unwrap_or(u32::MAX);
        match tokio::time::timeout(self.config.shutdown_grace, self.slots.acquire_many(all_slots)).await {
            Ok(_) => tracing::info!("All sessions closed"),
            Err(_) => tracing::warn!(
                "{} session(s) still open after {:?}",
                self.active_sessions(),
                self.config.shutdown_grace
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::directory::MemoryDirectory;
    use std::time::Duration;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    fn test_config(max_sessions: usize) -> RelayConfig {
        RelayConfig {
            port: 0,
            max_sessions,
            admission_timeout: Duration::from_millis(100),
            shutdown_grace: Duration::from_secs(2),
            db_path: None,
            ..RelayConfig::default()
        }
    }

    fn directory() -> Arc<MemoryDirectory> {
        Arc::new(MemoryDirectory::new().with_user("x@example.com", "pw"))
    }

    #[tokio::test]
    async fn test_server_authenticates_and_shuts_down() {
        let server = RelayServer::new(test_config(4), directory());
        let listener = server.bind().await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = server.shutdown_token();
        let handle = tokio::spawn(server.serve(listener));

        let stream = TcpStream::connect(addr).await.unwrap();
        let (read_half, mut write_half) = stream.into_split();
        let mut lines = BufReader::new(read_half).lines();

        write_half
            .write_all(b"{\"email\":\"x@example.com\",\"password\":\"pw\"}\n")
            .await
            .unwrap();
        let reply = tokio::time::timeout(Duration::from_secs(2), lines.next_line())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reply.as_deref(), Some("AUTH_SUCCESS"));

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();

        let end = tokio::time::timeout(Duration::from_secs(2), lines.next_line())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(end, None);
    }

    #[tokio::test]
    async fn test_excess_connection_is_dropped() {
        let server = RelayServer::new(test_config(1), directory());
        let listener = server.bind().await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = server.shutdown_token();
        let handle = tokio::spawn(server.serve(listener));

        // Holds the only slot without ever finishing its handshake
        let _first = TcpStream::connect(addr).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let second = TcpStream::connect(addr).await.unwrap();
        let mut lines = BufReader::new(second).lines();
        let end = tokio::time::timeout(Duration::from_secs(2), lines.next_line())
            .await
            .unwrap();
        assert!(matches!(end, Ok(None) | Err(_)));

        shutdown.cancel();
        handle.await.unwrap().unwrap();
    }
}

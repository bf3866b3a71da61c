//! Test utilities and fixtures for chatrelay
//!
//! Starts a relay on an ephemeral port and wraps the client calls the
//! integration tests repeat.

#![allow(dead_code)]

use chatrelay::relay::*;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Upper bound for anything a test waits on
pub const TIMEOUT: Duration = Duration::from_secs(5);

pub type TestClient = RelayClient<TcpStream>;

/// A relay running in the background for one test
pub struct TestRelay {
    pub addr: SocketAddr,
    pub ctx: RelayContext,
    shutdown: CancellationToken,
    handle: JoinHandle<anyhow::Result<()>>,
}

impl TestRelay {
    pub async fn start(directory: Arc<dyn UserDirectory>) -> Self {
        Self::start_with(directory, |_| {}).await
    }

    /// Like `start`, with `configure` applied to the test defaults
    pub async fn start_with(
        directory: Arc<dyn UserDirectory>,
        configure: impl FnOnce(&mut RelayConfig),
    ) -> Self {
        let mut config = RelayConfig {
            port: 0,
            shutdown_grace: Duration::from_secs(2),
            db_path: None,
            ..RelayConfig::default()
        };
        configure(&mut config);

        let server = RelayServer::new(config, directory);
        let listener = server.bind().await.expect("Failed to bind test relay");
        let addr = listener.local_addr().unwrap();
        let ctx = server.context().clone();
        let shutdown = server.shutdown_token();
        let handle = tokio::spawn(server.serve(listener));

        Self {
            addr,
            ctx,
            shutdown,
            handle,
        }
    }

    /// Relay backed by an in-memory directory holding `users`
    pub async fn with_users(users: &[(&str, &str)]) -> (Self, Arc<MemoryDirectory>) {
        let directory = Arc::new(MemoryDirectory::new());
        for (email, password) in users {
            directory.add_user(email, password).unwrap();
        }
        (Self::start(directory.clone()).await, directory)
    }

    pub async fn connect(&self) -> TestClient {
        RelayClient::connect(&self.addr.to_string())
            .await
            .expect("Failed to connect to test relay")
    }

    /// Connect, authenticate and wait until the broker routes to the new session
    pub async fn login(&self, email: &str, password: &str) -> TestClient {
        let mut client = self.connect().await;
        assert!(
            client.login(email, password).await.unwrap(),
            "login failed for {}",
            email
        );
        wait_until(|| self.ctx.broker.is_registered(email)).await;
        client
    }

    pub async fn stop(self) {
        self.shutdown.cancel();
        tokio::time::timeout(TIMEOUT, self.handle)
            .await
            .expect("relay did not stop in time")
            .unwrap()
            .unwrap();
    }
}

/// Poll `condition` until it holds
pub async fn wait_until(condition: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + TIMEOUT;
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not met within {:?}",
            TIMEOUT
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Next record, failing the test on timeout or hang-up
pub async fn recv(client: &mut TestClient) -> ServerRecord {
    tokio::time::timeout(TIMEOUT, client.next_record())
        .await
        .expect("timed out waiting for a record")
        .expect("failed to read record")
        .expect("connection closed")
}

/// Next record, which must be a CHAT. Returns (id, sender, content).
pub async fn recv_chat(client: &mut TestClient) -> (String, String, String) {
    match recv(client).await {
        ServerRecord::Chat {
            id,
            sender_email,
            content,
            status,
            ..
        } => {
            assert_eq!(status, MessageStatus::Delivered);
            (id, sender_email, content.unwrap_or_default())
        }
        other => panic!("expected CHAT, got {:?}", other),
    }
}

/// Next record, which must be a CONFIRMATION. Returns (id, status).
pub async fn recv_confirmation(client: &mut TestClient) -> (String, DeliveryOutcome) {
    match recv(client).await {
        ServerRecord::Confirmation { id, status } => (id, status),
        other => panic!("expected CONFIRMATION, got {:?}", other),
    }
}

/// Fail if anything arrives within `wait`
pub async fn assert_silent(client: &mut TestClient, wait: Duration) {
    if let Ok(received) = tokio::time::timeout(wait, client.next_record()).await {
        panic!("expected silence, got {:?}", received);
    }
}

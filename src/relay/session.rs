// Connection session: handshake, record dispatch and cleanup for one client
//
// A session owns two tasks. The reader side (the `run` future itself) parses
// inbound records and drives the broker; a spawned writer task drains the
// session's mailbox onto the socket. Everything addressed to the client,
// replies and deliveries alike, goes through that one mailbox, so records
// reach the wire in the order they were handed over.

use crate::relay::broker::MessageBroker;
use crate::relay::config::RelayConfig;
use crate::relay::directory::UserDirectory;
use crate::relay::error::{RelayError, RelayResult};
use crate::relay::message::{
    ClientRecord, Credentials, DeliveryOutcome, Identity, Message, Outbound, ServerRecord,
};
use crate::relay::registry::{Mailbox, SessionHandle, SessionRegistry};
use crate::relay::wire::LineReader;
use anyhow::Context;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Per-session limits
#[derive(Debug, Clone)]
pub struct SessionLimits {
    pub handshake_timeout: Duration,
    pub mailbox_capacity: usize,
    pub max_line_bytes: usize,
    /// How long a closing session waits for its writer to flush
    pub drain_timeout: Duration,
}

impl From<&RelayConfig> for SessionLimits {
    fn from(config: &RelayConfig) -> Self {
        Self {
            handshake_timeout: config.handshake_timeout,
            mailbox_capacity: config.mailbox_capacity.max(1),
            max_line_bytes: config.max_line_bytes,
            drain_timeout: config.shutdown_grace,
        }
    }
}

impl Default for SessionLimits {
    fn default() -> Self {
        Self::from(&RelayConfig::default())
    }
}

/// Services shared by every session of one server
#[derive(Clone)]
pub struct RelayContext {
    pub broker: Arc<MessageBroker>,
    pub registry: Arc<SessionRegistry>,
    pub directory: Arc<dyn UserDirectory>,
    pub limits: SessionLimits,
}

impl RelayContext {
    pub fn new(directory: Arc<dyn UserDirectory>, limits: SessionLimits) -> Self {
        Self {
            broker: Arc::new(MessageBroker::new()),
            registry: Arc::new(SessionRegistry::new()),
            directory,
            limits,
        }
    }
}

/// Lifecycle of a session. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connected,
    Authenticated,
    Closed,
}

#[derive(Debug, PartialEq, Eq)]
enum Flow {
    Continue,
    Logout,
}

fn mailbox_closed() -> RelayError {
    RelayError::Transport(io::Error::new(
        io::ErrorKind::BrokenPipe,
        "session mailbox closed",
    ))
}

/// One client connection
pub struct ConnectionSession {
    id: Uuid,
    ctx: RelayContext,
    identity: OnceLock<Identity>,
    authenticated: AtomicBool,
    closed: AtomicBool,
    /// Set when cleanup removed our registry entry and the directory still
    /// has to hear that the identity went offline
    offline_pending: AtomicBool,
    /// Serializes this session's presence writes
    presence: Arc<tokio::sync::Mutex<()>>,
    /// Our own handle on the mailbox; dropped on disconnect so the writer
    /// can finish once every other handle is gone too
    outbound: Mutex<Option<Mailbox>>,
    /// Receiving end, taken by the writer task when the session starts
    pending_writer: Mutex<Option<mpsc::Receiver<Outbound>>>,
    cancel: CancellationToken,
}

impl ConnectionSession {
    /// Create a session that stops when `shutdown` is cancelled
    pub fn new(ctx: RelayContext, shutdown: &CancellationToken) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(ctx.limits.mailbox_capacity.max(1));

        Arc::new(Self {
            id: Uuid::new_v4(),
            ctx,
            identity: OnceLock::new(),
            authenticated: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            offline_pending: AtomicBool::new(false),
            presence: Arc::new(tokio::sync::Mutex::new(())),
            outbound: Mutex::new(Some(tx)),
            pending_writer: Mutex::new(Some(rx)),
            cancel: shutdown.child_token(),
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Authenticated identity, once the handshake has succeeded
    pub fn identity(&self) -> Option<&str> {
        self.identity.get().map(String::as_str)
    }

    pub fn state(&self) -> SessionState {
        if self.closed.load(Ordering::SeqCst) {
            SessionState::Closed
        } else if self.authenticated.load(Ordering::SeqCst) {
            SessionState::Authenticated
        } else {
            SessionState::Connected
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn mailbox(&self) -> Option<Mailbox> {
        self.outbound.lock().ok().and_then(|mailbox| mailbox.clone())
    }

    /// Run a directory call on the blocking pool
    async fn directory<T, F>(&self, call: F) -> anyhow::Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&dyn UserDirectory) -> anyhow::Result<T> + Send + 'static,
    {
        let directory = Arc::clone(&self.ctx.directory);
        tokio::task::spawn_blocking(move || call(directory.as_ref()))
            .await
            .context("Directory task failed")?
    }

    /// Queue something for the client, waiting if the mailbox is full
    async fn reply(&self, outbound: impl Into<Outbound>) -> RelayResult<()> {
        let mailbox = self.mailbox().ok_or_else(mailbox_closed)?;
        mailbox
            .send(outbound.into())
            .await
            .map_err(|_| mailbox_closed())
    }

    /// Serve the connection until the client logs out, the stream ends, an
    /// unrecoverable error occurs or the session is cancelled. Cleanup has
    /// run by the time this returns.
    pub async fn run<S>(self: Arc<Self>, stream: S)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let Some(outbox) = self.pending_writer.lock().ok().and_then(|mut rx| rx.take()) else {
            tracing::warn!("Session {} was already started", self.id);
            return;
        };

        let (read_half, write_half) = tokio::io::split(stream);
        let mut writer = tokio::spawn(Arc::clone(&self).write_loop(outbox, write_half));
        let mut reader = LineReader::new(read_half, self.ctx.limits.max_line_bytes);

        let outcome = tokio::select! {
            _ = self.cancel.cancelled() => Ok(()),
            result = self.drive(&mut reader) => result,
        };

        match outcome {
            Ok(()) => {}
            Err(RelayError::Auth { identity }) => {
                tracing::info!("Authentication failed for {}", identity);
            }
            Err(RelayError::Transport(e)) => {
                tracing::debug!("Session {} transport closed: {}", self.id, e);
            }
            Err(e) => {
                tracing::warn!("Session {} ended: {}", self.id, e);
            }
        }

        self.disconnect();
        // Also covers a registration that raced disconnect() or was cut
        // short by cancellation
        if let Some(identity) = self.identity.get() {
            self.release_routes(identity);
        }
        if self.offline_pending.swap(false, Ordering::SeqCst) {
            if let Some(identity) = self.identity.get() {
                self.publish_presence(identity, false).await;
            }
        }

        tokio::select! {
            _ = &mut writer => {}
            _ = tokio::time::sleep(self.ctx.limits.drain_timeout) => {
                tracing::warn!("Session {} writer did not drain in time", self.id);
                writer.abort();
            }
        }
    }

    async fn drive<R: AsyncRead + Unpin>(&self, reader: &mut LineReader<R>) -> RelayResult<()> {
        let identity = self.authenticate(reader).await?;
        self.dispatch(&identity, reader).await
    }

    /// Connected -> Authenticated, or an error after AUTH_FAILED was queued
    async fn authenticate<R: AsyncRead + Unpin>(
        &self,
        reader: &mut LineReader<R>,
    ) -> RelayResult<Identity> {
        let handshake =
            tokio::time::timeout(self.ctx.limits.handshake_timeout, reader.next_line()).await;

        let line = match handshake {
            Ok(Ok(Some(line))) => line,
            Ok(Ok(None)) => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed before handshake",
                )
                .into())
            }
            Ok(Err(e)) if e.is_recoverable() => return self.reject(e).await,
            Ok(Err(e)) => return Err(e),
            Err(_) => return self.reject(RelayError::protocol("Handshake timed out")).await,
        };

        let Credentials { email, password } = match Credentials::parse(&line) {
            Ok(credentials) => credentials,
            Err(e) => return self.reject(e).await,
        };

        let checked = {
            let email = email.clone();
            self.directory(move |directory| directory.authenticate(&email, &password))
                .await
        };

        match checked {
            Ok(true) => self.bind(email).await,
            Ok(false) => self.reject(RelayError::Auth { identity: email }).await,
            Err(e) => self.reject(RelayError::Directory(e)).await,
        }
    }

    async fn reject<T>(&self, reason: RelayError) -> RelayResult<T> {
        // The connection is closed right after; nothing to do if this fails
        let _ = self.reply(Outbound::AuthReply(false)).await;
        Err(reason)
    }

    /// Register the session for `identity` and drain its backlog
    async fn bind(&self, identity: Identity) -> RelayResult<Identity> {
        let mailbox = self.mailbox().ok_or_else(mailbox_closed)?;
        if self.identity.set(identity.clone()).is_err() {
            return Err(RelayError::protocol("Session is already authenticated"));
        }

        // Queued before registration so it precedes any backlog on the wire
        self.reply(Outbound::AuthReply(true)).await?;

        let handle = SessionHandle::new(self.id, mailbox);
        self.ctx.registry.register(&identity, handle.clone());
        self.ctx.broker.register_consumer(&identity, handle);
        self.authenticated.store(true, Ordering::SeqCst);

        self.publish_presence(&identity, true).await;

        if self.is_closed() {
            // disconnect() may have run before the entries above existed;
            // run() releases them
            return Err(mailbox_closed());
        }

        tracing::info!("✓ {} authenticated (session {})", identity, self.id);
        Ok(identity)
    }

    async fn dispatch<R: AsyncRead + Unpin>(
        &self,
        identity: &str,
        reader: &mut LineReader<R>,
    ) -> RelayResult<()> {
        loop {
            let record = match reader.next_line().await {
                Ok(Some(line)) => ClientRecord::parse(&line),
                Ok(None) => {
                    tracing::debug!("{} closed the connection", identity);
                    return Ok(());
                }
                Err(e) if e.is_recoverable() => Err(e),
                Err(e) => return Err(e),
            };

            let flow = match record {
                Ok(record) => self.handle_record(identity, record).await?,
                Err(e) => {
                    tracing::warn!("Bad record from {}: {}", identity, e);
                    self.reply(ServerRecord::error(e.to_string())).await?;
                    Flow::Continue
                }
            };

            if flow == Flow::Logout {
                return Ok(());
            }

            // Retry anything that did not fit in the mailbox earlier
            self.ctx.broker.flush(identity);
        }
    }

    async fn handle_record(&self, identity: &str, record: ClientRecord) -> RelayResult<Flow> {
        match record {
            ClientRecord::Chat {
                id,
                sender_email,
                receiver_email,
                content,
            } => {
                let Some(receiver) = receiver_email.filter(|r| !r.is_empty()) else {
                    self.reply(ServerRecord::error("Missing receiverEmail"))
                        .await?;
                    return Ok(Flow::Continue);
                };

                if sender_email.as_deref().is_some_and(|sender| sender != identity) {
                    tracing::warn!(
                        "{} tried to send as {}",
                        identity,
                        sender_email.as_deref().unwrap_or_default()
                    );
                    self.reply(ServerRecord::error(
                        "senderEmail does not match the authenticated user",
                    ))
                    .await?;
                    return Ok(Flow::Continue);
                }

                // The broker swaps in a fresh id if the client's is taken
                let message = Message::chat(id, identity.to_string(), receiver.clone(), content);

                let local_receiver = self.ctx.registry.lookup(&receiver);
                let routed = self
                    .ctx
                    .broker
                    .send_message(message, local_receiver.as_ref());
                let status = DeliveryOutcome::from_delivered(routed.delivered);

                tracing::info!("Message {} from {} to {}: {}", routed.id, identity, receiver, status);

                self.reply(ServerRecord::Confirmation {
                    id: routed.id,
                    status,
                })
                .await?;
                Ok(Flow::Continue)
            }
            ClientRecord::Acknowledge { id } => {
                self.ctx.broker.acknowledge_message(&id);
                Ok(Flow::Continue)
            }
            ClientRecord::Logout { .. } => {
                self.reply(ServerRecord::LogoutConfirm).await?;
                tracing::info!("{} logged out", identity);
                Ok(Flow::Logout)
            }
        }
    }

    async fn write_loop<W: AsyncWrite + Unpin>(
        self: Arc<Self>,
        mut outbox: mpsc::Receiver<Outbound>,
        mut writer: W,
    ) {
        while let Some(outbound) = outbox.recv().await {
            let bytes = match outbound.to_bytes() {
                Ok(bytes) => bytes,
                Err(e) => {
                    tracing::error!("Failed to encode record for session {}: {}", self.id, e);
                    continue;
                }
            };

            let written = async {
                writer.write_all(&bytes).await?;
                writer.flush().await
            }
            .await;

            if let Err(e) = written {
                tracing::debug!("Write to session {} failed: {}", self.id, e);
                self.disconnect();
                return;
            }

            // The mailbox has room again; hand over what the broker held back
            if outbox.is_empty() {
                if let Some(identity) = self.identity.get() {
                    self.ctx.broker.flush(identity);
                }
            }
        }

        let _ = writer.shutdown().await;
    }

    /// Release everything the session holds. Only the first call does
    /// anything; returns whether this call performed the cleanup.
    ///
    /// Routing entries are only removed if they still belong to this
    /// session, so a session displaced by a newer login never tears down its
    /// successor. Queued and unacknowledged messages stay with the broker.
    /// The directory is told about the presence change by `run`.
    pub fn disconnect(&self) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }

        self.cancel.cancel();

        match self.identity.get() {
            Some(identity) => {
                self.release_routes(identity);
                tracing::info!("{} disconnected (session {})", identity, self.id);
            }
            None => tracing::debug!("Session {} closed before authenticating", self.id),
        }

        if let Ok(mut outbound) = self.outbound.lock() {
            outbound.take();
        }

        true
    }

    /// Drop our broker and registry entries, leaving newer sessions alone
    fn release_routes(&self, identity: &str) {
        self.ctx.broker.unregister_consumer(identity, self.id);
        if self.ctx.registry.remove_if_current(identity, self.id) {
            self.offline_pending.store(true, Ordering::SeqCst);
        }
    }

    /// Write presence for `identity` on the blocking pool.
    ///
    /// Writes from one session are serialized, and a write only lands while
    /// the registry still agrees: online needs our own entry, offline needs
    /// no entry at all.
    async fn publish_presence(&self, identity: &str, online: bool) {
        let guard = Arc::clone(&self.presence).lock_owned().await;
        let registry = Arc::clone(&self.ctx.registry);
        let session_id = self.id;
        let target = identity.to_string();

        let result = self
            .directory(move |directory| {
                let _guard = guard;
                let current = registry.lookup(&target).map(|handle| handle.session_id);
                let applies = if online {
                    current == Some(session_id)
                } else {
                    current.is_none()
                };
                if !applies {
                    return Ok(());
                }
                directory.set_presence(&target, online)
            })
            .await;

        if let Err(e) = result {
            let state = if online { "online" } else { "offline" };
            tracing::warn!("Failed to mark {} {}: {:#}", identity, state, e);
        }
    }
}

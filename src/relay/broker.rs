// Message broker: per-identity pending queues, delivery and acknowledgment
//
// Every identity owns one inbox behind its own mutex, so mutations for one
// identity are linearizable while different identities never contend on the
// same lock. Inbox locks are only held for in-memory work and non-blocking
// mailbox hand-offs; no I/O happens under them.

use crate::relay::message::{Identity, Message, MessageStatus, Outbound, ServerRecord};
use crate::relay::registry::SessionHandle;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc::error::TrySendError;
use uuid::Uuid;

/// Per-identity routing state
#[derive(Debug, Default)]
struct Inbox {
    /// Session currently receiving for this identity
    consumer: Option<SessionHandle>,
    /// Messages not yet handed to a consumer, in enqueue order
    pending: VecDeque<Message>,
    /// Messages handed to a consumer but not yet acknowledged, in delivery order
    unacked: Vec<Message>,
}

impl Inbox {
    fn is_idle(&self) -> bool {
        self.consumer.is_none() && self.pending.is_empty() && self.unacked.is_empty()
    }

    /// Hand pending messages to the consumer front-to-back, stopping at the
    /// first one that cannot be handed over. Returns how many were delivered.
    fn flush(&mut self, identity: &str) -> usize {
        let Some(consumer) = &self.consumer else {
            return 0;
        };

        let mut delivered = 0;
        let mut consumer_gone = false;

        while let Some(front) = self.pending.front() {
            let mut copy = front.clone();
            copy.advance(MessageStatus::Delivered);
            let record = Outbound::Record(ServerRecord::from(&copy));

            match consumer.mailbox.try_send(record) {
                Ok(()) => {
                    if let Some(mut message) = self.pending.pop_front() {
                        message.advance(MessageStatus::Delivered);
                        self.unacked.push(message);
                    }
                    delivered += 1;
                }
                Err(TrySendError::Full(_)) => {
                    tracing::warn!(
                        "Mailbox for {} is full, {} message(s) stay queued",
                        identity,
                        self.pending.len()
                    );
                    break;
                }
                Err(TrySendError::Closed(_)) => {
                    tracing::debug!(
                        "Mailbox for {} (session {}) is closed",
                        identity,
                        consumer.session_id
                    );
                    consumer_gone = true;
                    break;
                }
            }
        }

        if consumer_gone {
            self.consumer = None;
        }

        delivered
    }
}

/// Outcome of `MessageBroker::send_message`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Routed {
    /// Id the message is tracked under
    pub id: String,
    /// Whether the receiver was reachable and got the message within the call
    pub delivered: bool,
}

fn lock(inbox: &Mutex<Inbox>) -> MutexGuard<'_, Inbox> {
    // A poisoned inbox means a mutation panicked halfway through; its queue
    // can no longer be trusted.
    inbox.lock().expect("broker inbox lock poisoned")
}

/// Routing, queuing and acknowledgment engine shared by all sessions
#[derive(Debug, Default)]
pub struct MessageBroker {
    inboxes: DashMap<Identity, Arc<Mutex<Inbox>>>,
    /// Receiver of every message that has not been acknowledged yet
    locations: DashMap<String, Identity>,
}

impl MessageBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn inbox(&self, identity: &str) -> Arc<Mutex<Inbox>> {
        Arc::clone(&self.inboxes.entry(identity.to_string()).or_default())
    }

    fn existing_inbox(&self, identity: &str) -> Option<Arc<Mutex<Inbox>>> {
        self.inboxes.get(identity).map(|entry| Arc::clone(entry.value()))
    }

    /// Make `consumer` the delivery target for `identity`, replacing any
    /// previous registration, and drain everything waiting for it.
    ///
    /// Messages a previous session received but never acknowledged are
    /// queued again ahead of the pending ones, so the new consumer sees the
    /// whole backlog in its original order. Returns the number of messages
    /// delivered by the drain.
    pub fn register_consumer(&self, identity: &str, consumer: SessionHandle) -> usize {
        let inbox = self.inbox(identity);
        let mut inbox = lock(&inbox);

        let session_id = consumer.session_id;
        if let Some(old) = inbox.consumer.replace(consumer) {
            if old.session_id != session_id {
                tracing::info!(
                    "Consumer {} for {} replaced by {}",
                    old.session_id,
                    identity,
                    session_id
                );
            }
        }

        if !inbox.unacked.is_empty() {
            let redeliver = std::mem::take(&mut inbox.unacked);
            tracing::debug!(
                "Requeueing {} unacknowledged message(s) for {}",
                redeliver.len(),
                identity
            );
            for message in redeliver.into_iter().rev() {
                inbox.pending.push_front(message);
            }
        }

        let drained = inbox.flush(identity);
        tracing::info!(
            "Consumer {} registered for {}, drained {} message(s), {} still queued",
            session_id,
            identity,
            drained,
            inbox.pending.len()
        );
        drained
    }

    /// Drop the routing entry for `identity` if it still belongs to
    /// `session_id`. Queued messages are kept for the next registration.
    pub fn unregister_consumer(&self, identity: &str, session_id: Uuid) -> bool {
        let Some(inbox) = self.existing_inbox(identity) else {
            return false;
        };

        let removed = {
            let mut inbox = lock(&inbox);
            match &inbox.consumer {
                Some(current) if current.session_id == session_id => {
                    inbox.consumer = None;
                    true
                }
                _ => false,
            }
        };
        drop(inbox);

        if removed {
            tracing::debug!("Consumer {} unregistered for {}", session_id, identity);
            self.prune(identity);
        }
        removed
    }

    /// Route a chat message to its receiver.
    ///
    /// The message is always appended to the receiver's queue first, then
    /// the queue is flushed in order if the receiver has a live consumer.
    /// `local_receiver` is the caller's view of the receiver's session; the
    /// receiver only counts as reachable when it is present, so without it
    /// the call reports the message as queued even if the drain picks it
    /// up straight away.
    ///
    /// A message id that is already tracked is replaced by a fresh UUID.
    /// The returned `Routed` carries the id actually used.
    pub fn send_message(&self, mut message: Message, local_receiver: Option<&SessionHandle>) -> Routed {
        let Some(receiver) = message.receiver().map(str::to_string) else {
            tracing::error!("Dropping message {} without a receiver", message.id());
            return Routed {
                id: message.id().to_string(),
                delivered: false,
            };
        };
        message.advance(MessageStatus::Queued);

        let inbox = self.inbox(&receiver);
        let mut inbox = lock(&inbox);

        // Reserved under the inbox lock, so an acknowledgment for this id
        // cannot run between reservation and enqueue
        let id = loop {
            match self.locations.entry(message.id().to_string()) {
                Entry::Vacant(slot) => {
                    let id = slot.key().clone();
                    slot.insert(receiver.clone());
                    break id;
                }
                Entry::Occupied(_) => {
                    tracing::debug!("Message id {} is taken, assigning a new one", message.id());
                    message.reassign_id();
                }
            }
        };
        inbox.pending.push_back(message);

        if let (Some(hint), Some(consumer)) = (local_receiver, &inbox.consumer) {
            if hint.session_id != consumer.session_id {
                tracing::debug!(
                    "Registry and broker disagree on the session for {}, using {}",
                    receiver,
                    consumer.session_id
                );
            }
        }

        inbox.flush(&receiver);
        // The new message sits at the back, so it was handed over iff the
        // flush emptied the queue.
        let delivered = local_receiver.is_some() && inbox.pending.is_empty();

        tracing::debug!(
            "Message {} for {} {}",
            id,
            receiver,
            if delivered { "delivered" } else { "queued" }
        );
        Routed { id, delivered }
    }

    /// Permanently remove a message from whichever queue holds it. Unknown
    /// ids are ignored. Returns true if a message was removed.
    pub fn acknowledge_message(&self, id: &str) -> bool {
        let Some((_, identity)) = self.locations.remove(id) else {
            tracing::debug!("Ignoring acknowledgment for unknown message {}", id);
            return false;
        };

        let removed = match self.existing_inbox(&identity) {
            Some(inbox) => {
                let mut inbox = lock(&inbox);
                if let Some(pos) = inbox.unacked.iter().position(|m| m.id() == id) {
                    inbox.unacked.remove(pos);
                    true
                } else if let Some(pos) = inbox.pending.iter().position(|m| m.id() == id) {
                    inbox.pending.remove(pos);
                    true
                } else {
                    false
                }
            }
            None => false,
        };

        if removed {
            tracing::debug!("Message {} for {} acknowledged", id, identity);
            self.prune(&identity);
        }
        removed
    }

    /// Retry delivery of everything queued for `identity`
    pub fn flush(&self, identity: &str) -> usize {
        match self.existing_inbox(identity) {
            Some(inbox) => lock(&inbox).flush(identity),
            None => 0,
        }
    }

    /// Drop the inbox for `identity` when it holds nothing and nobody else
    /// is using it
    fn prune(&self, identity: &str) {
        let pruned = self.inboxes.remove_if(identity, |_, inbox| {
            Arc::strong_count(inbox) == 1
                && inbox
                    .try_lock()
                    .map(|inbox| inbox.is_idle())
                    .unwrap_or(false)
        });
        if pruned.is_some() {
            tracing::trace!("Pruned idle inbox for {}", identity);
        }
    }

    /// Number of messages waiting to be handed to `identity`
    pub fn pending_count(&self, identity: &str) -> usize {
        self.existing_inbox(identity)
            .map(|inbox| lock(&inbox).pending.len())
            .unwrap_or(0)
    }

    /// Ids waiting for `identity`, in delivery order
    pub fn pending_ids(&self, identity: &str) -> Vec<String> {
        self.existing_inbox(identity)
            .map(|inbox| {
                lock(&inbox)
                    .pending
                    .iter()
                    .map(|m| m.id().to_string())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Number of messages handed to `identity` but not acknowledged
    pub fn unacked_count(&self, identity: &str) -> usize {
        self.existing_inbox(identity)
            .map(|inbox| lock(&inbox).unacked.len())
            .unwrap_or(0)
    }

    pub fn is_registered(&self, identity: &str) -> bool {
        self.existing_inbox(identity)
            .map(|inbox| lock(&inbox).consumer.is_some())
            .unwrap_or(false)
    }

    /// Whether a message with this id is still awaiting acknowledgment
    pub fn is_tracked(&self, id: &str) -> bool {
        self.locations.contains_key(id)
    }

    /// Number of identities with routing state
    pub fn inbox_count(&self) -> usize {
        self.inboxes.len()
    }
}

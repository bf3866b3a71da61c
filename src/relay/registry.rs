// Live session registry

use crate::relay::message::{Identity, Outbound};
use dashmap::DashMap;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Sending side of a session's outbound mailbox
pub type Mailbox = mpsc::Sender<Outbound>;

/// Handle to a live session: its id plus the mailbox its writer task drains
#[derive(Debug, Clone)]
pub struct SessionHandle {
    pub session_id: Uuid,
    pub mailbox: Mailbox,
}

impl SessionHandle {
    pub fn new(session_id: Uuid, mailbox: Mailbox) -> Self {
        Self {
            session_id,
            mailbox,
        }
    }
}

/// Maps each identity to its current session. The last registration for an
/// identity wins.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: DashMap<Identity, SessionHandle>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `handle` the current session for `identity`, returning the
    /// session it displaced, if any
    pub fn register(&self, identity: &str, handle: SessionHandle) -> Option<SessionHandle> {
        let displaced = self.sessions.insert(identity.to_string(), handle);
        if let Some(old) = &displaced {
            tracing::info!(
                "Session {} for {} displaced by a newer login",
                old.session_id,
                identity
            );
        }
        displaced
    }

    /// Remove the entry for `identity` only if it still belongs to
    /// `session_id`. Returns true if an entry was removed.
    pub fn remove_if_current(&self, identity: &str, session_id: Uuid) -> bool {
        self.sessions
            .remove_if(identity, |_, handle| handle.session_id == session_id)
            .is_some()
    }

    /// Current session for `identity`
    pub fn lookup(&self, identity: &str) -> Option<SessionHandle> {
        self.sessions.get(identity).map(|entry| entry.value().clone())
    }

    pub fn is_online(&self, identity: &str) -> bool {
        self.sessions.contains_key(identity)
    }

    /// Number of identities with a live session
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Identities with a live session
    pub fn online_identities(&self) -> Vec<Identity> {
        self.sessions.iter().map(|entry| entry.key().clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle() -> SessionHandle {
        let (tx, _rx) = mpsc::channel(1);
        SessionHandle::new(Uuid::new_v4(), tx)
    }

    #[test]
    fn test_last_registration_wins() {
        let registry = SessionRegistry::new();
        let first = handle();
        let second = handle();

        assert!(registry.register("x@example.com", first.clone()).is_none());
        let displaced = registry.register("x@example.com", second.clone()).unwrap();
        assert_eq!(displaced.session_id, first.session_id);

        let current = registry.lookup("x@example.com").unwrap();
        assert_eq!(current.session_id, second.session_id);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_stale_removal_keeps_newer_session() {
        let registry = SessionRegistry::new();
        let old = handle();
        let new = handle();

        registry.register("x@example.com", old.clone());
        registry.register("x@example.com", new.clone());

        assert!(!registry.remove_if_current("x@example.com", old.session_id));
        assert!(registry.is_online("x@example.com"));

        assert!(registry.remove_if_current("x@example.com", new.session_id));
        assert!(!registry.is_online("x@example.com"));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_online_identities() {
        let registry = SessionRegistry::new();
        registry.register("a@example.com", handle());
        registry.register("b@example.com", handle());

        let mut online = registry.online_identities();
        online.sort();
        assert_eq!(online, vec!["a@example.com", "b@example.com"]);
    }
}

#![forbid(unsafe_code)]

// Session registry - the single source of truth for "who is connected".
// Bidirectional identity <-> connection mapping; the outer lock is a
// std::sync::RwLock held only for map operations, never across await points.

use crate::error::{SignalError, SignalResult};
use crate::room::participant::UserSession;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock as StdRwLock};
use tracing::debug;
use uuid::Uuid;

/// Opaque handle for one transport connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Default)]
struct Inner {
    by_identity: HashMap<String, Arc<UserSession>>,
    by_connection: HashMap<ConnectionId, String>,
}

/// Process-wide registry of connected participants.
///
/// Identities are unique at any instant: a second registration with a
/// colliding identity is rejected, never silently overwritten.
#[derive(Default)]
pub struct SessionRegistry {
    inner: StdRwLock<Inner>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds identity and connection mappings for a session.
    ///
    /// # Errors
    /// Returns `DuplicateIdentity` if the identity is already registered.
    pub fn register(&self, session: Arc<UserSession>) -> SignalResult<()> {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        if inner.by_identity.contains_key(session.name()) {
            return Err(SignalError::DuplicateIdentity(session.name().to_string()));
        }
        inner
            .by_connection
            .insert(session.connection(), session.name().to_string());
        inner
            .by_identity
            .insert(session.name().to_string(), session);
        Ok(())
    }

    /// Cheap pre-check used before allocating media resources for a joiner.
    /// `register` remains the authoritative duplicate guard.
    pub fn contains_identity(&self, name: &str) -> bool {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner.by_identity.contains_key(name)
    }

    pub fn by_identity(&self, name: &str) -> Option<Arc<UserSession>> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner.by_identity.get(name).cloned()
    }

    pub fn by_connection(&self, connection: &ConnectionId) -> Option<Arc<UserSession>> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        let name = inner.by_connection.get(connection)?;
        inner.by_identity.get(name).cloned()
    }

    /// Removes and returns the session for a connection. Idempotent: a second
    /// call for the same connection returns `None`.
    pub fn remove(&self, connection: &ConnectionId) -> Option<Arc<UserSession>> {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        let name = inner.by_connection.remove(connection)?;
        let session = inner.by_identity.remove(&name);
        debug!("Unregistered participant {} ({})", name, connection);
        session
    }

    pub fn participant_count(&self) -> usize {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner.by_identity.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{FakeMediaEngine, MediaEngine};
    use tokio::sync::mpsc;

    async fn make_session(name: &str) -> Arc<UserSession> {
        let engine: Arc<dyn MediaEngine> = Arc::new(FakeMediaEngine::new());
        let (tx, _rx) = mpsc::channel(8);
        UserSession::create(name, "room", ConnectionId::new(), tx, engine)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_register_and_lookup() {
        let registry = SessionRegistry::new();
        let session = make_session("alice").await;
        let connection = session.connection();

        registry.register(session).unwrap();

        assert!(registry.contains_identity("alice"));
        assert_eq!(registry.by_identity("alice").unwrap().name(), "alice");
        assert_eq!(registry.by_connection(&connection).unwrap().name(), "alice");
        assert_eq!(registry.participant_count(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_identity_rejected() {
        let registry = SessionRegistry::new();
        registry.register(make_session("alice").await).unwrap();

        let result = registry.register(make_session("alice").await);
        assert!(matches!(result, Err(SignalError::DuplicateIdentity(_))));
        // The original session stays registered.
        assert_eq!(registry.participant_count(), 1);
    }

    #[tokio::test]
    async fn test_remove_is_idempotent() {
        let registry = SessionRegistry::new();
        let session = make_session("bob").await;
        let connection = session.connection();
        registry.register(session).unwrap();

        assert!(registry.remove(&connection).is_some());
        assert!(registry.remove(&connection).is_none());
        assert!(!registry.contains_identity("bob"));
    }
}

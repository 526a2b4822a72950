//! Session registry: client identifier to live connection.

use crate::connection::{Connection, ConnectionId};
use dashmap::DashMap;
use std::sync::Arc;

/// A connected client's session.
#[derive(Clone)]
pub struct ClientSession {
    /// Client identifier
    pub client_id: String,
    /// Session state is discarded on disconnect
    pub clean_session: bool,
    /// Advertised keep-alive in seconds
    pub keep_alive: u16,
    /// Connection currently bound to the identifier
    pub connection: Arc<dyn Connection>,
}

impl ClientSession {
    /// Create a session bound to a connection.
    #[must_use]
    pub fn new(
        client_id: impl Into<String>,
        clean_session: bool,
        keep_alive: u16,
        connection: Arc<dyn Connection>,
    ) -> Self {
        Self {
            client_id: client_id.into(),
            clean_session,
            keep_alive,
            connection,
        }
    }

    /// Identity of the bound connection.
    #[must_use]
    pub fn connection_id(&self) -> ConnectionId {
        self.connection.id()
    }
}

impl std::fmt::Debug for ClientSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientSession")
            .field("client_id", &self.client_id)
            .field("clean_session", &self.clean_session)
            .field("keep_alive", &self.keep_alive)
            .field("connection_id", &self.connection_id())
            .finish()
    }
}

/// Concurrent map of active sessions.
///
/// Lookups return clones, so no shard lock outlives a call.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: DashMap<String, ClientSession>,
}

impl SessionRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a session, returning the one it replaced.
    pub fn register(&self, session: ClientSession) -> Option<ClientSession> {
        self.sessions.insert(session.client_id.clone(), session)
    }

    /// Session of a client.
    #[must_use]
    pub fn get(&self, client_id: &str) -> Option<ClientSession> {
        self.sessions.get(client_id).map(|entry| entry.value().clone())
    }

    /// Connection bound to a client.
    #[must_use]
    pub fn connection(&self, client_id: &str) -> Option<Arc<dyn Connection>> {
        self.sessions
            .get(client_id)
            .map(|entry| Arc::clone(&entry.value().connection))
    }

    /// Remove a client's session if it is still bound to `connection_id`.
    pub fn remove_if_bound(
        &self,
        client_id: &str,
        connection_id: ConnectionId,
    ) -> Option<ClientSession> {
        self.sessions
            .remove_if(client_id, |_, session| session.connection_id() == connection_id)
            .map(|(_, session)| session)
    }

    /// Remove a client's session. Missing clients are ignored.
    pub fn remove(&self, client_id: &str) -> Option<ClientSession> {
        self.sessions.remove(client_id).map(|(_, session)| session)
    }

    /// Whether a client has a session.
    #[must_use]
    pub fn contains(&self, client_id: &str) -> bool {
        self.sessions.contains_key(client_id)
    }

    /// Number of sessions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether no client is connected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ChannelConnection;

    #[test]
    fn register_is_last_writer_wins() {
        let registry = SessionRegistry::new();
        let (first, _rx1) = ChannelConnection::new();
        let (second, _rx2) = ChannelConnection::new();

        assert!(registry
            .register(ClientSession::new("c", true, 30, first.clone()))
            .is_none());
        let replaced = registry
            .register(ClientSession::new("c", false, 30, second.clone()))
            .unwrap();

        assert_eq!(replaced.connection_id(), first.id());
        assert_eq!(registry.get("c").unwrap().connection_id(), second.id());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn remove_if_bound_ignores_stale_connection() {
        let registry = SessionRegistry::new();
        let (stale, _rx1) = ChannelConnection::new();
        let (current, _rx2) = ChannelConnection::new();
        registry.register(ClientSession::new("c", true, 30, current.clone()));

        assert!(registry.remove_if_bound("c", stale.id()).is_none());
        assert!(registry.contains("c"));

        assert!(registry.remove_if_bound("c", current.id()).is_some());
        assert!(registry.is_empty());
    }

    #[test]
    fn remove_is_idempotent() {
        let registry = SessionRegistry::new();
        assert!(registry.remove("ghost").is_none());
        assert!(registry.remove("ghost").is_none());
    }
}

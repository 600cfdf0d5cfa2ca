use crate::{config::SessionConfig, Session, SessionFactory, SessionId};
use bytes::Bytes;
use dashmap::DashMap;
use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

/// Assigns session IDs and keeps track of every live session.
///
/// Sessions created through [`open`](SessionRegistry::open) remove themselves
/// when they tear down. The registry only holds sessions; it never drives
/// their I/O.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: DashMap<SessionId, Arc<Session>>,
    /// The last ID handed out. IDs start at 1.
    last_id: AtomicU64,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a new registry behind an `Arc`, the form listeners and
    /// connectors take it in.
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Creates and tracks a session for a connection to `peer`. The session is
    /// not started.
    pub fn open<F>(
        self: &Arc<Self>,
        peer: SocketAddr,
        factory: &F,
        config: &SessionConfig,
    ) -> Arc<Session>
    where
        F: SessionFactory + ?Sized,
    {
        let id = SessionId::new(self.last_id.fetch_add(1, Ordering::Relaxed) + 1);
        let session = Session::registered(
            id,
            peer,
            config.clone(),
            factory.create(id),
            Arc::downgrade(self),
        );
        self.sessions.insert(id, session.clone());
        session
    }

    pub fn get(&self, id: SessionId) -> Option<Arc<Session>> {
        self.sessions.get(&id).map(|entry| entry.value().clone())
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// A snapshot of the live sessions.
    pub fn sessions(&self) -> Vec<Arc<Session>> {
        self.sessions
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Queues the same bytes on every live session. Returns how many accepted
    /// them.
    pub fn broadcast(&self, region: impl Into<Bytes>) -> usize {
        let region = region.into();
        self.sessions()
            .iter()
            .filter(|session| session.send(region.clone()).is_ok())
            .count()
    }

    pub fn disconnect_all(&self) {
        for session in self.sessions() {
            session.disconnect();
        }
    }

    pub(crate) fn remove(&self, id: SessionId) {
        self.sessions.remove(&id);
    }
}

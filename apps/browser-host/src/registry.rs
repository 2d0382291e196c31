use dashmap::DashMap;
use metrics::gauge;
use std::sync::Arc;
use uuid::Uuid;

use crate::session::HostSession;

/// Live streaming sessions keyed by session id.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<DashMap<String, Arc<HostSession>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `session`, handing back whatever previously held its id.
    pub fn insert(&self, session: Arc<HostSession>) -> Option<Arc<HostSession>> {
        let replaced = self
            .sessions
            .insert(session.session_id().to_string(), session);
        gauge!("browser_host_active_sessions", self.sessions.len() as f64);
        replaced
    }

    pub fn get(&self, session_id: &str) -> Option<Arc<HostSession>> {
        self.sessions
            .get(session_id)
            .map(|entry| Arc::clone(entry.value()))
    }

    pub fn remove(&self, session_id: &str) -> Option<Arc<HostSession>> {
        let removed = self.sessions.remove(session_id).map(|(_, session)| session);
        gauge!("browser_host_active_sessions", self.sessions.len() as f64);
        removed
    }

    /// Removes the entry only while it still refers to `session`, so a late
    /// teardown cannot evict the replacement that took over its id.
    pub fn remove_if_same(&self, session: &Arc<HostSession>) -> bool {
        let removed = self
            .sessions
            .remove_if(session.session_id(), |_, current| Arc::ptr_eq(current, session))
            .is_some();
        gauge!("browser_host_active_sessions", self.sessions.len() as f64);
        removed
    }

    /// Detaches every session owned by the given viewer connection.
    pub fn take_viewer_sessions(&self, viewer: Uuid) -> Vec<Arc<HostSession>> {
        let owned: Vec<Arc<HostSession>> = self
            .sessions
            .iter()
            .filter(|entry| entry.value().viewer().id() == viewer)
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        owned
            .into_iter()
            .filter(|session| self.remove_if_same(session))
            .collect()
    }

    pub fn drain(&self) -> Vec<Arc<HostSession>> {
        let ids: Vec<String> = self.sessions.iter().map(|entry| entry.key().clone()).collect();
        let drained = ids
            .into_iter()
            .filter_map(|id| self.sessions.remove(&id).map(|(_, session)| session))
            .collect();
        gauge!("browser_host_active_sessions", self.sessions.len() as f64);
        drained
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

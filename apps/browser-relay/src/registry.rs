use browser_proto::{ViewerMessage, CLOSE_NORMAL, CLOSE_REPLACED};
use dashmap::DashMap;
use metrics::{counter, gauge};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::link::Link;

pub const REPLACED_REASON: &str = "Replaced by new connection";

/// One admitted session: the public client and its backend connection.
#[derive(Debug)]
pub struct RelaySession {
    pub session_id: String,
    pub client: Link,
    pub backend: Link,
}

impl RelaySession {
    pub fn new(session_id: impl Into<String>, client: Link, backend: Link) -> Self {
        Self {
            session_id: session_id.into(),
            client,
            backend,
        }
    }

    /// Tears down a session that lost its id to a newer connection.
    pub fn evict(&self) {
        if self.backend.is_open() {
            let stop = ViewerMessage::StopStreaming {
                session_id: self.session_id.clone(),
            };
            if let Ok(text) = stop.to_text() {
                self.backend.send_text(text);
            }
        }
        self.client.close(CLOSE_REPLACED, REPLACED_REASON);
        self.backend.close(CLOSE_NORMAL, REPLACED_REASON);
    }
}

/// At most one live session per id.
#[derive(Clone, Default)]
pub struct RelayRegistry {
    sessions: Arc<DashMap<String, Arc<RelaySession>>>,
}

impl RelayRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs `session` under its id and evicts whoever held it before.
    /// Returns the evicted session.
    pub fn admit(&self, session: Arc<RelaySession>) -> Option<Arc<RelaySession>> {
        let previous = self
            .sessions
            .insert(session.session_id.clone(), Arc::clone(&session));
        counter!("browser_relay_sessions_admitted_total", 1);
        gauge!("browser_relay_sessions_active", self.sessions.len() as f64);
        if let Some(previous) = &previous {
            info!(
                session_id = %session.session_id,
                evicted_client = %previous.client.id(),
                "evicting previous connection"
            );
            counter!("browser_relay_sessions_evicted_total", 1);
            previous.evict();
        }
        previous
    }

    /// Removes the entry only while it still belongs to `client_id`.
    pub fn remove_if_client(&self, session_id: &str, client_id: Uuid) -> bool {
        let removed = self
            .sessions
            .remove_if(session_id, |_, session| session.client.id() == client_id)
            .is_some();
        if removed {
            debug!(session_id = %session_id, client = %client_id, "session removed");
            gauge!("browser_relay_sessions_active", self.sessions.len() as f64);
        }
        removed
    }

    pub fn drain(&self) -> Vec<Arc<RelaySession>> {
        let ids: Vec<String> = self.sessions.iter().map(|entry| entry.key().clone()).collect();
        let drained = ids
            .into_iter()
            .filter_map(|id| self.sessions.remove(&id).map(|(_, session)| session))
            .collect();
        gauge!("browser_relay_sessions_active", self.sessions.len() as f64);
        drained
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

//! Live session registry

use super::session::Session;
use crate::signaling::message::SessionId;
use crate::{Error, Result};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Sessions keyed by id
///
/// A session stays registered until its teardown reaches the registry
/// stage; lookups after that fail with `Error::SessionNotFound`.
#[derive(Default)]
pub struct SessionManager {
    sessions: RwLock<HashMap<SessionId, Arc<Session>>>,
}

impl SessionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidData` if the id is already taken.
    pub async fn insert(&self, session: Arc<Session>) -> Result<()> {
        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(session.id()) {
            return Err(Error::InvalidData(format!(
                "Session {} already exists",
                session.id()
            )));
        }

        info!(session_id = %session.id(), "Session registered");
        sessions.insert(session.id().to_string(), session);
        Ok(())
    }

    /// Look up a session
    pub async fn get(&self, session_id: &str) -> Result<Arc<Session>> {
        self.sessions
            .read()
            .await
            .get(session_id)
            .cloned()
            .ok_or_else(|| Error::SessionNotFound(session_id.to_string()))
    }

    /// Remove a session, returning it if it was registered
    pub async fn remove(&self, session_id: &str) -> Option<Arc<Session>> {
        let removed = self.sessions.write().await.remove(session_id);
        if removed.is_some() {
            debug!(session_id = %session_id, "Session removed");
        }
        removed
    }

    pub async fn contains(&self, session_id: &str) -> bool {
        self.sessions.read().await.contains_key(session_id)
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn session_ids(&self) -> Vec<SessionId> {
        self.sessions.read().await.keys().cloned().collect()
    }
}

//! Registry of connected charge points
//!
//! One entry per identity. A new connection for an identity that is already
//! registered replaces the old entry; the caller closes the old session.
//! Removal is keyed on the connection id so a closing session can never
//! evict the connection that replaced it.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

use crate::session::{BootInfo, SessionHandle, SessionState};

/// Point-in-time view of one registered session
#[derive(Debug, Clone)]
pub struct SessionSummary {
    pub identity: String,
    pub connection_id: Uuid,
    pub connected_at: DateTime<Utc>,
    pub state: SessionState,
    pub boot: Option<BootInfo>,
    pub pending_calls: usize,
}

/// Active sessions keyed by charge point identity
#[derive(Debug, Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<RwLock<HashMap<String, SessionHandle>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session, returning the one it replaced
    pub async fn insert(&self, handle: SessionHandle) -> Option<SessionHandle> {
        let identity = handle.identity().to_string();
        let mut sessions = self.sessions.write().await;
        let previous = sessions.insert(identity.clone(), handle);
        info!(
            "Session registered: {} ({} active)",
            identity,
            sessions.len()
        );
        previous
    }

    /// Remove `identity` only while it still maps to `connection_id`
    pub async fn remove_if_current(&self, identity: &str, connection_id: Uuid) -> bool {
        let mut sessions = self.sessions.write().await;
        match sessions.get(identity) {
            Some(current) if current.connection_id() == connection_id => {
                sessions.remove(identity);
                info!(
                    "Session unregistered: {} ({} active)",
                    identity,
                    sessions.len()
                );
                true
            }
            Some(_) => {
                debug!(
                    "Session {} already replaced, keeping newer connection",
                    identity
                );
                false
            }
            None => false,
        }
    }

    pub async fn get(&self, identity: &str) -> Option<SessionHandle> {
        self.sessions.read().await.get(identity).cloned()
    }

    pub async fn contains(&self, identity: &str) -> bool {
        self.sessions.read().await.contains_key(identity)
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    /// Sorted list of connected identities
    pub async fn identities(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.sessions.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Summaries of every registered session, sorted by identity
    pub async fn snapshot(&self) -> Vec<SessionSummary> {
        let sessions = self.sessions.read().await;
        let mut summaries: Vec<SessionSummary> = sessions
            .values()
            .map(|h| SessionSummary {
                identity: h.identity().to_string(),
                connection_id: h.connection_id(),
                connected_at: h.connected_at(),
                state: h.state(),
                boot: h.boot_info(),
                pending_calls: h.pending().len(),
            })
            .collect();
        summaries.sort_by(|a, b| a.identity.cmp(&b.identity));
        summaries
    }

    /// Signal every registered session to close
    pub async fn close_all(&self) -> usize {
        let sessions = self.sessions.read().await;
        for handle in sessions.values() {
            handle.close();
        }
        sessions.len()
    }
}

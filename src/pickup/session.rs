//! Live delivery sessions, one per connection.
//!
//! Sessions live only in memory; a restart drops them and recipients ask
//! for live delivery again.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionRole {
    MessageHolder,
    Recipient,
}

impl std::fmt::Display for SessionRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionRole::MessageHolder => write!(f, "message_holder"),
            SessionRole::Recipient => write!(f, "recipient"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiveSession {
    pub connection_id: String,
    pub role: SessionRole,
    /// Transport session the pushes go out on.
    pub transport_session_id: String,
    pub created_at: i64,
}

impl LiveSession {
    pub fn new(connection_id: impl Into<String>, role: SessionRole, transport_session_id: impl Into<String>) -> Self {
        Self {
            connection_id: connection_id.into(),
            role,
            transport_session_id: transport_session_id.into(),
            created_at: chrono::Utc::now().timestamp_millis(),
        }
    }
}

/// Process-wide table of live sessions keyed by connection id.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, LiveSession>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `session`, replacing any session on the same connection.
    pub async fn save(&self, session: LiveSession) -> Option<LiveSession> {
        let mut sessions = self.sessions.write().await;
        sessions.insert(session.connection_id.clone(), session)
    }

    pub async fn remove(&self, connection_id: &str) -> Option<LiveSession> {
        self.sessions.write().await.remove(connection_id)
    }

    pub async fn get(&self, connection_id: &str) -> Option<LiveSession> {
        self.sessions.read().await.get(connection_id).cloned()
    }

    /// Drop every session bound to a closed transport.
    pub async fn remove_by_transport(&self, transport_session_id: &str) -> Vec<LiveSession> {
        let mut sessions = self.sessions.write().await;
        let closed: Vec<String> = sessions
            .values()
            .filter(|s| s.transport_session_id == transport_session_id)
            .map(|s| s.connection_id.clone())
            .collect();
        closed
            .iter()
            .filter_map(|connection_id| sessions.remove(connection_id))
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }
}

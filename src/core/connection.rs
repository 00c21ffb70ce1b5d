//! Connection lookup and readiness checks.
//!
//! Connection establishment itself lives outside this crate; engines only
//! need to resolve a connection id and check that it is usable.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::{Error, Result};

/// Connection handshake state.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    InvitationSent,
    RequestSent,
    ResponseSent,
    Completed,
    Abandoned,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::InvitationSent => write!(f, "invitation-sent"),
            ConnectionState::RequestSent => write!(f, "request-sent"),
            ConnectionState::ResponseSent => write!(f, "response-sent"),
            ConnectionState::Completed => write!(f, "completed"),
            ConnectionState::Abandoned => write!(f, "abandoned"),
        }
    }
}

/// An established (or establishing) pairwise connection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Connection {
    pub id: String,
    pub state: ConnectionState,
    pub their_label: Option<String>,
}

impl Connection {
    pub fn new(id: impl Into<String>, state: ConnectionState) -> Self {
        Self {
            id: id.into(),
            state,
            their_label: None,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.state == ConnectionState::Completed
    }

    /// Fail with `ConnectionNotReady` unless the handshake has completed.
    pub fn assert_ready(&self) -> Result<()> {
        if self.is_ready() {
            Ok(())
        } else {
            Err(Error::ConnectionNotReady(format!(
                "connection {} is in state {}",
                self.id, self.state
            )))
        }
    }
}

/// Connection lookup provided by the hosting agent.
#[async_trait]
pub trait ConnectionService: Send + Sync {
    async fn find_by_id(&self, connection_id: &str) -> Result<Option<Connection>>;
}

/// Resolve a connection and require it to be ready.
pub async fn assert_ready_connection(
    service: &dyn ConnectionService,
    connection_id: &str,
) -> Result<Connection> {
    let connection = service.find_by_id(connection_id).await?.ok_or_else(|| {
        Error::ConnectionNotReady(format!("connection {} does not exist", connection_id))
    })?;
    connection.assert_ready()?;
    Ok(connection)
}

/// In-memory connection table.
#[derive(Debug, Default)]
pub struct InMemoryConnectionService {
    connections: RwLock<HashMap<String, Connection>>,
}

impl InMemoryConnectionService {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, connection: Connection) {
        let mut connections = self.connections.write().await;
        connections.insert(connection.id.clone(), connection);
    }

    /// Convenience for registering a completed connection.
    pub async fn insert_ready(&self, connection_id: &str) {
        self.insert(Connection::new(connection_id, ConnectionState::Completed))
            .await;
    }
}

#[async_trait]
impl ConnectionService for InMemoryConnectionService {
    async fn find_by_id(&self, connection_id: &str) -> Result<Option<Connection>> {
        let connections = self.connections.read().await;
        Ok(connections.get(connection_id).cloned())
    }
}

//! Execution context handed to every engine call.

use std::sync::Arc;

use crate::core::connection::{assert_ready_connection, Connection, ConnectionService};
use crate::error::Result;

/// Handles an engine call needs from the hosting agent.
#[derive(Clone)]
pub struct AgentContext {
    /// Label used in logs to tell agents apart.
    pub label: String,
    pub connections: Arc<dyn ConnectionService>,
}

impl AgentContext {
    pub fn new(label: impl Into<String>, connections: Arc<dyn ConnectionService>) -> Self {
        Self {
            label: label.into(),
            connections,
        }
    }

    /// Resolve `connection_id` and fail with `ConnectionNotReady` unless usable.
    pub async fn ready_connection(&self, connection_id: &str) -> Result<Connection> {
        assert_ready_connection(self.connections.as_ref(), connection_id).await
    }
}

impl std::fmt::Debug for AgentContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentContext")
            .field("label", &self.label)
            .finish()
    }
}

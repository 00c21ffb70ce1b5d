//! Agent events emitted by the exchange and pickup engines.
//!
//! Engines never publish on their own: every call returns the events it
//! produced and the caller forwards them to an [`EventBus`].

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::exchange::credential::CredentialProtocol;
use crate::exchange::proof::ProofProtocol;
use crate::exchange::StateChangedEvent;
use crate::pickup::LiveSession;

/// Events observable by UIs and external auto-accept integrations.
#[derive(Debug, Clone)]
pub enum AgentEvent {
    CredentialStateChanged(StateChangedEvent<CredentialProtocol>),
    ProofStateChanged(StateChangedEvent<ProofProtocol>),
    PickupCompleted(PickupCompleted),
    LiveSessionSaved(LiveSession),
    LiveSessionRemoved(LiveSession),
}

impl AgentEvent {
    /// Short event name for logging.
    pub fn name(&self) -> &'static str {
        match self {
            AgentEvent::CredentialStateChanged(_) => "credential_state_changed",
            AgentEvent::ProofStateChanged(_) => "proof_state_changed",
            AgentEvent::PickupCompleted(_) => "pickup_completed",
            AgentEvent::LiveSessionSaved(_) => "live_session_saved",
            AgentEvent::LiveSessionRemoved(_) => "live_session_removed",
        }
    }
}

/// Batch pickup finished because the holder reported no queued messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PickupCompleted {
    pub connection_id: String,
    pub thread_id: String,
    pub recipient_key: Option<String>,
}

/// Fan-out hub for broadcasting agent events to subscribers.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<AgentEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Broadcast an event to all subscribers.
    pub fn emit(&self, event: AgentEvent) {
        tracing::debug!("Emitting {}", event.name());
        // No receivers is fine
        let _ = self.sender.send(event);
    }

    /// Broadcast every event in order.
    pub fn emit_all(&self, events: impl IntoIterator<Item = AgentEvent>) {
        for event in events {
            self.emit(event);
        }
    }

    /// Get a new receiver for subscribing.
    pub fn subscribe(&self) -> broadcast::Receiver<AgentEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

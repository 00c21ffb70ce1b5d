//! Exchange records: one per credential or proof negotiation.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

use super::message::{generate_id, FormatRef, MessageKind};
use super::protocol::ExchangeProtocol;

/// Auto-accept policy for incoming steps.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum AutoAcceptPolicy {
    /// Always respond automatically.
    Always,
    /// Respond only when the content matches what this side last sent.
    ContentApproved,
    /// Never respond automatically.
    #[default]
    Never,
}

impl std::fmt::Display for AutoAcceptPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AutoAcceptPolicy::Always => write!(f, "always"),
            AutoAcceptPolicy::ContentApproved => write!(f, "content_approved"),
            AutoAcceptPolicy::Never => write!(f, "never"),
        }
    }
}

/// Persistent state-machine instance for one negotiation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(bound(serialize = "", deserialize = ""))]
pub struct ExchangeRecord<P: ExchangeProtocol> {
    pub id: String,
    pub thread_id: String,
    pub parent_thread_id: Option<String>,
    /// `None` for connection-less exchanges.
    pub connection_id: Option<String>,
    pub role: P::Role,
    pub state: P::State,
    pub protocol_version: String,
    pub auto_accept: Option<AutoAcceptPolicy>,
    /// Attachment ids per step, keyed by wire format.
    #[serde(default)]
    pub format_refs: BTreeMap<MessageKind, Vec<FormatRef>>,
    /// Format-specific bookkeeping, opaque to the engine.
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
    pub error_message: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl<P: ExchangeProtocol> ExchangeRecord<P> {
    pub fn new(
        thread_id: impl Into<String>,
        role: P::Role,
        state: P::State,
        protocol_version: impl Into<String>,
    ) -> Self {
        let now = chrono::Utc::now().timestamp_millis();
        Self {
            id: generate_id(),
            thread_id: thread_id.into(),
            parent_thread_id: None,
            connection_id: None,
            role,
            state,
            protocol_version: protocol_version.into(),
            auto_accept: None,
            format_refs: BTreeMap::new(),
            metadata: BTreeMap::new(),
            error_message: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_connection(mut self, connection_id: Option<String>) -> Self {
        self.connection_id = connection_id;
        self
    }

    pub fn with_parent_thread(mut self, parent_thread_id: Option<String>) -> Self {
        self.parent_thread_id = parent_thread_id;
        self
    }

    pub fn with_auto_accept(mut self, policy: Option<AutoAcceptPolicy>) -> Self {
        self.auto_accept = policy;
        self
    }

    pub fn is_connectionless(&self) -> bool {
        self.connection_id.is_none()
    }

    /// Record policy, falling back to the module default.
    pub fn effective_policy(&self, default: AutoAcceptPolicy) -> AutoAcceptPolicy {
        self.auto_accept.unwrap_or(default)
    }

    pub fn assert_state(&self, expected: &[P::State]) -> Result<()> {
        if expected.contains(&self.state) {
            Ok(())
        } else {
            Err(Error::invalid_state(&self.id, expected, self.state))
        }
    }

    pub fn assert_protocol_version(&self, version: &str) -> Result<()> {
        if self.protocol_version == version {
            Ok(())
        } else {
            Err(Error::ProtocolVersionMismatch {
                expected: version.to_string(),
                actual: self.protocol_version.clone(),
            })
        }
    }

    /// Move to `state`, returning the previous state.
    pub fn set_state(&mut self, state: P::State) -> P::State {
        let previous = self.state;
        self.state = state;
        self.updated_at = chrono::Utc::now().timestamp_millis();
        previous
    }

    pub fn metadata(&self, key: &str) -> Option<&Value> {
        self.metadata.get(key)
    }

    pub fn set_metadata(&mut self, key: impl Into<String>, value: Value) {
        self.metadata.insert(key.into(), value);
    }
}

/// Emitted whenever a record changes state; `previous_state` is `None` on creation.
#[derive(Debug, Clone)]
pub struct StateChangedEvent<P: ExchangeProtocol> {
    pub record: ExchangeRecord<P>,
    pub previous_state: Option<P::State>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::credential::{CredentialProtocol, CredentialRole, CredentialState};
    use serde_json::json;

    fn record() -> ExchangeRecord<CredentialProtocol> {
        ExchangeRecord::new("thread-1", CredentialRole::Holder, CredentialState::ProposalSent, "v2")
            .with_connection(Some("conn-1".to_string()))
    }

    #[test]
    fn test_assertions() {
        let record = record();
        assert!(record.assert_state(&[CredentialState::ProposalSent]).is_ok());
        assert!(matches!(
            record.assert_state(&[CredentialState::OfferReceived]),
            Err(Error::InvalidStateTransition { .. })
        ));
        assert!(record.assert_protocol_version("v2").is_ok());
        assert!(matches!(
            record.assert_protocol_version("v1"),
            Err(Error::ProtocolVersionMismatch { .. })
        ));
    }

    #[test]
    fn test_policy_override() {
        let record = record();
        assert_eq!(record.effective_policy(AutoAcceptPolicy::Always), AutoAcceptPolicy::Always);

        let record = record.with_auto_accept(Some(AutoAcceptPolicy::Never));
        assert_eq!(record.effective_policy(AutoAcceptPolicy::Always), AutoAcceptPolicy::Never);
    }

    #[test]
    fn test_serde_roundtrip_keeps_metadata() {
        let mut record = record();
        record.set_metadata("credential_id", json!("cred-9"));
        let previous = record.set_state(CredentialState::OfferReceived);
        assert_eq!(previous, CredentialState::ProposalSent);

        let json = serde_json::to_string(&record).unwrap();
        let back: ExchangeRecord<CredentialProtocol> = serde_json::from_str(&json).unwrap();
        assert_eq!(back.state, CredentialState::OfferReceived);
        assert_eq!(back.metadata("credential_id"), Some(&json!("cred-9")));
    }
}

//! Credential issuance protocol (`issue-credential`).

use serde::{Deserialize, Serialize};

use crate::core::context::AgentContext;
use crate::core::events::AgentEvent;
use crate::error::Result;

use super::engine::{ExchangeEngine, ExchangeOutcome, InboundMessage, NegotiateOptions};
use super::message::MessageKind;
use super::protocol::{ExchangeProtocol, Transition};
use super::record::{ExchangeRecord, StateChangedEvent};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum CredentialRole {
    Holder,
    Issuer,
}

impl std::fmt::Display for CredentialRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CredentialRole::Holder => write!(f, "holder"),
            CredentialRole::Issuer => write!(f, "issuer"),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum CredentialState {
    ProposalSent,
    ProposalReceived,
    OfferSent,
    OfferReceived,
    RequestSent,
    RequestReceived,
    CredentialIssued,
    CredentialReceived,
    Done,
    Abandoned,
}

impl std::fmt::Display for CredentialState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CredentialState::ProposalSent => "proposal-sent",
            CredentialState::ProposalReceived => "proposal-received",
            CredentialState::OfferSent => "offer-sent",
            CredentialState::OfferReceived => "offer-received",
            CredentialState::RequestSent => "request-sent",
            CredentialState::RequestReceived => "request-received",
            CredentialState::CredentialIssued => "credential-issued",
            CredentialState::CredentialReceived => "credential-received",
            CredentialState::Done => "done",
            CredentialState::Abandoned => "abandoned",
        };
        write!(f, "{}", s)
    }
}

/// Holder proposes, issuer offers, holder requests, issuer issues, holder acks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CredentialProtocol;

pub type CredentialRecord = ExchangeRecord<CredentialProtocol>;

impl ExchangeProtocol for CredentialProtocol {
    type State = CredentialState;
    type Role = CredentialRole;

    const NAME: &'static str = "issue-credential";

    fn roles() -> &'static [CredentialRole] {
        &[CredentialRole::Holder, CredentialRole::Issuer]
    }

    fn done() -> CredentialState {
        CredentialState::Done
    }

    fn abandoned() -> CredentialState {
        CredentialState::Abandoned
    }

    fn message_name(kind: MessageKind) -> Option<&'static str> {
        match kind {
            MessageKind::Proposal => Some("propose-credential"),
            MessageKind::Offer => Some("offer-credential"),
            MessageKind::Request => Some("request-credential"),
            MessageKind::Issue => Some("issue-credential"),
            MessageKind::Ack => Some("ack"),
            MessageKind::ProblemReport => Some("problem-report"),
        }
    }

    fn sending(kind: MessageKind) -> Option<Transition<CredentialState, CredentialRole>> {
        use CredentialState::*;
        let transition = match kind {
            MessageKind::Proposal => Transition {
                role: CredentialRole::Holder,
                from: &[OfferReceived],
                to: ProposalSent,
                opens_record: true,
                connectionless: false,
            },
            MessageKind::Offer => Transition {
                role: CredentialRole::Issuer,
                from: &[ProposalReceived],
                to: OfferSent,
                opens_record: true,
                connectionless: true,
            },
            MessageKind::Request => Transition {
                role: CredentialRole::Holder,
                from: &[OfferReceived],
                to: RequestSent,
                opens_record: true,
                connectionless: false,
            },
            MessageKind::Issue => Transition {
                role: CredentialRole::Issuer,
                from: &[RequestReceived],
                to: CredentialIssued,
                opens_record: false,
                connectionless: false,
            },
            MessageKind::Ack => Transition {
                role: CredentialRole::Holder,
                from: &[CredentialReceived],
                to: Done,
                opens_record: false,
                connectionless: false,
            },
            MessageKind::ProblemReport => return None,
        };
        Some(transition)
    }

    fn receiving(kind: MessageKind) -> Option<Transition<CredentialState, CredentialRole>> {
        use CredentialState::*;
        let transition = match kind {
            MessageKind::Proposal => Transition {
                role: CredentialRole::Issuer,
                from: &[OfferSent],
                to: ProposalReceived,
                opens_record: true,
                connectionless: false,
            },
            MessageKind::Offer => Transition {
                role: CredentialRole::Holder,
                from: &[ProposalSent],
                to: OfferReceived,
                opens_record: true,
                connectionless: true,
            },
            MessageKind::Request => Transition {
                role: CredentialRole::Issuer,
                from: &[OfferSent],
                to: RequestReceived,
                opens_record: true,
                connectionless: false,
            },
            MessageKind::Issue => Transition {
                role: CredentialRole::Holder,
                from: &[RequestSent],
                to: CredentialReceived,
                opens_record: false,
                connectionless: false,
            },
            MessageKind::Ack => Transition {
                role: CredentialRole::Issuer,
                from: &[CredentialIssued],
                to: Done,
                opens_record: false,
                connectionless: false,
            },
            MessageKind::ProblemReport => return None,
        };
        Some(transition)
    }

    fn response_to(kind: MessageKind) -> Option<MessageKind> {
        match kind {
            MessageKind::Proposal => Some(MessageKind::Offer),
            MessageKind::Offer => Some(MessageKind::Request),
            MessageKind::Request => Some(MessageKind::Issue),
            MessageKind::Issue => Some(MessageKind::Ack),
            _ => None,
        }
    }

    fn counter_to(kind: MessageKind) -> Option<MessageKind> {
        match kind {
            MessageKind::Proposal => Some(MessageKind::Offer),
            MessageKind::Offer => Some(MessageKind::Proposal),
            _ => None,
        }
    }

    fn counterpart_of(kind: MessageKind) -> Option<MessageKind> {
        match kind {
            MessageKind::Proposal => Some(MessageKind::Offer),
            MessageKind::Offer => Some(MessageKind::Proposal),
            MessageKind::Request => Some(MessageKind::Offer),
            MessageKind::Issue => Some(MessageKind::Request),
            _ => None,
        }
    }

    fn state_changed(event: StateChangedEvent<Self>) -> AgentEvent {
        AgentEvent::CredentialStateChanged(event)
    }
}

pub type CredentialEngine = ExchangeEngine<CredentialProtocol>;

impl ExchangeEngine<CredentialProtocol> {
    pub async fn process_credential(
        &self,
        ctx: &AgentContext,
        inbound: InboundMessage,
    ) -> Result<ExchangeOutcome<CredentialProtocol>> {
        self.process_issue(ctx, inbound).await
    }

    /// Acknowledge a received credential, finishing the exchange.
    pub async fn accept_credential(
        &self,
        ctx: &AgentContext,
        record_id: &str,
    ) -> Result<ExchangeOutcome<CredentialProtocol>> {
        self.accept_issue(ctx, record_id).await
    }

    /// Answer an offer with a proposal of different content.
    pub async fn negotiate_offer(
        &self,
        ctx: &AgentContext,
        record_id: &str,
        options: NegotiateOptions,
    ) -> Result<ExchangeOutcome<CredentialProtocol>> {
        self.negotiate(ctx, record_id, MessageKind::Offer, options).await
    }

    pub async fn should_auto_respond_to_credential(&self, record: &ExchangeRecord<CredentialProtocol>) -> bool {
        self.should_auto_respond_to_issue(record).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sender_and_receiver_roles_differ() {
        for kind in [
            MessageKind::Proposal,
            MessageKind::Offer,
            MessageKind::Request,
            MessageKind::Issue,
            MessageKind::Ack,
        ] {
            let send = CredentialProtocol::sending(kind).unwrap();
            let recv = CredentialProtocol::receiving(kind).unwrap();
            assert_ne!(send.role, recv.role, "{}", kind);
        }
    }

    #[test]
    fn test_message_types() {
        assert_eq!(
            CredentialProtocol::message_type("v2", MessageKind::Offer).unwrap(),
            "https://didcomm.org/issue-credential/2.0/offer-credential"
        );
        let (version, kind) = CredentialProtocol::parse_message_type(
            "https://didcomm.org/issue-credential/1.0/request-credential",
        )
        .unwrap();
        assert_eq!(version, "v1");
        assert_eq!(kind, MessageKind::Request);

        assert!(CredentialProtocol::parse_message_type(
            "https://didcomm.org/present-proof/2.0/request-presentation"
        )
        .is_none());
    }

    #[test]
    fn test_state_serialization() {
        assert_eq!(
            serde_json::to_string(&CredentialState::CredentialIssued).unwrap(),
            "\"credential-issued\""
        );
        assert_eq!(CredentialState::OfferReceived.to_string(), "offer-received");
        assert!(CredentialProtocol::is_terminal(CredentialState::Abandoned));
        assert!(!CredentialProtocol::is_terminal(CredentialState::OfferSent));
    }
}

//! Proof presentation protocol (`present-proof`).

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
pub enum ProofRole {
    Prover,
    Verifier,
}

impl std::fmt::Display for ProofRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProofRole::Prover => write!(f, "prover"),
            ProofRole::Verifier => write!(f, "verifier"),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum ProofState {
    ProposalSent,
    ProposalReceived,
    RequestSent,
    RequestReceived,
    PresentationSent,
    PresentationReceived,
    Done,
    Abandoned,
}

impl std::fmt::Display for ProofState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ProofState::ProposalSent => "proposal-sent",
            ProofState::ProposalReceived => "proposal-received",
            ProofState::RequestSent => "request-sent",
            ProofState::RequestReceived => "request-received",
            ProofState::PresentationSent => "presentation-sent",
            ProofState::PresentationReceived => "presentation-received",
            ProofState::Done => "done",
            ProofState::Abandoned => "abandoned",
        };
        write!(f, "{}", s)
    }
}

/// Prover proposes, verifier requests, prover presents, verifier acks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProofProtocol;

pub type ProofRecord = ExchangeRecord<ProofProtocol>;

impl ExchangeProtocol for ProofProtocol {
    type State = ProofState;
    type Role = ProofRole;

    const NAME: &'static str = "present-proof";

    fn roles() -> &'static [ProofRole] {
        &[ProofRole::Prover, ProofRole::Verifier]
    }

    fn done() -> ProofState {
        ProofState::Done
    }

    fn abandoned() -> ProofState {
        ProofState::Abandoned
    }

    fn message_name(kind: MessageKind) -> Option<&'static str> {
        match kind {
            MessageKind::Proposal => Some("propose-presentation"),
            MessageKind::Request => Some("request-presentation"),
            MessageKind::Issue => Some("presentation"),
            MessageKind::Ack => Some("ack"),
            MessageKind::ProblemReport => Some("problem-report"),
            MessageKind::Offer => None,
        }
    }

    fn sending(kind: MessageKind) -> Option<Transition<ProofState, ProofRole>> {
        use ProofState::*;
        let transition = match kind {
            MessageKind::Proposal => Transition {
                role: ProofRole::Prover,
                from: &[RequestReceived],
                to: ProposalSent,
                opens_record: true,
                connectionless: false,
            },
            MessageKind::Request => Transition {
                role: ProofRole::Verifier,
                from: &[ProposalReceived],
                to: RequestSent,
                opens_record: true,
                connectionless: true,
            },
            MessageKind::Issue => Transition {
                role: ProofRole::Prover,
                from: &[RequestReceived],
                to: PresentationSent,
                opens_record: false,
                connectionless: false,
            },
            MessageKind::Ack => Transition {
                role: ProofRole::Verifier,
                from: &[PresentationReceived],
                to: Done,
                opens_record: false,
                connectionless: false,
            },
            MessageKind::Offer | MessageKind::ProblemReport => return None,
        };
        Some(transition)
    }

    fn receiving(kind: MessageKind) -> Option<Transition<ProofState, ProofRole>> {
        use ProofState::*;
        let transition = match kind {
            MessageKind::Proposal => Transition {
                role: ProofRole::Verifier,
                from: &[RequestSent],
                to: ProposalReceived,
                opens_record: true,
                connectionless: false,
            },
            MessageKind::Request => Transition {
                role: ProofRole::Prover,
                from: &[ProposalSent],
                to: RequestReceived,
                opens_record: true,
                connectionless: true,
            },
            MessageKind::Issue => Transition {
                role: ProofRole::Verifier,
                from: &[RequestSent],
                to: PresentationReceived,
                opens_record: false,
                connectionless: false,
            },
            MessageKind::Ack => Transition {
                role: ProofRole::Prover,
                from: &[PresentationSent],
                to: Done,
                opens_record: false,
                connectionless: false,
            },
            MessageKind::Offer | MessageKind::ProblemReport => return None,
        };
        Some(transition)
    }

    fn response_to(kind: MessageKind) -> Option<MessageKind> {
        match kind {
            MessageKind::Proposal => Some(MessageKind::Request),
            MessageKind::Request => Some(MessageKind::Issue),
            MessageKind::Issue => Some(MessageKind::Ack),
            _ => None,
        }
    }

    fn counter_to(kind: MessageKind) -> Option<MessageKind> {
        match kind {
            MessageKind::Proposal => Some(MessageKind::Request),
            MessageKind::Request => Some(MessageKind::Proposal),
            _ => None,
        }
    }

    fn counterpart_of(kind: MessageKind) -> Option<MessageKind> {
        match kind {
            MessageKind::Proposal => Some(MessageKind::Request),
            MessageKind::Request => Some(MessageKind::Proposal),
            MessageKind::Issue => Some(MessageKind::Request),
            _ => None,
        }
    }

    fn state_changed(event: StateChangedEvent<Self>) -> AgentEvent {
        AgentEvent::ProofStateChanged(event)
    }
}

pub type ProofEngine = ExchangeEngine<ProofProtocol>;

impl ExchangeEngine<ProofProtocol> {
    pub async fn process_presentation(
        &self,
        ctx: &AgentContext,
        inbound: InboundMessage,
    ) -> Result<ExchangeOutcome<ProofProtocol>> {
        self.process_issue(ctx, inbound).await
    }

    pub async fn accept_presentation(
        &self,
        ctx: &AgentContext,
        record_id: &str,
    ) -> Result<ExchangeOutcome<ProofProtocol>> {
        self.accept_issue(ctx, record_id).await
    }

    /// Answer a presentation request with a counter-proposal.
    pub async fn negotiate_request(
        &self,
        ctx: &AgentContext,
        record_id: &str,
        options: NegotiateOptions,
    ) -> Result<ExchangeOutcome<ProofProtocol>> {
        self.negotiate(ctx, record_id, MessageKind::Request, options).await
    }

    pub async fn should_auto_respond_to_presentation(&self, record: &ExchangeRecord<ProofProtocol>) -> bool {
        self.should_auto_respond_to_issue(record).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_offer_step() {
        assert!(ProofProtocol::message_type("v2", MessageKind::Offer).is_none());
        assert!(ProofProtocol::sending(MessageKind::Offer).is_none());
        assert_eq!(
            ProofProtocol::parse_message_type("https://didcomm.org/present-proof/2.0/presentation"),
            Some(("v2".to_string(), MessageKind::Issue))
        );
    }

    #[test]
    fn test_response_chain_ends_in_done() {
        let mut kind = MessageKind::Proposal;
        let mut steps = vec![kind];
        while let Some(next) = ProofProtocol::response_to(kind) {
            steps.push(next);
            kind = next;
        }
        assert_eq!(
            steps,
            vec![MessageKind::Proposal, MessageKind::Request, MessageKind::Issue, MessageKind::Ack]
        );
        assert_eq!(ProofProtocol::receiving(MessageKind::Ack).unwrap().to, ProofState::Done);
    }
}

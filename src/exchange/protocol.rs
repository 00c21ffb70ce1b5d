//! Protocol description the generic exchange engine is instantiated with.
//!
//! A protocol supplies its state and role enums plus a transition table keyed
//! by message step. The engine never names a concrete state.

use std::fmt::{Debug, Display};
use std::hash::Hash;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::core::events::AgentEvent;

use super::message::{message_type_uri, MessageKind, MessageTypeUri};
use super::record::StateChangedEvent;

/// Bounds shared by protocol state and role enums.
pub trait ProtocolEnum:
    Copy + Eq + Hash + Debug + Display + Serialize + DeserializeOwned + Send + Sync + 'static
{
}

impl<T> ProtocolEnum for T where
    T: Copy + Eq + Hash + Debug + Display + Serialize + DeserializeOwned + Send + Sync + 'static
{
}

/// Effect of sending or receiving one step on the local record.
#[derive(Debug, Clone, Copy)]
pub struct Transition<S: 'static, R> {
    /// Role of the local record taking this transition.
    pub role: R,
    /// States the record must be in when the record already exists.
    pub from: &'static [S],
    /// State after the transition.
    pub to: S,
    /// Whether the step may open a new record.
    pub opens_record: bool,
    /// Whether a new record may be opened without a connection.
    pub connectionless: bool,
}

pub trait ExchangeProtocol: Clone + Debug + Send + Sync + 'static {
    type State: ProtocolEnum;
    type Role: ProtocolEnum;

    /// Protocol name as it appears in message type URIs.
    const NAME: &'static str;

    fn roles() -> &'static [Self::Role];

    fn done() -> Self::State;

    fn abandoned() -> Self::State;

    /// Wire name of a step, `None` when the protocol has no such step.
    fn message_name(kind: MessageKind) -> Option<&'static str>;

    /// Transition of the sender's record when it sends `kind`.
    fn sending(kind: MessageKind) -> Option<Transition<Self::State, Self::Role>>;

    /// Transition of the receiver's record when it processes `kind`.
    fn receiving(kind: MessageKind) -> Option<Transition<Self::State, Self::Role>>;

    /// Step produced when accepting a received `kind`.
    fn response_to(kind: MessageKind) -> Option<MessageKind>;

    /// Step produced when countering a received `kind` with new content.
    fn counter_to(kind: MessageKind) -> Option<MessageKind>;

    /// Step this side previously sent that a received `kind` answers.
    fn counterpart_of(kind: MessageKind) -> Option<MessageKind>;

    fn state_changed(event: StateChangedEvent<Self>) -> AgentEvent;

    fn is_terminal(state: Self::State) -> bool {
        state == Self::done() || state == Self::abandoned()
    }

    fn message_type(version: &str, kind: MessageKind) -> Option<String> {
        Self::message_name(kind).map(|name| message_type_uri(Self::NAME, version, name))
    }

    /// Resolve a message type URI to a step of this protocol.
    fn parse_message_type(message_type: &str) -> Option<(String, MessageKind)> {
        let uri = MessageTypeUri::parse(message_type)?;
        if uri.protocol != Self::NAME {
            return None;
        }
        const KINDS: [MessageKind; 6] = [
            MessageKind::Proposal,
            MessageKind::Offer,
            MessageKind::Request,
            MessageKind::Issue,
            MessageKind::Ack,
            MessageKind::ProblemReport,
        ];
        KINDS
            .into_iter()
            .find(|kind| Self::message_name(*kind) == Some(uri.name.as_str()))
            .map(|kind| (uri.version, kind))
    }
}

//! Credential and proof negotiation.
//!
//! One generic engine drives both protocols; each protocol contributes its
//! states, roles and transition table, and format services contribute the
//! attachment payloads.

pub mod credential;
pub mod engine;
pub mod format;
pub mod handler;
pub mod message;
pub mod proof;
pub mod protocol;
pub mod record;
pub mod repository;

#[cfg(test)]
pub(crate) mod testing;

pub use credential::{CredentialEngine, CredentialProtocol, CredentialRecord, CredentialRole, CredentialState};
pub use engine::{
    AcceptOptions, CreateOptions, ExchangeEngine, ExchangeOutcome, FormatData, FormatPayloads,
    InboundMessage, NegotiateOptions,
};
pub use format::{FormatCoordinator, FormatRegistry, FormatService, SharedFormatService};
pub use handler::{ExchangeHandler, HandlerOutcome};
pub use message::{Attachment, AttachmentData, MessageKind, Preview, PreviewAttribute, ProblemReport, ProtocolMessage};
pub use proof::{ProofEngine, ProofProtocol, ProofRecord, ProofRole, ProofState};
pub use protocol::ExchangeProtocol;
pub use record::{AutoAcceptPolicy, ExchangeRecord, StateChangedEvent};
pub use repository::{ExchangeRecordStore, InMemoryMessageRepository, InMemoryRecordStore, MessageRepository};

//! Generic exchange engine driving one negotiation protocol.
//!
//! Every call either completes and persists or fails leaving the stored
//! record and its messages untouched: work happens on a copy that is only
//! written back once the formats and the outbound message succeeded, and a
//! message is kept only when the record write that goes with it committed.
//! Mutation of a given record is serialized through a keyed lock on
//! (protocol, role, thread).

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;

use crate::core::context::AgentContext;
use crate::core::events::AgentEvent;
use crate::core::lock::{KeyGuard, KeyedLocks};
use crate::error::{Error, Result};

use super::format::{AutoRespondCheck, FormatCoordinator, FormatRegistry, FormatSelection};
use super::message::{
    previews_match, AttachmentData, MessageKind, MessageRole, Preview, ProblemReport,
    ProtocolMessage,
};
use super::protocol::{ExchangeProtocol, Transition};
use super::record::{AutoAcceptPolicy, ExchangeRecord, StateChangedEvent};
use super::repository::{ExchangeRecordStore, MessageRepository};

/// Per-format options keyed by format key.
pub type FormatPayloads = BTreeMap<String, Value>;

/// Options for opening a new exchange.
#[derive(Debug, Clone, Default)]
pub struct CreateOptions {
    /// `None` opens a connection-less exchange where the step allows it.
    pub connection_id: Option<String>,
    pub formats: FormatPayloads,
    pub comment: Option<String>,
    pub preview: Option<Preview>,
    pub auto_accept: Option<AutoAcceptPolicy>,
    pub parent_thread_id: Option<String>,
}

/// Options for accepting a received step.
#[derive(Debug, Clone, Default)]
pub struct AcceptOptions {
    /// `None` (or empty) reuses the formats this side last sent.
    pub formats: Option<FormatPayloads>,
    pub comment: Option<String>,
    /// `None` carries the received preview forward.
    pub preview: Option<Preview>,
    pub auto_accept: Option<AutoAcceptPolicy>,
}

/// Options for countering a received step with new content.
#[derive(Debug, Clone, Default)]
pub struct NegotiateOptions {
    pub formats: FormatPayloads,
    pub comment: Option<String>,
    pub preview: Option<Preview>,
    pub auto_accept: Option<AutoAcceptPolicy>,
}

/// A message handed over by the transport.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub message: ProtocolMessage,
    /// Connection the message arrived on, if any.
    pub connection_id: Option<String>,
}

impl InboundMessage {
    pub fn new(message: ProtocolMessage, connection_id: Option<String>) -> Self {
        Self {
            message,
            connection_id,
        }
    }
}

/// Result of an engine call: the persisted record, the message to send (if
/// any) and the state-changed event the caller must forward.
#[derive(Debug, Clone)]
pub struct ExchangeOutcome<P: ExchangeProtocol> {
    pub record: ExchangeRecord<P>,
    pub message: Option<ProtocolMessage>,
    pub event: StateChangedEvent<P>,
}

impl<P: ExchangeProtocol> ExchangeOutcome<P> {
    fn new(record: ExchangeRecord<P>, previous_state: Option<P::State>, message: Option<ProtocolMessage>) -> Self {
        let event = StateChangedEvent {
            record: record.clone(),
            previous_state,
        };
        Self {
            record,
            message,
            event,
        }
    }

    pub fn agent_event(&self) -> AgentEvent {
        P::state_changed(self.event.clone())
    }
}

/// Format payloads of a record, per step and wire format.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FormatData {
    pub steps: BTreeMap<MessageKind, BTreeMap<String, AttachmentData>>,
}

pub struct ExchangeEngine<P: ExchangeProtocol> {
    version: String,
    coordinator: FormatCoordinator<P>,
    records: Arc<dyn ExchangeRecordStore<P>>,
    messages: Arc<dyn MessageRepository>,
    locks: KeyedLocks,
    default_policy: AutoAcceptPolicy,
}

impl<P: ExchangeProtocol> ExchangeEngine<P> {
    pub fn new(
        version: impl Into<String>,
        registry: Arc<FormatRegistry<P>>,
        records: Arc<dyn ExchangeRecordStore<P>>,
        messages: Arc<dyn MessageRepository>,
    ) -> Self {
        Self {
            version: version.into(),
            coordinator: FormatCoordinator::new(registry),
            records,
            messages,
            locks: KeyedLocks::new(),
            default_policy: AutoAcceptPolicy::default(),
        }
    }

    /// Module-wide auto-accept default used when a record has no override.
    pub fn with_default_policy(mut self, policy: AutoAcceptPolicy) -> Self {
        self.default_policy = policy;
        self
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn default_policy(&self) -> AutoAcceptPolicy {
        self.default_policy
    }

    pub fn registry(&self) -> &FormatRegistry<P> {
        self.coordinator.registry()
    }

    // ---------------------------------------------------------------------
    // Create
    // ---------------------------------------------------------------------

    pub async fn create_proposal(&self, ctx: &AgentContext, options: CreateOptions) -> Result<ExchangeOutcome<P>> {
        self.create(ctx, MessageKind::Proposal, options).await
    }

    pub async fn create_offer(&self, ctx: &AgentContext, options: CreateOptions) -> Result<ExchangeOutcome<P>> {
        self.create(ctx, MessageKind::Offer, options).await
    }

    pub async fn create_request(&self, ctx: &AgentContext, options: CreateOptions) -> Result<ExchangeOutcome<P>> {
        self.create(ctx, MessageKind::Request, options).await
    }

    /// Open a new exchange by sending `kind`.
    pub async fn create(
        &self,
        ctx: &AgentContext,
        kind: MessageKind,
        options: CreateOptions,
    ) -> Result<ExchangeOutcome<P>> {
        let transition = P::sending(kind)
            .filter(|t| t.opens_record)
            .ok_or_else(|| Error::InvalidMessage(format!("{} cannot open a {} exchange", kind, P::NAME)))?;

        match options.connection_id.as_deref() {
            Some(connection_id) => {
                ctx.ready_connection(connection_id).await?;
            }
            None if !transition.connectionless => {
                return Err(Error::ConnectionRequired(format!(
                    "{} {} requires a connection",
                    P::NAME,
                    kind
                )));
            }
            None => {}
        }

        let services = self
            .registry()
            .resolve_keys(options.formats.keys().map(String::as_str))?;
        if services.is_empty() {
            return Err(Error::UnsupportedFormat("no format requested".to_string()));
        }
        let selections: Vec<_> = services
            .into_iter()
            .map(|service| {
                let options = options.formats.get(service.format_key());
                FormatSelection { service, options }
            })
            .collect();

        let message = ProtocolMessage::new(self.message_type(kind)?)
            .with_parent_thread(options.parent_thread_id.clone())
            .with_comment(options.comment.clone())
            .with_preview(options.preview.clone());

        let mut record = ExchangeRecord::<P>::new(
            message.thread_id.clone(),
            transition.role,
            transition.to,
            self.version.clone(),
        )
        .with_connection(options.connection_id.clone())
        .with_parent_thread(options.parent_thread_id.clone())
        .with_auto_accept(options.auto_accept);

        let message = self
            .coordinator
            .create(&mut record, kind, &selections, None, message)
            .await?;

        self.commit(None, &record, kind, MessageRole::Sender, &message)
            .await?;

        tracing::debug!(
            "[{}] created {} record {} (thread {}) in {}",
            ctx.label,
            P::NAME,
            record.id,
            record.thread_id,
            record.state
        );
        Ok(ExchangeOutcome::new(record, None, Some(message)))
    }

    // ---------------------------------------------------------------------
    // Process
    // ---------------------------------------------------------------------

    pub async fn process_proposal(&self, ctx: &AgentContext, inbound: InboundMessage) -> Result<ExchangeOutcome<P>> {
        self.process(ctx, MessageKind::Proposal, inbound).await
    }

    pub async fn process_offer(&self, ctx: &AgentContext, inbound: InboundMessage) -> Result<ExchangeOutcome<P>> {
        self.process(ctx, MessageKind::Offer, inbound).await
    }

    pub async fn process_request(&self, ctx: &AgentContext, inbound: InboundMessage) -> Result<ExchangeOutcome<P>> {
        self.process(ctx, MessageKind::Request, inbound).await
    }

    /// Process a credential (issuance) or presentation (proof).
    pub async fn process_issue(&self, ctx: &AgentContext, inbound: InboundMessage) -> Result<ExchangeOutcome<P>> {
        self.process(ctx, MessageKind::Issue, inbound).await
    }

    pub async fn process_ack(&self, ctx: &AgentContext, inbound: InboundMessage) -> Result<ExchangeOutcome<P>> {
        self.process(ctx, MessageKind::Ack, inbound).await
    }

    /// Apply a received `kind` to its record, opening one if the step allows.
    pub async fn process(
        &self,
        ctx: &AgentContext,
        kind: MessageKind,
        inbound: InboundMessage,
    ) -> Result<ExchangeOutcome<P>> {
        let transition = self.receiving(kind)?;
        self.assert_message_type(&inbound.message, kind)?;
        if let Some(connection_id) = inbound.connection_id.as_deref() {
            ctx.ready_connection(connection_id).await?;
        }

        let message = &inbound.message;
        let connection_id = inbound.connection_id.as_deref();
        let _lock = self.lock_thread(transition.role, &message.thread_id).await;

        let existing = self
            .find_for_inbound(transition.role, &message.thread_id, connection_id)
            .await?;

        let snapshot = existing.clone();
        let (mut record, previous_state) = match existing {
            Some(mut record) => {
                record.assert_protocol_version(&self.version)?;
                record.assert_state(transition.from)?;
                if record.is_connectionless() {
                    self.authenticate_connectionless(&record, message).await?;
                    if let Some(connection_id) = connection_id {
                        tracing::debug!(
                            "[{}] binding {} record {} to connection {}",
                            ctx.label,
                            P::NAME,
                            record.id,
                            connection_id
                        );
                        record.connection_id = Some(connection_id.to_string());
                    }
                }
                let previous = record.state;
                (record, Some(previous))
            }
            None => {
                if !transition.opens_record {
                    return Err(Error::NotFound(format!(
                        "{} record for thread {} as {}",
                        P::NAME,
                        message.thread_id,
                        transition.role
                    )));
                }
                if connection_id.is_none() && !transition.connectionless {
                    return Err(Error::ConnectionRequired(format!(
                        "{} {} received without a connection",
                        P::NAME,
                        kind
                    )));
                }
                let record = ExchangeRecord::<P>::new(
                    message.thread_id.clone(),
                    transition.role,
                    transition.to,
                    self.version.clone(),
                )
                .with_connection(inbound.connection_id.clone())
                .with_parent_thread(message.parent_thread_id.clone());
                (record, None)
            }
        };

        self.coordinator.process(&mut record, kind, message).await?;
        record.set_state(transition.to);

        self.commit(snapshot.as_ref(), &record, kind, MessageRole::Receiver, message)
            .await?;

        tracing::debug!(
            "[{}] processed {} {} for record {}: {:?} -> {}",
            ctx.label,
            P::NAME,
            kind,
            record.id,
            previous_state,
            record.state
        );
        Ok(ExchangeOutcome::new(record, previous_state, None))
    }

    // ---------------------------------------------------------------------
    // Accept
    // ---------------------------------------------------------------------

    pub async fn accept_proposal(&self, ctx: &AgentContext, record_id: &str, options: AcceptOptions) -> Result<ExchangeOutcome<P>> {
        self.accept(ctx, record_id, MessageKind::Proposal, options).await
    }

    pub async fn accept_offer(&self, ctx: &AgentContext, record_id: &str, options: AcceptOptions) -> Result<ExchangeOutcome<P>> {
        self.accept(ctx, record_id, MessageKind::Offer, options).await
    }

    pub async fn accept_request(&self, ctx: &AgentContext, record_id: &str, options: AcceptOptions) -> Result<ExchangeOutcome<P>> {
        self.accept(ctx, record_id, MessageKind::Request, options).await
    }

    /// Accept a received credential or presentation by acknowledging it.
    pub async fn accept_issue(&self, ctx: &AgentContext, record_id: &str) -> Result<ExchangeOutcome<P>> {
        self.accept(ctx, record_id, MessageKind::Issue, AcceptOptions::default())
            .await
    }

    /// Answer the received `received_kind` with the protocol's next step.
    pub async fn accept(
        &self,
        ctx: &AgentContext,
        record_id: &str,
        received_kind: MessageKind,
        options: AcceptOptions,
    ) -> Result<ExchangeOutcome<P>> {
        let response_kind = P::response_to(received_kind).ok_or_else(|| {
            Error::InvalidMessage(format!("{} {} cannot be accepted", P::NAME, received_kind))
        })?;
        let received_transition = self.receiving(received_kind)?;
        let send = self.sending(response_kind)?;

        let (mut record, _lock) = self.lock_record(record_id).await?;
        let snapshot = record.clone();
        record.assert_protocol_version(&self.version)?;
        record.assert_state(&[received_transition.to])?;
        if let Some(connection_id) = record.connection_id.as_deref() {
            ctx.ready_connection(connection_id).await?;
        }

        let received = self
            .messages
            .get_message(&record.id, received_kind, MessageRole::Receiver)
            .await?;

        let mut message = ProtocolMessage::new(self.message_type(response_kind)?)
            .with_thread(record.thread_id.clone())
            .with_parent_thread(record.parent_thread_id.clone())
            .with_reply_to(received.id.clone())
            .with_comment(options.comment.clone());

        if response_kind != MessageKind::Ack {
            message = message.with_preview(options.preview.clone().or_else(|| received.preview.clone()));

            let payloads = options.formats.clone().unwrap_or_default();
            let selections = if payloads.is_empty() {
                self.pinned_selections(&record, received_kind, &received).await?
            } else {
                self.registry()
                    .resolve_keys(payloads.keys().map(String::as_str))?
                    .into_iter()
                    .map(|service| {
                        let options = payloads.get(service.format_key());
                        FormatSelection { service, options }
                    })
                    .collect()
            };
            if selections.is_empty() {
                return Err(Error::NoSupportedFormats);
            }

            message = self
                .coordinator
                .create(&mut record, response_kind, &selections, Some(&received), message)
                .await?;
        }

        if options.auto_accept.is_some() {
            record.auto_accept = options.auto_accept;
        }
        let previous = record.set_state(send.to);

        self.commit(Some(&snapshot), &record, response_kind, MessageRole::Sender, &message)
            .await?;

        tracing::debug!(
            "[{}] accepted {} {} on record {} with {}: {} -> {}",
            ctx.label,
            P::NAME,
            received_kind,
            record.id,
            response_kind,
            previous,
            record.state
        );
        Ok(ExchangeOutcome::new(record, Some(previous), Some(message)))
    }

    /// Formats to answer with when the caller names none: those of the
    /// message this side sent last for the counterpart step, falling back to
    /// the received message only when this side never sent one.
    async fn pinned_selections<'a>(
        &self,
        record: &ExchangeRecord<P>,
        received_kind: MessageKind,
        received: &ProtocolMessage,
    ) -> Result<Vec<FormatSelection<'a, P>>> {
        let sent = match P::counterpart_of(received_kind) {
            Some(kind) => {
                self.messages
                    .find_message(&record.id, kind, MessageRole::Sender)
                    .await?
            }
            None => None,
        };
        let formats = match &sent {
            Some(sent) => &sent.formats,
            None => &received.formats,
        };
        Ok(self
            .registry()
            .for_formats(formats)
            .into_iter()
            .map(|service| FormatSelection { service, options: None })
            .collect())
    }

    // ---------------------------------------------------------------------
    // Negotiate
    // ---------------------------------------------------------------------

    pub async fn negotiate_proposal(&self, ctx: &AgentContext, record_id: &str, options: NegotiateOptions) -> Result<ExchangeOutcome<P>> {
        self.negotiate(ctx, record_id, MessageKind::Proposal, options).await
    }

    /// Counter a received `received_kind` with a message of new content.
    pub async fn negotiate(
        &self,
        ctx: &AgentContext,
        record_id: &str,
        received_kind: MessageKind,
        options: NegotiateOptions,
    ) -> Result<ExchangeOutcome<P>> {
        let counter_kind = P::counter_to(received_kind).ok_or_else(|| {
            Error::NegotiationNotSupported(format!("{} {} cannot be countered", P::NAME, received_kind))
        })?;
        let received_transition = self.receiving(received_kind)?;
        let send = self.sending(counter_kind)?;

        let (mut record, _lock) = self.lock_record(record_id).await?;
        let snapshot = record.clone();
        let connection_id = record.connection_id.clone().ok_or_else(|| {
            Error::NegotiationNotSupported(format!(
                "{} record {} has no connection",
                P::NAME,
                record.id
            ))
        })?;
        record.assert_protocol_version(&self.version)?;
        record.assert_state(&[received_transition.to])?;
        ctx.ready_connection(&connection_id).await?;

        let selections: Vec<_> = self
            .registry()
            .resolve_keys(options.formats.keys().map(String::as_str))?
            .into_iter()
            .map(|service| {
                let payload = options.formats.get(service.format_key());
                FormatSelection { service, options: payload }
            })
            .collect();
        if selections.is_empty() {
            return Err(Error::NoSupportedFormats);
        }

        let received = self
            .messages
            .get_message(&record.id, received_kind, MessageRole::Receiver)
            .await?;

        let message = ProtocolMessage::new(self.message_type(counter_kind)?)
            .with_thread(record.thread_id.clone())
            .with_parent_thread(record.parent_thread_id.clone())
            .with_reply_to(received.id.clone())
            .with_comment(options.comment.clone())
            .with_preview(options.preview.clone());
        let message = self
            .coordinator
            .create(&mut record, counter_kind, &selections, Some(&received), message)
            .await?;

        if options.auto_accept.is_some() {
            record.auto_accept = options.auto_accept;
        }
        let previous = record.set_state(send.to);

        self.commit(Some(&snapshot), &record, counter_kind, MessageRole::Sender, &message)
            .await?;

        tracing::debug!(
            "[{}] countered {} {} on record {} with {}: {} -> {}",
            ctx.label,
            P::NAME,
            received_kind,
            record.id,
            counter_kind,
            previous,
            record.state
        );
        Ok(ExchangeOutcome::new(record, Some(previous), Some(message)))
    }

    // ---------------------------------------------------------------------
    // Auto-accept
    // ---------------------------------------------------------------------

    pub async fn should_auto_respond_to_proposal(&self, record: &ExchangeRecord<P>) -> bool {
        self.should_auto_respond(record, MessageKind::Proposal).await
    }

    pub async fn should_auto_respond_to_offer(&self, record: &ExchangeRecord<P>) -> bool {
        self.should_auto_respond(record, MessageKind::Offer).await
    }

    pub async fn should_auto_respond_to_request(&self, record: &ExchangeRecord<P>) -> bool {
        self.should_auto_respond(record, MessageKind::Request).await
    }

    pub async fn should_auto_respond_to_issue(&self, record: &ExchangeRecord<P>) -> bool {
        self.should_auto_respond(record, MessageKind::Issue).await
    }

    /// Whether the received `kind` may be answered without asking anyone.
    /// Never mutates; any failure counts as "no".
    pub async fn should_auto_respond(&self, record: &ExchangeRecord<P>, kind: MessageKind) -> bool {
        match self.auto_respond_decision(record, kind).await {
            Ok(decision) => decision,
            Err(e) => {
                tracing::debug!(
                    "Not auto-responding to {} {} on record {}: {}",
                    P::NAME,
                    kind,
                    record.id,
                    e
                );
                false
            }
        }
    }

    async fn auto_respond_decision(&self, record: &ExchangeRecord<P>, kind: MessageKind) -> Result<bool> {
        match record.effective_policy(self.default_policy) {
            AutoAcceptPolicy::Always => return Ok(true),
            AutoAcceptPolicy::Never => return Ok(false),
            AutoAcceptPolicy::ContentApproved => {}
        }

        let Some(counterpart) = P::counterpart_of(kind) else {
            return Ok(false);
        };
        let Some(sent) = self
            .messages
            .find_message(&record.id, counterpart, MessageRole::Sender)
            .await?
        else {
            tracing::debug!(
                "No {} sent on record {}, {} needs manual approval",
                counterpart,
                record.id,
                kind
            );
            return Ok(false);
        };
        let received = self
            .messages
            .get_message(&record.id, kind, MessageRole::Receiver)
            .await?;

        // Only the formats this side sent are checked; extra inbound formats
        // cannot force an equality nobody asked for.
        for service in self.registry().for_formats(&sent.formats) {
            let ours = self.coordinator.attachment_for(&service, &sent);
            let theirs = self.coordinator.attachment_for(&service, &received);
            let (Some(ours), Some(theirs)) = (ours, theirs) else {
                tracing::debug!("Format {} missing on record {}", service.format_key(), record.id);
                return Ok(false);
            };
            let check = AutoRespondCheck {
                kind,
                sent: ours,
                received: theirs,
            };
            if !service.should_auto_respond(record, check).await {
                tracing::debug!("Format {} disagrees on record {}", service.format_key(), record.id);
                return Ok(false);
            }
        }

        Ok(previews_match(sent.preview.as_ref(), received.preview.as_ref()))
    }

    // ---------------------------------------------------------------------
    // Problem reports
    // ---------------------------------------------------------------------

    /// Build an abandonment message on the record's thread. Does not change state.
    pub async fn create_problem_report(
        &self,
        record: &ExchangeRecord<P>,
        report: ProblemReport,
    ) -> Result<ProtocolMessage> {
        let mut message = ProtocolMessage::new(self.message_type(MessageKind::ProblemReport)?)
            .with_thread(record.thread_id.clone())
            .with_parent_thread(record.parent_thread_id.clone())
            .with_body(serde_json::to_value(&report)?);
        if let Some(last) = self
            .messages
            .find_latest(&record.id, MessageRole::Receiver)
            .await?
        {
            message = message.with_reply_to(last.message.id);
        }
        Ok(message)
    }

    /// Move a record to the abandoned state after sending a problem report.
    pub async fn abandon(&self, record_id: &str, reason: impl Into<String>) -> Result<ExchangeOutcome<P>> {
        let (mut record, _lock) = self.lock_record(record_id).await?;
        self.assert_not_terminal(&record)?;

        record.error_message = Some(reason.into());
        let previous = record.set_state(P::abandoned());
        self.records.update(&record).await?;

        tracing::debug!("Abandoned {} record {} from {}", P::NAME, record.id, previous);
        Ok(ExchangeOutcome::new(record, Some(previous), None))
    }

    /// Abandon the record a received problem report refers to.
    pub async fn process_problem_report(
        &self,
        ctx: &AgentContext,
        inbound: InboundMessage,
    ) -> Result<ExchangeOutcome<P>> {
        self.assert_message_type(&inbound.message, MessageKind::ProblemReport)?;
        let message = &inbound.message;
        let report = ProblemReport::from_message(message)
            .ok_or_else(|| Error::InvalidMessage(format!("problem report {} has no description", message.id)))?;

        for role in P::roles() {
            let _lock = self.lock_thread(*role, &message.thread_id).await;
            let Some(mut record) = self
                .find_for_inbound(*role, &message.thread_id, inbound.connection_id.as_deref())
                .await?
            else {
                continue;
            };

            self.assert_not_terminal(&record)?;
            if record.is_connectionless() {
                self.authenticate_connectionless(&record, message).await?;
            }

            let snapshot = record.clone();
            record.error_message = Some(format!("{}: {}", report.code, report.description));
            let previous = record.set_state(P::abandoned());
            self.commit(Some(&snapshot), &record, MessageKind::ProblemReport, MessageRole::Receiver, message)
                .await?;

            tracing::info!(
                "[{}] {} record {} abandoned by peer: {}",
                ctx.label,
                P::NAME,
                record.id,
                report.description
            );
            return Ok(ExchangeOutcome::new(record, Some(previous), None));
        }

        Err(Error::NotFound(format!(
            "{} record for thread {}",
            P::NAME,
            message.thread_id
        )))
    }

    // ---------------------------------------------------------------------
    // Queries
    // ---------------------------------------------------------------------

    pub async fn get_by_id(&self, record_id: &str) -> Result<ExchangeRecord<P>> {
        self.records.get_by_id(record_id).await
    }

    pub async fn find_by_id(&self, record_id: &str) -> Result<Option<ExchangeRecord<P>>> {
        self.records.find_by_id(record_id).await
    }

    pub async fn get_all(&self) -> Result<Vec<ExchangeRecord<P>>> {
        self.records.get_all().await
    }

    pub async fn find_by_thread(
        &self,
        thread_id: &str,
        role: P::Role,
        connection_id: Option<&str>,
    ) -> Result<Option<ExchangeRecord<P>>> {
        self.records
            .find_by_properties(thread_id, role, connection_id)
            .await
    }

    /// Latest stored message of `kind` for a record, whichever side sent it.
    pub async fn find_message(&self, record_id: &str, kind: MessageKind) -> Result<Option<ProtocolMessage>> {
        let record = self.records.get_by_id(record_id).await?;
        let role = self.stored_role(&record, kind);
        self.messages.find_message(record_id, kind, role).await
    }

    /// Reassemble the format payloads of every step the record went through.
    pub async fn get_format_data(&self, record_id: &str) -> Result<FormatData> {
        let record = self.records.get_by_id(record_id).await?;
        let mut data = FormatData::default();

        for (kind, refs) in &record.format_refs {
            let role = self.stored_role(&record, *kind);
            let Some(message) = self.messages.find_message(&record.id, *kind, role).await? else {
                continue;
            };
            let step = data.steps.entry(*kind).or_default();
            for format in refs {
                if let Some(attachment) = message.attachment(&format.attachment_id) {
                    step.insert(format.format.clone(), attachment.data.clone());
                }
            }
        }

        Ok(data)
    }

    // ---------------------------------------------------------------------
    // Helpers
    // ---------------------------------------------------------------------

    fn sending(&self, kind: MessageKind) -> Result<Transition<P::State, P::Role>> {
        P::sending(kind).ok_or_else(|| Error::InvalidMessage(format!("{} has no {} step", P::NAME, kind)))
    }

    fn receiving(&self, kind: MessageKind) -> Result<Transition<P::State, P::Role>> {
        P::receiving(kind).ok_or_else(|| Error::InvalidMessage(format!("{} has no {} step", P::NAME, kind)))
    }

    fn message_type(&self, kind: MessageKind) -> Result<String> {
        P::message_type(&self.version, kind)
            .ok_or_else(|| Error::InvalidMessage(format!("{} has no {} message", P::NAME, kind)))
    }

    fn assert_message_type(&self, message: &ProtocolMessage, kind: MessageKind) -> Result<()> {
        let (version, parsed) = P::parse_message_type(&message.message_type).ok_or_else(|| {
            Error::InvalidMessage(format!("{} is not a {} message", message.message_type, P::NAME))
        })?;
        if version != self.version {
            return Err(Error::ProtocolVersionMismatch {
                expected: self.version.clone(),
                actual: version,
            });
        }
        if parsed != kind {
            return Err(Error::InvalidMessage(format!(
                "expected {} message, got {}",
                kind, message.message_type
            )));
        }
        Ok(())
    }

    fn assert_not_terminal(&self, record: &ExchangeRecord<P>) -> Result<()> {
        if P::is_terminal(record.state) {
            let open = ["any non-terminal state".to_string()];
            return Err(Error::invalid_state(&record.id, &open[..], record.state.to_string()));
        }
        Ok(())
    }

    /// Role under which a record's message of `kind` was stored.
    fn stored_role(&self, record: &ExchangeRecord<P>, kind: MessageKind) -> MessageRole {
        match P::sending(kind) {
            Some(t) if t.role == record.role => MessageRole::Sender,
            _ => MessageRole::Receiver,
        }
    }

    /// Write `record`, then the message that moved it. When the message
    /// cannot be stored the record goes back to `snapshot` (or is removed if
    /// it was new), so no stored message outlives a failed transition.
    async fn commit(
        &self,
        snapshot: Option<&ExchangeRecord<P>>,
        record: &ExchangeRecord<P>,
        kind: MessageKind,
        role: MessageRole,
        message: &ProtocolMessage,
    ) -> Result<()> {
        match snapshot {
            Some(_) => self.records.update(record).await?,
            None => self.records.save(record).await?,
        }

        let Err(err) = self.messages.save_message(&record.id, kind, role, message).await else {
            return Ok(());
        };
        let restored = match snapshot {
            Some(previous) => self.records.update(previous).await,
            None => self.records.delete(&record.id).await,
        };
        if let Err(restore_err) = restored {
            tracing::error!(
                "Failed to roll back {} record {} after message write error: {}",
                P::NAME,
                record.id,
                restore_err
            );
        }
        Err(err)
    }

    fn lock_key(&self, role: P::Role, thread_id: &str) -> String {
        format!("{}:{}:{}", P::NAME, role, thread_id)
    }

    async fn lock_thread(&self, role: P::Role, thread_id: &str) -> KeyGuard {
        self.locks.acquire(self.lock_key(role, thread_id)).await
    }

    /// Lock a record and re-read it under the lock.
    async fn lock_record(&self, record_id: &str) -> Result<(ExchangeRecord<P>, KeyGuard)> {
        let record = self.records.get_by_id(record_id).await?;
        let guard = self.lock_thread(record.role, &record.thread_id).await;
        let record = self.records.get_by_id(record_id).await?;
        Ok((record, guard))
    }

    /// Record on this connection, else a connection-less record on the thread.
    async fn find_for_inbound(
        &self,
        role: P::Role,
        thread_id: &str,
        connection_id: Option<&str>,
    ) -> Result<Option<ExchangeRecord<P>>> {
        if let Some(connection_id) = connection_id {
            if let Some(record) = self
                .records
                .find_by_properties(thread_id, role, Some(connection_id))
                .await?
            {
                return Ok(Some(record));
            }
        }
        self.records.find_by_properties(thread_id, role, None).await
    }

    /// A reply to a connection-less exchange must answer the last message
    /// this side sent on it.
    async fn authenticate_connectionless(
        &self,
        record: &ExchangeRecord<P>,
        message: &ProtocolMessage,
    ) -> Result<()> {
        let last_sent = self
            .messages
            .find_latest(&record.id, MessageRole::Sender)
            .await?
            .ok_or_else(|| {
                Error::InvalidMessage(format!("no message was sent on connection-less record {}", record.id))
            })?;

        let answers_last = message.thread_id == last_sent.message.thread_id
            && message.reply_to.as_deref() == Some(last_sent.message.id.as_str());
        if !answers_last {
            return Err(Error::InvalidMessage(format!(
                "message {} does not answer {} {} on thread {}",
                message.id, last_sent.kind, last_sent.message.id, record.thread_id
            )));
        }
        Ok(())
    }
}

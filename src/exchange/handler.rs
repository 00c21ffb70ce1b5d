//! Inbound dispatch for one exchange protocol.
//!
//! Routes a message to the engine by its type URI, then answers on the
//! agent's behalf when the record's auto-accept policy allows it.

use std::sync::Arc;

use crate::core::context::AgentContext;
use crate::core::events::AgentEvent;
use crate::error::{Error, Result};

use super::engine::{AcceptOptions, ExchangeEngine, InboundMessage};
use super::message::{MessageKind, ProtocolMessage};
use super::protocol::ExchangeProtocol;
use super::record::ExchangeRecord;

/// What handling one inbound message produced.
#[derive(Debug, Clone)]
pub struct HandlerOutcome<P: ExchangeProtocol> {
    pub record: ExchangeRecord<P>,
    /// Reply to send back, when the step was answered automatically.
    pub response: Option<ProtocolMessage>,
    /// State changes in the order they happened.
    pub events: Vec<AgentEvent>,
}

pub struct ExchangeHandler<P: ExchangeProtocol> {
    engine: Arc<ExchangeEngine<P>>,
}

impl<P: ExchangeProtocol> Clone for ExchangeHandler<P> {
    fn clone(&self) -> Self {
        Self {
            engine: self.engine.clone(),
        }
    }
}

impl<P: ExchangeProtocol> ExchangeHandler<P> {
    pub fn new(engine: Arc<ExchangeEngine<P>>) -> Self {
        Self { engine }
    }

    pub fn engine(&self) -> &ExchangeEngine<P> {
        &self.engine
    }

    /// Whether `message_type` belongs to this handler's protocol.
    pub fn handles(&self, message_type: &str) -> bool {
        P::parse_message_type(message_type).is_some()
    }

    pub async fn handle(&self, ctx: &AgentContext, inbound: InboundMessage) -> Result<HandlerOutcome<P>> {
        let message_type = inbound.message.message_type.clone();
        let (version, kind) = P::parse_message_type(&message_type)
            .ok_or_else(|| Error::InvalidMessage(format!("{} is not a {} message", message_type, P::NAME)))?;
        if version != self.engine.version() {
            return Err(Error::ProtocolVersionMismatch {
                expected: self.engine.version().to_string(),
                actual: version,
            });
        }

        tracing::debug!(
            "[{}] handling {} {} on thread {}",
            ctx.label,
            P::NAME,
            kind,
            inbound.message.thread_id
        );

        if kind == MessageKind::ProblemReport {
            let outcome = self.engine.process_problem_report(ctx, inbound).await?;
            let events = vec![outcome.agent_event()];
            return Ok(HandlerOutcome {
                record: outcome.record,
                response: None,
                events,
            });
        }

        let processed = self.engine.process(ctx, kind, inbound).await?;
        let mut events = vec![processed.agent_event()];

        let answerable = kind != MessageKind::Ack && P::response_to(kind).is_some();
        if !answerable || !self.engine.should_auto_respond(&processed.record, kind).await {
            return Ok(HandlerOutcome {
                record: processed.record,
                response: None,
                events,
            });
        }

        tracing::info!(
            "[{}] auto-accepting {} {} on record {}",
            ctx.label,
            P::NAME,
            kind,
            processed.record.id
        );
        let accepted = self
            .engine
            .accept(ctx, &processed.record.id, kind, AcceptOptions::default())
            .await?;
        events.push(accepted.agent_event());

        Ok(HandlerOutcome {
            record: accepted.record,
            response: accepted.message,
            events,
        })
    }
}

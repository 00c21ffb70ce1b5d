//! Store-and-forward pickup between a message holder and a recipient.
//!
//! The holder answers status, delivery and acknowledgement messages from its
//! queue; the recipient drives batch pickup and toggles live delivery. Queue
//! access is serialized per connection.

use std::sync::Arc;

use crate::config::{DeliveryMode, PickupSettings};
use crate::core::context::AgentContext;
use crate::core::events::{AgentEvent, PickupCompleted};
use crate::core::lock::KeyedLocks;
use crate::error::{Error, Result};
use crate::exchange::message::Attachment;

use super::message::{PickupBody, PickupMessage};
use super::queue::{QueueRepository, SharedQueue, TakeFromQueue};
use super::session::{LiveSession, SessionRegistry, SessionRole};

/// Reply to send (if any), events to forward and messages unpacked from a
/// delivery.
#[derive(Debug, Clone, Default)]
pub struct PickupOutcome {
    pub reply: Option<PickupMessage>,
    pub events: Vec<AgentEvent>,
    pub delivered: Vec<Attachment>,
}

impl PickupOutcome {
    fn reply(message: PickupMessage) -> Self {
        Self {
            reply: Some(message),
            ..Default::default()
        }
    }
}

/// Messages unpacked from a delivery and the acknowledgement to send back.
#[derive(Debug, Clone)]
pub struct DeliveryOutcome {
    pub messages: Vec<Attachment>,
    pub reply: PickupMessage,
}

pub struct PickupEngine {
    queue: SharedQueue,
    sessions: Arc<SessionRegistry>,
    locks: KeyedLocks,
    settings: PickupSettings,
}

impl PickupEngine {
    pub fn new(queue: SharedQueue, sessions: Arc<SessionRegistry>, settings: PickupSettings) -> Self {
        Self {
            queue,
            sessions,
            locks: KeyedLocks::new(),
            settings,
        }
    }

    pub fn settings(&self) -> &PickupSettings {
        &self.settings
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    /// Dispatch an inbound pickup message by its body.
    pub async fn handle(
        &self,
        ctx: &AgentContext,
        connection_id: &str,
        transport_session_id: Option<&str>,
        message: &PickupMessage,
    ) -> Result<PickupOutcome> {
        tracing::debug!(
            "[{}] pickup {} on connection {}",
            ctx.label,
            message.body.name(),
            connection_id
        );
        match &message.body {
            PickupBody::StatusRequest { .. } => Ok(PickupOutcome::reply(
                self.process_status_request(ctx, connection_id, message).await?,
            )),
            PickupBody::DeliveryRequest { .. } => Ok(PickupOutcome::reply(
                self.process_delivery_request(ctx, connection_id, message).await?,
            )),
            PickupBody::MessagesReceived { .. } => Ok(PickupOutcome::reply(
                self.process_messages_received(ctx, connection_id, message).await?,
            )),
            PickupBody::LiveDeliveryChange { .. } => {
                self.process_live_delivery_change(ctx, connection_id, transport_session_id, message)
                    .await
            }
            PickupBody::Status { .. } => self.process_status(ctx, connection_id, message).await,
            PickupBody::Delivery { .. } => {
                let delivered = self.process_delivery(ctx, connection_id, message).await?;
                Ok(PickupOutcome {
                    reply: Some(delivered.reply),
                    delivered: delivered.messages,
                    ..Default::default()
                })
            }
        }
    }

    // ---------------------------------------------------------------------
    // Message holder
    // ---------------------------------------------------------------------

    pub async fn process_status_request(
        &self,
        ctx: &AgentContext,
        connection_id: &str,
        message: &PickupMessage,
    ) -> Result<PickupMessage> {
        let PickupBody::StatusRequest { recipient_key } = &message.body else {
            return Err(unexpected("status-request", message));
        };
        ctx.ready_connection(connection_id).await?;

        let _lock = self.locks.acquire(connection_id).await;
        let count = self
            .queue
            .get_available_message_count(connection_id, recipient_key.as_deref())
            .await?;
        Ok(self.status(message, connection_id, count, recipient_key.clone()).await)
    }

    pub async fn process_delivery_request(
        &self,
        ctx: &AgentContext,
        connection_id: &str,
        message: &PickupMessage,
    ) -> Result<PickupMessage> {
        let PickupBody::DeliveryRequest { limit, recipient_key } = &message.body else {
            return Err(unexpected("delivery-request", message));
        };
        ctx.ready_connection(connection_id).await?;

        let _lock = self.locks.acquire(connection_id).await;
        let keep_messages = self.settings.delivery_mode == DeliveryMode::AtLeastOnce;
        let taken = self
            .queue
            .take_from_queue(
                TakeFromQueue::new(connection_id)
                    .recipient_key(recipient_key.clone())
                    .limit(*limit)
                    .keep_messages(keep_messages),
            )
            .await?;

        if taken.is_empty() {
            tracing::debug!("[{}] nothing queued for {}", ctx.label, connection_id);
            return Ok(self.status(message, connection_id, 0, recipient_key.clone()).await);
        }

        tracing::info!(
            "[{}] delivering {} message(s) to {}",
            ctx.label,
            taken.len(),
            connection_id
        );
        let attachments = taken
            .into_iter()
            .map(|m| Attachment::binary(m.id, m.encrypted_payload))
            .collect();
        Ok(PickupMessage::reply_to(
            message,
            PickupBody::Delivery {
                recipient_key: recipient_key.clone(),
                attachments: Some(attachments),
            },
        ))
    }

    pub async fn process_messages_received(
        &self,
        ctx: &AgentContext,
        connection_id: &str,
        message: &PickupMessage,
    ) -> Result<PickupMessage> {
        let PickupBody::MessagesReceived { message_id_list } = &message.body else {
            return Err(unexpected("messages-received", message));
        };
        ctx.ready_connection(connection_id).await?;

        let _lock = self.locks.acquire(connection_id).await;
        let removed = self.queue.remove_messages(connection_id, message_id_list).await?;
        if removed != message_id_list.len() {
            tracing::debug!(
                "[{}] {} of {} acknowledged ids were already gone",
                ctx.label,
                message_id_list.len() - removed,
                message_id_list.len()
            );
        }
        let count = self.queue.get_available_message_count(connection_id, None).await?;
        Ok(self.status(message, connection_id, count, None).await)
    }

    /// Enable or disable live delivery for the connection; replies with a status.
    pub async fn process_live_delivery_change(
        &self,
        ctx: &AgentContext,
        connection_id: &str,
        transport_session_id: Option<&str>,
        message: &PickupMessage,
    ) -> Result<PickupOutcome> {
        let PickupBody::LiveDeliveryChange { live_delivery } = &message.body else {
            return Err(unexpected("live-delivery-change", message));
        };
        ctx.ready_connection(connection_id).await?;

        let mut events = Vec::new();
        if *live_delivery {
            let transport_session_id = transport_session_id.ok_or_else(|| {
                Error::InvalidMessage("live delivery needs a persistent transport session".to_string())
            })?;
            let session = LiveSession::new(connection_id, SessionRole::MessageHolder, transport_session_id);
            self.sessions.save(session.clone()).await;
            tracing::info!("[{}] live delivery enabled for {}", ctx.label, connection_id);
            events.push(AgentEvent::LiveSessionSaved(session));
        } else if let Some(session) = self.sessions.remove(connection_id).await {
            tracing::info!("[{}] live delivery disabled for {}", ctx.label, connection_id);
            events.push(AgentEvent::LiveSessionRemoved(session));
        }

        let count = {
            let _lock = self.locks.acquire(connection_id).await;
            self.queue.get_available_message_count(connection_id, None).await?
        };
        Ok(PickupOutcome {
            reply: Some(self.status(message, connection_id, count, None).await),
            events,
            ..Default::default()
        })
    }

    /// Hold a message for an offline recipient and return its queue id.
    pub async fn queue_message(
        &self,
        connection_id: &str,
        recipient_key: Option<&str>,
        payload: Vec<u8>,
    ) -> Result<String> {
        let _lock = self.locks.acquire(connection_id).await;
        if let Some(max) = self.settings.max_queue_size_per_connection {
            let count = self.queue.get_available_message_count(connection_id, None).await?;
            if count >= max {
                return Err(Error::Storage(format!(
                    "queue for connection {} is full ({} messages)",
                    connection_id, count
                )));
            }
        }
        let id = self.queue.add_message(connection_id, recipient_key, payload).await?;
        tracing::debug!("Queued message {} for {}", id, connection_id);
        Ok(id)
    }

    /// Live session for the connection, when pushes should bypass the queue.
    pub async fn live_session(&self, connection_id: &str) -> Option<LiveSession> {
        self.sessions.get(connection_id).await
    }

    /// Forget live sessions riding on a transport that went away.
    pub async fn transport_closed(&self, transport_session_id: &str) -> Vec<AgentEvent> {
        let removed = self.sessions.remove_by_transport(transport_session_id).await;
        if !removed.is_empty() {
            tracing::info!(
                "Transport {} closed, dropped {} live session(s)",
                transport_session_id,
                removed.len()
            );
        }
        removed.into_iter().map(AgentEvent::LiveSessionRemoved).collect()
    }

    async fn status(
        &self,
        request: &PickupMessage,
        connection_id: &str,
        message_count: usize,
        recipient_key: Option<String>,
    ) -> PickupMessage {
        let live_delivery = self
            .sessions
            .get(connection_id)
            .await
            .map_or(false, |s| s.role == SessionRole::MessageHolder);
        PickupMessage::reply_to(
            request,
            PickupBody::Status {
                message_count,
                recipient_key,
                live_delivery,
            },
        )
    }

    // ---------------------------------------------------------------------
    // Recipient
    // ---------------------------------------------------------------------

    pub async fn create_status_request(
        &self,
        ctx: &AgentContext,
        connection_id: &str,
        recipient_key: Option<String>,
    ) -> Result<PickupMessage> {
        ctx.ready_connection(connection_id).await?;
        Ok(PickupMessage::new(PickupBody::StatusRequest { recipient_key }))
    }

    /// Ask for the next batch, or report completion when nothing is left.
    pub async fn process_status(
        &self,
        ctx: &AgentContext,
        connection_id: &str,
        message: &PickupMessage,
    ) -> Result<PickupOutcome> {
        let PickupBody::Status {
            message_count,
            recipient_key,
            ..
        } = &message.body
        else {
            return Err(unexpected("status", message));
        };
        ctx.ready_connection(connection_id).await?;

        if *message_count == 0 {
            tracing::debug!("[{}] pickup complete on {}", ctx.label, connection_id);
            return Ok(PickupOutcome {
                events: vec![AgentEvent::PickupCompleted(PickupCompleted {
                    connection_id: connection_id.to_string(),
                    thread_id: message.thread_id.clone(),
                    recipient_key: recipient_key.clone(),
                })],
                ..Default::default()
            });
        }

        let limit = (*message_count).min(self.settings.max_batch_size);
        Ok(PickupOutcome::reply(PickupMessage::reply_to(
            message,
            PickupBody::DeliveryRequest {
                limit,
                recipient_key: recipient_key.clone(),
            },
        )))
    }

    /// Unpack a delivery and acknowledge every attachment in it.
    pub async fn process_delivery(
        &self,
        ctx: &AgentContext,
        connection_id: &str,
        message: &PickupMessage,
    ) -> Result<DeliveryOutcome> {
        let PickupBody::Delivery { attachments, .. } = &message.body else {
            return Err(unexpected("delivery", message));
        };
        ctx.ready_connection(connection_id).await?;

        let attachments = attachments.clone().ok_or_else(|| {
            Error::ErrorProcessingAttachments(format!("delivery {} carries no attachments", message.id))
        })?;
        let message_id_list = attachments.iter().map(|a| a.id.clone()).collect();

        tracing::debug!(
            "[{}] received {} message(s) over {}",
            ctx.label,
            attachments.len(),
            connection_id
        );
        Ok(DeliveryOutcome {
            messages: attachments,
            reply: PickupMessage::reply_to(message, PickupBody::MessagesReceived { message_id_list }),
        })
    }

    /// Ask the holder to start or stop pushing messages over `transport_session_id`.
    pub async fn set_live_delivery(
        &self,
        ctx: &AgentContext,
        connection_id: &str,
        transport_session_id: &str,
        live_delivery: bool,
    ) -> Result<PickupOutcome> {
        ctx.ready_connection(connection_id).await?;

        let event = if live_delivery {
            let session = LiveSession::new(connection_id, SessionRole::Recipient, transport_session_id);
            self.sessions.save(session.clone()).await;
            Some(AgentEvent::LiveSessionSaved(session))
        } else {
            self.sessions
                .remove(connection_id)
                .await
                .map(AgentEvent::LiveSessionRemoved)
        };

        Ok(PickupOutcome {
            reply: Some(PickupMessage::new(PickupBody::LiveDeliveryChange { live_delivery })),
            events: event.into_iter().collect(),
            ..Default::default()
        })
    }
}

fn unexpected(expected: &str, message: &PickupMessage) -> Error {
    Error::InvalidMessage(format!(
        "expected {} message, got {}",
        expected,
        message.body.name()
    ))
}

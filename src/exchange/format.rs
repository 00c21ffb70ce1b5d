//! Pluggable payload formats and their coordination.
//!
//! A [`FormatService`] knows one payload encoding (an anoncreds credential, a
//! JSON-LD presentation, ...). The [`FormatRegistry`] resolves services by
//! declared key or by wire format identifier; the [`FormatCoordinator`] merges
//! their attachments into one outbound message and splits inbound messages
//! back out per service.

use std::sync::Arc;

use async_trait::async_trait;
use regex::Regex;
use serde_json::Value;

use crate::error::{Error, Result};

use super::message::{generate_id, Attachment, AttachmentData, FormatRef, MessageKind, ProtocolMessage};
use super::protocol::ExchangeProtocol;
use super::record::ExchangeRecord;

/// Payload a format service produced for one step.
#[derive(Debug, Clone, PartialEq)]
pub struct FormatAttachment {
    /// Wire format identifier, e.g. `hlindy/cred-abstract@v2.0`.
    pub format: String,
    pub data: AttachmentData,
}

/// Input to [`FormatService::create`].
#[derive(Debug, Clone, Copy)]
pub struct FormatCreateInput<'a> {
    pub kind: MessageKind,
    /// Caller-supplied options for this format, absent when accepting as-is.
    pub options: Option<&'a Value>,
    /// This format's attachment in the message being answered.
    pub received: Option<&'a Attachment>,
}

/// The pair of attachments an auto-accept check compares.
#[derive(Debug, Clone, Copy)]
pub struct AutoRespondCheck<'a> {
    /// Step that was received.
    pub kind: MessageKind,
    /// This format's attachment in the message this side sent before.
    pub sent: &'a Attachment,
    /// This format's attachment in the received message.
    pub received: &'a Attachment,
}

#[async_trait]
pub trait FormatService<P: ExchangeProtocol>: Send + Sync {
    /// Key callers use to request this format.
    fn format_key(&self) -> &str;

    /// Regex matched against wire format identifiers.
    fn format_pattern(&self) -> &str;

    async fn create(
        &self,
        record: &mut ExchangeRecord<P>,
        input: FormatCreateInput<'_>,
    ) -> Result<FormatAttachment>;

    async fn process(
        &self,
        record: &mut ExchangeRecord<P>,
        kind: MessageKind,
        attachment: &Attachment,
    ) -> Result<()>;

    /// Whether this format's content agrees with what this side sent.
    async fn should_auto_respond(
        &self,
        record: &ExchangeRecord<P>,
        check: AutoRespondCheck<'_>,
    ) -> bool;
}

pub type SharedFormatService<P> = Arc<dyn FormatService<P>>;

/// Same service instance, regardless of how it was looked up.
pub fn same_service<P: ExchangeProtocol>(a: &SharedFormatService<P>, b: &SharedFormatService<P>) -> bool {
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}

fn push_unique<P: ExchangeProtocol>(list: &mut Vec<SharedFormatService<P>>, service: SharedFormatService<P>) {
    if !list.iter().any(|s| same_service(s, &service)) {
        list.push(service);
    }
}

struct Registered<P: ExchangeProtocol> {
    service: SharedFormatService<P>,
    pattern: Regex,
}

/// Format services by key and by wire format pattern.
pub struct FormatRegistry<P: ExchangeProtocol> {
    services: Vec<Registered<P>>,
}

impl<P: ExchangeProtocol> Default for FormatRegistry<P> {
    fn default() -> Self {
        Self { services: Vec::new() }
    }
}

impl<P: ExchangeProtocol> FormatRegistry<P> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, service: SharedFormatService<P>) -> Result<()> {
        let pattern = Regex::new(service.format_pattern()).map_err(|e| {
            Error::Format(format!("invalid pattern for format {}: {}", service.format_key(), e))
        })?;
        if self.by_key(service.format_key()).is_some() {
            return Err(Error::Duplicate(format!("format key {}", service.format_key())));
        }
        tracing::debug!("Registered {} format {}", P::NAME, service.format_key());
        self.services.push(Registered { service, pattern });
        Ok(())
    }

    pub fn with(mut self, service: SharedFormatService<P>) -> Result<Self> {
        self.register(service)?;
        Ok(self)
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    /// Lookup by declared format key.
    pub fn by_key(&self, key: &str) -> Option<SharedFormatService<P>> {
        self.services
            .iter()
            .find(|r| r.service.format_key() == key)
            .map(|r| r.service.clone())
    }

    /// Lookup by wire format identifier.
    pub fn for_format(&self, format: &str) -> Option<SharedFormatService<P>> {
        self.services
            .iter()
            .find(|r| r.pattern.is_match(format))
            .map(|r| r.service.clone())
    }

    /// Resolve every key; any unknown key fails the whole lookup.
    pub fn resolve_keys<'a, I>(&self, keys: I) -> Result<Vec<SharedFormatService<P>>>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut services = Vec::new();
        for key in keys {
            let service = self
                .by_key(key)
                .ok_or_else(|| Error::UnsupportedFormat(key.to_string()))?;
            push_unique(&mut services, service);
        }
        Ok(services)
    }

    /// Services for the formats a message declares, deduplicated. Unknown formats are skipped.
    pub fn for_formats(&self, formats: &[FormatRef]) -> Vec<SharedFormatService<P>> {
        let mut services = Vec::new();
        for format in formats {
            if let Some(service) = self.for_format(&format.format) {
                push_unique(&mut services, service);
            }
        }
        services
    }

    fn handles(&self, service: &SharedFormatService<P>, format: &str) -> bool {
        self.for_format(format)
            .map_or(false, |found| same_service(&found, service))
    }
}

/// A service together with the options the caller gave it.
pub struct FormatSelection<'a, P: ExchangeProtocol> {
    pub service: SharedFormatService<P>,
    pub options: Option<&'a Value>,
}

/// Merges and splits per-format attachments for one protocol step.
pub struct FormatCoordinator<P: ExchangeProtocol> {
    registry: Arc<FormatRegistry<P>>,
}

impl<P: ExchangeProtocol> Clone for FormatCoordinator<P> {
    fn clone(&self) -> Self {
        Self {
            registry: self.registry.clone(),
        }
    }
}

impl<P: ExchangeProtocol> FormatCoordinator<P> {
    pub fn new(registry: Arc<FormatRegistry<P>>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &FormatRegistry<P> {
        &self.registry
    }

    /// This service's attachment in `message`, if it carries one.
    pub fn attachment_for<'m>(
        &self,
        service: &SharedFormatService<P>,
        message: &'m ProtocolMessage,
    ) -> Option<&'m Attachment> {
        message
            .attachments_matching(|format| self.registry.handles(service, format))
            .into_iter()
            .next()
            .map(|(_, attachment)| attachment)
    }

    /// Let every selected service contribute an attachment to `message`.
    pub async fn create(
        &self,
        record: &mut ExchangeRecord<P>,
        kind: MessageKind,
        selections: &[FormatSelection<'_, P>],
        received: Option<&ProtocolMessage>,
        mut message: ProtocolMessage,
    ) -> Result<ProtocolMessage> {
        if selections.is_empty() {
            return Err(Error::NoSupportedFormats);
        }

        for selection in selections {
            let input = FormatCreateInput {
                kind,
                options: selection.options,
                received: received.and_then(|m| self.attachment_for(&selection.service, m)),
            };
            let produced = selection.service.create(record, input).await?;
            let attachment = match produced.data {
                AttachmentData::Json(value) => Attachment::json(generate_id(), value),
                AttachmentData::Binary(bytes) => Attachment::binary(generate_id(), bytes),
            };
            message.add_format_attachment(produced.format, attachment);
        }

        record.format_refs.insert(kind, message.formats.clone());
        Ok(message)
    }

    /// Hand each attachment of an inbound message to the service owning its format.
    pub async fn process(
        &self,
        record: &mut ExchangeRecord<P>,
        kind: MessageKind,
        message: &ProtocolMessage,
    ) -> Result<()> {
        let services = self.registry.for_formats(&message.formats);
        if services.is_empty() && !message.formats.is_empty() {
            return Err(Error::NoSupportedFormats);
        }

        for service in &services {
            let attachment = self.attachment_for(service, message).ok_or_else(|| {
                Error::InvalidMessage(format!(
                    "message {} declares format {} without an attachment",
                    message.id,
                    service.format_key()
                ))
            })?;
            service.process(record, kind, attachment).await?;
        }

        record.format_refs.insert(kind, message.formats.clone());
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! A configurable format service for engine tests.

    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Emits `{"step": kind, "options": options, "answers": received}` and
    /// approves auto-accept when both sides carry equal `values`.
    pub struct StaticFormat {
        pub key: String,
        pub format: String,
        pub processed: AtomicUsize,
        pub fail_processing: bool,
    }

    impl StaticFormat {
        pub fn new(key: &str, format: &str) -> Self {
            Self {
                key: key.to_string(),
                format: format.to_string(),
                processed: AtomicUsize::new(0),
                fail_processing: false,
            }
        }

        pub fn failing(key: &str, format: &str) -> Self {
            Self {
                fail_processing: true,
                ..Self::new(key, format)
            }
        }

        pub fn processed(&self) -> usize {
            self.processed.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl<P: ExchangeProtocol> FormatService<P> for StaticFormat {
        fn format_key(&self) -> &str {
            &self.key
        }

        fn format_pattern(&self) -> &str {
            &self.format
        }

        async fn create(
            &self,
            record: &mut ExchangeRecord<P>,
            input: FormatCreateInput<'_>,
        ) -> Result<FormatAttachment> {
            record.set_metadata(format!("{}.created", self.key), json!(input.kind));
            let values = input
                .options
                .and_then(|o| o.get("values").cloned())
                .or_else(|| {
                    input
                        .received
                        .and_then(|a| a.data.as_json())
                        .and_then(|v| v.get("values").cloned())
                })
                .unwrap_or(Value::Null);
            Ok(FormatAttachment {
                format: self.format.trim_start_matches('^').to_string(),
                data: AttachmentData::Json(json!({
                    "step": input.kind,
                    "values": values,
                    "answers": input.received.map(|a| a.id.clone()),
                })),
            })
        }

        async fn process(
            &self,
            record: &mut ExchangeRecord<P>,
            kind: MessageKind,
            attachment: &Attachment,
        ) -> Result<()> {
            if self.fail_processing {
                return Err(Error::Format(format!("{} rejected {}", self.key, attachment.id)));
            }
            self.processed.fetch_add(1, Ordering::SeqCst);
            record.set_metadata(format!("{}.processed", self.key), json!(kind));
            Ok(())
        }

        async fn should_auto_respond(
            &self,
            _record: &ExchangeRecord<P>,
            check: AutoRespondCheck<'_>,
        ) -> bool {
            let values = |a: &Attachment| a.data.as_json().and_then(|v| v.get("values").cloned());
            values(check.sent) == values(check.received)
        }
    }
}

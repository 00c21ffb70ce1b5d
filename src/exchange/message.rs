//! Protocol messages and the attachments they carry.

use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// DIDComm protocol host every message type lives under.
pub const MESSAGE_TYPE_HOST: &str = "https://didcomm.org";

/// Step of a negotiation protocol a message belongs to.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Proposal,
    Offer,
    Request,
    /// Credential (issuance) or presentation (proof).
    Issue,
    Ack,
    ProblemReport,
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageKind::Proposal => write!(f, "proposal"),
            MessageKind::Offer => write!(f, "offer"),
            MessageKind::Request => write!(f, "request"),
            MessageKind::Issue => write!(f, "issue"),
            MessageKind::Ack => write!(f, "ack"),
            MessageKind::ProblemReport => write!(f, "problem-report"),
        }
    }
}

/// Which side of the exchange a stored message came from.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    Sender,
    Receiver,
}

/// Opaque attachment payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum AttachmentData {
    Json(Value),
    Binary(Vec<u8>),
}

impl AttachmentData {
    pub fn as_json(&self) -> Option<&Value> {
        match self {
            AttachmentData::Json(value) => Some(value),
            AttachmentData::Binary(_) => None,
        }
    }
}

/// Attachment carried inside a protocol message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Attachment {
    pub id: String,
    pub mime_type: Option<String>,
    pub data: AttachmentData,
}

impl Attachment {
    pub fn json(id: impl Into<String>, value: Value) -> Self {
        Self {
            id: id.into(),
            mime_type: Some("application/json".to_string()),
            data: AttachmentData::Json(value),
        }
    }

    pub fn binary(id: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            id: id.into(),
            mime_type: Some("application/octet-stream".to_string()),
            data: AttachmentData::Binary(bytes),
        }
    }
}

/// Associates an attachment id with the wire format identifier of its payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FormatRef {
    pub attachment_id: String,
    pub format: String,
}

/// One attribute of a human-readable preview.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PreviewAttribute {
    pub name: String,
    pub mime_type: Option<String>,
    pub value: String,
}

impl PreviewAttribute {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            mime_type: None,
            value: value.into(),
        }
    }
}

/// Human-readable preview of the attributes being negotiated.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct Preview {
    pub attributes: Vec<PreviewAttribute>,
}

impl Preview {
    pub fn new(attributes: Vec<PreviewAttribute>) -> Self {
        Self { attributes }
    }

    /// Same attribute names and values, ignoring order.
    pub fn same_attributes(&self, other: &Preview) -> bool {
        let mut ours: Vec<(&str, &str)> = self
            .attributes
            .iter()
            .map(|a| (a.name.as_str(), a.value.as_str()))
            .collect();
        let mut theirs: Vec<(&str, &str)> = other
            .attributes
            .iter()
            .map(|a| (a.name.as_str(), a.value.as_str()))
            .collect();
        ours.sort_unstable();
        theirs.sort_unstable();
        ours == theirs
    }
}

/// Both previews absent, or both present with equal attributes.
pub fn previews_match(a: Option<&Preview>, b: Option<&Preview>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(a), Some(b)) => a.same_attributes(b),
        _ => false,
    }
}

/// A protocol message. Immutable once sent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProtocolMessage {
    pub id: String,
    pub message_type: String,
    pub thread_id: String,
    pub parent_thread_id: Option<String>,
    /// Id of the message this one answers.
    pub reply_to: Option<String>,
    pub comment: Option<String>,
    #[serde(default)]
    pub formats: Vec<FormatRef>,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    pub preview: Option<Preview>,
    #[serde(default)]
    pub body: Value,
    pub created_at: i64,
}

impl ProtocolMessage {
    /// New message opening its own thread.
    pub fn new(message_type: impl Into<String>) -> Self {
        let id = generate_id();
        Self {
            thread_id: id.clone(),
            id,
            message_type: message_type.into(),
            parent_thread_id: None,
            reply_to: None,
            comment: None,
            formats: Vec::new(),
            attachments: Vec::new(),
            preview: None,
            body: Value::Null,
            created_at: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// Place the message on an existing thread.
    pub fn with_thread(mut self, thread_id: impl Into<String>) -> Self {
        self.thread_id = thread_id.into();
        self
    }

    pub fn with_parent_thread(mut self, parent_thread_id: Option<String>) -> Self {
        self.parent_thread_id = parent_thread_id;
        self
    }

    pub fn with_reply_to(mut self, message_id: impl Into<String>) -> Self {
        self.reply_to = Some(message_id.into());
        self
    }

    pub fn with_comment(mut self, comment: Option<String>) -> Self {
        self.comment = comment;
        self
    }

    pub fn with_preview(mut self, preview: Option<Preview>) -> Self {
        self.preview = preview;
        self
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = body;
        self
    }

    /// Add an attachment and declare its format.
    pub fn add_format_attachment(&mut self, format: impl Into<String>, attachment: Attachment) {
        self.formats.push(FormatRef {
            attachment_id: attachment.id.clone(),
            format: format.into(),
        });
        self.attachments.push(attachment);
    }

    pub fn attachment(&self, attachment_id: &str) -> Option<&Attachment> {
        self.attachments.iter().find(|a| a.id == attachment_id)
    }

    /// Attachments whose declared format satisfies `matches`, in declaration order.
    pub fn attachments_matching<F>(&self, matches: F) -> Vec<(&FormatRef, &Attachment)>
    where
        F: Fn(&str) -> bool,
    {
        self.formats
            .iter()
            .filter(|f| matches(&f.format))
            .filter_map(|f| self.attachment(&f.attachment_id).map(|a| (f, a)))
            .collect()
    }
}

/// Body of a problem report message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProblemReport {
    pub code: String,
    pub description: String,
}

impl ProblemReport {
    pub fn new(code: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            description: description.into(),
        }
    }

    pub fn from_message(message: &ProtocolMessage) -> Option<Self> {
        serde_json::from_value(message.body.clone()).ok()
    }
}

/// Parsed form of a message type URI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageTypeUri {
    pub protocol: String,
    /// Version tag such as `v2`.
    pub version: String,
    pub name: String,
}

impl MessageTypeUri {
    pub fn parse(uri: &str) -> Option<Self> {
        static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
        let pattern = PATTERN
            .get_or_init(|| Regex::new(r"^https://didcomm\.org/([a-z0-9-]+)/(\d+)\.\d+/([a-z0-9-]+)$").ok())
            .as_ref()?;

        let caps = pattern.captures(uri)?;
        Some(Self {
            protocol: caps[1].to_string(),
            version: format!("v{}", &caps[2]),
            name: caps[3].to_string(),
        })
    }
}

/// Build a message type URI from a protocol name, version tag and message name.
pub fn message_type_uri(protocol: &str, version: &str, name: &str) -> String {
    let major = version.trim_start_matches('v');
    format!("{}/{}/{}.0/{}", MESSAGE_TYPE_HOST, protocol, major, name)
}

pub(crate) fn generate_id() -> String {
    ulid::Ulid::new().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_message_type_roundtrip() {
        let uri = message_type_uri("issue-credential", "v2", "offer-credential");
        assert_eq!(uri, "https://didcomm.org/issue-credential/2.0/offer-credential");

        let parsed = MessageTypeUri::parse(&uri).unwrap();
        assert_eq!(parsed.protocol, "issue-credential");
        assert_eq!(parsed.version, "v2");
        assert_eq!(parsed.name, "offer-credential");

        assert!(MessageTypeUri::parse("https://example.com/foo").is_none());
    }

    #[test]
    fn test_new_message_opens_thread() {
        let msg = ProtocolMessage::new("https://didcomm.org/present-proof/2.0/request-presentation");
        assert_eq!(msg.id, msg.thread_id);

        let reply = ProtocolMessage::new("x")
            .with_thread(msg.thread_id.clone())
            .with_reply_to(msg.id.clone());
        assert_ne!(reply.id, reply.thread_id);
        assert_eq!(reply.reply_to.as_deref(), Some(msg.id.as_str()));
    }

    #[test]
    fn test_attachments_matching() {
        let mut msg = ProtocolMessage::new("x");
        msg.add_format_attachment("hlindy/cred@v2.0", Attachment::json("a1", json!({"k": 1})));
        msg.add_format_attachment("aries/ld-proof-vc@v1.0", Attachment::binary("a2", vec![1, 2]));

        let indy = msg.attachments_matching(|f| f.starts_with("hlindy/"));
        assert_eq!(indy.len(), 1);
        assert_eq!(indy[0].1.id, "a1");
        assert_eq!(indy[0].1.data.as_json(), Some(&json!({"k": 1})));
    }

    #[test]
    fn test_preview_comparison_ignores_order() {
        let a = Preview::new(vec![
            PreviewAttribute::new("name", "John"),
            PreviewAttribute::new("age", "42"),
        ]);
        let b = Preview::new(vec![
            PreviewAttribute::new("age", "42"),
            PreviewAttribute::new("name", "John"),
        ]);
        let c = Preview::new(vec![PreviewAttribute::new("name", "Jane")]);

        assert!(a.same_attributes(&b));
        assert!(!a.same_attributes(&c));
        assert!(previews_match(None, None));
        assert!(!previews_match(Some(&a), None));
        assert!(previews_match(Some(&a), Some(&b)));
    }

    #[test]
    fn test_problem_report_body() {
        let report = ProblemReport::new("abandoned", "issuance abandoned");
        let msg = ProtocolMessage::new("x").with_body(serde_json::to_value(&report).unwrap());
        assert_eq!(ProblemReport::from_message(&msg), Some(report));
    }
}

//! Message pickup 2.0 messages.

use serde::{Deserialize, Serialize};

use crate::exchange::message::{message_type_uri, Attachment, MessageTypeUri};

pub const PICKUP_PROTOCOL: &str = "messagepickup";
pub const PICKUP_VERSION: &str = "v2";

/// Body of a pickup message. The variant decides the message type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PickupBody {
    StatusRequest {
        recipient_key: Option<String>,
    },
    Status {
        message_count: usize,
        recipient_key: Option<String>,
        live_delivery: bool,
    },
    DeliveryRequest {
        limit: usize,
        recipient_key: Option<String>,
    },
    Delivery {
        recipient_key: Option<String>,
        /// `None` is a protocol violation; an empty list is not.
        attachments: Option<Vec<Attachment>>,
    },
    MessagesReceived {
        message_id_list: Vec<String>,
    },
    LiveDeliveryChange {
        live_delivery: bool,
    },
}

impl PickupBody {
    pub fn name(&self) -> &'static str {
        match self {
            PickupBody::StatusRequest { .. } => "status-request",
            PickupBody::Status { .. } => "status",
            PickupBody::DeliveryRequest { .. } => "delivery-request",
            PickupBody::Delivery { .. } => "delivery",
            PickupBody::MessagesReceived { .. } => "messages-received",
            PickupBody::LiveDeliveryChange { .. } => "live-delivery-change",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PickupMessage {
    pub id: String,
    pub thread_id: String,
    pub body: PickupBody,
}

impl PickupMessage {
    /// A message opening its own thread.
    pub fn new(body: PickupBody) -> Self {
        let id = ulid::Ulid::new().to_string();
        Self {
            thread_id: id.clone(),
            id,
            body,
        }
    }

    /// A reply on `request`'s thread.
    pub fn reply_to(request: &PickupMessage, body: PickupBody) -> Self {
        Self {
            thread_id: request.thread_id.clone(),
            ..Self::new(body)
        }
    }

    pub fn message_type(&self) -> String {
        message_type_uri(PICKUP_PROTOCOL, PICKUP_VERSION, self.body.name())
    }

    /// Whether `uri` names a message of this protocol.
    pub fn is_pickup_type(uri: &str) -> bool {
        MessageTypeUri::parse(uri)
            .map_or(false, |t| t.protocol == PICKUP_PROTOCOL && t.version == PICKUP_VERSION)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_types() {
        let request = PickupMessage::new(PickupBody::StatusRequest { recipient_key: None });
        assert_eq!(request.message_type(), "https://didcomm.org/messagepickup/2.0/status-request");
        assert!(PickupMessage::is_pickup_type(&request.message_type()));
        assert!(!PickupMessage::is_pickup_type("https://didcomm.org/messagepickup/1.0/batch"));

        let status = PickupMessage::reply_to(
            &request,
            PickupBody::Status {
                message_count: 3,
                recipient_key: None,
                live_delivery: false,
            },
        );
        assert_eq!(status.thread_id, request.id);
        assert_ne!(status.id, request.id);
    }

    #[test]
    fn test_missing_attachments_survive_serialization() {
        let delivery = PickupMessage::new(PickupBody::Delivery {
            recipient_key: None,
            attachments: None,
        });
        let json = serde_json::to_string(&delivery).unwrap();
        let back: PickupMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(back.body, delivery.body);
    }
}

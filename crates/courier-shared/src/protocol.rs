use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;
use crate::types::{ChatId, MessageId, MessageStatus, UserId};

/// Frames a client may send over its WebSocket channel.
///
/// Encoded as `{"type": "...", "data": {...}}`. Anything outside this union
/// (unknown `type`, missing required field) fails to decode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum InboundFrame {
    /// Submit a chat message to another user
    Message(SubmitMessage),

    /// Report a delivery/read receipt, or stop the receipt loop for a chat
    ReceiptUpdate(ReceiptUpdate),
}

/// Body of an inbound `message` frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmitMessage {
    /// Claimed sender. Never trusted: must equal the authenticated identity.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<UserId>,
    pub receiver: UserId,
    pub message: String,
    /// Opaque attachment references (e.g. object-store URLs), kept in order
    #[serde(default)]
    pub attachments: Vec<String>,
}

/// Body of an inbound `receipt_update` frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReceiptUpdate {
    pub chat_id: ChatId,
    /// Acting user (the one who delivered/read the message)
    pub user_id: UserId,
    #[serde(default)]
    pub message_id: Option<MessageId>,
    #[serde(default)]
    pub status: Option<MessageStatus>,
    #[serde(default)]
    pub stop: bool,
}

impl InboundFrame {
    /// Decode and validate a text frame.
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let frame: InboundFrame = serde_json::from_str(text)?;
        frame.validate()?;
        Ok(frame)
    }

    /// Shape checks that serde cannot express.
    pub fn validate(&self) -> Result<(), ProtocolError> {
        match self {
            InboundFrame::Message(msg) => {
                if msg.receiver.is_empty() {
                    return Err(ProtocolError::MissingField("receiver"));
                }
                if msg.message.is_empty() && msg.attachments.is_empty() {
                    return Err(ProtocolError::MissingField("message"));
                }
                if msg.attachments.iter().any(|a| a.trim().is_empty()) {
                    return Err(ProtocolError::InvalidField {
                        field: "attachments",
                        reason: "empty attachment reference".to_string(),
                    });
                }
                Ok(())
            }
            InboundFrame::ReceiptUpdate(update) => {
                if update.chat_id.as_str().is_empty() {
                    return Err(ProtocolError::MissingField("chat_id"));
                }
                if update.user_id.is_empty() {
                    return Err(ProtocolError::MissingField("user_id"));
                }
                // A stop request needs nothing beyond the chat it targets.
                if update.stop {
                    return Ok(());
                }
                if update.message_id.is_none() {
                    return Err(ProtocolError::MissingField("message_id"));
                }
                match update.status {
                    None => Err(ProtocolError::MissingField("status")),
                    Some(MessageStatus::Sent) => Err(ProtocolError::InvalidField {
                        field: "status",
                        reason: "receipts report delivered or read".to_string(),
                    }),
                    Some(_) => Ok(()),
                }
            }
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            InboundFrame::Message(_) => "message",
            InboundFrame::ReceiptUpdate(_) => "receipt_update",
        }
    }
}

/// Frames the server pushes to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum OutboundFrame {
    /// One summary per known chat, sent on connect and on presence change
    RecipientList(ChatSummary),

    /// Submission confirmation to the sender, or live/backlog delivery
    Message(MessageView),

    /// Status change relayed to the original sender
    ReceiptUpdate(ReceiptNotice),

    /// Per-frame failure report; the connection stays open unless the
    /// code is `unauthorized`
    Error(ErrorNotice),
}

impl OutboundFrame {
    pub fn to_json(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            OutboundFrame::RecipientList(_) => "recipient_list",
            OutboundFrame::Message(_) => "message",
            OutboundFrame::ReceiptUpdate(_) => "receipt_update",
            OutboundFrame::Error(_) => "error",
        }
    }
}

/// Denormalized summary of a chat, seen from one participant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatSummary {
    pub chat_id: ChatId,
    /// The counterpart of the user receiving this summary
    pub receiver: UserId,
    pub name: String,
    pub last_message: Option<String>,
    pub is_blocked: bool,
    pub last_updated: DateTime<Utc>,
    pub is_online: bool,
}

/// A fully populated message as stored by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageView {
    pub id: MessageId,
    pub sender: UserId,
    pub receiver: UserId,
    pub status: MessageStatus,
    pub message: String,
    pub attachments: Vec<String>,
    pub created_at: DateTime<Utc>,
}

/// A status change pushed to the message's original sender.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReceiptNotice {
    pub chat_id: ChatId,
    /// The user whose action caused the change
    pub user_id: UserId,
    pub message_id: MessageId,
    pub status: MessageStatus,
    pub stop: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorNotice {
    pub code: String,
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_message_frame() {
        let text = json!({
            "type": "message",
            "data": {"sender": "alice", "receiver": "bob", "message": "hi"}
        })
        .to_string();

        let frame = InboundFrame::parse(&text).unwrap();
        match frame {
            InboundFrame::Message(msg) => {
                assert_eq!(msg.sender, Some(UserId::from("alice")));
                assert_eq!(msg.receiver, UserId::from("bob"));
                assert_eq!(msg.message, "hi");
                assert!(msg.attachments.is_empty());
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn test_attachments_without_body_are_valid() {
        let text = json!({
            "type": "message",
            "data": {"receiver": "bob", "message": "", "attachments": ["s3://a", "s3://b"]}
        })
        .to_string();

        let Ok(InboundFrame::Message(msg)) = InboundFrame::parse(&text) else {
            panic!("frame should parse");
        };
        assert_eq!(msg.attachments, vec!["s3://a".to_string(), "s3://b".to_string()]);
    }

    #[test]
    fn test_empty_message_rejected() {
        let text = json!({"type": "message", "data": {"receiver": "bob", "message": ""}}).to_string();
        assert!(matches!(
            InboundFrame::parse(&text),
            Err(ProtocolError::MissingField("message"))
        ));
    }

    #[test]
    fn test_unknown_type_rejected() {
        let text = json!({"type": "typing", "data": {"chat_id": "x"}}).to_string();
        assert!(matches!(InboundFrame::parse(&text), Err(ProtocolError::Json(_))));
    }

    #[test]
    fn test_missing_receiver_rejected() {
        let text = json!({"type": "message", "data": {"message": "hi"}}).to_string();
        assert!(InboundFrame::parse(&text).is_err());
    }

    #[test]
    fn test_receipt_requires_status_unless_stop() {
        let id = MessageId::new();
        let missing_status = json!({
            "type": "receipt_update",
            "data": {"chat_id": "c1", "user_id": "bob", "message_id": id, "stop": false}
        })
        .to_string();
        assert!(matches!(
            InboundFrame::parse(&missing_status),
            Err(ProtocolError::MissingField("status"))
        ));

        let stop = json!({
            "type": "receipt_update",
            "data": {"chat_id": "c1", "user_id": "bob", "stop": true}
        })
        .to_string();
        assert!(InboundFrame::parse(&stop).is_ok());
    }

    #[test]
    fn test_receipt_rejects_sent_status() {
        let text = json!({
            "type": "receipt_update",
            "data": {"chat_id": "c1", "user_id": "bob", "message_id": MessageId::new(), "status": "sent"}
        })
        .to_string();
        assert!(matches!(
            InboundFrame::parse(&text),
            Err(ProtocolError::InvalidField { field: "status", .. })
        ));
    }

    #[test]
    fn test_outbound_shape() {
        let frame = OutboundFrame::ReceiptUpdate(ReceiptNotice {
            chat_id: ChatId("c1".to_string()),
            user_id: UserId::from("bob"),
            message_id: MessageId::new(),
            status: MessageStatus::Read,
            stop: false,
        });

        let value: serde_json::Value = serde_json::from_str(&frame.to_json().unwrap()).unwrap();
        assert_eq!(value["type"], "receipt_update");
        assert_eq!(value["data"]["status"], "read");
        assert_eq!(value["data"]["chat_id"], "c1");
    }
}

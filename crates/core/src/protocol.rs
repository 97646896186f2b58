//! The bidirectional frame envelope and its typed payloads.
//!
//! Every frame on the wire is `{"type": <tag>, "data": <payload>}`. Inbound
//! frames are decoded in two steps so that an unknown tag can be told apart
//! from a malformed payload: the former is ignored, the latter earns the
//! sender an `error` frame.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::message::{DeliveryStatus, PresenceStatus};

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("frame is not a valid envelope: {0}")]
    Envelope(#[source] serde_json::Error),
    #[error("invalid payload for '{frame_type}': {source}")]
    Payload {
        frame_type: String,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    frame_type: String,
    #[serde(default)]
    data: Value,
}

/// Result of decoding one inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    Command(ClientCommand),
    /// A syntactically valid envelope whose tag this server does not speak.
    Unknown(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum ClientCommand {
    SendMessage(SendMessage),
    TypingStart(ConversationRef),
    TypingStop(ConversationRef),
    MarkRead(MessageRef),
    JoinConversation(ConversationRef),
    Ping,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessage {
    pub conversation_id: Uuid,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachments: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationRef {
    pub conversation_id: Uuid,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageRef {
    pub message_id: Uuid,
}

/// Decode one inbound text frame into a typed command.
pub fn decode_client_frame(raw: &str) -> Result<InboundFrame, ProtocolError> {
    let envelope: Envelope = serde_json::from_str(raw).map_err(ProtocolError::Envelope)?;
    let command = match envelope.frame_type.as_str() {
        "send_message" => {
            ClientCommand::SendMessage(decode_payload(&envelope.frame_type, envelope.data)?)
        }
        "typing_start" => {
            ClientCommand::TypingStart(decode_payload(&envelope.frame_type, envelope.data)?)
        }
        "typing_stop" => {
            ClientCommand::TypingStop(decode_payload(&envelope.frame_type, envelope.data)?)
        }
        "mark_read" => ClientCommand::MarkRead(decode_payload(&envelope.frame_type, envelope.data)?),
        "join_conversation" => {
            ClientCommand::JoinConversation(decode_payload(&envelope.frame_type, envelope.data)?)
        }
        "ping" => ClientCommand::Ping,
        _ => return Ok(InboundFrame::Unknown(envelope.frame_type)),
    };
    Ok(InboundFrame::Command(command))
}

fn decode_payload<T: DeserializeOwned>(frame_type: &str, data: Value) -> Result<T, ProtocolError> {
    serde_json::from_value(data).map_err(|source| ProtocolError::Payload {
        frame_type: frame_type.to_owned(),
        source,
    })
}

/// Outbound payload shared by `new_message` and `scheduled_message_delivered`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageBroadcast {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub content: String,
    pub sender_id: Uuid,
    pub sender_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_avatar: Option<String>,
    pub created_at: DateTime<Utc>,
    pub delivery_status: DeliveryStatus,
    pub is_read: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachments: Option<Value>,
}

/// Payload of `scheduled_message_delivered`: the `new_message` shape plus
/// the `isScheduled` marker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledBroadcast {
    #[serde(flatten)]
    pub message: MessageBroadcast,
    #[serde(rename = "isScheduled")]
    pub is_scheduled: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ServerFrame {
    #[serde(rename_all = "camelCase")]
    ConnectionEstablished {
        user_id: Uuid,
        timestamp: DateTime<Utc>,
    },
    NewMessage(MessageBroadcast),
    #[serde(rename_all = "camelCase")]
    MessageSent {
        message_id: Uuid,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename_all = "camelCase")]
    UserTyping {
        conversation_id: Uuid,
        user_id: Uuid,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename_all = "camelCase")]
    UserStoppedTyping {
        conversation_id: Uuid,
        user_id: Uuid,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename_all = "camelCase")]
    MessageRead {
        message_id: Uuid,
        read_by: Uuid,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename_all = "camelCase")]
    UserJoinedConversation {
        conversation_id: Uuid,
        user_id: Uuid,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename_all = "camelCase")]
    UserStatusChanged {
        user_id: Uuid,
        status: PresenceStatus,
        timestamp: DateTime<Utc>,
    },
    ScheduledMessageDelivered(ScheduledBroadcast),
    Pong {
        timestamp: DateTime<Utc>,
    },
    Error {
        message: String,
    },
}

impl ServerFrame {
    pub fn error(message: impl Into<String>) -> Self {
        ServerFrame::Error {
            message: message.into(),
        }
    }

    pub fn scheduled(message: MessageBroadcast) -> Self {
        ServerFrame::ScheduledMessageDelivered(ScheduledBroadcast {
            message,
            is_scheduled: true,
        })
    }

    /// Wire encoding of the frame. Serialization of these self-owned types
    /// cannot fail, so a lossy fallback is acceptable.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    /// The envelope tag this frame serializes under.
    pub fn frame_type(&self) -> &'static str {
        match self {
            ServerFrame::ConnectionEstablished { .. } => "connection_established",
            ServerFrame::NewMessage(_) => "new_message",
            ServerFrame::MessageSent { .. } => "message_sent",
            ServerFrame::UserTyping { .. } => "user_typing",
            ServerFrame::UserStoppedTyping { .. } => "user_stopped_typing",
            ServerFrame::MessageRead { .. } => "message_read",
            ServerFrame::UserJoinedConversation { .. } => "user_joined_conversation",
            ServerFrame::UserStatusChanged { .. } => "user_status_changed",
            ServerFrame::ScheduledMessageDelivered(_) => "scheduled_message_delivered",
            ServerFrame::Pong { .. } => "pong",
            ServerFrame::Error { .. } => "error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn decodes_send_message_command() {
        let conversation_id = Uuid::new_v4();
        let raw = json!({
            "type": "send_message",
            "data": {"conversationId": conversation_id, "content": "hi"}
        })
        .to_string();

        match decode_client_frame(&raw).expect("frame decodes") {
            InboundFrame::Command(ClientCommand::SendMessage(cmd)) => {
                assert_eq!(cmd.conversation_id, conversation_id);
                assert_eq!(cmd.content, "hi");
                assert!(cmd.attachments.is_none());
            }
            other => panic!("unexpected decode result: {other:?}"),
        }
    }

    #[test]
    fn ping_needs_no_payload() {
        let decoded = decode_client_frame(r#"{"type":"ping"}"#).expect("frame decodes");
        assert_eq!(decoded, InboundFrame::Command(ClientCommand::Ping));
    }

    #[test]
    fn unknown_type_is_surfaced_not_errored() {
        let raw = r#"{"type":"start_video_call","data":{"conversationId":"x"}}"#;
        match decode_client_frame(raw).expect("envelope decodes") {
            InboundFrame::Unknown(tag) => assert_eq!(tag, "start_video_call"),
            other => panic!("unexpected decode result: {other:?}"),
        }
    }

    #[test]
    fn malformed_payload_is_a_payload_error() {
        let raw = r#"{"type":"mark_read","data":{"messageId":"not-a-uuid"}}"#;
        match decode_client_frame(raw) {
            Err(ProtocolError::Payload { frame_type, .. }) => assert_eq!(frame_type, "mark_read"),
            other => panic!("unexpected decode result: {other:?}"),
        }
    }

    #[test]
    fn garbage_is_an_envelope_error() {
        assert!(matches!(
            decode_client_frame("not json at all"),
            Err(ProtocolError::Envelope(_))
        ));
        assert!(matches!(
            decode_client_frame(r#"{"data":{}}"#),
            Err(ProtocolError::Envelope(_))
        ));
    }

    #[test]
    fn server_frames_use_the_shared_envelope() {
        let frame = ServerFrame::MessageSent {
            message_id: Uuid::new_v4(),
            timestamp: Utc::now(),
        };
        let value: Value = serde_json::from_str(&frame.to_json()).unwrap();
        assert_eq!(value["type"], "message_sent");
        assert!(value["data"]["messageId"].is_string());
        assert!(value["data"]["timestamp"].is_string());
    }

    #[test]
    fn scheduled_delivery_frame_carries_the_message_fields_inline() {
        let broadcast = MessageBroadcast {
            id: Uuid::new_v4(),
            conversation_id: Uuid::new_v4(),
            content: "shift swap approved".into(),
            sender_id: Uuid::new_v4(),
            sender_name: "Dana".into(),
            sender_avatar: None,
            created_at: Utc::now(),
            delivery_status: DeliveryStatus::Delivered,
            is_read: false,
            attachments: None,
        };
        let frame = ServerFrame::scheduled(broadcast.clone());
        let value: Value = serde_json::from_str(&frame.to_json()).unwrap();

        assert_eq!(value["type"], "scheduled_message_delivered");
        assert_eq!(value["data"]["isScheduled"], true);
        assert_eq!(value["data"]["content"], "shift swap approved");
        assert_eq!(value["data"]["deliveryStatus"], "delivered");
        assert_eq!(
            value["data"]["id"].as_str().unwrap(),
            broadcast.id.to_string()
        );
    }

    #[test]
    fn frame_type_matches_serialized_tag() {
        let frame = ServerFrame::error("nope");
        let value: Value = serde_json::from_str(&frame.to_json()).unwrap();
        assert_eq!(value["type"], frame.frame_type());
    }

    proptest! {
        #[test]
        fn arbitrary_tags_never_panic(tag in "[a-z_]{1,24}", content in "\\PC{0,64}") {
            let raw = json!({"type": tag, "data": {"content": content}}).to_string();
            let decoded = decode_client_frame(&raw);
            // Tags outside the protocol must come back as Unknown, and known
            // tags must either decode or fail with a payload error.
            match decoded {
                Ok(InboundFrame::Unknown(seen)) => prop_assert_eq!(seen, tag),
                Ok(InboundFrame::Command(_)) => {}
                Err(ProtocolError::Payload { frame_type, .. }) => prop_assert_eq!(frame_type, tag),
                Err(ProtocolError::Envelope(_)) => prop_assert!(false, "envelope was valid"),
            }
        }
    }
}

//! The message entity and its delivery status.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::{ConversationId, LocalId, ServerId, UserId};

/// Delivery status of a message, as tracked on-device.
///
/// Statuses advance monotonically once the server becomes authoritative:
/// `Sent -> Delivered -> Read`. `Recalled` is terminal. `Failed` is reachable
/// only from `Sending` and is not terminal (a retry returns it to `Sending`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    /// Persisted locally, transmission not yet acknowledged.
    Sending,
    /// Acknowledged by the server.
    Sent,
    /// Delivered to the recipient's device.
    Delivered,
    /// Read by the recipient.
    Read,
    /// Transmission failed; awaiting retry or explicit resend.
    Failed,
    /// Retracted by the sender. Terminal.
    Recalled,
}

impl DeliveryStatus {
    /// Stable string form, used for storage.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sending => "sending",
            Self::Sent => "sent",
            Self::Delivered => "delivered",
            Self::Read => "read",
            Self::Failed => "failed",
            Self::Recalled => "recalled",
        }
    }

    /// Parse the stable string form.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "sending" => Some(Self::Sending),
            "sent" => Some(Self::Sent),
            "delivered" => Some(Self::Delivered),
            "read" => Some(Self::Read),
            "failed" => Some(Self::Failed),
            "recalled" => Some(Self::Recalled),
            _ => None,
        }
    }
}

impl fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The kind of content a message carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    /// Plain text.
    Text,
    /// Image attachment.
    Image,
    /// Voice note.
    Voice,
    /// Video attachment.
    Video,
    /// Arbitrary file attachment.
    File,
    /// Geographic location.
    Location,
    /// Server-generated system notice.
    System,
}

/// Descriptor for media content stored outside the message row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaDescriptor {
    /// Remote or local URI of the media object.
    pub uri: String,
    /// MIME type, e.g. `image/jpeg`.
    pub mime_type: String,
    /// Size in bytes, if known.
    pub size_bytes: Option<u64>,
}

/// Message content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum MessagePayload {
    /// Text body.
    Text {
        /// The text content.
        body: String,
    },
    /// Media reference.
    Media(MediaDescriptor),
    /// Placeholder left behind by a recall.
    Tombstone,
}

impl MessagePayload {
    /// Convenience constructor for a text payload.
    pub fn text(body: impl Into<String>) -> Self {
        Self::Text { body: body.into() }
    }
}

/// One chat message as stored on-device.
///
/// Exactly one of `{local_id only, local_id + server_id}` holds at any time;
/// once `server_id` is set it never changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Client-generated identifier, assigned at creation.
    pub local_id: LocalId,
    /// Server-assigned identifier, set once acknowledged.
    pub server_id: Option<ServerId>,
    /// Conversation this message belongs to.
    pub conversation_id: ConversationId,
    /// The sending user.
    pub sender_id: UserId,
    /// Content kind.
    pub kind: MessageKind,
    /// Content payload.
    pub payload: MessagePayload,
    /// Type-specific attributes (duration, file size, coordinates).
    pub metadata: BTreeMap<String, String>,
    /// Creation time, unix milliseconds.
    pub created_at: i64,
    /// Recall confirmation time, unix milliseconds.
    pub recalled_at: Option<i64>,
    /// Last edit time, unix milliseconds.
    pub edited_at: Option<i64>,
    /// Current delivery status.
    pub status: DeliveryStatus,
}

impl Message {
    /// Create an optimistic record for an outgoing message.
    ///
    /// The record starts in `Sending` with a fresh [`LocalId`] and no
    /// `server_id`; it must be persisted before any network attempt.
    pub fn draft(
        conversation_id: ConversationId,
        sender_id: UserId,
        kind: MessageKind,
        payload: MessagePayload,
        created_at: i64,
    ) -> Self {
        Self {
            local_id: LocalId::new(),
            server_id: None,
            conversation_id,
            sender_id,
            kind,
            payload,
            metadata: BTreeMap::new(),
            created_at,
            recalled_at: None,
            edited_at: None,
            status: DeliveryStatus::Sending,
        }
    }

    /// Check whether the server has acknowledged this message.
    pub fn is_confirmed(&self) -> bool {
        self.server_id.is_some()
    }

    /// Snapshot of the fields the transport needs to (re)send this message.
    pub fn to_draft(&self) -> MessageDraft {
        MessageDraft {
            conversation_id: self.conversation_id,
            temp_id: self.local_id,
            sender_id: self.sender_id.clone(),
            kind: self.kind,
            payload: self.payload.clone(),
            metadata: self.metadata.clone(),
            created_at: self.created_at,
        }
    }
}

/// The payload snapshot submitted to the transport for a send.
///
/// `temp_id` is the client's [`LocalId`]; the server round-trips it in the
/// acknowledgment so the optimistic record can be reconciled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageDraft {
    /// Target conversation.
    pub conversation_id: ConversationId,
    /// Echoed client identifier.
    pub temp_id: LocalId,
    /// The sending user.
    pub sender_id: UserId,
    /// Content kind.
    pub kind: MessageKind,
    /// Content payload.
    pub payload: MessagePayload,
    /// Type-specific attributes.
    pub metadata: BTreeMap<String, String>,
    /// Client creation time, unix milliseconds.
    pub created_at: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text_draft() -> Message {
        Message::draft(
            ConversationId::new(),
            UserId::from("alice"),
            MessageKind::Text,
            MessagePayload::text("hi"),
            1_700_000_000_000,
        )
    }

    #[test]
    fn draft_starts_sending_without_server_id() {
        let msg = text_draft();
        assert_eq!(msg.status, DeliveryStatus::Sending);
        assert!(msg.server_id.is_none());
        assert!(!msg.is_confirmed());
    }

    #[test]
    fn status_string_roundtrip() {
        for status in [
            DeliveryStatus::Sending,
            DeliveryStatus::Sent,
            DeliveryStatus::Delivered,
            DeliveryStatus::Read,
            DeliveryStatus::Failed,
            DeliveryStatus::Recalled,
        ] {
            assert_eq!(DeliveryStatus::parse(status.as_str()), Some(status));
        }
    }

    #[test]
    fn status_parse_unknown_fails() {
        assert_eq!(DeliveryStatus::parse("teleported"), None);
    }

    #[test]
    fn to_draft_echoes_local_id() {
        let msg = text_draft();
        let draft = msg.to_draft();
        assert_eq!(draft.temp_id, msg.local_id);
        assert_eq!(draft.conversation_id, msg.conversation_id);
        assert_eq!(draft.payload, msg.payload);
    }

    #[test]
    fn message_serde_roundtrip() {
        let mut msg = text_draft();
        msg.metadata.insert("duration".into(), "12".into());
        let json = serde_json::to_string(&msg).unwrap();
        let restored: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(msg, restored);
    }

    #[test]
    fn payload_tags_are_stable() {
        let json = serde_json::to_string(&MessagePayload::text("hello")).unwrap();
        assert!(json.contains("\"type\":\"text\""));
        let json = serde_json::to_string(&MessagePayload::Tombstone).unwrap();
        assert!(json.contains("\"type\":\"tombstone\""));
    }
}

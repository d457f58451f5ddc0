//! Frames exchanged with the remote service.
//!
//! The request side is expressed through the gateway trait in `sync-client`;
//! this module holds the acknowledgment and push-stream payloads. Push events
//! are delivered at-least-once, so consumers must dedup by `server_id`.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::{ConversationId, LocalId, MessageKind, MessagePayload, ServerId, UserId};

/// Server acknowledgment of a send.
///
/// `temp_id` echoes the client's [`LocalId`] so the optimistic record can be
/// matched without string scanning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendAck {
    /// Canonical identifier assigned by the server.
    pub server_id: ServerId,
    /// Echoed client identifier.
    pub temp_id: LocalId,
    /// Server-authoritative creation time, unix milliseconds.
    pub created_at: i64,
}

/// Status carried by a `statusUpdate` push frame.
///
/// Only the remote-driven portion of the lifecycle appears on the wire;
/// `sending`/`failed` are local-only states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RemoteStatus {
    /// Accepted by the server.
    Sent,
    /// Delivered to the recipient's device.
    Delivered,
    /// Read by the recipient.
    Read,
}

/// A message pushed from the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteMessage {
    /// Canonical server identifier.
    pub server_id: ServerId,
    /// Echoed client identifier, present when this frame acknowledges one of
    /// our own optimistic sends.
    pub temp_id: Option<LocalId>,
    /// Conversation the message belongs to.
    pub conversation_id: ConversationId,
    /// The sending user.
    pub sender_id: UserId,
    /// Content kind.
    pub kind: MessageKind,
    /// Content payload.
    pub payload: MessagePayload,
    /// Type-specific attributes.
    pub metadata: BTreeMap<String, String>,
    /// Server creation time, unix milliseconds.
    pub created_at: i64,
}

/// A frame from the server push stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerEvent {
    /// A new message arrived (or our own send was echoed back).
    NewMessage(RemoteMessage),
    /// A message's delivery status advanced.
    StatusUpdate {
        /// The message concerned.
        server_id: ServerId,
        /// The new status.
        status: RemoteStatus,
    },
    /// A sender retracted a message.
    RecallNotice {
        /// The message concerned.
        server_id: ServerId,
        /// Recall confirmation time, unix milliseconds.
        recalled_at: i64,
    },
}

/// Target of a mark-read request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReadTarget {
    /// One message.
    Message(ServerId),
    /// Every message in a conversation.
    Conversation(ConversationId),
}

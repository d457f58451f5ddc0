//! Reconciliation of optimistic local records with server state.
//!
//! The critical correctness property here is merging rather than duplicating:
//! when the server echoes back a message we sent optimistically, the existing
//! row must absorb the confirmation instead of a second row appearing (the
//! well-known "double message" bug in optimistic send UIs).

use chat_sync_types::{
    DeliveryStatus, LocalId, Message, RemoteMessage, SendAck,
};

use crate::delivery;

/// Merge a send acknowledgment into the optimistic record.
///
/// Stamps the server identifier (write-once: an already-confirmed record
/// keeps its original `server_id`), advances `sending`/`failed` to `sent`,
/// and adopts the server-authoritative creation time.
pub fn merge_ack(mut local: Message, ack: &SendAck) -> Message {
    if local.server_id.is_none() {
        local.server_id = Some(ack.server_id.clone());
    }
    local.created_at = ack.created_at;
    local.status = match local.status {
        DeliveryStatus::Sending | DeliveryStatus::Failed => DeliveryStatus::Sent,
        // A push event may already have advanced us past `sent`.
        other => delivery::mark_sent(other).unwrap_or(other),
    };
    local
}

/// Outcome of merging an inbound `newMessage` event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Merged {
    /// The event matched an existing row; the merged row replaces it.
    Updated(Message),
    /// The event introduced a new message with a freshly minted [`LocalId`].
    Inserted(Message),
}

impl Merged {
    /// The resulting message, whichever way it merged.
    pub fn message(&self) -> &Message {
        match self {
            Self::Updated(msg) | Self::Inserted(msg) => msg,
        }
    }
}

/// Merge an inbound server message with the matching local row, if any.
///
/// `local` is the row found by `server_id` lookup, or failing that by the
/// echoed `temp_id`. When a match exists the merge preserves `local_id`
/// linkage, any status already advanced beyond `sent`, and the tombstone of
/// an already-recalled row; when none exists a fresh row is minted. Inbound
/// rows from other senders start at `delivered` - they are on this device,
/// after all.
pub fn merge_remote(local: Option<Message>, remote: RemoteMessage) -> Merged {
    match local {
        Some(mut existing) => {
            if existing.server_id.is_none() {
                existing.server_id = Some(remote.server_id.clone());
            }
            // Frames arrive at-least-once; one redelivered after a recall
            // must not resurrect the recalled content.
            if existing.status == DeliveryStatus::Recalled {
                return Merged::Updated(existing);
            }
            existing.created_at = remote.created_at;
            existing.kind = remote.kind;
            existing.payload = remote.payload;
            existing.metadata = remote.metadata;
            existing.status = match existing.status {
                DeliveryStatus::Sending | DeliveryStatus::Failed => DeliveryStatus::Sent,
                other => other,
            };
            Merged::Updated(existing)
        }
        None => {
            let local_id = remote.temp_id.unwrap_or_else(LocalId::new);
            Merged::Inserted(Message {
                local_id,
                server_id: Some(remote.server_id),
                conversation_id: remote.conversation_id,
                sender_id: remote.sender_id,
                kind: remote.kind,
                payload: remote.payload,
                metadata: remote.metadata,
                created_at: remote.created_at,
                recalled_at: None,
                edited_at: None,
                status: DeliveryStatus::Delivered,
            })
        }
    }
}

//! Application-facing notifications.
//!
//! The coordinator broadcasts a [`SyncEvent`] whenever local state changes,
//! whether the change came from a local call or from the server push stream.
//! A UI subscribes once and re-renders the affected rows.

use chat_sync_types::{ConversationId, LocalId, OpId, ServerId};

/// A state change the application may want to render.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    /// A message row changed (status, payload, or confirmation).
    MessageUpdated {
        /// The message's client identifier.
        local_id: LocalId,
        /// Its server identifier, if confirmed.
        server_id: Option<ServerId>,
    },
    /// A send attempt failed; the message is awaiting retry or resend.
    MessageFailed {
        /// The message's client identifier.
        local_id: LocalId,
    },
    /// A message was recalled (locally or by the remote sender).
    MessageRecalled {
        /// The message's client identifier.
        local_id: LocalId,
    },
    /// Delivered messages in a conversation were advanced to read.
    MessageRead {
        /// The conversation concerned.
        conversation_id: ConversationId,
    },
    /// A message row was removed.
    MessageDeleted {
        /// The deleted message's client identifier.
        local_id: LocalId,
    },
    /// The server permanently rejected a queued operation.
    OperationRejected {
        /// The operation concerned.
        op_id: OpId,
        /// Why it was rejected.
        reason: String,
    },
    /// A queued operation ran out of retry attempts.
    RetriesExhausted {
        /// The operation concerned.
        op_id: OpId,
    },
    /// The push stream terminated and will not be resumed.
    EventStreamLost {
        /// The terminal transport error.
        error: String,
    },
}

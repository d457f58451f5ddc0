//! Time-windowed mutability of a sent message (recall, edit).
//!
//! Checks run locally before any network attempt: a recall outside the window
//! fails fast with [`PolicyViolation`] and saves the round trip. The server
//! may still reject a request that passed the local check; that surfaces as a
//! non-retryable transport rejection in `sync-client`.

use std::time::Duration;

use chat_sync_types::{DeliveryStatus, Message, MessagePayload, UserId};
use thiserror::Error;

/// Default recall window: two minutes from creation.
pub const DEFAULT_RECALL_WINDOW: Duration = Duration::from_secs(120);

/// A recall or edit request that violates the policy.
///
/// Violations are local and final - no network call is made.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PolicyViolation {
    /// Only the original sender may recall or edit.
    #[error("requester is not the sender of the message")]
    NotSender,
    /// The mutability window has elapsed.
    #[error("recall window elapsed: {elapsed_ms}ms since creation (window: {window_ms}ms)")]
    WindowElapsed {
        /// Milliseconds since the message was created.
        elapsed_ms: i64,
        /// The configured window in milliseconds.
        window_ms: i64,
    },
    /// The message is not in a recallable status.
    #[error("message is not recallable in status {status}")]
    NotRecallable {
        /// The current status.
        status: DeliveryStatus,
    },
}

/// Policy governing recall and edit of sent messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecallPolicy {
    /// How long after creation a message stays mutable.
    pub recall_window: Duration,
}

impl Default for RecallPolicy {
    fn default() -> Self {
        Self {
            recall_window: DEFAULT_RECALL_WINDOW,
        }
    }
}

impl RecallPolicy {
    /// Create a policy with an explicit window.
    pub fn new(recall_window: Duration) -> Self {
        Self { recall_window }
    }

    /// Check whether `requester` may recall `message` at `now_millis`.
    ///
    /// Recall requires: the requester is the sender, the window has not
    /// elapsed, and status is one of `sent`, `delivered`, `read`.
    pub fn check_recall(
        &self,
        message: &Message,
        requester: &UserId,
        now_millis: i64,
    ) -> Result<(), PolicyViolation> {
        if &message.sender_id != requester {
            return Err(PolicyViolation::NotSender);
        }
        self.check_window(message, now_millis)?;
        match message.status {
            DeliveryStatus::Sent | DeliveryStatus::Delivered | DeliveryStatus::Read => Ok(()),
            status => Err(PolicyViolation::NotRecallable { status }),
        }
    }

    /// Check whether `requester` may edit `message` at `now_millis`.
    ///
    /// Same window and ownership rule as recall; the editable statuses are
    /// the same acknowledged set.
    pub fn check_edit(
        &self,
        message: &Message,
        requester: &UserId,
        now_millis: i64,
    ) -> Result<(), PolicyViolation> {
        self.check_recall(message, requester, now_millis)
    }

    fn check_window(&self, message: &Message, now_millis: i64) -> Result<(), PolicyViolation> {
        let elapsed_ms = now_millis.saturating_sub(message.created_at);
        let window_ms = self.recall_window.as_millis() as i64;
        if elapsed_ms > window_ms {
            return Err(PolicyViolation::WindowElapsed {
                elapsed_ms,
                window_ms,
            });
        }
        Ok(())
    }
}

/// Transform a message into its recalled tombstone.
///
/// The payload is replaced, status becomes terminal `recalled`, and
/// `recalled_at` is stamped with the confirmation time. The row keeps its
/// `local_id`/`server_id` for audit and UI continuity - recall never
/// hard-deletes.
pub fn apply_recall(mut message: Message, recalled_at: i64) -> Message {
    message.payload = MessagePayload::Tombstone;
    message.status = DeliveryStatus::Recalled;
    message.recalled_at = Some(recalled_at);
    message
}

/// Replace a message's payload in place, stamping `edited_at`.
///
/// Status is unchanged by an edit.
pub fn apply_edit(mut message: Message, payload: MessagePayload, edited_at: i64) -> Message {
    message.payload = payload;
    message.edited_at = Some(edited_at);
    message
}

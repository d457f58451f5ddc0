//! # sync-store
//!
//! Durable local storage for the chat-sync message engine.
//!
//! Provides the [`MessageStore`] trait - pure data access with no network
//! awareness - and [`SqliteStore`], a SQLite implementation. Two tables are
//! kept: `messages`, keyed by `local_id` with a unique secondary index on
//! `server_id`, and `pending_operations`, keyed by `op_id` with an index on
//! `(conversation_id, next_retry_at)`.
//!
//! All writes are idempotent, and writes within one conversation are
//! serialized so interleaved optimistic-send and incoming-event writes cannot
//! produce out-of-order or duplicated rows. Reads run concurrently.

#![warn(missing_docs)]
#![warn(clippy::all)]

mod error;
mod sqlite;

pub use error::{Result, StorageError};
pub use sqlite::SqliteStore;

use async_trait::async_trait;
use chat_sync_types::{
    ConversationId, LocalId, Message, OpId, PendingOperation, ServerId,
};

/// Trait for local message storage backends.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Insert or update a message.
    ///
    /// Idempotent: writing a message whose `server_id` matches an existing
    /// row overwrites that row's fields but preserves its `local_id` linkage.
    async fn put_message(&self, message: &Message) -> Result<()>;

    /// Look up a message by its client identifier.
    async fn get_by_local_id(&self, local_id: &LocalId) -> Result<Option<Message>>;

    /// Look up a message by its server identifier.
    async fn get_by_server_id(&self, server_id: &ServerId) -> Result<Option<Message>>;

    /// Query a conversation newest-first.
    ///
    /// Returns at most `limit` messages. `before` is a continuation cursor:
    /// results are strictly earlier than the referenced message, ordered by
    /// descending creation time with ties broken by descending `local_id`
    /// lexical order for determinism.
    async fn query_conversation(
        &self,
        conversation_id: &ConversationId,
        limit: u32,
        before: Option<&LocalId>,
    ) -> Result<Vec<Message>>;

    /// Hard-delete a message row. Returns whether a row was removed.
    async fn delete_message(&self, local_id: &LocalId) -> Result<bool>;

    /// Insert a pending operation, coalescing duplicates.
    ///
    /// At most one operation exists per `(conversation_id, kind, target)`;
    /// when one already does, its identity, attempt count, and schedule
    /// survive and only the draft snapshot is refreshed. Returns the stored
    /// operation.
    async fn upsert_pending_op(&self, op: PendingOperation) -> Result<PendingOperation>;

    /// List pending operations, FIFO by creation time.
    ///
    /// Optionally scoped to one conversation.
    async fn list_pending_ops(
        &self,
        conversation_id: Option<&ConversationId>,
    ) -> Result<Vec<PendingOperation>>;

    /// List operations whose `next_retry_at` has elapsed, FIFO.
    async fn list_due_ops(&self, now_millis: i64) -> Result<Vec<PendingOperation>>;

    /// Record an attempt: bump the count and set the next deadline.
    async fn reschedule_op(
        &self,
        op_id: &OpId,
        attempt_count: u32,
        next_retry_at: i64,
    ) -> Result<()>;

    /// Remove a pending operation. Returns whether a row was removed.
    async fn remove_pending_op(&self, op_id: &OpId) -> Result<bool>;

    /// Advance every `delivered` message in a conversation to `read`.
    ///
    /// Returns the number of rows advanced. Monotonic: already-`read` rows
    /// are untouched.
    async fn mark_conversation_read(&self, conversation_id: &ConversationId) -> Result<u64>;

    /// Advance one `delivered` message to `read`, by server identifier.
    async fn mark_message_read(&self, server_id: &ServerId) -> Result<bool>;
}
